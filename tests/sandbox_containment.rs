//! 沙箱约束测试：静态拒绝、模块代理、缺失值、去重、超时、内存上限、确定性
//!
//! 需要解释器的用例在找不到 python3 时跳过。

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use g2p_router::core::SandboxFailureKind;
use g2p_router::sandbox::{preload, PreloadOptions, PreloadedInput, SandboxConfig, SandboxExecutor, SandboxJob, Table};
use g2p_router::tools::{Delimiter, ToolPayload};

const FEATURES_TSV: &str = "residueId\tscore\tClinVar\n\
1\t0.5\tPathogenic\n\
2\t\t\n\
3\t1.5\tBenign\n\
3\t1.5\tBenign\n";

fn tabular(text: &str) -> ToolPayload {
    ToolPayload::Tabular {
        text: text.to_string(),
        delimiter: Delimiter::Tab,
    }
}

/// 不存在的解释器：任何真正执行都会以 "interpreter unavailable" 失败
fn unspawnable() -> SandboxExecutor {
    SandboxExecutor::new(SandboxConfig {
        python: "/nonexistent/python-for-tests".to_string(),
        ..SandboxConfig::default()
    })
}

async fn python_executor(timeout: Duration) -> Option<SandboxExecutor> {
    let exec = SandboxExecutor::new(SandboxConfig {
        timeout,
        ..SandboxConfig::default()
    });
    if exec.interpreter_available().await {
        Some(exec)
    } else {
        eprintln!("python3 not available, skipping interpreter-backed sandbox test");
        None
    }
}

#[tokio::test]
async fn test_denylisted_code_never_executes() {
    let exec = unspawnable();
    let cases = [
        "import subprocess\nsubprocess.run(['ls'])",
        "import os\nprint(os.getcwd())",
        "from socket import socket\ns = socket()",
        "import urllib.request\nurllib.request.urlopen('http://example.com')",
        "df.read_csv('https://example.com/data.tsv')",
        "print(open('/etc/passwd').read())",
        "__import__('os').system('id')",
    ];
    for code in cases {
        let err = exec
            .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "escape"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Forbidden, "code: {code}");
        assert!(!err.detail.contains("interpreter unavailable"));
    }
}

#[test]
fn test_blank_numeric_cell_is_null_not_zero() {
    let opts = PreloadOptions::default();
    let table = Table::parse(FEATURES_TSV, Delimiter::Tab, &opts).unwrap();
    // 去重后为 0.5、空、1.5：(0.5 + 1.5) / 2，空单元格不计入
    let mean = table.column_mean("score").unwrap();
    assert!((mean - 1.0).abs() < 1e-9);

    let records = table.to_records();
    assert!(records[1]["score"].is_null());
    assert_eq!(records[1]["ClinVar"], "");
}

#[test]
fn test_identity_key_rows_are_deduplicated() {
    let opts = PreloadOptions::default();
    match preload(&tabular(FEATURES_TSV), &opts).unwrap() {
        PreloadedInput::Table(t) => {
            assert_eq!(t.len(), 3);
            let ids: Vec<f64> = t.to_records().as_array().unwrap().iter().filter_map(|r| r["residueId"].as_f64()).collect();
            assert_eq!(ids, vec![1.0, 2.0, 3.0]);
        }
        other => panic!("expected table, got {other:?}"),
    }

    let keep_all = PreloadOptions {
        dedupe: false,
        ..PreloadOptions::default()
    };
    match preload(&tabular(FEATURES_TSV), &keep_all).unwrap() {
        PreloadedInput::Table(t) => assert_eq!(t.len(), 4),
        other => panic!("expected table, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unbounded_loop_is_resource_exceeded() {
    let Some(exec) = python_executor(Duration::from_millis(800)).await else {
        return;
    };
    let err = exec
        .execute(
            SandboxJob::new(tabular(FEATURES_TSV), "while True:\n    pass", "spin"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, SandboxFailureKind::ResourceExceeded);
}

#[tokio::test]
async fn test_same_payload_and_code_give_identical_output() {
    let Some(exec) = python_executor(Duration::from_secs(10)).await else {
        return;
    };
    let code = "rows = df.to_dict('records') if hasattr(df, 'to_dict') else df\n\
vals = [r['score'] for r in rows if r['score'] is not None and r['score'] == r['score']]\n\
print(len(rows), round(sum(vals) / len(vals), 4))";
    let a = exec
        .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "mean"), &CancellationToken::new())
        .await
        .unwrap();
    let b = exec
        .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "mean"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a.captured_output.trim(), "3 1.0");
    assert!(!a.truncated);
}

#[tokio::test]
async fn test_compound_statement_imports_rejected_before_spawn() {
    // 解释器路径不存在：静态扫描漏掉的代码会以 "interpreter unavailable" 失败
    let exec = unspawnable();
    for code in [
        "print('leaked'); import os",
        "if True: import os\nprint('unreachable')",
        "import pandas as pd, os",
        "import numpy as np, subprocess as sp",
        "x = 1; from socket import socket",
        "import \\\nos",
    ] {
        let err = exec
            .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "import"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Forbidden, "code: {code}");
        assert!(err.detail.starts_with("code rejected"), "code: {code}, detail: {}", err.detail);
    }
}

#[tokio::test]
async fn test_module_attribute_walk_rejected_before_spawn() {
    let exec = unspawnable();
    for code in [
        "statistics.random._os.system('id > /tmp/g2p_sandbox_escape')\nprint(statistics.random._os.getuid())",
        "pd.io.common.os.system('id')",
        "np.ctypeslib.ctypes.CDLL(None)",
        "from functools import reduce\nos = reduce(getattr, ['random', 'x'], statistics)",
        "g = (i for i in [1])\nprint(g.gi_frame.f_back.f_globals)",
    ] {
        let err = exec
            .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "walk"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SandboxFailureKind::Forbidden, "code: {code}");
        assert!(err.detail.starts_with("code rejected"), "code: {code}, detail: {}", err.detail);
    }
}

#[tokio::test]
async fn test_exposed_modules_are_proxies_without_submodules() {
    let Some(exec) = python_executor(Duration::from_secs(10)).await else {
        return;
    };
    let code = "import statistics as st\n\
print(hasattr(statistics, 'random'), hasattr(st, 'random'), hasattr(json, 'decoder'), st.mean([1, 2, 3]))";
    let out = exec
        .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "proxy"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.captured_output.trim(), "False False False 2");
}

#[tokio::test]
async fn test_permitted_imports_still_work_through_proxies() {
    let Some(exec) = python_executor(Duration::from_secs(10)).await else {
        return;
    };
    let code = "from json import loads, dumps\nimport math as m\nprint(dumps(loads('[1, 2]')), m.floor(2.5))";
    let out = exec
        .execute(SandboxJob::new(tabular(FEATURES_TSV), code, "imports"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.captured_output.trim(), "[1, 2] 2");
}

#[tokio::test]
async fn test_memory_ceiling_is_resource_exceeded() {
    let Some(exec) = python_executor(Duration::from_secs(10)).await else {
        return;
    };
    let err = exec
        .execute(
            SandboxJob::new(tabular(FEATURES_TSV), "x = bytearray(2 * 1024 ** 3)\nprint(len(x))", "alloc"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, SandboxFailureKind::ResourceExceeded);
}

#[tokio::test]
async fn test_exception_detail_is_sanitized() {
    let Some(exec) = python_executor(Duration::from_secs(10)).await else {
        return;
    };
    let err = exec
        .execute(
            SandboxJob::new(ToolPayload::Text("ATOM".to_string()), "print(1 / 0)", "div"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind, SandboxFailureKind::ExecutionError);
    assert!(err.detail.contains("ZeroDivisionError"));
    assert!(!err.detail.contains("Traceback"));
}

#[tokio::test]
async fn test_cancel_terminates_running_job() {
    let Some(exec) = python_executor(Duration::from_secs(30)).await else {
        return;
    };
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });
    let started = std::time::Instant::now();
    let err = exec
        .execute(SandboxJob::new(tabular(FEATURES_TSV), "while True:\n    pass", "spin"), &cancel)
        .await
        .unwrap_err();
    assert_eq!(err.kind, SandboxFailureKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));
}
