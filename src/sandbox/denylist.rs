//! 静态扫描：代码在进入解释器之前按能力黑名单检查
//!
//! 命中任一规则即拒绝（Forbidden），代码不会执行。规则覆盖：
//! - 任意位置的 import / from（行首、`;` 或 `:` 之后，含逗号列表与 as 别名）
//! - 下划线开头的属性访问，以及以受限模块命名的属性（模块属性链逃逸）
//! - 动态求值与反射名字、帧/代码对象属性、NFKC 兼容字符
//! - 文件、网络与 pandas / numpy 的读写入口
//!
//! 运行时还有一层：受限 builtins、导入守卫与模块代理（见 prelude）。

use std::sync::OnceLock;

use regex::Regex;

/// 进程、文件系统、网络、反射与代码执行相关的根模块（import 时拒绝）
pub const DENIED_MODULES: &[&str] = &[
    "os",
    "posix",
    "nt",
    "posixpath",
    "ntpath",
    "genericpath",
    "sys",
    "subprocess",
    "pty",
    "socket",
    "socketserver",
    "ssl",
    "shutil",
    "importlib",
    "pkgutil",
    "zipimport",
    "runpy",
    "site",
    "sysconfig",
    "ctypes",
    "multiprocessing",
    "concurrent",
    "threading",
    "asyncio",
    "signal",
    "faulthandler",
    "atexit",
    "resource",
    "platform",
    "urllib",
    "urllib3",
    "http",
    "requests",
    "httpx",
    "aiohttp",
    "ftplib",
    "smtplib",
    "imaplib",
    "poplib",
    "telnetlib",
    "xmlrpc",
    "webbrowser",
    "pathlib",
    "tempfile",
    "glob",
    "fileinput",
    "linecache",
    "io",
    "codecs",
    "mmap",
    "fcntl",
    "zipfile",
    "tarfile",
    "shelve",
    "dbm",
    "sqlite3",
    "configparser",
    "xml",
    "logging",
    "pickle",
    "marshal",
    "builtins",
    "inspect",
    "gc",
    "traceback",
    "operator",
    "string",
    "pydoc",
    "code",
    "codeop",
    "pdb",
    "bdb",
    "trace",
    "timeit",
    "doctest",
    "unittest",
    "cProfile",
    "profile",
];

/// 属性链上出现即拒绝的名字：进程/网络模块与 numpy 内可执行代码的子包
const ESCAPE_ATTRIBUTES: &[&str] = &[
    "os",
    "posix",
    "sys",
    "subprocess",
    "socket",
    "shutil",
    "importlib",
    "ctypes",
    "ctypeslib",
    "multiprocessing",
    "threading",
    "asyncio",
    "signal",
    "urllib",
    "http",
    "requests",
    "pathlib",
    "tempfile",
    "glob",
    "io",
    "pickle",
    "builtins",
    "inspect",
    "f2py",
    "distutils",
    "testing",
];

struct Rule {
    name: &'static str,
    pattern: Regex,
}

fn rules() -> &'static [Rule] {
    static RULES: OnceLock<Vec<Rule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let modules = DENIED_MODULES.join("|");
        let attrs = ESCAPE_ATTRIBUTES.join("|");
        // 语句起点：行首，或同一行的 `;` / `:` 之后；`ws` 含反斜杠续行
        let ws = r"[\s\\]";
        let stmt = format!(r"(?m)(?:^|[;:]){ws}*");
        let specs: Vec<(&'static str, String)> = vec![
            (
                "import of a restricted module",
                format!(r"{stmt}import{ws}+(?:[\w.]+(?:{ws}+as{ws}+\w+)?{ws}*,{ws}*)*(?:(?:{modules})\b|_)"),
            ),
            (
                "import of a restricted module",
                format!(r"{stmt}from{ws}+(?:(?:{modules})\b|_)"),
            ),
            (
                "import of a restricted name",
                format!(
                    r"{stmt}from{ws}+[\w.]+{ws}+import{ws}+\(?{ws}*(?:\w+(?:{ws}+as{ws}+\w+)?{ws}*,{ws}*)*(?:(?:{modules})\b|_)"
                ),
            ),
            ("private attribute access", r"\.[\s\\]*_".to_string()),
            ("restricted attribute", format!(r"\.[\s\\]*(?:{attrs})\b")),
            (
                "frame or code object access",
                r"\.[\s\\]*(?:gi_\w+|cr_\w+|ag_\w+|tb_\w+|co_\w+|f_(?:globals|locals|builtins|back|code))\b".to_string(),
            ),
            (
                "interpreter escape hatch",
                r"__(?:import|builtins|subclasses|globals|code|loader|spec)__".to_string(),
            ),
            (
                "dynamic evaluation",
                r"\b(?:eval|exec|compile|getattr|setattr|delattr|globals|locals|vars|breakpoint)\b".to_string(),
            ),
            // 解释器按 NFKC 规范化标识符，全角/数学字母等可拼出被拒绝的名字
            (
                "compatibility character",
                r"[\x{2070}-\x{209F}\x{2100}-\x{214F}\x{FB00}-\x{FB4F}\x{FE30}-\x{FE4F}\x{FF00}-\x{FFEF}\x{1D400}-\x{1D7FF}]"
                    .to_string(),
            ),
            ("file access", r"\bopen\s*\(".to_string()),
            ("network address", r"(?i)\b(?:https?|ftp)://".to_string()),
            (
                "pandas or numpy I/O",
                r"\.[\s\\]*(?:read_\w+|to_(?:pickle|parquet|sql|csv|excel|hdf|feather|json|html|latex|markdown|xml|stata|orc|clipboard|gbq)|load|loadtxt|save|savez\w*|savetxt|fromfile|tofile|genfromtxt|fromregex|query)\s*\(".to_string(),
            ),
            (
                "pandas or numpy I/O",
                r"\b(?:HDFStore|ExcelWriter|ExcelFile|DataSource|memmap)\b".to_string(),
            ),
        ];
        specs
            .into_iter()
            .filter_map(|(name, src)| match Regex::new(&src) {
                Ok(pattern) => Some(Rule { name, pattern }),
                Err(e) => {
                    tracing::error!(rule = name, error = %e, "invalid denylist pattern");
                    None
                }
            })
            .collect()
    })
}

/// 命中的规则：(规则名, 命中的片段)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: &'static str,
    pub fragment: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.rule, self.fragment)
    }
}

/// 扫描代码，返回第一条命中的规则
pub fn scan(code: &str) -> Option<Violation> {
    rules().iter().find_map(|rule| {
        rule.pattern.find(code).map(|m| Violation {
            rule: rule.name,
            fragment: m.as_str().trim().chars().take(60).collect(),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_patterns_compile() {
        assert_eq!(rules().len(), 13);
    }

    #[test]
    fn test_rejects_process_control() {
        for code in [
            "import os\nos.system('ls')",
            "import json, subprocess",
            "from subprocess import run",
            "from os.path import join",
            "  import sys",
            "x = __import__('os')",
            "().__class__.__base__.__subclasses__()",
            "import posix\nposix.system('id')",
            "import timeit\ntimeit.timeit('1')",
        ] {
            assert!(scan(code).is_some(), "not rejected: {code}");
        }
    }

    #[test]
    fn test_rejects_imports_inside_compound_statements() {
        for code in [
            "print('x'); import os",
            "if True: import os",
            "for _ in [1]:import subprocess",
            "import pandas as pd, os",
            "import numpy as np,  socket as s",
            "x = 1; from os import system",
            "from pandas.io.common import os",
            "from pandas.io.common import (\n    stringify_path,\n    os as o,\n)",
            "import _posixsubprocess",
            "from _socket import socket",
            "import \\\nos",
            "import json,\\\n  os",
            "from pandas.io.common import \\\n os",
        ] {
            assert!(scan(code).is_some(), "not rejected: {code}");
        }
    }

    #[test]
    fn test_rejects_attribute_walks() {
        for code in [
            "statistics.random._os.system('id')",
            "print(statistics.random._os.getuid())",
            "m = json . _default_decoder",
            "pd.io.common.os.system('id')",
            "np.ctypeslib.ctypes.CDLL(None)",
            "np.testing.runstring('1', {})",
            "x = statistics.random.\\\n_os",
            "g = (i for i in [1])\nprint(g.gi_frame.f_back.f_globals)",
            "err.__traceback__.tb_frame",
            "from functools import reduce\nreduce(getattr, ['random', 'x'], statistics)",
            "print(__loader__)",
        ] {
            assert!(scan(code).is_some(), "not rejected: {code}");
        }
    }

    #[test]
    fn test_rejects_network_and_files() {
        assert!(scan("import socket").is_some());
        assert!(scan("import urllib.request").is_some());
        assert!(scan("pd.read_csv('https://example.org/x.tsv')").is_some());
        assert!(scan("open('/etc/passwd').read()").is_some());
        assert!(scan("df.to_pickle('x')").is_some());
        assert!(scan("df.to_html('/tmp/x.html')").is_some());
        assert!(scan("np.loadtxt('/etc/passwd')").is_some());
        assert!(scan("store = pd.HDFStore('x.h5')").is_some());
        assert!(scan("eval('1+1')").is_some());
        assert!(scan("df.query('score > 1')").is_some());
    }

    #[test]
    fn test_rejects_compatibility_spelling() {
        // 全角 o/s 在解释器中等同于 os
        assert!(scan("import \u{FF4F}\u{FF53}").is_some());
        assert!(scan("statistics.random.\u{FE4F}os").is_some());
    }

    #[test]
    fn test_allows_ordinary_analysis() {
        for code in [
            "print(df['score'].mean())",
            "result = df[df['ClinVar'] != ''].shape[0]",
            "import math\nprint(math.sqrt(len(data)))",
            "import statistics",
            "import numpy as np, pandas as pd",
            "from collections import Counter\nprint(Counter(df['ClinVar']).most_common(3))",
            "positions = [r for r in df['residueId'] if r > 10]\nprint(len(positions))",
            "print(text.count('ATOM'))",
            "dataset = 1\nprint(dataset)",
            "for row in data:\n    print(row['posix_time'])",
            "cols = {'score': 1}\nprint(df.columns.tolist(), df.dtypes.to_dict())",
            "print(df.sort_values('score').head(5).to_string())",
            "rows = df.to_dict('records')",
        ] {
            assert_eq!(scan(code), None, "wrongly rejected: {code}");
        }
    }
}
