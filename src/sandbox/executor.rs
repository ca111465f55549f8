//! 沙箱执行器
//!
//! 每个作业一个全新的解释器子进程（不复用、不共享状态）：
//! 静态扫描 → 预加载 → 获取工作池名额 → 启动子进程 → 超时/取消时 kill → 按退出码映射失败类型。

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::core::{SandboxFailure, SandboxFailureKind};
use crate::sandbox::denylist::{self, DENIED_MODULES};
use crate::sandbox::preload::{preload, PreloadOptions};
use crate::sandbox::prelude::{EXIT_EXECUTION_ERROR, EXIT_FORBIDDEN, EXIT_MEMORY, EXIT_OK, PRELUDE};
use crate::tools::payload::{truncate_chars, PayloadKind, ToolPayload};

const STDERR_CAP: usize = 16 * 1024;
const NO_OUTPUT: &str =
    "Analysis completed but produced no output (print results or assign them to `result`).";

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub python: String,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
    pub workers: usize,
    /// 排队等待名额的作业上限，超出即 Overloaded
    pub queue_limit: usize,
    pub queue_wait: Duration,
    pub preload: PreloadOptions,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout: Duration::from_secs(5),
            memory_limit_mb: 512,
            max_output_bytes: 16 * 1024,
            workers: 4,
            queue_limit: 16,
            queue_wait: Duration::from_secs(10),
            preload: PreloadOptions::default(),
        }
    }
}

/// 一个沙箱作业
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxJob {
    pub payload: ToolPayload,
    pub code: String,
    pub declared_intent: String,
    /// false 时跳过身份键去重（同位异构体分析）
    pub dedupe: bool,
}

impl SandboxJob {
    pub fn new(payload: ToolPayload, code: impl Into<String>, declared_intent: impl Into<String>) -> Self {
        Self {
            payload,
            code: code.into(),
            declared_intent: declared_intent.into(),
            dedupe: true,
        }
    }

    pub fn with_dedupe(mut self, dedupe: bool) -> Self {
        self.dedupe = dedupe;
        self
    }

    pub fn payload_kind(&self) -> PayloadKind {
        self.payload.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxOutput {
    pub captured_output: String,
    pub truncated: bool,
}

/// 固定大小的工作池 + 有界等待队列
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    queue_limit: usize,
    queue_wait: Duration,
}

struct WaitSlot<'a>(&'a AtomicUsize);

impl Drop for WaitSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl WorkerPool {
    pub fn new(workers: usize, queue_limit: usize, queue_wait: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            waiting: AtomicUsize::new(0),
            queue_limit,
            queue_wait,
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// 有空闲名额直接返回；否则排队（队列满或等待超时即 Overloaded）
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, SandboxFailure> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.queue_limit {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(SandboxFailure::overloaded("sandbox queue is full"));
        }
        let _slot = WaitSlot(&self.waiting);
        match tokio::time::timeout(self.queue_wait, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(SandboxFailure::overloaded("sandbox pool closed")),
            Err(_) => Err(SandboxFailure::overloaded(format!(
                "no sandbox worker became free within {:?}",
                self.queue_wait
            ))),
        }
    }
}

struct Captured {
    stdout: Vec<u8>,
    truncated: bool,
    stderr: Vec<u8>,
    status: ExitStatus,
}

enum Ended {
    Finished(std::io::Result<Captured>),
    TimedOut,
    Cancelled,
}

/// 读取至多 cap 字节，超出部分继续读空（避免子进程阻塞在写管道上）
async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let Some(mut reader) = reader else {
        return Ok((Vec::new(), false));
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = cap.saturating_sub(kept.len());
        if n > room {
            truncated = true;
        }
        kept.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok((kept, truncated))
}

fn path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?:[A-Za-z]:)?(?:[/\\][\w.\-]+){2,}"#).expect("valid regex"))
}

/// 错误信息清洗：只保留最后一行，去掉文件路径并截断
pub fn sanitize_error(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("analysis failed without an error message");
    let cleaned = path_re().replace_all(line, "<path>");
    truncate_chars(&cleaned, 300)
}

pub struct SandboxExecutor {
    config: SandboxConfig,
    pool: WorkerPool,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        let pool = WorkerPool::new(config.workers, config.queue_limit, config.queue_wait);
        Self { config, pool }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// 解释器是否可用（状态接口与测试用）
    pub async fn interpreter_available(&self) -> bool {
        Command::new(&self.config.python)
            .args(["-c", "import json"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub async fn execute(&self, job: SandboxJob, cancel: &CancellationToken) -> Result<SandboxOutput, SandboxFailure> {
        let start = Instant::now();
        let kind = job.payload_kind();
        let result = self.run(&job, cancel).await;
        let outcome = match &result {
            Ok(out) if out.truncated => "ok_truncated",
            Ok(_) => "ok",
            Err(f) => match f.kind {
                SandboxFailureKind::Forbidden => "forbidden",
                SandboxFailureKind::ResourceExceeded => "resource_exceeded",
                SandboxFailureKind::ExecutionError => "execution_error",
                SandboxFailureKind::Overloaded => "overloaded",
                SandboxFailureKind::Cancelled => "cancelled",
            },
        };
        tracing::info!(
            intent = %job.declared_intent,
            payload_kind = ?kind,
            outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            "sandbox job"
        );
        result
    }

    async fn run(&self, job: &SandboxJob, cancel: &CancellationToken) -> Result<SandboxOutput, SandboxFailure> {
        if let Some(violation) = denylist::scan(&job.code) {
            tracing::warn!(rule = violation.rule, "analysis code rejected by static scan");
            return Err(SandboxFailure::forbidden(format!("code rejected: {violation}")));
        }

        let mut options = self.config.preload.clone();
        options.dedupe = job.dedupe;
        let input = preload(&job.payload, &options)
            .map_err(|e| SandboxFailure::execution(format!("input could not be loaded: {e}")))?;
        tracing::debug!(intent = %job.declared_intent, input = %input.describe(), "analysis input preloaded");

        let _permit = tokio::select! {
            permit = self.pool.acquire() => permit?,
            _ = cancel.cancelled() => {
                return Err(SandboxFailure::new(SandboxFailureKind::Cancelled, "turn cancelled while queued"));
            }
        };

        let envelope = json!({
            "input": input.envelope(),
            "code": job.code,
            "memory_limit": self.config.memory_limit_mb * 1024 * 1024,
            "cpu_seconds": self.config.timeout.as_secs() + 1,
            "denied_modules": DENIED_MODULES,
        });
        let stdin_bytes = serde_json::to_vec(&envelope)
            .map_err(|e| SandboxFailure::execution(format!("cannot encode job: {e}")))?;

        let mut child = Command::new(&self.config.python)
            .args(["-s", "-B", "-c", PRELUDE])
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("PYTHONHASHSEED", "0")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("OMP_NUM_THREADS", "1")
            .env("OPENBLAS_NUM_THREADS", "1")
            .env("LC_ALL", "C.UTF-8")
            .current_dir(std::env::temp_dir())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxFailure::execution(format!("interpreter unavailable: {e}")))?;

        let ended = tokio::select! {
            r = drive(&mut child, stdin_bytes, self.config.max_output_bytes) => Ended::Finished(r),
            _ = tokio::time::sleep(self.config.timeout) => Ended::TimedOut,
            _ = cancel.cancelled() => Ended::Cancelled,
        };

        match ended {
            Ended::Finished(Ok(captured)) => self.interpret(captured),
            Ended::Finished(Err(e)) => {
                let _ = child.kill().await;
                Err(SandboxFailure::execution(format!("interpreter I/O failed: {e}")))
            }
            Ended::TimedOut => {
                let _ = child.kill().await;
                Err(SandboxFailure::resource_exceeded(format!(
                    "wall-clock limit of {:?} exceeded",
                    self.config.timeout
                )))
            }
            Ended::Cancelled => {
                let _ = child.kill().await;
                Err(SandboxFailure::new(SandboxFailureKind::Cancelled, "turn cancelled; job terminated"))
            }
        }
    }

    fn interpret(&self, captured: Captured) -> Result<SandboxOutput, SandboxFailure> {
        let stderr = String::from_utf8_lossy(&captured.stderr);
        match captured.status.code() {
            Some(EXIT_OK) => {
                let mut text = String::from_utf8_lossy(&captured.stdout).into_owned();
                if captured.truncated {
                    // 截断点可能落在多字节字符中间
                    while text.ends_with('\u{FFFD}') {
                        text.pop();
                    }
                }
                if text.trim().is_empty() && !captured.truncated {
                    text = NO_OUTPUT.to_string();
                }
                Ok(SandboxOutput {
                    captured_output: text,
                    truncated: captured.truncated,
                })
            }
            Some(EXIT_MEMORY) => Err(SandboxFailure::resource_exceeded(format!(
                "memory limit of {} MB exceeded",
                self.config.memory_limit_mb
            ))),
            Some(EXIT_FORBIDDEN) => Err(SandboxFailure::forbidden(sanitize_error(&stderr))),
            Some(EXIT_EXECUTION_ERROR) => Err(SandboxFailure::execution(sanitize_error(&stderr))),
            Some(code) => Err(SandboxFailure::execution(format!(
                "interpreter exited with status {code}: {}",
                sanitize_error(&stderr)
            ))),
            None => Err(SandboxFailure::resource_exceeded(
                "interpreter terminated by the operating system (cpu or memory limit)",
            )),
        }
    }
}

async fn drive(child: &mut Child, input: Vec<u8>, max_output: usize) -> std::io::Result<Captured> {
    if let Some(mut stdin) = child.stdin.take() {
        match stdin.write_all(&input).await {
            Ok(()) => {}
            // 子进程提前退出：以退出码为准
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
            Err(e) => return Err(e),
        }
        drop(stdin);
    }
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (out, err) = tokio::join!(read_capped(stdout, max_output), read_capped(stderr, STDERR_CAP));
    let (stdout, truncated) = out?;
    let (stderr, _) = err?;
    let status = child.wait().await?;
    Ok(Captured {
        stdout,
        truncated,
        stderr,
        status,
    })
}
