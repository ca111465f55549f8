//! 沙箱执行器：对工具结果运行短小的分析代码
//!
//! - preload：表格规范化（数值强转、缺失值、去重）
//! - denylist：执行前的静态能力扫描
//! - prelude：解释器端引导脚本（绑定输入、rlimit、受限 builtins）
//! - executor：工作池 + 一次性子进程 + 超时/取消

pub mod denylist;
pub mod executor;
pub mod preload;
pub mod prelude;

pub use denylist::{scan, Violation, DENIED_MODULES};
pub use executor::{sanitize_error, SandboxConfig, SandboxExecutor, SandboxJob, SandboxOutput, WorkerPool};
pub use preload::{inline_payload, preload, Cell, ColumnType, PreloadError, PreloadOptions, PreloadedInput, Table};
