//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，RUST_LOG 覆盖。重复初始化（测试、嵌入方已初始化）时静默跳过。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .try_init();
}
