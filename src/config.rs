//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `G2P__*` 覆盖（双下划线表示嵌套，如 `G2P__SANDBOX__WORKERS=8`）。
//! 每个字段都有默认值，空配置也是合法配置。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub router: RouterSection,
    pub agents: AgentsSection,
    pub portal: PortalSection,
    pub sandbox: SandboxSection,
    pub stream: StreamSection,
    pub feedback: FeedbackSection,
    pub server: ServerSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 每个会话保留的历史轮数
    pub max_history_turns: usize,
    /// 每个会话保留的已关闭回合数（含事件日志）
    pub max_stored_turns: usize,
    /// 进程内会话数上限，超出时淘汰最久未更新的会话
    pub max_conversations: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "g2p-router".to_string(),
            max_history_turns: 10,
            max_stored_turns: 50,
            max_conversations: 1000,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai（任意 OpenAI 兼容端点）/ mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub temperature: f32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 60,
            temperature: 0.1,
        }
    }
}

/// [router] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSection {
    /// 低于该置信度时先提澄清问题
    pub confidence_floor: f32,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            confidence_floor: 0.35,
        }
    }
}

/// [agents] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub max_tool_rounds: usize,
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self { max_tool_rounds: 5 }
    }
}

/// [portal] 段：G2P 门户与 RCSB
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortalSection {
    pub base_url: String,
    pub pdb_base_url: String,
    pub timeout_secs: u64,
    pub retry_backoff_ms: u64,
    pub max_search_results: usize,
}

impl Default for PortalSection {
    fn default() -> Self {
        Self {
            base_url: crate::tools::gateway::DEFAULT_BASE_URL.to_string(),
            pdb_base_url: crate::tools::gateway::DEFAULT_PDB_BASE_URL.to_string(),
            timeout_secs: 20,
            retry_backoff_ms: 250,
            max_search_results: 10,
        }
    }
}

/// [sandbox] 段：解释器、资源上限、工作池、预加载规则
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub python: String,
    pub timeout_secs: u64,
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
    pub workers: usize,
    pub queue_limit: usize,
    pub queue_wait_secs: u64,
    pub numeric_columns: Vec<String>,
    pub text_columns: Vec<String>,
    pub identity_key: String,
    pub dedupe: bool,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            timeout_secs: 5,
            memory_limit_mb: 512,
            max_output_bytes: 16 * 1024,
            workers: 4,
            queue_limit: 16,
            queue_wait_secs: 10,
            numeric_columns: vec![
                "residueId".to_string(),
                "position".to_string(),
                "start".to_string(),
                "end".to_string(),
            ],
            text_columns: vec!["ClinVar".to_string()],
            identity_key: "residueId".to_string(),
            dedupe: true,
        }
    }
}

/// [stream] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    /// 客户端未指定时的可见性：minimal / standard / advanced
    pub default_visibility: String,
    /// 合并相邻 Thinking 片段
    pub coalesce_thinking: bool,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            default_visibility: "standard".to_string(),
            coalesce_thinking: false,
        }
    }
}

/// [feedback] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedbackSection {
    /// memory / sqlite
    pub backend: String,
    pub sqlite_path: PathBuf,
}

impl Default for FeedbackSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            sqlite_path: PathBuf::from("data/feedback.db"),
        }
    }
}

/// [server] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 从 config 目录加载配置，环境变量 G2P__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 G2P__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("G2P")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_complete() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.agents.max_tool_rounds, 5);
        assert_eq!(cfg.sandbox.timeout_secs, 5);
        assert_eq!(cfg.sandbox.memory_limit_mb, 512);
        assert_eq!(cfg.sandbox.identity_key, "residueId");
        assert_eq!(cfg.feedback.backend, "memory");
        assert_eq!(cfg.app.max_stored_turns, 50);
        assert_eq!(cfg.app.max_conversations, 1000);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[sandbox]\nworkers = 2\n\n[router]\nconfidence_floor = 0.5").unwrap();
        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.sandbox.workers, 2);
        assert_eq!(cfg.sandbox.queue_limit, 16);
        assert_eq!(cfg.router.confidence_floor, 0.5);
        assert_eq!(cfg.agents.max_tool_rounds, 5);
    }
}
