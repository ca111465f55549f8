//! 工具结果载荷：表格文本 / 结构化记录 / 纯文本 / 二进制引用
//!
//! 载荷标签决定沙箱如何预加载（df / data / text / blob_ref）。

use serde::Serialize;
use serde_json::Value;

/// 表格分隔符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delimiter {
    Tab,
    Comma,
}

impl Delimiter {
    pub fn as_char(&self) -> char {
        match self {
            Delimiter::Tab => '\t',
            Delimiter::Comma => ',',
        }
    }
}

/// 载荷标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Tabular,
    Structured,
    Text,
    Binary,
}

/// 工具结果载荷
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    Tabular { text: String, delimiter: Delimiter },
    Structured(Value),
    /// 纯文本文档（如 PDB 坐标文件）
    Text(String),
    /// 不透明二进制，只保存引用
    Binary { reference: String, mime: String },
}

impl ToolPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ToolPayload::Tabular { .. } => PayloadKind::Tabular,
            ToolPayload::Structured(_) => PayloadKind::Structured,
            ToolPayload::Text(_) => PayloadKind::Text,
            ToolPayload::Binary { .. } => PayloadKind::Binary,
        }
    }

    /// 根据响应的 content-type 与内容判断载荷类型
    pub fn detect(body: String, content_type: Option<&str>, reference: &str) -> Self {
        let ct = content_type.unwrap_or("").to_lowercase();
        if ct.contains("json") {
            if let Ok(v) = serde_json::from_str::<Value>(&body) {
                return ToolPayload::Structured(v);
            }
        }
        let is_textual = ct.is_empty() || ct.starts_with("text/") || ct.contains("json");
        if !is_textual {
            return ToolPayload::Binary {
                reference: reference.to_string(),
                mime: ct,
            };
        }
        let trimmed = body.trim_start();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
                return ToolPayload::Structured(v);
            }
        }
        let header = trimmed.lines().next().unwrap_or("");
        if header.contains('\t') {
            return ToolPayload::Tabular {
                text: body,
                delimiter: Delimiter::Tab,
            };
        }
        if ct.contains("csv") {
            return ToolPayload::Tabular {
                text: body,
                delimiter: Delimiter::Comma,
            };
        }
        ToolPayload::Text(body)
    }

    /// 形状描述（写入历史，供推理引擎引用）
    pub fn describe(&self) -> String {
        match self {
            ToolPayload::Tabular { text, delimiter } => {
                let mut lines = text.lines().filter(|l| !l.trim().is_empty());
                let header = lines.next().unwrap_or("");
                let cols = header.split(delimiter.as_char()).count();
                let rows = lines.count();
                format!("tabular, {rows} rows x {cols} columns: [{}]", header.replace(delimiter.as_char(), ", "))
            }
            ToolPayload::Structured(v) => match v {
                Value::Array(a) => format!("structured, array of {} items", a.len()),
                Value::Object(o) => format!("structured, object with {} keys", o.len()),
                _ => "structured, scalar".to_string(),
            },
            ToolPayload::Text(t) => format!("text, {} lines", t.lines().count()),
            ToolPayload::Binary { mime, .. } => format!("binary reference ({mime})"),
        }
    }

    /// 内容预览（按字符截断）
    pub fn preview(&self, max_chars: usize) -> String {
        let full = match self {
            ToolPayload::Tabular { text, .. } | ToolPayload::Text(text) => text.clone(),
            ToolPayload::Structured(v) => v.to_string(),
            ToolPayload::Binary { reference, .. } => reference.clone(),
        };
        truncate_chars(&full, max_chars)
    }
}

/// 按字符截断，超出时追加 "..."
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

/// 规范化的工具结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub payload: ToolPayload,
    /// 来源（请求 URL 或内部标识）
    pub source: String,
}

impl ToolResult {
    pub fn new(payload: ToolPayload, source: impl Into<String>) -> Self {
        Self {
            payload,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_json_and_tsv() {
        let p = ToolPayload::detect(r#"{"hgnc":"LDLR"}"#.to_string(), Some("application/json"), "u");
        assert_eq!(p.kind(), PayloadKind::Structured);

        let tsv = "residueId\tPfMA\tClinVar\n1\tSignal\t\n2\t\tPathogenic\n".to_string();
        let p = ToolPayload::detect(tsv, Some("text/plain"), "u");
        assert_eq!(p.kind(), PayloadKind::Tabular);
        assert!(p.describe().starts_with("tabular, 2 rows x 3 columns"));
    }

    #[test]
    fn test_detect_text_and_binary() {
        let pdb = "HEADER    LIPID TRANSPORT\nATOM      1  N   MET A   1\n".to_string();
        assert_eq!(ToolPayload::detect(pdb, None, "u").kind(), PayloadKind::Text);

        let p = ToolPayload::detect("\u{0}\u{1}".to_string(), Some("application/octet-stream"), "https://x/model.cif");
        assert_eq!(
            p,
            ToolPayload::Binary {
                reference: "https://x/model.cif".to_string(),
                mime: "application/octet-stream".to_string()
            }
        );
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("🧬🧬🧬", 2), "🧬🧬...");
        assert_eq!(truncate_chars("abc", 5), "abc");
    }
}
