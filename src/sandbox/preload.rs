//! 载荷预加载：在进入解释器之前把 ToolResult 规范化为沙箱输入
//!
//! 表格规则：
//! - 声明为数值的列强制转为数字，无法解析或空白的单元格为 null（不是 0）
//! - 声明为文本的列（如 ClinVar）一律按字符串处理
//! - 其余列按内容推断：全部非空单元格可解析为数字则为数值列
//! - 文本列的缺失值填 ""，数值列的缺失值保持 null
//! - 按身份键去重（保留首行），dedupe=false 时跳过
//! - 行比表头长时报 RaggedRow，行比表头短时补空

use std::collections::HashSet;

use serde::Serialize;
use serde_json::{json, Map, Number, Value};
use thiserror::Error;

use crate::tools::catalog::DataFormat;
use crate::tools::payload::{Delimiter, ToolPayload};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreloadOptions {
    pub numeric_columns: Vec<String>,
    pub text_columns: Vec<String>,
    pub identity_key: String,
    pub dedupe: bool,
}

impl Default for PreloadOptions {
    fn default() -> Self {
        Self {
            numeric_columns: ["residueId", "position", "start", "end"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            text_columns: vec!["ClinVar".to_string()],
            identity_key: "residueId".to_string(),
            dedupe: true,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreloadError {
    #[error("tabular payload has no header row")]
    Empty,
    #[error("line {line}: expected {expected} fields, found {found}")]
    RaggedRow {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(String),
}

/// 单元格
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Number(f64),
    Text(String),
}

impl Cell {
    fn to_json(&self) -> Value {
        match self {
            Cell::Null => Value::Null,
            // 整数值按整数传递，避免解释器侧把 residueId 打印成 1.0
            Cell::Number(n) if n.fract() == 0.0 && n.abs() < 9.0e15 => Value::from(*n as i64),
            Cell::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
            Cell::Text(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Numeric,
    Text,
}

/// 规范化后的表格
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    types: Vec<ColumnType>,
    rows: Vec<Vec<Cell>>,
}

/// 按分隔符切分一行，支持双引号包裹（"" 转义为 "）
fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            c if c == delimiter && !in_quotes => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn parse_number(raw: &str) -> Option<f64> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    t.parse::<f64>().ok().filter(|n| n.is_finite())
}

impl Table {
    pub fn parse(text: &str, delimiter: Delimiter, options: &PreloadOptions) -> Result<Self, PreloadError> {
        let sep = delimiter.as_char();
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
            .filter(|(_, l)| !l.trim().is_empty());

        let (_, header) = lines.next().ok_or(PreloadError::Empty)?;
        let columns: Vec<String> = split_record(header, sep)
            .into_iter()
            .map(|h| h.trim().to_string())
            .collect();
        let width = columns.len();

        let mut raw_rows = Vec::new();
        for (line, l) in lines {
            let mut fields = split_record(l, sep);
            if fields.len() > width {
                return Err(PreloadError::RaggedRow {
                    line,
                    expected: width,
                    found: fields.len(),
                });
            }
            fields.resize(width, String::new());
            raw_rows.push(fields);
        }

        let types: Vec<ColumnType> = columns
            .iter()
            .enumerate()
            .map(|(i, name)| {
                if options.text_columns.iter().any(|c| c == name) {
                    ColumnType::Text
                } else if options.numeric_columns.iter().any(|c| c == name) {
                    ColumnType::Numeric
                } else {
                    let mut non_blank = raw_rows.iter().map(|r| r[i].trim()).filter(|v| !v.is_empty()).peekable();
                    if non_blank.peek().is_some() && non_blank.all(|v| parse_number(v).is_some()) {
                        ColumnType::Numeric
                    } else {
                        ColumnType::Text
                    }
                }
            })
            .collect();

        let rows = raw_rows
            .into_iter()
            .map(|fields| {
                fields
                    .into_iter()
                    .zip(&types)
                    .map(|(raw, ty)| match ty {
                        ColumnType::Numeric => parse_number(&raw).map(Cell::Number).unwrap_or(Cell::Null),
                        ColumnType::Text => Cell::Text(raw),
                    })
                    .collect()
            })
            .collect();

        let mut table = Self { columns, types, rows };
        if options.dedupe {
            table.dedupe(&options.identity_key);
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn column_types(&self) -> &[ColumnType] {
        &self.types
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// 列均值：只计非空数值
    pub fn column_mean(&self, name: &str) -> Option<f64> {
        let idx = self.column_index(name)?;
        let values: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|r| match r.get(idx) {
                Some(Cell::Number(n)) => Some(*n),
                _ => None,
            })
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.iter().sum::<f64>() / values.len() as f64)
        }
    }

    /// 按身份键去重（保留首行）；键为 null 的行不参与去重。返回删除的行数
    pub fn dedupe(&mut self, key: &str) -> usize {
        let Some(idx) = self.column_index(key) else {
            return 0;
        };
        let before = self.rows.len();
        let mut seen: HashSet<String> = HashSet::with_capacity(before);
        self.rows.retain(|row| match &row[idx] {
            Cell::Null => true,
            Cell::Number(n) => seen.insert(format!("n:{n}")),
            Cell::Text(s) => seen.insert(format!("s:{s}")),
        });
        before - self.rows.len()
    }

    /// 行记录数组（JSON），列顺序由 `columns` 单独给出
    pub fn to_records(&self) -> Value {
        Value::Array(
            self.rows
                .iter()
                .map(|row| {
                    let obj: Map<String, Value> = self
                        .columns
                        .iter()
                        .cloned()
                        .zip(row.iter().map(Cell::to_json))
                        .collect();
                    Value::Object(obj)
                })
                .collect(),
        )
    }
}

/// 沙箱输入：决定解释器中绑定的变量（df / data / text / blob_ref）
#[derive(Debug, Clone, PartialEq)]
pub enum PreloadedInput {
    Table(Table),
    Structured(Value),
    Text(String),
    BinaryRef { reference: String, mime: String },
}

impl PreloadedInput {
    /// 发给解释器的输入信封
    pub fn envelope(&self) -> Value {
        match self {
            PreloadedInput::Table(t) => json!({
                "kind": "table",
                "columns": t.columns(),
                "types": t.column_types(),
                "records": t.to_records(),
            }),
            PreloadedInput::Structured(v) => json!({ "kind": "structured", "data": v }),
            PreloadedInput::Text(s) => json!({ "kind": "text", "text": s }),
            PreloadedInput::BinaryRef { reference, mime } => json!({
                "kind": "binary",
                "blob_ref": { "reference": reference, "mime": mime },
            }),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PreloadedInput::Table(t) => format!("df: {} rows x {} columns", t.len(), t.columns().len()),
            PreloadedInput::Structured(_) => "data: structured".to_string(),
            PreloadedInput::Text(s) => format!("text: {} chars", s.chars().count()),
            PreloadedInput::BinaryRef { mime, .. } => format!("blob_ref: {mime}"),
        }
    }
}

/// 按载荷标签预加载
pub fn preload(payload: &ToolPayload, options: &PreloadOptions) -> Result<PreloadedInput, PreloadError> {
    Ok(match payload {
        ToolPayload::Tabular { text, delimiter } => {
            PreloadedInput::Table(Table::parse(text, *delimiter, options)?)
        }
        ToolPayload::Structured(v) => PreloadedInput::Structured(v.clone()),
        ToolPayload::Text(s) => PreloadedInput::Text(s.clone()),
        ToolPayload::Binary { reference, mime } => PreloadedInput::BinaryRef {
            reference: reference.clone(),
            mime: mime.clone(),
        },
    })
}

/// 内联载荷转为 ToolPayload
pub fn inline_payload(raw: &str, format: DataFormat) -> Result<ToolPayload, PreloadError> {
    Ok(match format {
        DataFormat::Tsv => ToolPayload::Tabular {
            text: raw.to_string(),
            delimiter: Delimiter::Tab,
        },
        DataFormat::Csv => ToolPayload::Tabular {
            text: raw.to_string(),
            delimiter: Delimiter::Comma,
        },
        DataFormat::Json => ToolPayload::Structured(
            serde_json::from_str(raw).map_err(|e| PreloadError::InvalidJson(e.to_string()))?,
        ),
        DataFormat::Text => ToolPayload::Text(raw.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tsv(text: &str) -> Table {
        Table::parse(text, Delimiter::Tab, &PreloadOptions::default()).unwrap()
    }

    #[test]
    fn test_blank_numeric_cell_is_null_not_zero() {
        let t = tsv("residueId\tscore\n1\t2.0\n2\t\n3\t4.0\n");
        let score = t.column_index("score").unwrap();
        assert_eq!(t.rows()[1][score], Cell::Null);
        // 手算：(2.0 + 4.0) / 2
        assert_eq!(t.column_mean("score"), Some(3.0));
        assert_eq!(t.to_records()[1]["score"], Value::Null);
    }

    #[test]
    fn test_declared_numeric_column_coerces() {
        let t = tsv("residueId\tPfMA\n1\tSignal\nabc\tLDLa\n");
        assert_eq!(t.rows()[1][0], Cell::Null);
        assert_eq!(t.column_types()[0], ColumnType::Numeric);
    }

    #[test]
    fn test_clinvar_forced_textual_and_blank_text_is_empty() {
        let t = tsv("residueId\tClinVar\tnote\n1\t1\tx\n2\t\t\n");
        assert_eq!(t.rows()[0][1], Cell::Text("1".to_string()));
        assert_eq!(t.rows()[1][1], Cell::Text(String::new()));
        assert_eq!(t.rows()[1][2], Cell::Text(String::new()));
    }

    #[test]
    fn test_dedupe_on_identity_key() {
        let text = "residueId\tisoform\n7\tA\n7\tB\n8\tA\n";
        let t = tsv(text);
        assert_eq!(t.len(), 2);
        assert_eq!(t.rows()[0][1], Cell::Text("A".to_string()));

        let keep = Table::parse(
            text,
            Delimiter::Tab,
            &PreloadOptions {
                dedupe: false,
                ..PreloadOptions::default()
            },
        )
        .unwrap();
        assert_eq!(keep.len(), 3);
    }

    #[test]
    fn test_dedupe_scales_and_keeps_null_keys() {
        let mut text = String::from("residueId\tscore\n");
        for i in 0..20_000 {
            text.push_str(&format!("{}\t{}\n", i % 500, i));
        }
        text.push_str("\t1\n\t2\n");
        let mut t = Table::parse(
            &text,
            Delimiter::Tab,
            &PreloadOptions {
                dedupe: false,
                ..PreloadOptions::default()
            },
        )
        .unwrap();
        assert_eq!(t.dedupe("residueId"), 20_000 - 500);
        // 500 个不同的键 + 2 行空键
        assert_eq!(t.len(), 502);
        assert_eq!(t.rows()[499][1], Cell::Number(499.0));
        assert_eq!(
            PreloadedInput::Table(t).describe(),
            "df: 502 rows x 2 columns"
        );
    }

    #[test]
    fn test_ragged_rows() {
        let err = Table::parse("a\tb\n1\t2\t3\n", Delimiter::Tab, &PreloadOptions::default()).unwrap_err();
        assert_eq!(
            err,
            PreloadError::RaggedRow {
                line: 2,
                expected: 2,
                found: 3
            }
        );
        let padded = tsv("a\tb\n1\n");
        assert_eq!(padded.rows()[0].len(), 2);
    }

    #[test]
    fn test_csv_quotes() {
        let t = Table::parse(
            "name,desc\nLDLR,\"receptor, low density\"\n",
            Delimiter::Comma,
            &PreloadOptions::default(),
        )
        .unwrap();
        assert_eq!(t.rows()[0][1], Cell::Text("receptor, low density".to_string()));
    }

    #[test]
    fn test_empty_and_inline() {
        assert_eq!(
            Table::parse("  \n", Delimiter::Tab, &PreloadOptions::default()).unwrap_err(),
            PreloadError::Empty
        );
        assert!(matches!(
            inline_payload("{bad", DataFormat::Json),
            Err(PreloadError::InvalidJson(_))
        ));
        let env = preload(&inline_payload("hello", DataFormat::Text).unwrap(), &PreloadOptions::default())
            .unwrap()
            .envelope();
        assert_eq!(env["kind"], "text");
    }
}
