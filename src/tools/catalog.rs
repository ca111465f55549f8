//! 工具目录：封闭的工具集合 + 每个工具的参数记录
//!
//! 推理引擎给出 `{"tool": "...", "args": {...}}`；ToolKind::from_name 定位标签，
//! ToolRequest::parse 按标签把 args 反序列化为强类型记录并校验（不做开放式反射）。
//! 参数 JSON Schema 由 schemars 从参数记录生成，注入 Specialist 的 system prompt。

use std::sync::OnceLock;

use regex::Regex;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 封闭工具集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    SearchGeneIndex,
    GetGeneDossier,
    GetProteinFeatures,
    GetStructureMap,
    FetchAlphafoldAccess,
    FetchPdbFile,
    MapVariantToCanonical,
    CheckClinvarStatus,
    AlignIsoforms,
    RunAnalysis,
    SuggestImprovement,
}

impl ToolKind {
    pub const ALL: [ToolKind; 11] = [
        ToolKind::SearchGeneIndex,
        ToolKind::GetGeneDossier,
        ToolKind::GetProteinFeatures,
        ToolKind::GetStructureMap,
        ToolKind::FetchAlphafoldAccess,
        ToolKind::FetchPdbFile,
        ToolKind::MapVariantToCanonical,
        ToolKind::CheckClinvarStatus,
        ToolKind::AlignIsoforms,
        ToolKind::RunAnalysis,
        ToolKind::SuggestImprovement,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ToolKind::SearchGeneIndex => "search_gene_index",
            ToolKind::GetGeneDossier => "get_gene_dossier",
            ToolKind::GetProteinFeatures => "get_protein_features",
            ToolKind::GetStructureMap => "get_structure_map",
            ToolKind::FetchAlphafoldAccess => "fetch_alphafold_access",
            ToolKind::FetchPdbFile => "fetch_pdb_file",
            ToolKind::MapVariantToCanonical => "map_variant_to_canonical",
            ToolKind::CheckClinvarStatus => "check_clinvar_status",
            ToolKind::AlignIsoforms => "align_isoforms",
            ToolKind::RunAnalysis => "run_analysis",
            ToolKind::SuggestImprovement => "suggest_improvement",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.name() == name.trim())
    }

    /// 工具描述（供推理引擎理解功能）
    pub fn description(&self) -> &'static str {
        match self {
            ToolKind::SearchGeneIndex => "Fuzzy search for genes or proteins by name or symbol. Use it to resolve a gene symbol (e.g. 'LDL receptor' -> 'LDLR'). Returns at most 10 candidates.",
            ToolKind::GetGeneDossier => "Retrieve the identity card of a gene: HGNC ID, UniProt ID, canonical isoform and GenCC disease validity.",
            ToolKind::GetProteinFeatures => "Retrieve per-residue protein features (domains, active sites, PTMs, ClinVar) as a TSV table.",
            ToolKind::GetStructureMap => "Map a protein sequence to experimental PDB structures to assess structure coverage.",
            ToolKind::FetchAlphafoldAccess => "Retrieve access to the predicted AlphaFold structure for a UniProt accession. Use only if PDB coverage is poor.",
            ToolKind::FetchPdbFile => "Download the coordinate file of an experimental structure by 4-character PDB ID.",
            ToolKind::MapVariantToCanonical => "Map a protein variant (e.g. p.H23Q) from a specific isoform onto the canonical sequence.",
            ToolKind::CheckClinvarStatus => "Check whether a residue position has a ClinVar entry in the protein feature table.",
            ToolKind::AlignIsoforms => "Align two isoforms of a gene to inspect splicing differences.",
            ToolKind::RunAnalysis => "Run short Python data-analysis code against an earlier tool result (pass its invocation id as `source`) or an inline payload. Tabular data is preloaded as `df`, JSON as `data`, plain text as `text`. Print results or assign `result`. Preloaded modules: pd, np, json, math, statistics. Private attributes (`_name`), eval/exec/getattr, file and network access are rejected.",
            ToolKind::SuggestImprovement => "Submit a suggestion for global system improvement. It is stored as pending and reviewed by administrators before it takes effect.",
        }
    }

    /// 展示信息：(icon, title)
    pub fn display(&self) -> (&'static str, &'static str) {
        match self {
            ToolKind::SearchGeneIndex => ("🔎", "Searching Gene Index"),
            ToolKind::GetGeneDossier => ("📊", "Fetching Gene Information"),
            ToolKind::GetProteinFeatures => ("🧬", "Analyzing Protein Features"),
            ToolKind::GetStructureMap => ("🗂️", "Mapping Structure Coverage"),
            ToolKind::FetchAlphafoldAccess => ("🔮", "Getting AlphaFold Structure"),
            ToolKind::FetchPdbFile => ("📥", "Downloading PDB Structure"),
            ToolKind::MapVariantToCanonical => ("🗺️", "Mapping Variant"),
            ToolKind::CheckClinvarStatus => ("🩺", "Checking ClinVar"),
            ToolKind::AlignIsoforms => ("🔀", "Aligning Isoforms"),
            ToolKind::RunAnalysis => ("🐍", "Running Custom Analysis"),
            ToolKind::SuggestImprovement => ("💡", "Submitting Suggestion"),
        }
    }

    /// 参数 JSON Schema（schemars 生成）
    pub fn parameters_schema(&self) -> Value {
        let schema = match self {
            ToolKind::SearchGeneIndex => schema_for!(SearchGeneIndexArgs),
            ToolKind::GetGeneDossier => schema_for!(GeneDossierArgs),
            ToolKind::GetProteinFeatures | ToolKind::GetStructureMap => schema_for!(ProteinArgs),
            ToolKind::FetchAlphafoldAccess => schema_for!(AlphafoldArgs),
            ToolKind::FetchPdbFile => schema_for!(PdbFileArgs),
            ToolKind::MapVariantToCanonical => schema_for!(VariantMapArgs),
            ToolKind::CheckClinvarStatus => schema_for!(ClinvarArgs),
            ToolKind::AlignIsoforms => schema_for!(AlignIsoformsArgs),
            ToolKind::RunAnalysis => schema_for!(RunAnalysisArgs),
            ToolKind::SuggestImprovement => schema_for!(SuggestImprovementArgs),
        };
        serde_json::to_value(schema).unwrap_or(Value::Null)
    }

    /// 由 Tool Gateway 处理（外部 HTTP）；RunAnalysis 走沙箱，SuggestImprovement 走反馈存储
    pub fn is_gateway_tool(&self) -> bool {
        !matches!(self, ToolKind::RunAnalysis | ToolKind::SuggestImprovement)
    }
}

/// 参数校验错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("arguments do not match schema: {0}")]
    Schema(String),
    #[error("field `{field}` is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._:-]{0,63}$").expect("valid regex"))
}

/// URL 路径段中的标识符：只允许字母数字与 `._:-`
fn check_identifier(field: &'static str, value: &str) -> Result<(), ArgumentError> {
    if identifier_re().is_match(value.trim()) {
        Ok(())
    } else {
        Err(ArgumentError::Invalid {
            field,
            reason: format!("'{value}' is not a valid identifier"),
        })
    }
}

fn check_non_empty(field: &'static str, value: &str) -> Result<(), ArgumentError> {
    if value.trim().is_empty() {
        Err(ArgumentError::Invalid {
            field,
            reason: "must not be empty".to_string(),
        })
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SearchGeneIndexArgs {
    /// Name or symbol to search for, e.g. "her2" or "insulin"
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct GeneDossierArgs {
    /// Official gene symbol, e.g. "LDLR"
    pub gene_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ProteinArgs {
    /// Gene symbol, e.g. "LDLR"
    pub gene: String,
    /// UniProt accession, e.g. "P01130"
    pub protein_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct AlphafoldArgs {
    /// UniProt accession
    pub uniprot_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct PdbFileArgs {
    /// 4-character PDB ID, e.g. "7K4Y"
    pub pdb_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct VariantMapArgs {
    pub gene: String,
    /// Isoform identifier, e.g. "NM_000527"
    pub isoform_id: String,
    /// Protein variant, e.g. "p.H23Q"
    pub variant: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct ClinvarArgs {
    pub gene: String,
    /// Canonical UniProt accession
    pub protein_id: String,
    /// Residue number (1-based)
    pub position: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct AlignIsoformsArgs {
    pub gene: String,
    pub iso1: String,
    pub iso2: String,
}

/// 内联载荷格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Tsv,
    Csv,
    Json,
    Text,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct RunAnalysisArgs {
    /// Python code; print() results or assign `result`
    pub code: String,
    /// One-line description of the analysis intent
    pub description: String,
    /// Invocation id of an earlier tool call in this turn whose result should be preloaded
    #[serde(default)]
    pub source: Option<String>,
    /// Inline raw data when no `source` is given
    #[serde(default)]
    pub data_payload: Option<String>,
    #[serde(default)]
    pub data_format: Option<DataFormat>,
    /// Deduplicate rows on the identity key; set false for isoform-aware analyses
    #[serde(default = "default_true")]
    pub dedupe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementCategory {
    ResponseAccuracy,
    CitationRules,
    ExplanationStyle,
    DomainExpertise,
}

impl ImprovementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImprovementCategory::ResponseAccuracy => "response_accuracy",
            ImprovementCategory::CitationRules => "citation_rules",
            ImprovementCategory::ExplanationStyle => "explanation_style",
            ImprovementCategory::DomainExpertise => "domain_expertise",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, JsonSchema)]
pub struct SuggestImprovementArgs {
    pub category: ImprovementCategory,
    pub suggestion: String,
}

/// 已校验的工具请求
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    SearchGeneIndex(SearchGeneIndexArgs),
    GetGeneDossier(GeneDossierArgs),
    GetProteinFeatures(ProteinArgs),
    GetStructureMap(ProteinArgs),
    FetchAlphafoldAccess(AlphafoldArgs),
    FetchPdbFile(PdbFileArgs),
    MapVariantToCanonical(VariantMapArgs),
    CheckClinvarStatus(ClinvarArgs),
    AlignIsoforms(AlignIsoformsArgs),
    RunAnalysis(RunAnalysisArgs),
    SuggestImprovement(SuggestImprovementArgs),
}

fn decode<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ArgumentError> {
    serde_json::from_value(args).map_err(|e| ArgumentError::Schema(e.to_string()))
}

impl ToolRequest {
    /// 按工具标签解析并校验参数
    pub fn parse(kind: ToolKind, args: Value) -> Result<Self, ArgumentError> {
        let req = match kind {
            ToolKind::SearchGeneIndex => ToolRequest::SearchGeneIndex(decode(args)?),
            ToolKind::GetGeneDossier => ToolRequest::GetGeneDossier(decode(args)?),
            ToolKind::GetProteinFeatures => ToolRequest::GetProteinFeatures(decode(args)?),
            ToolKind::GetStructureMap => ToolRequest::GetStructureMap(decode(args)?),
            ToolKind::FetchAlphafoldAccess => ToolRequest::FetchAlphafoldAccess(decode(args)?),
            ToolKind::FetchPdbFile => ToolRequest::FetchPdbFile(decode(args)?),
            ToolKind::MapVariantToCanonical => ToolRequest::MapVariantToCanonical(decode(args)?),
            ToolKind::CheckClinvarStatus => ToolRequest::CheckClinvarStatus(decode(args)?),
            ToolKind::AlignIsoforms => ToolRequest::AlignIsoforms(decode(args)?),
            ToolKind::RunAnalysis => ToolRequest::RunAnalysis(decode(args)?),
            ToolKind::SuggestImprovement => ToolRequest::SuggestImprovement(decode(args)?),
        };
        req.validate()?;
        Ok(req)
    }

    pub fn kind(&self) -> ToolKind {
        match self {
            ToolRequest::SearchGeneIndex(_) => ToolKind::SearchGeneIndex,
            ToolRequest::GetGeneDossier(_) => ToolKind::GetGeneDossier,
            ToolRequest::GetProteinFeatures(_) => ToolKind::GetProteinFeatures,
            ToolRequest::GetStructureMap(_) => ToolKind::GetStructureMap,
            ToolRequest::FetchAlphafoldAccess(_) => ToolKind::FetchAlphafoldAccess,
            ToolRequest::FetchPdbFile(_) => ToolKind::FetchPdbFile,
            ToolRequest::MapVariantToCanonical(_) => ToolKind::MapVariantToCanonical,
            ToolRequest::CheckClinvarStatus(_) => ToolKind::CheckClinvarStatus,
            ToolRequest::AlignIsoforms(_) => ToolKind::AlignIsoforms,
            ToolRequest::RunAnalysis(_) => ToolKind::RunAnalysis,
            ToolRequest::SuggestImprovement(_) => ToolKind::SuggestImprovement,
        }
    }

    fn validate(&self) -> Result<(), ArgumentError> {
        match self {
            ToolRequest::SearchGeneIndex(a) => check_non_empty("query", &a.query),
            ToolRequest::GetGeneDossier(a) => check_identifier("gene_name", &a.gene_name),
            ToolRequest::GetProteinFeatures(a) | ToolRequest::GetStructureMap(a) => {
                check_identifier("gene", &a.gene)?;
                check_identifier("protein_id", &a.protein_id)
            }
            ToolRequest::FetchAlphafoldAccess(a) => check_identifier("uniprot_id", &a.uniprot_id),
            ToolRequest::FetchPdbFile(a) => {
                let id = a.pdb_id.trim();
                if id.len() == 4 && id.chars().all(|c| c.is_ascii_alphanumeric()) {
                    Ok(())
                } else {
                    Err(ArgumentError::Invalid {
                        field: "pdb_id",
                        reason: format!("'{id}' is not a 4-character PDB ID"),
                    })
                }
            }
            ToolRequest::MapVariantToCanonical(a) => {
                check_identifier("gene", &a.gene)?;
                check_identifier("isoform_id", &a.isoform_id)?;
                check_non_empty("variant", &a.variant)
            }
            ToolRequest::CheckClinvarStatus(a) => {
                check_identifier("gene", &a.gene)?;
                check_identifier("protein_id", &a.protein_id)?;
                if a.position == 0 {
                    return Err(ArgumentError::Invalid {
                        field: "position",
                        reason: "residue positions are 1-based".to_string(),
                    });
                }
                Ok(())
            }
            ToolRequest::AlignIsoforms(a) => {
                check_identifier("gene", &a.gene)?;
                check_identifier("iso1", &a.iso1)?;
                check_identifier("iso2", &a.iso2)
            }
            ToolRequest::RunAnalysis(a) => {
                check_non_empty("code", &a.code)?;
                if a.source.is_none() && a.data_payload.is_none() {
                    return Err(ArgumentError::Invalid {
                        field: "source",
                        reason: "either `source` or `data_payload` is required".to_string(),
                    });
                }
                if a.data_payload.is_some() && a.data_format.is_none() {
                    return Err(ArgumentError::Invalid {
                        field: "data_format",
                        reason: "required with `data_payload`".to_string(),
                    });
                }
                Ok(())
            }
            ToolRequest::SuggestImprovement(a) => check_non_empty("suggestion", &a.suggestion),
        }
    }

    /// 参数摘要（Action 事件展示用），如 `Gene: LDLR | Protein: P01130`
    pub fn summary(&self) -> String {
        let parts: Vec<String> = match self {
            ToolRequest::SearchGeneIndex(a) => vec![format!("query: {}", a.query)],
            ToolRequest::GetGeneDossier(a) => vec![format!("Gene: {}", a.gene_name)],
            ToolRequest::GetProteinFeatures(a) | ToolRequest::GetStructureMap(a) => vec![
                format!("Gene: {}", a.gene),
                format!("Protein: {}", a.protein_id),
            ],
            ToolRequest::FetchAlphafoldAccess(a) => vec![format!("Protein: {}", a.uniprot_id)],
            ToolRequest::FetchPdbFile(a) => vec![format!("PDB: {}", a.pdb_id)],
            ToolRequest::MapVariantToCanonical(a) => vec![
                format!("Gene: {}", a.gene),
                format!("isoform_id: {}", a.isoform_id),
                format!("Variant: {}", a.variant),
            ],
            ToolRequest::CheckClinvarStatus(a) => vec![
                format!("Gene: {}", a.gene),
                format!("Protein: {}", a.protein_id),
                format!("position: {}", a.position),
            ],
            ToolRequest::AlignIsoforms(a) => vec![
                format!("Gene: {}", a.gene),
                format!("iso1: {}", a.iso1),
                format!("iso2: {}", a.iso2),
            ],
            ToolRequest::RunAnalysis(a) => vec![a.description.clone()],
            ToolRequest::SuggestImprovement(a) => vec![format!("category: {}", a.category.as_str())],
        };
        parts.join(" | ")
    }
}

/// 工具目录 JSON（name / description / parameters），用于生成 prompt 中的 Available tools 段落
pub fn tools_schema_json(kinds: &[ToolKind]) -> String {
    let tools: Vec<Value> = kinds
        .iter()
        .map(|k| {
            serde_json::json!({
                "name": k.name(),
                "description": k.description(),
                "parameters": k.parameters_schema(),
            })
        })
        .collect();
    serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_names_roundtrip() {
        for kind in ToolKind::ALL {
            assert_eq!(ToolKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ToolKind::from_name("shell"), None);
    }

    #[test]
    fn test_parse_valid_dossier() {
        let req = ToolRequest::parse(ToolKind::GetGeneDossier, json!({"gene_name": "LDLR"})).unwrap();
        assert_eq!(req.kind(), ToolKind::GetGeneDossier);
        assert_eq!(req.summary(), "Gene: LDLR");
    }

    #[test]
    fn test_parse_rejects_path_injection() {
        let err = ToolRequest::parse(ToolKind::GetGeneDossier, json!({"gene_name": "../admin"}))
            .unwrap_err();
        assert!(matches!(err, ArgumentError::Invalid { field: "gene_name", .. }));
    }

    #[test]
    fn test_parse_rejects_missing_field() {
        let err = ToolRequest::parse(ToolKind::GetProteinFeatures, json!({"gene": "LDLR"})).unwrap_err();
        assert!(matches!(err, ArgumentError::Schema(_)));
    }

    #[test]
    fn test_run_analysis_defaults_and_requirements() {
        let req = ToolRequest::parse(
            ToolKind::RunAnalysis,
            json!({"code": "print(len(df))", "description": "count rows", "source": "inv-1"}),
        )
        .unwrap();
        match req {
            ToolRequest::RunAnalysis(a) => assert!(a.dedupe),
            _ => unreachable!(),
        }

        let err = ToolRequest::parse(
            ToolKind::RunAnalysis,
            json!({"code": "print(1)", "description": "x", "data_payload": "a\tb"}),
        )
        .unwrap_err();
        assert!(matches!(err, ArgumentError::Invalid { field: "data_format", .. }));
    }

    #[test]
    fn test_schema_lists_required_fields() {
        let schema = ToolKind::CheckClinvarStatus.parameters_schema();
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("position")));
        assert!(tools_schema_json(&[ToolKind::GetGeneDossier]).contains("gene_name"));
    }
}
