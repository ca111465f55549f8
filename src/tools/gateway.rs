//! Tool Gateway：门户接口的强类型封装
//!
//! call(request) 在统一超时内完成一次调用；瞬时失败（传输错误、超时、408/429/5xx）静默重试一次，
//! 其余 4xx 视为永久失败不重试。每次调用输出一行 JSON 审计日志。
//! 网关无状态，不持有任何回合数据。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::timeout;

use crate::core::ToolFailure;
use crate::sandbox::preload::{Cell, PreloadOptions, Table};
use crate::tools::catalog::{ClinvarArgs, ProteinArgs, ToolRequest};
use crate::tools::payload::{Delimiter, ToolPayload, ToolResult};
use crate::tools::portal::{PortalClient, PortalRequest, PortalResponse};

pub const DEFAULT_BASE_URL: &str = "https://g2p.broadinstitute.org/api";
pub const DEFAULT_PDB_BASE_URL: &str = "https://files.rcsb.org/download";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub pdb_base_url: String,
    pub timeout: Duration,
    /// 第一次瞬时失败后的等待
    pub retry_backoff: Duration,
    pub max_search_results: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            pdb_base_url: DEFAULT_PDB_BASE_URL.to_string(),
            timeout: Duration::from_secs(20),
            retry_backoff: Duration::from_millis(250),
            max_search_results: 10,
        }
    }
}

/// 408 / 429 / 5xx 为瞬时
fn is_transient_status(status: u16) -> bool {
    status == 408 || status == 429 || status >= 500
}

pub struct ToolGateway {
    portal: Arc<dyn PortalClient>,
    config: GatewayConfig,
    preload: PreloadOptions,
}

impl ToolGateway {
    pub fn new(portal: Arc<dyn PortalClient>, config: GatewayConfig) -> Self {
        Self {
            portal,
            config,
            preload: PreloadOptions::default(),
        }
    }

    pub fn with_preload_options(mut self, preload: PreloadOptions) -> Self {
        self.preload = preload;
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// 执行一次网关工具调用；run_analysis / suggest_improvement 不经过网关
    pub async fn call(&self, request: &ToolRequest) -> Result<ToolResult, ToolFailure> {
        let start = Instant::now();
        let result = self.dispatch(request).await;

        let (ok, outcome) = match &result {
            Ok(_) => (true, "ok"),
            Err(f) if f.is_transient() => (false, "transient"),
            Err(_) => (false, "permanent"),
        };
        let audit = json!({
            "event": "tool_audit",
            "tool": request.kind().name(),
            "ok": ok,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": request.summary(),
        });
        tracing::info!(audit = %audit, "tool");
        result
    }

    async fn dispatch(&self, request: &ToolRequest) -> Result<ToolResult, ToolFailure> {
        match request {
            ToolRequest::SearchGeneIndex(a) => self.search(&a.query).await,
            ToolRequest::GetGeneDossier(a) => {
                self.fetch(PortalRequest::get(self.api(&format!("/gene/{}", a.gene_name.trim()))))
                    .await
            }
            ToolRequest::GetProteinFeatures(a) => self.protein_features(a).await,
            ToolRequest::GetStructureMap(a) => {
                self.fetch(PortalRequest::get(self.api(&format!(
                    "/gene/{}/protein/{}/gene-transcript-protein-isoform-structure-map",
                    a.gene.trim(),
                    a.protein_id.trim()
                ))))
                .await
            }
            ToolRequest::FetchAlphafoldAccess(a) => {
                self.fetch(PortalRequest::get(
                    self.api(&format!("/af3StructureByUniProtId/{}", a.uniprot_id.trim())),
                ))
                .await
            }
            ToolRequest::FetchPdbFile(a) => {
                let url = format!(
                    "{}/{}.pdb",
                    self.config.pdb_base_url.trim_end_matches('/'),
                    a.pdb_id.trim().to_uppercase()
                );
                let resp = self.send_with_retry(&PortalRequest::get(url.clone())).await?;
                Ok(ToolResult::new(ToolPayload::Text(resp.body), url))
            }
            ToolRequest::MapVariantToCanonical(a) => {
                let url = self.api(&format!(
                    "/gene/{}/isoform/{}/variant-map",
                    a.gene.trim(),
                    a.isoform_id.trim()
                ));
                self.fetch(PortalRequest::post(url, json!({ "variant": a.variant.trim() })))
                    .await
            }
            ToolRequest::CheckClinvarStatus(a) => self.clinvar(a).await,
            ToolRequest::AlignIsoforms(a) => {
                self.fetch(PortalRequest::get(self.api(&format!(
                    "/gene/{}/protein/{}/{}/alignment",
                    a.gene.trim(),
                    a.iso1.trim(),
                    a.iso2.trim()
                ))))
                .await
            }
            ToolRequest::RunAnalysis(_) | ToolRequest::SuggestImprovement(_) => Err(
                ToolFailure::permanent(format!("{} is not a gateway tool", request.kind().name())),
            ),
        }
    }

    /// 单次往返 + 超时；按状态码分类失败
    async fn send_once(&self, request: &PortalRequest) -> Result<PortalResponse, ToolFailure> {
        let resp = match timeout(self.config.timeout, self.portal.send(request)).await {
            Err(_) => {
                return Err(ToolFailure::transient(format!(
                    "request to {} timed out after {:?}",
                    request.url, self.config.timeout
                )))
            }
            Ok(Err(e)) => return Err(ToolFailure::transient(e.to_string())),
            Ok(Ok(resp)) => resp,
        };
        if resp.is_success() {
            return Ok(resp);
        }
        let message = format!("HTTP {} from {}", resp.status, request.url);
        if is_transient_status(resp.status) {
            Err(ToolFailure::transient(message))
        } else {
            Err(ToolFailure::permanent(message))
        }
    }

    async fn send_with_retry(&self, request: &PortalRequest) -> Result<PortalResponse, ToolFailure> {
        match self.send_once(request).await {
            Err(first) if first.is_transient() => {
                tracing::debug!(url = %request.url, error = %first.message, "transient failure, retrying once");
                tokio::time::sleep(self.config.retry_backoff).await;
                self.send_once(request).await
            }
            other => other,
        }
    }

    async fn fetch(&self, request: PortalRequest) -> Result<ToolResult, ToolFailure> {
        let resp = self.send_with_retry(&request).await?;
        if resp.body.trim().is_empty() && is_textual_response(&resp) {
            return Err(ToolFailure::permanent(format!("empty response from {}", request.url)));
        }
        let payload = ToolPayload::detect(resp.body, resp.content_type.as_deref(), &request.url);
        if matches!(&payload, ToolPayload::Structured(Value::Null)) {
            return Err(ToolFailure::permanent(format!("no record at {}", request.url)));
        }
        Ok(ToolResult::new(payload, request.url))
    }

    async fn search(&self, query: &str) -> Result<ToolResult, ToolFailure> {
        let url = self.api("/genes/options");
        let result = self.fetch(PortalRequest::get(url.clone())).await?;
        let items = match result.payload {
            ToolPayload::Structured(Value::Array(items)) => items,
            other => {
                return Err(ToolFailure::permanent(format!(
                    "unexpected gene index shape: {}",
                    other.describe()
                )))
            }
        };
        let needle = query.trim().to_lowercase();
        let matches: Vec<Value> = items
            .into_iter()
            .filter(|item| option_matches(item, &needle))
            .take(self.config.max_search_results)
            .collect();
        Ok(ToolResult::new(ToolPayload::Structured(Value::Array(matches)), url))
    }

    async fn protein_features(&self, a: &ProteinArgs) -> Result<ToolResult, ToolFailure> {
        let url = self.api(&format!(
            "/gene/{}/protein/{}/protein-features",
            a.gene.trim(),
            a.protein_id.trim()
        ));
        let mut result = self.fetch(PortalRequest::get(url)).await?;
        // 门户有时以 text/plain 返回单列 TSV，表头没有制表符
        if let ToolPayload::Text(text) = &result.payload {
            result.payload = ToolPayload::Tabular {
                text: text.clone(),
                delimiter: Delimiter::Tab,
            };
        }
        Ok(result)
    }

    /// 派生工具：取特征表，定位 ClinVar 列与残基所在行
    async fn clinvar(&self, a: &ClinvarArgs) -> Result<ToolResult, ToolFailure> {
        let features = self
            .protein_features(&ProteinArgs {
                gene: a.gene.clone(),
                protein_id: a.protein_id.clone(),
            })
            .await?;
        let (text, delimiter) = match &features.payload {
            ToolPayload::Tabular { text, delimiter } => (text.as_str(), *delimiter),
            other => {
                return Err(ToolFailure::permanent(format!(
                    "protein features are not tabular ({})",
                    other.describe()
                )))
            }
        };
        let mut options = self.preload.clone();
        options.dedupe = false;
        let table = Table::parse(text, delimiter, &options)
            .map_err(|e| ToolFailure::permanent(format!("cannot parse protein features: {e}")))?;

        let Some(clinvar_col) = table
            .columns()
            .iter()
            .position(|h| h.contains("ClinVar") || h.to_lowercase().contains("clinical"))
        else {
            return Ok(ToolResult::new(
                ToolPayload::Text("ClinVar data not found in features.".to_string()),
                features.source,
            ));
        };

        let row = match table.column_index(&self.preload.identity_key) {
            Some(key_col) => table.rows().iter().find(|r| {
                matches!(r.get(key_col), Some(Cell::Number(n)) if *n == f64::from(a.position))
            }),
            None => table.rows().get(a.position as usize - 1),
        };
        let Some(row) = row else {
            return Err(ToolFailure::permanent(format!(
                "residue {} is out of range for {}",
                a.position, a.protein_id
            )));
        };

        let text = match row.get(clinvar_col) {
            Some(Cell::Text(v)) if !v.trim().is_empty() => {
                format!("ClinVar entry at {}: {}", a.position, v.trim())
            }
            _ => format!("No ClinVar entry found at {}.", a.position),
        };
        Ok(ToolResult::new(ToolPayload::Text(text), features.source))
    }
}

fn is_textual_response(resp: &PortalResponse) -> bool {
    let ct = resp.content_type.as_deref().unwrap_or("").to_lowercase();
    ct.is_empty() || ct.starts_with("text/") || ct.contains("json")
}

/// 索引项可能是 `{label, value}` 对象或纯字符串
fn option_matches(item: &Value, needle: &str) -> bool {
    match item {
        Value::String(s) => s.to_lowercase().contains(needle),
        Value::Object(o) => ["label", "value"].iter().any(|k| {
            o.get(*k)
                .map(|v| match v {
                    Value::String(s) => s.to_lowercase().contains(needle),
                    other => other.to_string().to_lowercase().contains(needle),
                })
                .unwrap_or(false)
        }),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::catalog::ToolKind;
    use crate::tools::portal::{StaticPortal, TransportError};

    fn config() -> GatewayConfig {
        GatewayConfig {
            base_url: "http://portal/api".to_string(),
            pdb_base_url: "http://rcsb".to_string(),
            timeout: Duration::from_secs(2),
            retry_backoff: Duration::from_millis(1),
            max_search_results: 10,
        }
    }

    fn gateway(portal: Arc<StaticPortal>) -> ToolGateway {
        ToolGateway::new(portal, config())
    }

    fn req(kind: ToolKind, args: Value) -> ToolRequest {
        ToolRequest::parse(kind, args).unwrap()
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let portal = Arc::new(StaticPortal::new().with_sequence(
            "http://portal/api/gene/LDLR",
            vec![
                Ok(PortalResponse::status(503)),
                Ok(PortalResponse::json(json!({"hgnc": "HGNC:6547"}))),
            ],
        ));
        let gw = gateway(portal.clone());
        let result = gw
            .call(&req(ToolKind::GetGeneDossier, json!({"gene_name": "LDLR"})))
            .await
            .unwrap();
        assert_eq!(result.payload, ToolPayload::Structured(json!({"hgnc": "HGNC:6547"})));
        assert_eq!(portal.hits("http://portal/api/gene/LDLR"), 2);
    }

    #[tokio::test]
    async fn test_transient_failure_twice_surfaces() {
        let portal = Arc::new(StaticPortal::new().with_sequence(
            "http://portal/api/gene/LDLR",
            vec![Err(TransportError::Timeout)],
        ));
        let gw = gateway(portal.clone());
        let err = gw
            .call(&req(ToolKind::GetGeneDossier, json!({"gene_name": "LDLR"})))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(portal.hits("http://portal/api/gene/LDLR"), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let portal = Arc::new(StaticPortal::new());
        let gw = gateway(portal.clone());
        let err = gw
            .call(&req(ToolKind::GetGeneDossier, json!({"gene_name": "NOTAGENE"})))
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(portal.hits("http://portal/api/gene/NOTAGENE"), 1);
    }

    #[tokio::test]
    async fn test_search_filters_and_caps() {
        let options: Vec<Value> = (0..30)
            .map(|i| json!({"label": format!("LDLR{i}"), "value": format!("LDLR{i}")}))
            .chain(std::iter::once(json!({"label": "BRCA1", "value": "BRCA1"})))
            .collect();
        let portal = Arc::new(
            StaticPortal::new().with_route("http://portal/api/genes/options", PortalResponse::json(Value::Array(options))),
        );
        let gw = gateway(portal);
        let result = gw
            .call(&req(ToolKind::SearchGeneIndex, json!({"query": "ldlr"})))
            .await
            .unwrap();
        match result.payload {
            ToolPayload::Structured(Value::Array(items)) => assert_eq!(items.len(), 10),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clinvar_derived_from_features() {
        let tsv = "residueId\tPfMA\tClinVar\n1\tSignal\t\n2\tLDLa\tPathogenic\n";
        let portal = Arc::new(StaticPortal::new().with_route(
            "http://portal/api/gene/LDLR/protein/P01130/protein-features",
            PortalResponse::ok("text/tab-separated-values", tsv),
        ));
        let gw = gateway(portal);
        let hit = gw
            .call(&req(
                ToolKind::CheckClinvarStatus,
                json!({"gene": "LDLR", "protein_id": "P01130", "position": 2}),
            ))
            .await
            .unwrap();
        assert_eq!(hit.payload, ToolPayload::Text("ClinVar entry at 2: Pathogenic".to_string()));

        let miss = gw
            .call(&req(
                ToolKind::CheckClinvarStatus,
                json!({"gene": "LDLR", "protein_id": "P01130", "position": 1}),
            ))
            .await
            .unwrap();
        assert_eq!(miss.payload, ToolPayload::Text("No ClinVar entry found at 1.".to_string()));

        let out_of_range = gw
            .call(&req(
                ToolKind::CheckClinvarStatus,
                json!({"gene": "LDLR", "protein_id": "P01130", "position": 99}),
            ))
            .await
            .unwrap_err();
        assert!(!out_of_range.is_transient());
    }

    #[tokio::test]
    async fn test_variant_map_posts_body() {
        let portal = Arc::new(StaticPortal::new().with_route(
            "http://portal/api/gene/LDLR/isoform/NM_000527/variant-map",
            PortalResponse::json(json!({"canonical": "p.H23Q"})),
        ));
        let gw = gateway(portal.clone());
        let result = gw
            .call(&req(
                ToolKind::MapVariantToCanonical,
                json!({"gene": "LDLR", "isoform_id": "NM_000527", "variant": "p.H23Q"}),
            ))
            .await
            .unwrap();
        assert_eq!(result.source, "http://portal/api/gene/LDLR/isoform/NM_000527/variant-map");
    }
}
