//! Specialist 定义：标签、角色提示、工具子集、展示信息

use serde::{Deserialize, Serialize};

use crate::memory::FeedbackSnapshot;
use crate::tools::ToolKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Discovery,
    Structure,
    Variant,
}

const DISCOVERY_ROLE: &str = "You are the Genetic Discovery specialist of the G2P portal. \
Resolve vague names to official HGNC symbols and report each gene's identity card: UniProt \
accession, canonical isoform and GenCC disease validity.\n\
Rules:\n\
- Never guess a gene symbol; search the gene index when the request is not an exact symbol.\n\
- Never state a UniProt ID that no tool returned.\n\
- If a tool reports that no data is available, say so plainly.";

const STRUCTURE_ROLE: &str = "You are the Structural Biology specialist of the G2P portal. \
Describe the protein as a physical object: domains, sites, secondary structure and structure \
coverage (experimental PDB versus AlphaFold prediction).\n\
Rules:\n\
- Only report features returned by get_protein_features.\n\
- Verify PDB coverage with get_structure_map before claiming it.\n\
- For counts or statistics over a feature table, call run_analysis with `source` set to the \
invocation id of that table.";

const VARIANT_ROLE: &str = "You are the Variant Analysis specialist of the G2P portal. \
Assess protein variants by first mapping them onto the canonical isoform, then checking what \
the canonical position hits and whether ClinVar lists it.\n\
Rules:\n\
- Never interpret a variant before mapping it to the canonical sequence.\n\
- Only cite ClinVar classifications a tool returned; otherwise say there is no known entry.\n\
- Set dedupe=false in run_analysis when comparing isoforms.";

const SHARED_RULES: &str = "\n\nYou are the only specialist working on this request. If part of \
the question belongs to another domain, answer what your tools can support and mention the rest \
as a suggested follow-up.";

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [AgentKind::Discovery, AgentKind::Structure, AgentKind::Variant];

    /// 路由标签
    pub fn label(&self) -> &'static str {
        match self {
            AgentKind::Discovery => "discovery",
            AgentKind::Structure => "structure",
            AgentKind::Variant => "variant",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        let l = label.trim().to_lowercase();
        Self::ALL.iter().copied().find(|a| a.label() == l)
    }

    /// 分类提示里的一句话职责描述
    pub fn routing_hint(&self) -> &'static str {
        match self {
            AgentKind::Discovery => "gene symbols, gene search by name or disease, gene metadata (\"What is LDLR?\", \"genes for cystic fibrosis\")",
            AgentKind::Structure => "protein domains, active or binding sites, 3D structure, AlphaFold, PDB, residue function",
            AgentKind::Variant => "specific mutations (p.H23Q, V200A), pathogenicity, ClinVar, mapping variants between isoforms",
        }
    }

    pub fn tools(&self) -> &'static [ToolKind] {
        match self {
            AgentKind::Discovery => &[
                ToolKind::SearchGeneIndex,
                ToolKind::GetGeneDossier,
                ToolKind::RunAnalysis,
                ToolKind::SuggestImprovement,
            ],
            AgentKind::Structure => &[
                ToolKind::GetProteinFeatures,
                ToolKind::GetStructureMap,
                ToolKind::FetchAlphafoldAccess,
                ToolKind::FetchPdbFile,
                ToolKind::RunAnalysis,
                ToolKind::SuggestImprovement,
            ],
            AgentKind::Variant => &[
                ToolKind::MapVariantToCanonical,
                ToolKind::CheckClinvarStatus,
                ToolKind::AlignIsoforms,
                ToolKind::RunAnalysis,
                ToolKind::SuggestImprovement,
            ],
        }
    }

    pub fn permits(&self, tool: ToolKind) -> bool {
        self.tools().contains(&tool)
    }

    /// 展示信息：(icon, title)
    pub fn display(&self) -> (&'static str, &'static str) {
        match self {
            AgentKind::Discovery => ("🧬", "Genetic Discovery Specialist"),
            AgentKind::Structure => ("🔬", "Structural Biology Expert"),
            AgentKind::Variant => ("🩺", "Variant Analysis Specialist"),
        }
    }

    /// 角色提示 + 回合开始时的反馈快照
    pub fn role_prompt(&self, feedback: &FeedbackSnapshot) -> String {
        let base = match self {
            AgentKind::Discovery => DISCOVERY_ROLE,
            AgentKind::Structure => STRUCTURE_ROLE,
            AgentKind::Variant => VARIANT_ROLE,
        };
        format!("{base}{SHARED_RULES}{}", feedback.render())
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsets_are_disjoint_except_shared_tools() {
        let shared = [ToolKind::RunAnalysis, ToolKind::SuggestImprovement];
        for a in AgentKind::ALL {
            for b in AgentKind::ALL {
                if a == b {
                    continue;
                }
                for t in a.tools() {
                    if !shared.contains(t) {
                        assert!(!b.permits(*t), "{t:?} owned by both {a} and {b}");
                    }
                }
            }
        }
        // 每个网关工具恰好属于一个 Specialist
        for t in ToolKind::ALL.iter().filter(|t| t.is_gateway_tool()) {
            assert_eq!(AgentKind::ALL.iter().filter(|a| a.permits(*t)).count(), 1);
        }
    }

    #[test]
    fn test_role_prompt_includes_feedback() {
        let snap = FeedbackSnapshot {
            lessons: vec!["Cite pLDDT".to_string()],
            preferences: vec![],
        };
        let prompt = AgentKind::Structure.role_prompt(&snap);
        assert!(prompt.contains("Structural Biology"));
        assert!(prompt.ends_with("- Cite pLDDT\n"));
        assert_eq!(AgentKind::from_label(" Variant "), Some(AgentKind::Variant));
        assert_eq!(AgentKind::from_label("off_topic"), None);
    }
}
