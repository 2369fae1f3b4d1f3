//! Tool Selector (spec §4.6): progressive disclosure over a tool catalog.
//!
//! Four layered filters run in order — role prefilter, keyword prefilter,
//! semantic rank, token-budget enforcement — each narrowing what the next
//! stage sees. Given the same catalog, role, query, and budget, the output
//! is deterministic: the keyword and budget stages are plain code, and the
//! semantic stage falls back to a deterministic keyword-overlap score when
//! no `RetrievalClient` is configured.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub allowed_roles: Vec<String>,
    /// Rough token cost of including this tool's schema in a prompt.
    pub token_cost: u32,
    pub schema: serde_json::Value,
}

/// A ranked chunk returned by an external semantic retrieval backend.
#[derive(Debug, Clone)]
pub struct RankedTool {
    pub name: String,
    pub score: f64,
}

/// External semantic search over the tool catalog. Implementations call out
/// to an embeddings/vector index; `tools.rs` stays decoupled from which one.
#[async_trait]
pub trait RetrievalClient: Send + Sync {
    async fn rank(&self, query: &str, candidates: &[ToolDescriptor]) -> Vec<RankedTool>;
}

/// Deterministic fallback used when no retrieval backend is configured:
/// ranks by the count of query words that appear in the tool's name,
/// description, or keyword list. Ties keep catalog order (stable sort).
pub struct KeywordOverlapRanker;

#[async_trait]
impl RetrievalClient for KeywordOverlapRanker {
    async fn rank(&self, query: &str, candidates: &[ToolDescriptor]) -> Vec<RankedTool> {
        let query_words: HashSet<String> = tokenize(query);
        let mut ranked: Vec<RankedTool> = candidates
            .iter()
            .map(|tool| {
                let haystack = tokenize(&format!(
                    "{} {} {}",
                    tool.name,
                    tool.description,
                    tool.keywords.join(" ")
                ));
                let overlap = query_words.intersection(&haystack).count();
                RankedTool {
                    name: tool.name.clone(),
                    score: overlap as f64,
                }
            })
            .collect();
        ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

pub struct ToolSelector<R: RetrievalClient = KeywordOverlapRanker> {
    catalog: Vec<ToolDescriptor>,
    ranker: R,
}

impl ToolSelector<KeywordOverlapRanker> {
    pub fn new(catalog: Vec<ToolDescriptor>) -> Self {
        Self {
            catalog,
            ranker: KeywordOverlapRanker,
        }
    }
}

impl<R: RetrievalClient> ToolSelector<R> {
    pub fn with_ranker(catalog: Vec<ToolDescriptor>, ranker: R) -> Self {
        Self { catalog, ranker }
    }

    /// Returns the tools to disclose for `role` given `query`, keeping as
    /// many of the top-ranked candidates as fit in `token_budget`.
    pub async fn select(&self, role: &str, query: &str, token_budget: u32) -> Vec<ToolDescriptor> {
        let role_filtered: Vec<&ToolDescriptor> = self
            .catalog
            .iter()
            .filter(|t| t.allowed_roles.iter().any(|r| r == role || r == "*"))
            .collect();

        let keywords = tokenize(query);
        let keyword_filtered: Vec<ToolDescriptor> = if keywords.is_empty() {
            role_filtered.into_iter().cloned().collect()
        } else {
            let matched: Vec<ToolDescriptor> = role_filtered
                .iter()
                .filter(|t| {
                    let haystack = tokenize(&format!("{} {} {}", t.name, t.description, t.keywords.join(" ")));
                    !haystack.is_disjoint(&keywords)
                })
                .map(|t| (*t).clone())
                .collect();
            // No keyword match at all: fall back to the full role-filtered
            // set rather than disclosing nothing.
            if matched.is_empty() {
                role_filtered.into_iter().cloned().collect()
            } else {
                matched
            }
        };

        let ranked = self.ranker.rank(query, &keyword_filtered).await;
        let by_name: std::collections::HashMap<&str, &ToolDescriptor> =
            keyword_filtered.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut selected = Vec::new();
        let mut spent: u32 = 0;
        for ranked_tool in &ranked {
            let Some(tool) = by_name.get(ranked_tool.name.as_str()) else {
                continue;
            };
            if spent + tool.token_cost > token_budget {
                continue;
            }
            spent += tool.token_cost;
            selected.push((*tool).clone());
        }
        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str, keywords: &[&str], roles: &[&str], cost: u32) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} description"),
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            allowed_roles: roles.iter().map(|s| s.to_string()).collect(),
            token_cost: cost,
            schema: json!({}),
        }
    }

    #[tokio::test]
    async fn role_prefilter_excludes_unauthorized_tools() {
        let catalog = vec![
            tool("deploy", &["deploy"], &["operator"], 10),
            tool("read_file", &["read", "file"], &["*"], 10),
        ];
        let selector = ToolSelector::new(catalog);
        let selected = selector.select("developer", "read a file", 1000).await;
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "read_file");
    }

    #[tokio::test]
    async fn keyword_prefilter_prioritizes_matching_tools() {
        let catalog = vec![
            tool("deploy", &["deploy", "release"], &["*"], 10),
            tool("read_file", &["read", "file"], &["*"], 10),
        ];
        let selector = ToolSelector::new(catalog);
        let selected = selector.select("developer", "read the file contents", 1000).await;
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].name, "read_file");
    }

    #[tokio::test]
    async fn token_budget_enforced_by_rank_order() {
        let catalog = vec![
            tool("a_tool", &["query"], &["*"], 50),
            tool("b_tool", &["query"], &["*"], 50),
            tool("c_tool", &["query"], &["*"], 50),
        ];
        let selector = ToolSelector::new(catalog);
        let selected = selector.select("developer", "query", 120).await;
        assert_eq!(selected.len(), 2);
    }

    #[tokio::test]
    async fn no_keyword_match_falls_back_to_full_role_filtered_set() {
        let catalog = vec![tool("a_tool", &["unrelated"], &["*"], 10)];
        let selector = ToolSelector::new(catalog);
        let selected = selector.select("developer", "totally different topic", 1000).await;
        assert_eq!(selected.len(), 1);
    }

    #[tokio::test]
    async fn deterministic_given_identical_inputs() {
        let catalog = vec![
            tool("alpha", &["build", "compile"], &["*"], 10),
            tool("beta", &["build", "test"], &["*"], 10),
        ];
        let selector = ToolSelector::new(catalog);
        let first = selector.select("developer", "build the project", 1000).await;
        let second = selector.select("developer", "build the project", 1000).await;
        let first_names: Vec<&str> = first.iter().map(|t| t.name.as_str()).collect();
        let second_names: Vec<&str> = second.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(first_names, second_names);
    }
}
