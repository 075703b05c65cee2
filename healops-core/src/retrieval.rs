//! Similar-fix memory retrieval.
//!
//! The orchestration engine stores every concluded attempt as a memory
//! document and queries this corpus for similar past fixes when building the
//! next proposal prompt. Production deployments plug a real retrieval
//! service in behind the `Retrieval` trait; `InMemoryRetrieval` is the
//! reference implementation used by tests and local runs.

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// One ranked retrieval match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub title: String,
    pub snippet: String,
    pub score: f32,
}

/// A document ingested into the retrieval corpus.
#[derive(Debug, Clone)]
pub struct MemoryDocument {
    pub title: String,
    pub body: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Retrieval: Send + Sync {
    /// Return up to `top_k` chunks with similarity >= `min_score`,
    /// best match first.
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Add a document to the corpus.
    async fn ingest(&self, document: MemoryDocument) -> Result<()>;
}

const SNIPPET_LEN: usize = 200;

/// In-process retrieval over token-overlap similarity.
pub struct InMemoryRetrieval {
    documents: RwLock<Vec<MemoryDocument>>,
}

impl InMemoryRetrieval {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryRetrieval {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Retrieval for InMemoryRetrieval {
    async fn query(
        &self,
        text: &str,
        top_k: usize,
        min_score: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }

        let documents = self.documents.read().await;
        let mut scored: Vec<RetrievedChunk> = documents
            .iter()
            .filter_map(|doc| {
                let score = jaccard(&query_tokens, &tokenize(&doc.body));
                if score >= min_score {
                    Some(RetrievedChunk {
                        title: doc.title.clone(),
                        snippet: doc.body.chars().take(SNIPPET_LEN).collect(),
                        score,
                    })
                } else {
                    None
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn ingest(&self, document: MemoryDocument) -> Result<()> {
        let mut documents = self.documents.write().await;
        documents.push(document);
        Ok(())
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.len() > 2)
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(title: &str, body: &str) -> MemoryDocument {
        MemoryDocument {
            title: title.to_string(),
            body: body.to_string(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_query_empty_corpus() {
        let retrieval = InMemoryRetrieval::new();
        let matches = retrieval.query("type error in build", 3, 0.1).await.unwrap();
        assert!(matches.is_empty());
    }

    #[tokio::test]
    async fn test_query_ranks_closest_first() {
        let retrieval = InMemoryRetrieval::new();
        retrieval
            .ingest(doc(
                "fix-1",
                "type error property missing on struct after rename",
            ))
            .await
            .unwrap();
        retrieval
            .ingest(doc("fix-2", "network timeout connecting to registry"))
            .await
            .unwrap();

        let matches = retrieval
            .query("type error property missing", 3, 0.05)
            .await
            .unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0].title, "fix-1");
    }

    #[tokio::test]
    async fn test_query_applies_threshold_and_top_k() {
        let retrieval = InMemoryRetrieval::new();
        for i in 0..5 {
            retrieval
                .ingest(doc(
                    &format!("fix-{i}"),
                    "compile failure missing semicolon parser error",
                ))
                .await
                .unwrap();
        }
        retrieval
            .ingest(doc("unrelated", "disk full on runner host"))
            .await
            .unwrap();

        let matches = retrieval
            .query("compile failure missing semicolon", 3, 0.3)
            .await
            .unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.score >= 0.3));
        assert!(matches.iter().all(|m| m.title.starts_with("fix-")));
    }

    #[test]
    fn test_jaccard_identical_and_disjoint() {
        let a = tokenize("missing field rename");
        let b = tokenize("missing field rename");
        let c = tokenize("completely different words");
        assert!((jaccard(&a, &b) - 1.0).abs() < f32::EPSILON);
        assert_eq!(jaccard(&a, &c), 0.0);
    }
}
