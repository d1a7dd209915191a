//! Search result re-ranking with a cross-encoder.
//!
//! Stateless: the scorer sees a query and a set of documents and nothing else.
//! It only refines search output and never touches the write path.

use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use parking_lot::Mutex;
use std::path::PathBuf;
use tracing::info;

use crate::error::{AppError, AppResult};

pub trait Reranker: Send + Sync {
    /// One relevance score per document, in document order.
    fn score(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>>;
}

pub struct FastEmbedReranker {
    model: Mutex<TextRerank>,
}

impl FastEmbedReranker {
    /// Blocking; downloads the model into `cache_dir` on first use.
    pub fn load(cache_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let model = TextRerank::try_new(
            RerankInitOptions::new(RerankerModel::BGERerankerBase).with_cache_dir(cache_dir.into()),
        )
        .map_err(|e| AppError::ModelLoad(format!("Failed to init re-ranker: {}", e)))?;
        info!("Re-ranker loaded");
        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl Reranker for FastEmbedReranker {
    fn score(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self.model.lock();
        let docs: Vec<&str> = documents.iter().map(String::as_str).collect();
        let results = model
            .rerank(query, docs, false, None)
            .map_err(|e| AppError::SearchError(format!("Re-ranking failed: {}", e)))?;

        let mut scores = vec![0.0f32; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score;
            }
        }
        Ok(scores)
    }
}

/// Score `items` against `query`, sort descending and drop every item whose
/// score is not positive.
pub fn rerank_by<T>(
    reranker: &dyn Reranker,
    query: &str,
    items: Vec<T>,
    text_of: impl Fn(&T) -> String,
) -> AppResult<Vec<(T, f32)>> {
    let documents: Vec<String> = items.iter().map(&text_of).collect();
    let scores = reranker.score(query, &documents)?;
    if scores.len() != items.len() {
        return Err(AppError::SearchError(format!(
            "Re-ranker returned {} scores for {} documents",
            scores.len(),
            items.len()
        )));
    }

    let mut ranked: Vec<(T, f32)> = items
        .into_iter()
        .zip(scores)
        .filter(|(_, score)| *score > 0.0)
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    Ok(ranked)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores by how many query words the document contains, minus one.
    struct OverlapReranker;

    impl Reranker for OverlapReranker {
        fn score(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
            Ok(documents
                .iter()
                .map(|d| {
                    query
                        .split_whitespace()
                        .filter(|w| d.contains(w))
                        .count() as f32
                        - 1.0
                })
                .collect())
        }
    }

    #[test]
    fn test_rerank_sorts_descending_and_drops_non_positive() {
        let items = vec!["rust only", "nothing here", "rust async tokio", "async rust"];
        let ranked = rerank_by(&OverlapReranker, "rust async tokio", items, |s| s.to_string()).unwrap();

        let order: Vec<&str> = ranked.iter().map(|(s, _)| *s).collect();
        assert_eq!(order, vec!["rust async tokio", "async rust"]);
        assert_eq!(ranked[0].1, 2.0);
    }

    #[test]
    fn test_rerank_empty() {
        let ranked = rerank_by(&OverlapReranker, "q", Vec::<String>::new(), |s| s.clone()).unwrap();
        assert!(ranked.is_empty());
    }
}
