//! Rerankers for re-scoring retrieved documents.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::document::{Document, Query};
use crate::error::{RagError, Result};

/// A document's position in the candidate set and its relevance score.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedDocument {
    /// Index into the candidate set that was ranked.
    pub index: usize,
    /// Relevance score; higher is more relevant.
    pub score: f32,
    /// The document itself, present when requested.
    pub document: Option<Document>,
}

/// A reranker that re-scores and reorders candidate documents.
///
/// Scores follow "higher = more relevant", the inverse of vector store
/// distances. Results are sorted by descending score and truncated to
/// `query.k`.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{Query, Reranker, TfidfReranker};
///
/// let reranker = TfidfReranker::new();
/// let ranked = reranker.rerank(&Query::new("cat").with_k(2), Some(&docs), true).await?;
/// ```
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Rank `docs` against `query`.
    ///
    /// When `docs` is `None` the reranker may reuse the candidate set of a
    /// previous call; otherwise it fails with [`RagError::Configuration`].
    async fn rerank(
        &self,
        query: &Query,
        docs: Option<&[Document]>,
        return_docs: bool,
    ) -> Result<Vec<RankedDocument>>;
}

fn ranked(
    scores: Vec<f32>,
    docs: &[Document],
    k: usize,
    return_docs: bool,
) -> Vec<RankedDocument> {
    let mut ranked: Vec<RankedDocument> = scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| RankedDocument {
            index,
            score,
            document: return_docs.then(|| docs[index].clone()),
        })
        .collect();
    ranked.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    ranked.truncate(k);
    ranked
}

/// A reranker that gives every document the same score, keeping the input
/// order.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReranker {
    score: f32,
}

impl ConstantReranker {
    pub fn new(score: f32) -> Self {
        Self { score }
    }
}

impl Default for ConstantReranker {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl Reranker for ConstantReranker {
    async fn rerank(
        &self,
        query: &Query,
        docs: Option<&[Document]>,
        return_docs: bool,
    ) -> Result<Vec<RankedDocument>> {
        let docs =
            docs.ok_or_else(|| RagError::Configuration("no documents to rank".to_string()))?;
        Ok(ranked(vec![self.score; docs.len()], docs, query.k, return_docs))
    }
}

type TermVector = HashMap<String, f32>;

fn terms(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn cosine(a: &TermVector, b: &TermVector) -> f32 {
    let dot: f32 = a.iter().filter_map(|(t, x)| b.get(t).map(|y| x * y)).sum();
    let norm_a = a.values().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.values().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 { 0.0 } else { dot / (norm_a * norm_b) }
}

/// Identity of a candidate set: a SHA-256 over ids, titles and contents.
fn fingerprint(docs: &[Document]) -> String {
    let mut hasher = Sha256::new();
    for doc in docs {
        hasher.update(doc.id.to_string().as_bytes());
        hasher.update([0]);
        hasher.update(doc.title.as_bytes());
        hasher.update([0]);
        hasher.update(doc.content.as_bytes());
        hasher.update([0xff]);
    }
    format!("{:x}", hasher.finalize())
}

/// TF-IDF statistics fitted on one candidate set.
#[derive(Debug)]
struct FittedModel {
    fingerprint: String,
    idf: HashMap<String, f32>,
    vectors: Vec<TermVector>,
    documents: Vec<Document>,
}

impl FittedModel {
    fn fit(docs: &[Document], fingerprint: String) -> Self {
        let tokenized: Vec<Vec<String>> = docs.iter().map(|d| terms(&d.full_text())).collect();

        let mut df: HashMap<&str, usize> = HashMap::new();
        for doc_terms in &tokenized {
            let mut seen: Vec<&str> = doc_terms.iter().map(String::as_str).collect();
            seen.sort_unstable();
            seen.dedup();
            for term in seen {
                *df.entry(term).or_insert(0) += 1;
            }
        }

        let n = docs.len() as f32;
        let idf: HashMap<String, f32> = df
            .into_iter()
            .map(|(term, count)| (term.to_string(), ((1.0 + n) / (1.0 + count as f32)).ln() + 1.0))
            .collect();

        let vectors = tokenized.iter().map(|t| Self::weigh(&idf, t)).collect();
        Self { fingerprint, idf, vectors, documents: docs.to_vec() }
    }

    /// Term frequency times idf; terms unseen at fit time are dropped.
    fn weigh(idf: &HashMap<String, f32>, terms: &[String]) -> TermVector {
        let mut vector = TermVector::new();
        for term in terms {
            if let Some(weight) = idf.get(term) {
                *vector.entry(term.clone()).or_insert(0.0) += weight;
            }
        }
        vector
    }

    fn scores(&self, query: &str) -> Vec<f32> {
        let query = Self::weigh(&self.idf, &terms(query));
        self.vectors.iter().map(|v| cosine(&query, v)).collect()
    }
}

/// A lexical reranker scoring each candidate's title and content against the
/// query by TF-IDF weighted cosine similarity.
///
/// The fitted statistics are cached and reused while the candidate set stays
/// the same, so repeated queries over one set fit only once.
#[derive(Debug, Default)]
pub struct TfidfReranker {
    cache: Mutex<Option<Arc<FittedModel>>>,
}

impl TfidfReranker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn model_for(&self, docs: Option<&[Document]>) -> Result<Arc<FittedModel>> {
        let mut cache = self.cache.lock().await;
        match docs {
            Some(docs) => {
                let key = fingerprint(docs);
                if let Some(model) = cache.as_ref().filter(|m| m.fingerprint == key) {
                    debug!(candidates = docs.len(), "reusing fitted tf-idf model");
                    return Ok(Arc::clone(model));
                }
                let model = Arc::new(FittedModel::fit(docs, key));
                debug!(candidates = docs.len(), terms = model.idf.len(), "fitted tf-idf model");
                *cache = Some(Arc::clone(&model));
                Ok(model)
            }
            None => cache
                .clone()
                .ok_or_else(|| RagError::Configuration("no documents to rank".to_string())),
        }
    }
}

#[async_trait]
impl Reranker for TfidfReranker {
    async fn rerank(
        &self,
        query: &Query,
        docs: Option<&[Document]>,
        return_docs: bool,
    ) -> Result<Vec<RankedDocument>> {
        let model = self.model_for(docs).await?;
        let scores = model.scores(&query.text);
        Ok(ranked(scores, &model.documents, query.k, return_docs))
    }
}

/// The closed set of built-in rerankers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RerankerKind {
    Constant,
    #[default]
    Tfidf,
}

impl RerankerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Constant => "constant",
            Self::Tfidf => "tfidf",
        }
    }
}

impl fmt::Display for RerankerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RerankerKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "constant" => Ok(Self::Constant),
            "tfidf" | "tf-idf" | "tf_idf" => Ok(Self::Tfidf),
            other => Err(RagError::Configuration(format!("unsupported reranker: {other}"))),
        }
    }
}

/// Create a reranker by kind.
pub fn create_reranker(kind: RerankerKind) -> Arc<dyn Reranker> {
    match kind {
        RerankerKind::Constant => Arc::new(ConstantReranker::default()),
        RerankerKind::Tfidf => Arc::new(TfidfReranker::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(texts: &[&str]) -> Vec<Document> {
        texts.iter().enumerate().map(|(i, t)| Document::new(i as u64, "", *t)).collect()
    }

    #[tokio::test]
    async fn tfidf_prefers_matching_terms() {
        let candidates = docs(&["the cat sat", "the dog ran", "cats and dogs"]);
        let reranker = TfidfReranker::new();
        let ranked =
            reranker.rerank(&Query::new("cat").with_k(3), Some(&candidates), true).await.unwrap();

        let position = |text: &str| {
            ranked
                .iter()
                .position(|r| r.document.as_ref().is_some_and(|d| d.content == text))
                .unwrap()
        };
        assert!(position("the cat sat") < position("the dog ran"));
        assert_eq!(ranked[0].index, 0);
        assert!(ranked.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn tfidf_reuses_the_cached_candidate_set() {
        let reranker = TfidfReranker::new();
        let err = reranker.rerank(&Query::new("cat"), None, false).await.unwrap_err();
        assert!(err.is_configuration());

        let candidates = docs(&["rust ownership", "python typing"]);
        reranker.rerank(&Query::new("rust"), Some(&candidates), false).await.unwrap();
        let ranked = reranker.rerank(&Query::new("python").with_k(1), None, false).await.unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].index, 1);
        assert!(ranked[0].document.is_none());
    }

    #[tokio::test]
    async fn constant_reranker_keeps_order_and_truncates() {
        let candidates = docs(&["a", "b", "c"]);
        let ranked = ConstantReranker::default()
            .rerank(&Query::new("q").with_k(2), Some(&candidates), false)
            .await
            .unwrap();
        assert_eq!(ranked.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn fingerprint_changes_with_content() {
        let a = docs(&["one", "two"]);
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b[1].content = "three".into();
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn kinds_parse_by_name() {
        assert_eq!("TFIDF".parse::<RerankerKind>().unwrap(), RerankerKind::Tfidf);
        assert_eq!("constant".parse::<RerankerKind>().unwrap(), RerankerKind::Constant);
        assert!("bm25".parse::<RerankerKind>().unwrap_err().is_configuration());
    }
}
