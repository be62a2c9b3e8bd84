//! Data types shared by every stage of the pipeline: chunks, documents,
//! queries and query results.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RagError, Result};

/// Metadata key under which a chunk's title is persisted by vector stores.
pub const TITLE_KEY: &str = "title";

/// Default number of results requested by a [`Query`].
pub const DEFAULT_K: usize = 10;

/// Identifier of a chunk or document within a collection.
///
/// Uniqueness within a collection is the caller's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    /// Numeric identifier.
    Int(u64),
    /// String identifier.
    Str(String),
}

impl ItemId {
    /// Generate a fresh random (UUID v4) identifier.
    pub fn generate() -> Self {
        Self::Str(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<u64> for ItemId {
    fn from(value: u64) -> Self {
        Self::Int(value)
    }
}

impl From<String> for ItemId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for ItemId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Null,
}

impl MetadataValue {
    /// Borrow the value as a string slice if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<usize> for MetadataValue {
    fn from(value: usize) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Key-value metadata attached to chunks and documents.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A unit of split text before embedding.
///
/// Produced by a [`Splitter`](crate::splitter::Splitter) and consumed by the
/// [`Encoder`](crate::encoder::Encoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Identifier, generated when not supplied.
    pub id: ItemId,
    /// Title of the source (file path, heading, ...). May be empty.
    pub title: String,
    /// The text content.
    pub content: String,
    /// Additional information about the source such as origin or date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl Chunk {
    /// Create a chunk with a generated identifier.
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self { id: ItemId::generate(), title: title.into(), content: content.into(), metadata: None }
    }

    /// Replace the identifier.
    pub fn with_id(mut self, id: impl Into<ItemId>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A [`Chunk`] plus its embedding vectors; the unit persisted by vector stores.
///
/// If a non-empty `content_embedding` is present, `dimensions` equals its
/// length and `embedding_model` names the function that produced it. An empty
/// embedding marks a field that had nothing to embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: ItemId,
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

impl Document {
    /// Create a document without embeddings from its parts.
    pub fn new(
        id: impl Into<ItemId>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::from_chunk(Chunk {
            id: id.into(),
            title: title.into(),
            content: content.into(),
            metadata: None,
        })
    }

    /// Wrap a chunk into a document without embeddings.
    pub fn from_chunk(chunk: Chunk) -> Self {
        Self {
            id: chunk.id,
            title: chunk.title,
            content: chunk.content,
            metadata: chunk.metadata,
            title_embedding: None,
            content_embedding: None,
            embedding_model: None,
            dimensions: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the content embedding, stamping the producing model and the
    /// dimensionality.
    pub fn with_content_embedding(mut self, embedding: Vec<f32>, model: impl Into<String>) -> Self {
        self.dimensions = Some(embedding.len());
        self.embedding_model = Some(model.into());
        self.content_embedding = Some(embedding);
        self
    }

    /// The chunk part of this document.
    pub fn to_chunk(&self) -> Chunk {
        Chunk {
            id: self.id.clone(),
            title: self.title.clone(),
            content: self.content.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Title and content joined by a newline, skipping an empty title.
    pub fn full_text(&self) -> String {
        if self.title.is_empty() {
            self.content.clone()
        } else {
            format!("{}\n{}", self.title, self.content)
        }
    }

    /// Check the embedding invariant.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if a content embedding is present
    /// without a matching `dimensions` or without an `embedding_model`.
    pub fn validate(&self) -> Result<()> {
        let Some(embedding) = self.content_embedding.as_ref().filter(|e| !e.is_empty()) else {
            return Ok(());
        };
        if self.dimensions != Some(embedding.len()) {
            return Err(RagError::Configuration(format!(
                "document '{}' declares dimensions {:?} but its content embedding has length {}",
                self.id,
                self.dimensions,
                embedding.len()
            )));
        }
        if self.embedding_model.as_deref().is_none_or(str::is_empty) {
            return Err(RagError::Configuration(format!(
                "document '{}' has a content embedding but no embedding_model",
                self.id
            )));
        }
        Ok(())
    }
}

impl From<Chunk> for Document {
    fn from(chunk: Chunk) -> Self {
        Self::from_chunk(chunk)
    }
}

/// A retrieval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// The query text.
    pub text: String,
    /// Number of results wanted. Must be positive.
    pub k: usize,
    /// Metadata predicates: every key must be present with an equal value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<Metadata>,
    /// Content predicate: the document content must contain this string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    /// Precomputed query embedding. Stores embed `text` themselves when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl Query {
    /// Create a query for `text` with the default `k`.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), k: DEFAULT_K, filters: None, contains: None, embedding: None }
    }

    /// Set the number of results wanted.
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Set metadata predicates.
    pub fn with_filters(mut self, filters: Metadata) -> Self {
        self.filters = Some(filters);
        self
    }

    /// Set the content predicate.
    pub fn with_contains(mut self, needle: impl Into<String>) -> Self {
        self.contains = Some(needle.into());
        self
    }

    /// Set a precomputed embedding.
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// Results of a batch similarity search.
///
/// Parallel sequences: one outer entry per input query, one inner entry per
/// match, ordered by ascending distance (lower distance = more similar).
/// All inner sequences of a given query index have equal length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResults {
    pub ids: Vec<Vec<ItemId>>,
    pub texts: Vec<Vec<String>>,
    pub embeddings: Vec<Vec<Vec<f32>>>,
    pub metadatas: Vec<Vec<Metadata>>,
    pub distances: Vec<Vec<f32>>,
    /// Model that produced each returned embedding.
    #[serde(default)]
    pub embedding_models: Vec<Vec<Option<String>>>,
}

/// A single match, used to assemble [`QueryResults`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryMatch {
    pub id: ItemId,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
    pub distance: f32,
    pub embedding_model: Option<String>,
}

impl QueryMatch {
    /// Build a match from a stored document and its distance to the query.
    ///
    /// The document title is folded into the metadata under [`TITLE_KEY`].
    pub fn from_document(doc: &Document, distance: f32) -> Self {
        let mut metadata = doc.metadata.clone().unwrap_or_default();
        if !doc.title.is_empty() {
            metadata.insert(TITLE_KEY.to_string(), MetadataValue::Str(doc.title.clone()));
        }
        Self {
            id: doc.id.clone(),
            text: doc.content.clone(),
            embedding: doc.content_embedding.clone().unwrap_or_default(),
            metadata,
            distance,
            embedding_model: doc.embedding_model.clone(),
        }
    }
}

impl QueryResults {
    /// Number of queries these results answer.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if no query was answered.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Append the matches for one more query, keeping the parallel
    /// sequences aligned.
    pub fn push_query(&mut self, matches: Vec<QueryMatch>) {
        let mut ids = Vec::with_capacity(matches.len());
        let mut texts = Vec::with_capacity(matches.len());
        let mut embeddings = Vec::with_capacity(matches.len());
        let mut metadatas = Vec::with_capacity(matches.len());
        let mut distances = Vec::with_capacity(matches.len());
        let mut models = Vec::with_capacity(matches.len());
        for m in matches {
            ids.push(m.id);
            texts.push(m.text);
            embeddings.push(m.embedding);
            metadatas.push(m.metadata);
            distances.push(m.distance);
            models.push(m.embedding_model);
        }
        self.ids.push(ids);
        self.texts.push(texts);
        self.embeddings.push(embeddings);
        self.metadatas.push(metadatas);
        self.distances.push(distances);
        self.embedding_models.push(models);
    }

    /// Iterate over the matches of query `index` as `(id, text, distance)`.
    pub fn matches(&self, index: usize) -> impl Iterator<Item = (&ItemId, &str, f32)> {
        let ids = self.ids.get(index).map(Vec::as_slice).unwrap_or_default();
        let texts = self.texts.get(index).map(Vec::as_slice).unwrap_or_default();
        let distances = self.distances.get(index).map(Vec::as_slice).unwrap_or_default();
        ids.iter().zip(texts).zip(distances).map(|((id, text), d)| (id, text.as_str(), *d))
    }

    /// Rebuild the [`Document`]s returned for query `index`.
    ///
    /// The title is recovered from the [`TITLE_KEY`] metadata entry. An
    /// embedding whose producing model is unknown is left out, so every
    /// rebuilt document passes [`Document::validate`]. Returns an empty `Vec`
    /// if `index` is out of range.
    pub fn documents(&self, index: usize) -> Vec<Document> {
        let Some(ids) = self.ids.get(index) else {
            return Vec::new();
        };
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let mut metadata = self
                    .metadatas
                    .get(index)
                    .and_then(|m| m.get(i))
                    .cloned()
                    .unwrap_or_default();
                let title = match metadata.remove(TITLE_KEY) {
                    Some(MetadataValue::Str(title)) => title,
                    _ => String::new(),
                };
                let content =
                    self.texts.get(index).and_then(|t| t.get(i)).cloned().unwrap_or_default();
                let embedding_model = self
                    .embedding_models
                    .get(index)
                    .and_then(|m| m.get(i))
                    .cloned()
                    .flatten()
                    .filter(|m| !m.is_empty());
                let embedding = self
                    .embeddings
                    .get(index)
                    .and_then(|e| e.get(i))
                    .filter(|e| !e.is_empty() && embedding_model.is_some())
                    .cloned();
                Document {
                    id: id.clone(),
                    title,
                    content,
                    metadata: (!metadata.is_empty()).then_some(metadata),
                    title_embedding: None,
                    dimensions: embedding.as_ref().map(Vec::len),
                    embedding_model: embedding.as_ref().and(embedding_model),
                    content_embedding: embedding,
                }
            })
            .collect()
    }
}
