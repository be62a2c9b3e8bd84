//! Vector store contract, collection descriptors and the backend registry.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::{Document, ItemId, Query, QueryResults};
use crate::embedding::EmbeddingFunction;
use crate::error::{RagError, Result};

/// Default number of documents written per backend request.
pub const DEFAULT_BATCH_SIZE: usize = 40_000;

/// Distance metric of a collection.
///
/// Every store reports distances with "lower = closer" semantics; backends
/// that natively return similarities convert at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    /// `1 - a·b`.
    #[default]
    #[serde(rename = "ip")]
    InnerProduct,
    /// `1 - cos(a, b)`.
    #[serde(rename = "cosine")]
    Cosine,
    /// Squared Euclidean distance.
    #[serde(rename = "l2")]
    L2,
}

impl Distance {
    /// Distance between two vectors of equal length.
    pub fn between(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::InnerProduct => 1.0 - dot(a, b),
            Self::Cosine => {
                let norm_a = dot(a, a).sqrt();
                let norm_b = dot(b, b).sqrt();
                if norm_a == 0.0 || norm_b == 0.0 {
                    return 1.0;
                }
                1.0 - dot(a, b) / (norm_a * norm_b)
            }
            Self::L2 => a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum(),
        }
    }

    /// Convert a backend similarity score (higher = closer) into a distance.
    pub fn from_similarity(&self, score: f32) -> f32 {
        match self {
            Self::InnerProduct | Self::Cosine => 1.0 - score,
            // Backends report Euclidean distance for L2; square it to match `between`.
            Self::L2 => score * score,
        }
    }
}

impl FromStr for Distance {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ip" => Ok(Self::InnerProduct),
            "cosine" => Ok(Self::Cosine),
            "l2" => Ok(Self::L2),
            other => Err(RagError::Configuration(format!("unsupported distance: {other}"))),
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A named partition of a vector store.
///
/// Every (re)creation gets a fresh `id`, so a collection recreated under a
/// reused name is a different instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    pub id: Uuid,
    pub distance: Distance,
    /// Model of the store-side embedding function, if one is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Collection {
    pub fn new(name: impl Into<String>, distance: Distance, embedding_model: Option<String>) -> Self {
        Self {
            name: name.into(),
            id: Uuid::new_v4(),
            distance,
            embedding_model,
            created_at: Utc::now(),
        }
    }
}

/// A storage backend for documents with similarity search.
///
/// Implementations manage named [`Collection`]s and remember the last
/// activated one: every method taking `Option<&str>` falls back to it when no
/// name is given.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{InMemoryVectorStore, Query, VectorStore};
///
/// let store = InMemoryVectorStore::new();
/// store.create_collection("docs", false, true).await?;
/// store.insert_docs(&documents, None, false).await?;
/// let results = store.retrieve_docs(&[Query::new("what is X?")], None).await?;
/// ```
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a collection and make it active.
    ///
    /// - absent: create it
    /// - present and `overwrite`: delete and recreate it (empty)
    /// - present, not `overwrite`, and `get_or_create`: return it
    /// - otherwise: [`RagError::AlreadyExists`]
    async fn create_collection(
        &self,
        name: &str,
        overwrite: bool,
        get_or_create: bool,
    ) -> Result<Collection>;

    /// Return the named collection and make it active, or the active
    /// collection when `name` is `None`.
    ///
    /// Fails with [`RagError::NotFound`] if the collection does not exist or
    /// no name is given and none is active.
    async fn get_collection(&self, name: Option<&str>) -> Result<Collection>;

    /// Delete a collection and all its documents, clearing the active
    /// pointer if it pointed at it.
    async fn delete_collection(&self, name: &str) -> Result<()>;

    /// Names of all existing collections.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Insert documents in batches, in order.
    ///
    /// All documents must either carry a content embedding or none may; in
    /// the latter case the store's embedding function computes them. Without
    /// `upsert`, an existing id fails the batch with
    /// [`RagError::AlreadyExists`]. Batches already written stay written when
    /// a later batch fails.
    async fn insert_docs(
        &self,
        docs: &[Document],
        collection: Option<&str>,
        upsert: bool,
    ) -> Result<()>;

    /// Replace documents by id, inserting the missing ones.
    async fn update_docs(&self, docs: &[Document], collection: Option<&str>) -> Result<()> {
        self.insert_docs(docs, collection, true).await
    }

    /// Delete documents by id. Unknown ids are ignored.
    async fn delete_docs(&self, ids: &[ItemId], collection: Option<&str>) -> Result<()>;

    /// Fetch documents by id, or every document when `ids` is `None`.
    /// Unknown ids are skipped.
    async fn get_docs_by_ids(
        &self,
        ids: Option<&[ItemId]>,
        collection: Option<&str>,
    ) -> Result<Vec<Document>>;

    /// Run a batch similarity search, one result row per query, ordered by
    /// ascending distance.
    ///
    /// `k`, `filters` and `contains` are taken from the first query and
    /// apply to the whole batch.
    async fn retrieve_docs(&self, queries: &[Query], collection: Option<&str>)
    -> Result<QueryResults>;
}

/// Split `len` items into consecutive `[start, end)` ranges of at most
/// `batch_size` items.
pub fn batches(len: usize, batch_size: usize) -> impl Iterator<Item = (usize, usize)> {
    let size = batch_size.max(1);
    (0..len).step_by(size).map(move |start| (start, (start + size).min(len)))
}

/// Check the shared-schema rule of [`VectorStore::insert_docs`] and the
/// per-document embedding invariant. Returns whether embeddings are provided.
pub fn check_insert_schema(docs: &[Document]) -> Result<bool> {
    let with_embedding = docs.iter().filter(|d| d.content_embedding.is_some()).count();
    if with_embedding != 0 && with_embedding != docs.len() {
        return Err(RagError::Configuration(format!(
            "either all or none of the documents must carry a content embedding \
             ({with_embedding} of {} do)",
            docs.len()
        )));
    }
    for doc in docs {
        doc.validate()?;
    }
    Ok(with_embedding != 0)
}

/// Check the parameters shared by a query batch.
pub fn check_queries(queries: &[Query]) -> Result<()> {
    match queries.first() {
        Some(query) if query.k == 0 => {
            Err(RagError::Configuration("query k must be greater than zero".to_string()))
        }
        _ => Ok(()),
    }
}

/// The closed set of vector store backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreKind {
    InMemory,
    Qdrant,
}

impl VectorStoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InMemory => "inmemory",
            Self::Qdrant => "qdrant",
        }
    }
}

impl fmt::Display for VectorStoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VectorStoreKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "inmemory" | "in_memory" | "memory" => Ok(Self::InMemory),
            "qdrant" => Ok(Self::Qdrant),
            other => Err(RagError::Configuration(format!("unsupported vector store: {other}"))),
        }
    }
}

/// Construction parameters shared by all backends.
#[derive(Clone)]
pub struct VectorStoreOptions {
    /// Backend endpoint, for remote stores.
    pub url: Option<String>,
    /// Store-side embedding function for documents inserted without vectors
    /// and queries issued without an embedding.
    pub embedding_function: Option<Arc<dyn EmbeddingFunction>>,
    /// Vector size for backends that fix it when a collection is created.
    pub dimensions: Option<usize>,
    pub distance: Distance,
    pub batch_size: usize,
}

impl Default for VectorStoreOptions {
    fn default() -> Self {
        Self {
            url: None,
            embedding_function: None,
            dimensions: None,
            distance: Distance::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl fmt::Debug for VectorStoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorStoreOptions")
            .field("url", &self.url)
            .field("embedding_function", &self.embedding_function.as_ref().map(|_| "<function>"))
            .field("dimensions", &self.dimensions)
            .field("distance", &self.distance)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Builds a backend from options.
pub type VectorStoreConstructor = fn(&VectorStoreOptions) -> Result<Arc<dyn VectorStore>>;

/// Lookup table from [`VectorStoreKind`] to constructor.
///
/// [`VectorStoreRegistry::default`] registers every backend compiled into
/// the crate.
pub struct VectorStoreRegistry {
    constructors: HashMap<VectorStoreKind, VectorStoreConstructor>,
}

impl VectorStoreRegistry {
    /// A registry with no backends.
    pub fn empty() -> Self {
        Self { constructors: HashMap::new() }
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register(&mut self, kind: VectorStoreKind, constructor: VectorStoreConstructor) {
        self.constructors.insert(kind, constructor);
    }

    /// Whether a backend is available for `kind`.
    pub fn contains(&self, kind: VectorStoreKind) -> bool {
        self.constructors.contains_key(&kind)
    }

    /// Create a backend by name.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] for unknown names or backends not
    /// compiled in, and whatever the backend constructor returns.
    pub fn create(&self, name: &str, options: &VectorStoreOptions) -> Result<Arc<dyn VectorStore>> {
        let kind: VectorStoreKind = name.parse()?;
        let constructor = self.constructors.get(&kind).ok_or_else(|| {
            RagError::Configuration(format!("vector store '{kind}' is not available in this build"))
        })?;
        constructor(options)
    }
}

impl Default for VectorStoreRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(VectorStoreKind::InMemory, |options: &VectorStoreOptions| {
            let store: Arc<dyn VectorStore> =
                Arc::new(crate::inmemory::InMemoryVectorStore::with_options(options.clone()));
            Ok(store)
        });
        #[cfg(feature = "qdrant")]
        registry.register(VectorStoreKind::Qdrant, |options: &VectorStoreOptions| {
            let store: Arc<dyn VectorStore> =
                Arc::new(crate::qdrant::QdrantVectorStore::from_options(options)?);
            Ok(store)
        });
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distances_are_lower_for_closer_vectors() {
        let a = [1.0, 0.0];
        let near = [0.9, 0.1];
        let far = [0.0, 1.0];
        for distance in [Distance::InnerProduct, Distance::Cosine, Distance::L2] {
            assert!(distance.between(&a, &near) < distance.between(&a, &far), "{distance:?}");
        }
        assert_eq!(Distance::Cosine.from_similarity(0.75), 0.25);
    }

    #[test]
    fn batches_cover_every_index_once() {
        let ranges: Vec<_> = batches(5, 2).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 4), (4, 5)]);
        assert_eq!(batches(0, 3).count(), 0);
        assert_eq!(batches(3, 0).count(), 3);
    }

    #[test]
    fn mixed_embedding_schema_is_rejected() {
        let docs = vec![
            Document::new("a", "", "x").with_content_embedding(vec![1.0], "m"),
            Document::new("b", "", "y"),
        ];
        assert!(check_insert_schema(&docs).unwrap_err().is_configuration());
        assert!(!check_insert_schema(&docs[1..]).unwrap());
    }

    #[test]
    fn registry_resolves_known_names_only() {
        let registry = VectorStoreRegistry::default();
        assert!(registry.create("inmemory", &VectorStoreOptions::default()).is_ok());
        assert!(registry.create("Memory", &VectorStoreOptions::default()).is_ok());
        assert!(
            registry.create("chromadb", &VectorStoreOptions::default()).err().unwrap().is_configuration()
        );
        assert!(VectorStoreRegistry::empty()
            .create("inmemory", &VectorStoreOptions::default())
            .err().unwrap()
            .is_configuration());
    }
}
