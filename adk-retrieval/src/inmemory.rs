//! In-memory vector store using brute-force distance search.
//!
//! This module provides [`InMemoryVectorStore`], a vector store backed by
//! ordered maps protected by a `tokio::sync::RwLock`. It is suitable for
//! development, testing, and small-scale use cases.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

use crate::document::{
    Document, ItemId, Metadata, MetadataValue, Query, QueryMatch, QueryResults, TITLE_KEY,
};
use crate::embedding::EmbeddingCapability;
use crate::error::{RagError, Result};
use crate::vectorstore::{
    Collection, Distance, VectorStore, VectorStoreOptions, batches, check_insert_schema,
    check_queries,
};

#[derive(Debug)]
struct CollectionState {
    info: Collection,
    docs: BTreeMap<ItemId, Document>,
    /// Fixed by the first non-empty embedding written.
    dimensions: Option<usize>,
}

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, CollectionState>,
    active: Option<String>,
}

impl StoreState {
    fn resolve_name(&self, name: Option<&str>) -> Result<String> {
        match name {
            Some(name) => Ok(name.to_string()),
            None => self
                .active
                .clone()
                .ok_or_else(|| RagError::NotFound("no collection is specified or active".into())),
        }
    }

    fn collection(&self, name: &str) -> Result<&CollectionState> {
        self.collections
            .get(name)
            .ok_or_else(|| RagError::NotFound(format!("collection '{name}' does not exist")))
    }

    fn collection_mut(&mut self, name: &str) -> Result<&mut CollectionState> {
        self.collections
            .get_mut(name)
            .ok_or_else(|| RagError::NotFound(format!("collection '{name}' does not exist")))
    }
}

/// An in-memory [`VectorStore`].
///
/// Collections map document ids to documents; searches compute the
/// collection's [`Distance`] against every stored embedding. Documents
/// inserted without embeddings, and queries issued without one, are embedded
/// with the store's own embedding function when one is configured.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{InMemoryVectorStore, VectorStore};
///
/// let store = InMemoryVectorStore::new();
/// store.create_collection("docs", false, false).await?;
/// ```
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    state: RwLock<StoreState>,
    options: VectorStoreOptions,
    /// Store-side embedding function, resolved on first use.
    capability: OnceCell<EmbeddingCapability>,
}

impl InMemoryVectorStore {
    /// Create an empty store with default options and no embedding function.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store with the given options.
    pub fn with_options(options: VectorStoreOptions) -> Self {
        Self { state: RwLock::default(), options, capability: OnceCell::new() }
    }

    /// The store-side embedding function with its resolved model name and
    /// dimensionality.
    async fn capability(&self) -> Result<&EmbeddingCapability> {
        let function = self.options.embedding_function.as_ref().ok_or_else(|| {
            RagError::Configuration(
                "no embeddings were provided and the vector store has no embedding function"
                    .into(),
            )
        })?;
        self.capability
            .get_or_try_init(|| EmbeddingCapability::resolve(Arc::clone(function)))
            .await
    }

    async fn embedding_model(&self) -> Result<Option<String>> {
        if self.options.embedding_function.is_none() {
            return Ok(None);
        }
        Ok(Some(self.capability().await?.model_name().to_string()))
    }
}

fn matches_filters(doc: &Document, filters: Option<&Metadata>, contains: Option<&str>) -> bool {
    if let Some(needle) = contains {
        if !doc.content.contains(needle) {
            return false;
        }
    }
    let Some(filters) = filters else {
        return true;
    };
    filters.iter().all(|(key, expected)| {
        let stored = doc.metadata.as_ref().and_then(|m| m.get(key));
        match stored {
            Some(value) => value == expected,
            None if key == TITLE_KEY => expected == &MetadataValue::Str(doc.title.clone()),
            None => false,
        }
    })
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn create_collection(
        &self,
        name: &str,
        overwrite: bool,
        get_or_create: bool,
    ) -> Result<Collection> {
        let embedding_model = self.embedding_model().await?;
        let mut state = self.state.write().await;

        if let Some(existing) = state.collections.get(name) {
            if !overwrite {
                if !get_or_create {
                    return Err(RagError::AlreadyExists(format!(
                        "collection '{name}' already exists"
                    )));
                }
                let info = existing.info.clone();
                state.active = Some(name.to_string());
                debug!(collection = name, "reusing existing collection");
                return Ok(info);
            }
            debug!(collection = name, "overwriting collection");
        }

        let info = Collection::new(name, self.options.distance, embedding_model);
        state.collections.insert(
            name.to_string(),
            CollectionState { info: info.clone(), docs: BTreeMap::new(), dimensions: None },
        );
        state.active = Some(name.to_string());
        info!(collection = name, id = %info.id, "created collection");
        Ok(info)
    }

    async fn get_collection(&self, name: Option<&str>) -> Result<Collection> {
        let mut state = self.state.write().await;
        let resolved = state.resolve_name(name)?;
        let info = state.collection(&resolved)?.info.clone();
        if name.is_none() {
            debug!(collection = %resolved, "no collection specified, using the active one");
        }
        state.active = Some(resolved);
        Ok(info)
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.collections.remove(name).is_none() {
            return Err(RagError::NotFound(format!("collection '{name}' does not exist")));
        }
        if state.active.as_deref() == Some(name) {
            state.active = None;
        }
        info!(collection = name, "deleted collection");
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut names: Vec<String> = state.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn insert_docs(
        &self,
        docs: &[Document],
        collection: Option<&str>,
        upsert: bool,
    ) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let provided = check_insert_schema(docs)?;
        let name = {
            let state = self.state.read().await;
            let name = state.resolve_name(collection)?;
            state.collection(&name)?;
            name
        };
        if !provided {
            info!(
                collection = %name,
                "no content embedding provided, using the vector store's embedding function"
            );
        }

        for (start, end) in batches(docs.len(), self.options.batch_size) {
            let batch = &docs[start..end];
            let prepared: Vec<Document> = if provided {
                batch.to_vec()
            } else {
                let texts: Vec<&str> = batch.iter().map(|d| d.content.as_str()).collect();
                let capability = self.capability().await?;
                let vectors = capability.embed(&texts).await?;
                let model = capability.model_name().to_string();
                batch
                    .iter()
                    .zip(vectors)
                    .map(|(doc, vector)| doc.clone().with_content_embedding(vector, model.clone()))
                    .collect()
            };

            let mut state = self.state.write().await;
            let target = state.collection_mut(&name)?;

            // Validate the whole batch before touching the collection.
            let mut dimensions = target.dimensions;
            let mut seen = HashSet::new();
            for doc in &prepared {
                let len = doc.content_embedding.as_ref().map_or(0, Vec::len);
                if len > 0 {
                    match dimensions {
                        Some(expected) if expected != len => {
                            return Err(RagError::Configuration(format!(
                                "document '{}' has {len} dimensions, \
                                 collection '{name}' expects {expected}",
                                doc.id
                            )));
                        }
                        Some(_) => {}
                        None => dimensions = Some(len),
                    }
                }
                if !upsert && (target.docs.contains_key(&doc.id) || !seen.insert(&doc.id)) {
                    return Err(RagError::AlreadyExists(format!(
                        "document '{}' already exists in collection '{name}'",
                        doc.id
                    )));
                }
            }

            target.dimensions = dimensions;
            for doc in prepared {
                target.docs.insert(doc.id.clone(), doc);
            }
            debug!(collection = %name, start, end, total = docs.len(), upsert, "inserted batch");
        }
        Ok(())
    }

    async fn delete_docs(&self, ids: &[ItemId], collection: Option<&str>) -> Result<()> {
        let mut state = self.state.write().await;
        let name = state.resolve_name(collection)?;
        let target = state.collection_mut(&name)?;
        let removed = ids.iter().filter(|id| target.docs.remove(*id).is_some()).count();
        debug!(collection = %name, requested = ids.len(), removed, "deleted documents");
        Ok(())
    }

    async fn get_docs_by_ids(
        &self,
        ids: Option<&[ItemId]>,
        collection: Option<&str>,
    ) -> Result<Vec<Document>> {
        let state = self.state.read().await;
        let name = state.resolve_name(collection)?;
        let target = state.collection(&name)?;
        Ok(match ids {
            Some(ids) => ids.iter().filter_map(|id| target.docs.get(id).cloned()).collect(),
            None => target.docs.values().cloned().collect(),
        })
    }

    async fn retrieve_docs(
        &self,
        queries: &[Query],
        collection: Option<&str>,
    ) -> Result<QueryResults> {
        check_queries(queries)?;
        let Some(first) = queries.first() else {
            return Ok(QueryResults::default());
        };

        let missing: Vec<&str> =
            queries.iter().filter(|q| q.embedding.is_none()).map(|q| q.text.as_str()).collect();
        let mut computed = if missing.is_empty() {
            Vec::new().into_iter()
        } else {
            self.capability().await?.embed(&missing).await?.into_iter()
        };
        let vectors: Vec<Vec<f32>> = queries
            .iter()
            .map(|q| q.embedding.clone().or_else(|| computed.next()).unwrap_or_default())
            .collect();

        let state = self.state.read().await;
        let name = state.resolve_name(collection)?;
        let target = state.collection(&name)?;
        let distance: Distance = target.info.distance;

        if let Some(expected) = target.dimensions {
            if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
                return Err(RagError::Configuration(format!(
                    "query embedding has {} dimensions, collection '{name}' expects {expected}",
                    bad.len()
                )));
            }
        }

        let candidates: Vec<(&Document, &[f32])> = target
            .docs
            .values()
            .filter(|doc| matches_filters(doc, first.filters.as_ref(), first.contains.as_deref()))
            .filter_map(|doc| {
                doc.content_embedding
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .map(|embedding| (doc, embedding))
            })
            .collect();

        let mut results = QueryResults::default();
        for vector in &vectors {
            let mut scored: Vec<(&Document, f32)> = candidates
                .iter()
                .map(|(doc, embedding)| (*doc, distance.between(vector, embedding)))
                .collect();
            scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(first.k);
            results.push_query(
                scored.into_iter().map(|(doc, d)| QueryMatch::from_document(doc, d)).collect(),
            );
        }

        debug!(collection = %name, queries = queries.len(), k = first.k, "retrieved documents");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::embedding::{EmbeddingFunction, HashingEmbedding, UNDECLARED_MODEL_NAME};

    /// Declares neither a model name nor dimensions.
    struct Anonymous;

    #[async_trait]
    impl EmbeddingFunction for Anonymous {
        async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn doc(id: &str, embedding: Vec<f32>) -> Document {
        Document::new(id, "", format!("content of {id}")).with_content_embedding(embedding, "test")
    }

    #[tokio::test]
    async fn collection_lifecycle() {
        let store = InMemoryVectorStore::new();
        let first = store.create_collection("c", false, false).await.unwrap();

        let err = store.create_collection("c", false, false).await.unwrap_err();
        assert!(err.is_already_exists());

        let same = store.create_collection("c", false, true).await.unwrap();
        assert_eq!(same.id, first.id);

        store.insert_docs(&[doc("a", vec![1.0, 0.0])], Some("c"), false).await.unwrap();
        let fresh = store.create_collection("c", true, false).await.unwrap();
        assert_ne!(fresh.id, first.id);
        assert!(store.get_docs_by_ids(None, Some("c")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn active_collection_tracks_create_get_and_delete() {
        let store = InMemoryVectorStore::new();
        assert!(store.get_collection(None).await.unwrap_err().is_not_found());

        store.create_collection("one", false, false).await.unwrap();
        store.create_collection("two", false, false).await.unwrap();
        assert_eq!(store.get_collection(None).await.unwrap().name, "two");

        store.get_collection(Some("one")).await.unwrap();
        assert_eq!(store.get_collection(None).await.unwrap().name, "one");

        store.delete_collection("one").await.unwrap();
        assert!(store.get_collection(None).await.unwrap_err().is_not_found());
        assert!(store.get_collection(Some("one")).await.unwrap_err().is_not_found());
        assert_eq!(store.list_collections().await.unwrap(), vec!["two".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_ids_fail_without_upsert() {
        let store = InMemoryVectorStore::new();
        store.create_collection("c", false, false).await.unwrap();
        store.insert_docs(&[doc("a", vec![1.0, 0.0])], None, false).await.unwrap();

        let err = store.insert_docs(&[doc("a", vec![0.0, 1.0])], None, false).await.unwrap_err();
        assert!(err.is_already_exists());

        store.update_docs(&[doc("a", vec![0.0, 1.0])], None).await.unwrap();
        let stored = store.get_docs_by_ids(Some(&["a".into()]), None).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content_embedding, Some(vec![0.0, 1.0]));
    }

    #[tokio::test]
    async fn failed_batch_leaves_earlier_batches_committed() {
        let store = InMemoryVectorStore::with_options(VectorStoreOptions {
            batch_size: 1,
            ..VectorStoreOptions::default()
        });
        store.create_collection("c", false, false).await.unwrap();
        store.insert_docs(&[doc("b", vec![1.0, 0.0])], None, false).await.unwrap();

        let docs = [doc("a", vec![1.0, 0.0]), doc("b", vec![0.0, 1.0]), doc("c", vec![0.5, 0.5])];
        assert!(store.insert_docs(&docs, None, false).await.unwrap_err().is_already_exists());

        let ids: Vec<ItemId> = store
            .get_docs_by_ids(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![ItemId::from("a"), ItemId::from("b")]);
    }

    #[tokio::test]
    async fn retrieve_orders_by_ascending_distance_and_applies_filters() {
        let store = InMemoryVectorStore::new();
        store.create_collection("c", false, false).await.unwrap();
        let mut tagged = doc("far", vec![0.0, 1.0]);
        tagged.metadata = Some(Metadata::from([("lang".to_string(), MetadataValue::from("rust"))]));
        store
            .insert_docs(
                &[doc("near", vec![1.0, 0.0]), doc("mid", vec![0.7, 0.7]), tagged],
                None,
                false,
            )
            .await
            .unwrap();

        let query = Query::new("q").with_embedding(vec![1.0, 0.0]).with_k(2);
        let results = store.retrieve_docs(&[query.clone()], None).await.unwrap();
        assert_eq!(results.ids[0], vec![ItemId::from("near"), ItemId::from("mid")]);
        assert!(results.distances[0][0] <= results.distances[0][1]);

        let filtered = query
            .with_filters(Metadata::from([("lang".to_string(), MetadataValue::from("rust"))]));
        let results = store.retrieve_docs(&[filtered], None).await.unwrap();
        assert_eq!(results.ids[0], vec![ItemId::from("far")]);
    }

    #[tokio::test]
    async fn store_side_embedding_fills_missing_vectors() {
        let store = InMemoryVectorStore::with_options(VectorStoreOptions {
            embedding_function: Some(Arc::new(HashingEmbedding::new(16))),
            ..VectorStoreOptions::default()
        });
        store.create_collection("c", false, false).await.unwrap();
        store
            .insert_docs(
                &[Document::new(1u64, "", "rust ownership"), Document::new(2u64, "", "python gil")],
                None,
                false,
            )
            .await
            .unwrap();

        let results = store.retrieve_docs(&[Query::new("rust").with_k(1)], None).await.unwrap();
        assert_eq!(results.ids[0], vec![ItemId::Int(1)]);

        let plain = InMemoryVectorStore::new();
        plain.create_collection("c", false, false).await.unwrap();
        let err = plain.insert_docs(&[Document::new("x", "", "y")], None, false).await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn undeclared_function_is_stamped_with_its_resolved_name() {
        let store = InMemoryVectorStore::with_options(VectorStoreOptions {
            embedding_function: Some(Arc::new(Anonymous)),
            ..VectorStoreOptions::default()
        });
        let info = store.create_collection("c", false, false).await.unwrap();
        assert_eq!(info.embedding_model.as_deref(), Some(UNDECLARED_MODEL_NAME));

        store.insert_docs(&[Document::new("a", "", "abc")], None, false).await.unwrap();
        let stored = store.get_docs_by_ids(None, None).await.unwrap();
        assert_eq!(stored[0].embedding_model.as_deref(), Some(UNDECLARED_MODEL_NAME));
        assert_eq!(stored[0].dimensions, Some(2));
        assert!(stored[0].validate().is_ok());
    }

    #[tokio::test]
    async fn deleting_unknown_ids_is_a_no_op() {
        let store = InMemoryVectorStore::new();
        store.create_collection("c", false, false).await.unwrap();
        store.insert_docs(&[doc("a", vec![1.0])], None, false).await.unwrap();
        store.delete_docs(&["a".into(), "missing".into()], None).await.unwrap();
        store.delete_docs(&["a".into()], None).await.unwrap();
        assert!(store.get_docs_by_ids(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_k_is_rejected() {
        let store = InMemoryVectorStore::new();
        store.create_collection("c", false, false).await.unwrap();
        let query = Query::new("q").with_embedding(vec![1.0]).with_k(0);
        assert!(store.retrieve_docs(&[query], None).await.unwrap_err().is_configuration());
    }
}
