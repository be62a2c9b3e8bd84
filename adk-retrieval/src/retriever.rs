//! Query-side facade over a vector store and an encoder.

use std::sync::Arc;

use tracing::debug;

use crate::document::{Chunk, Document, ItemId, Query, QueryResults};
use crate::encoder::Encoder;
use crate::error::Result;
use crate::vectorstore::VectorStore;

/// Binds a [`VectorStore`] collection to the [`Encoder`] that embeds its
/// documents, so queries are embedded with the same model as the data.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{Query, Retriever};
///
/// let retriever = Retriever::new(store, encoder, "docs");
/// retriever.insert_chunks(&chunks, false).await?;
/// let results = retriever.retrieve_docs(&Query::new("what is X?").with_k(5)).await?;
/// ```
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn VectorStore>,
    encoder: Arc<Encoder>,
    collection: String,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        encoder: Arc<Encoder>,
        collection: impl Into<String>,
    ) -> Self {
        Self { store, encoder, collection: collection.into() }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn encoder(&self) -> &Arc<Encoder> {
        &self.encoder
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Embed the query text (unless an embedding is already attached) and
    /// search the collection.
    pub async fn retrieve_docs(&self, query: &Query) -> Result<QueryResults> {
        self.retrieve_batch(std::slice::from_ref(query)).await
    }

    /// Search with several queries at once; `k`, filters and the content
    /// predicate of the first query apply to all of them.
    pub async fn retrieve_batch(&self, queries: &[Query]) -> Result<QueryResults> {
        let mut embedded = Vec::with_capacity(queries.len());
        for query in queries {
            let mut query = query.clone();
            if query.embedding.is_none() {
                query.embedding = Some(self.encoder.embed_query(&query.text).await?);
            }
            embedded.push(query);
        }
        debug!(collection = %self.collection, queries = embedded.len(), "retrieving");
        self.store.retrieve_docs(&embedded, Some(&self.collection)).await
    }

    /// Insert documents, embedding those that carry no content embedding.
    pub async fn insert_docs(&self, documents: Vec<Document>, upsert: bool) -> Result<()> {
        let documents = self.encoder.encode_documents(documents).await?;
        self.store.insert_docs(&documents, Some(&self.collection), upsert).await
    }

    /// Encode chunks and insert the resulting documents.
    pub async fn insert_chunks(&self, chunks: &[Chunk], upsert: bool) -> Result<()> {
        let documents = self.encoder.encode(chunks).await?;
        self.store.insert_docs(&documents, Some(&self.collection), upsert).await
    }

    pub async fn delete_docs(&self, ids: &[ItemId]) -> Result<()> {
        self.store.delete_docs(ids, Some(&self.collection)).await
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever").field("collection", &self.collection).finish_non_exhaustive()
    }
}
