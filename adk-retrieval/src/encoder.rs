//! Encoding chunks into documents.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::document::{Chunk, Document};
use crate::embedding::{EmbeddingCapability, EmbeddingFunction};
use crate::error::{RagError, Result};

/// Turns [`Chunk`]s into [`Document`]s carrying embedding vectors.
///
/// Wraps an [`EmbeddingFunction`] resolved into an [`EmbeddingCapability`].
/// The function can be swapped at runtime with
/// [`set_embedding_function`](Encoder::set_embedding_function). If a function
/// does not declare its model name and dimensions, a warning is logged the
/// first time this happens for the encoder instance.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{Encoder, HashingEmbedding};
///
/// let encoder = Encoder::new(Arc::new(HashingEmbedding::new(384))).await?;
/// let documents = encoder.encode(&chunks).await?;
/// ```
#[derive(Debug)]
pub struct Encoder {
    capability: RwLock<EmbeddingCapability>,
    warned: AtomicBool,
}

impl Encoder {
    /// Create an encoder, resolving the function's capability.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the function is not usable.
    pub async fn new(function: Arc<dyn EmbeddingFunction>) -> Result<Self> {
        let capability = EmbeddingCapability::resolve(function).await?;
        let encoder = Self { capability: RwLock::new(capability), warned: AtomicBool::new(false) };
        encoder.warn_if_inferred(&*encoder.capability.read().await);
        Ok(encoder)
    }

    /// Replace the embedding function.
    ///
    /// The model name and dimensionality are re-derived exactly as in
    /// [`Encoder::new`]. On error the previous function stays in place.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the replacement is not usable.
    pub async fn set_embedding_function(&self, function: Arc<dyn EmbeddingFunction>) -> Result<()> {
        let capability = EmbeddingCapability::resolve(function).await?;
        self.warn_if_inferred(&capability);
        info!(
            model = capability.model_name(),
            dimensions = capability.dimensions(),
            "swapped embedding function"
        );
        *self.capability.write().await = capability;
        Ok(())
    }

    /// A snapshot of the current capability.
    pub async fn capability(&self) -> EmbeddingCapability {
        self.capability.read().await.clone()
    }

    pub async fn model_name(&self) -> String {
        self.capability.read().await.model_name().to_string()
    }

    pub async fn dimensions(&self) -> usize {
        self.capability.read().await.dimensions()
    }

    /// Encode chunks into documents, preserving order.
    ///
    /// Non-empty titles and contents are each embedded once; empty fields get
    /// an empty vector. Every document is stamped with the model name and
    /// dimensionality.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ExternalService`] if the embedding function fails.
    pub async fn encode(&self, chunks: &[Chunk]) -> Result<Vec<Document>> {
        let capability = self.capability().await;

        let titles = embed_non_empty(&capability, chunks.iter().map(|c| c.title.as_str())).await?;
        let contents =
            embed_non_empty(&capability, chunks.iter().map(|c| c.content.as_str())).await?;

        Ok(chunks
            .iter()
            .zip(titles.into_iter().zip(contents))
            .map(|(chunk, (title_embedding, content_embedding))| Document {
                id: chunk.id.clone(),
                title: chunk.title.clone(),
                content: chunk.content.clone(),
                metadata: chunk.metadata.clone(),
                title_embedding: Some(title_embedding),
                content_embedding: Some(content_embedding),
                embedding_model: Some(capability.model_name().to_string()),
                dimensions: Some(capability.dimensions()),
            })
            .collect())
    }

    /// Encode only the documents that carry no content embedding yet; the
    /// others are returned untouched, in their original positions.
    pub async fn encode_documents(&self, documents: Vec<Document>) -> Result<Vec<Document>> {
        let missing: Vec<usize> = documents
            .iter()
            .enumerate()
            .filter(|(_, d)| d.content_embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return Ok(documents);
        }

        let chunks: Vec<Chunk> = missing.iter().map(|&i| documents[i].to_chunk()).collect();
        let encoded = self.encode(&chunks).await?;

        let mut documents = documents;
        for (i, document) in missing.into_iter().zip(encoded) {
            documents[i] = document;
        }
        Ok(documents)
    }

    /// Embed a query text.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ExternalService`] if the embedding function fails.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let capability = self.capability().await;
        capability.embed(&[text]).await?.pop().ok_or_else(|| {
            RagError::external(capability.model_name(), "no embedding returned for query")
        })
    }

    fn warn_if_inferred(&self, capability: &EmbeddingCapability) {
        if capability.was_inferred() && !self.warned.swap(true, Ordering::Relaxed) {
            warn!(
                model = capability.model_name(),
                dimensions = capability.dimensions(),
                "embedding function does not declare model_name and dimensions; \
                 dimensionality was inferred from a live call"
            );
        }
    }

    /// Whether the undeclared-capability warning has been emitted.
    pub fn has_warned(&self) -> bool {
        self.warned.load(Ordering::Relaxed)
    }
}

/// Embed the non-empty texts in one call and spread the vectors back over
/// the input positions, leaving empty vectors for empty texts.
async fn embed_non_empty<'a>(
    capability: &EmbeddingCapability,
    texts: impl Iterator<Item = &'a str>,
) -> Result<Vec<Vec<f32>>> {
    let texts: Vec<&str> = texts.collect();
    let inputs: Vec<&str> = texts.iter().copied().filter(|t| !t.is_empty()).collect();
    let mut vectors = capability.embed(&inputs).await?.into_iter();
    Ok(texts
        .iter()
        .map(|t| if t.is_empty() { Vec::new() } else { vectors.next().unwrap_or_default() })
        .collect())
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::embedding::HashingEmbedding;

    struct Undeclared;

    #[async_trait]
    impl EmbeddingFunction for Undeclared {
        async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs.iter().map(|_| vec![0.5, 0.5]).collect())
        }
    }

    struct Failing;

    #[async_trait]
    impl EmbeddingFunction for Failing {
        async fn embed(&self, _inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
            Err(RagError::external("failing", "unavailable"))
        }
    }

    #[tokio::test]
    async fn encode_is_deterministic_and_stamps_model() {
        let encoder = Encoder::new(Arc::new(HashingEmbedding::new(16))).await.unwrap();
        let chunk = Chunk::new("Title", "some content");

        let first = encoder.encode(std::slice::from_ref(&chunk)).await.unwrap();
        let second = encoder.encode(std::slice::from_ref(&chunk)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].dimensions, Some(16));
        assert_eq!(first[0].embedding_model.as_deref(), Some("hashing-16"));
        assert!(first[0].validate().is_ok());
    }

    #[tokio::test]
    async fn empty_fields_get_empty_vectors() {
        let encoder = Encoder::new(Arc::new(HashingEmbedding::new(4))).await.unwrap();
        let docs = encoder.encode(&[Chunk::new("", "body"), Chunk::new("t", "")]).await.unwrap();
        assert_eq!(docs[0].title_embedding.as_ref().map(Vec::len), Some(0));
        assert_eq!(docs[0].content_embedding.as_ref().map(Vec::len), Some(4));
        assert_eq!(docs[1].title_embedding.as_ref().map(Vec::len), Some(4));
        assert_eq!(docs[1].content_embedding.as_ref().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn swap_rederives_capability_and_rejects_unusable_functions() {
        let encoder = Encoder::new(Arc::new(HashingEmbedding::new(8))).await.unwrap();
        assert!(!encoder.has_warned());

        encoder.set_embedding_function(Arc::new(Undeclared)).await.unwrap();
        assert_eq!(encoder.dimensions().await, 2);
        assert!(encoder.has_warned());

        let err = encoder.set_embedding_function(Arc::new(Failing)).await.unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(encoder.dimensions().await, 2);
    }

    #[tokio::test]
    async fn encode_documents_fills_only_missing_embeddings() {
        let encoder = Encoder::new(Arc::new(HashingEmbedding::new(4))).await.unwrap();
        let kept = Document::new("a", "", "x").with_content_embedding(vec![1.0, 0.0, 0.0, 0.0], "m");
        let docs = encoder
            .encode_documents(vec![kept.clone(), Document::new("b", "", "hello")])
            .await
            .unwrap();
        assert_eq!(docs[0], kept);
        assert_eq!(docs[1].embedding_model.as_deref(), Some("hashing-4"));
    }
}
