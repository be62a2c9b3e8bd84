//! Embedding functions and the capability descriptor that pins their model
//! name and dimensionality.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RagError, Result};

/// Text used to infer the dimensionality of an embedding function that does
/// not declare it.
pub const PROBE_TEXT: &str = "dimension probe";

/// Model name recorded for embedding functions that do not declare one.
pub const UNDECLARED_MODEL_NAME: &str = "custom-embedding";

/// A function that maps text to fixed-dimension vectors.
///
/// Implementations wrap specific embedding backends (OpenAI, local models,
/// ...) behind a unified async interface. A function should declare its
/// [`model_name`](EmbeddingFunction::model_name) and
/// [`dimensions`](EmbeddingFunction::dimensions); when it does not, the
/// dimensionality is inferred once by [`EmbeddingCapability::resolve`].
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::{EmbeddingFunction, HashingEmbedding};
///
/// let function = HashingEmbedding::new(384);
/// let vectors = function.embed(&["hello world"]).await?;
/// assert_eq!(vectors[0].len(), 384);
/// ```
#[async_trait]
pub trait EmbeddingFunction: Send + Sync {
    /// Embed every input, returning one vector per input in order.
    async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Name of the model producing the vectors, if declared.
    fn model_name(&self) -> Option<&str> {
        None
    }

    /// Dimensionality of the produced vectors, if declared.
    fn dimensions(&self) -> Option<usize> {
        None
    }
}

/// An embedding function together with its resolved model name and
/// dimensionality.
#[derive(Clone)]
pub struct EmbeddingCapability {
    model_name: String,
    dimensions: usize,
    function: Arc<dyn EmbeddingFunction>,
    inferred: bool,
}

impl EmbeddingCapability {
    /// Resolve the descriptor for `function`.
    ///
    /// Declared values are used as-is. Missing values are inferred by
    /// embedding [`PROBE_TEXT`] once; the probe also validates that the
    /// function can be invoked at all.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the probe fails or yields no
    /// usable vector, or if the function declares zero dimensions.
    pub async fn resolve(function: Arc<dyn EmbeddingFunction>) -> Result<Self> {
        let declared_name = function.model_name().map(str::to_string);
        let declared_dimensions = function.dimensions();

        if let (Some(model_name), Some(dimensions)) = (&declared_name, declared_dimensions) {
            if dimensions == 0 {
                return Err(RagError::Configuration(format!(
                    "embedding function '{model_name}' declares zero dimensions"
                )));
            }
            return Ok(Self { model_name: model_name.clone(), dimensions, function, inferred: false });
        }

        let probe = function.embed(&[PROBE_TEXT]).await.map_err(|e| {
            RagError::Configuration(format!("embedding function is not invocable: {e}"))
        })?;
        let dimensions = match probe.first() {
            Some(vector) if !vector.is_empty() => vector.len(),
            _ => {
                return Err(RagError::Configuration(
                    "embedding function returned no vector for the probe input".to_string(),
                ));
            }
        };
        if let Some(declared) = declared_dimensions {
            if declared != dimensions {
                return Err(RagError::Configuration(format!(
                    "embedding function declares {declared} dimensions but produced {dimensions}"
                )));
            }
        }

        let model_name = declared_name.unwrap_or_else(|| UNDECLARED_MODEL_NAME.to_string());
        debug!(model = %model_name, dimensions, "inferred embedding dimensions");
        Ok(Self { model_name, dimensions, function, inferred: true })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn function(&self) -> &Arc<dyn EmbeddingFunction> {
        &self.function
    }

    /// Whether the function failed to declare its model name or dimensions.
    pub fn was_inferred(&self) -> bool {
        self.inferred
    }

    /// Embed `inputs`, checking the count and length of the returned vectors.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::ExternalService`] if the function fails or returns
    /// vectors of the wrong count or dimensionality.
    pub async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.function.embed(inputs).await?;
        if vectors.len() != inputs.len() {
            return Err(RagError::external(
                &self.model_name,
                format!("expected {} embeddings, got {}", inputs.len(), vectors.len()),
            ));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(RagError::external(
                &self.model_name,
                format!("expected {} dimensions, got {}", self.dimensions, bad.len()),
            ));
        }
        Ok(vectors)
    }
}

impl fmt::Debug for EmbeddingCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingCapability")
            .field("model_name", &self.model_name)
            .field("dimensions", &self.dimensions)
            .field("inferred", &self.inferred)
            .finish_non_exhaustive()
    }
}

/// Deterministic bag-of-words embedding using the hashing trick.
///
/// Each lower-cased alphanumeric term is hashed into one of `dimensions`
/// buckets weighted by its term frequency, then the vector is L2-normalized.
/// Texts without terms map to the zero vector. Needs no external service,
/// which makes it the default for local pipelines and tests.
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimensions: usize,
    model_name: String,
}

impl HashingEmbedding {
    /// Create a hashing embedding with the given dimensionality (at least 1).
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self { dimensions, model_name: format!("hashing-{dimensions}") }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in lowered.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            *tf.entry(word).or_insert(0) += 1;
        }

        for (term, count) in &tf {
            vector[djb2(term) % self.dimensions] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedding {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingFunction for HashingEmbedding {
    async fn embed(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(inputs.iter().map(|text| self.embed_one(text)).collect())
    }

    fn model_name(&self) -> Option<&str> {
        Some(&self.model_name)
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }
}

fn djb2(s: &str) -> usize {
    s.bytes().fold(5381usize, |hash, b| hash.wrapping_mul(33).wrapping_add(b as usize))
}
