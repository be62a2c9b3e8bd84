//! Configuration for the RAG agent.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::{EmbeddingFunction, HashingEmbedding};
use crate::error::{RagError, Result};
use crate::prompt::{PromptGenerator, PromptTask};
use crate::splitter::{ChunkMode, SplitOptions};
use crate::tokens::context_window;
use crate::vectorstore::{DEFAULT_BATCH_SIZE, Distance, VectorStoreKind, VectorStoreOptions};

/// Name of the built-in [`HashingEmbedding`] model; `hashing-<dims>` picks
/// the dimensionality.
pub const HASHING_EMBEDDING_MODEL: &str = "hashing";

/// Share of the model's context window used for one chunk when
/// `chunk_token_size` is unset.
const CHUNK_WINDOW_SHARE: f64 = 0.4;

/// Configuration parameters for the RAG agent.
///
/// Every field has a default, so a partial JSON object deserializes.
/// [`RetrieveConfig::builder`] and [`RetrieveConfig::from_json`] validate
/// the result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrieveConfig {
    /// Vector store backend name.
    pub retriever: String,
    /// File or directory to index. Without it the collection must exist.
    pub docs_path: Option<PathBuf>,
    pub collection_name: String,
    /// Chat model; drives the chunk and context token budgets.
    pub model: String,
    /// Token budget of one chunk. Defaults to 40% of the model's context window.
    pub chunk_token_size: Option<usize>,
    pub chunk_mode: ChunkMode,
    pub must_break_at_empty_line: bool,
    /// Lines repeated between consecutive chunks.
    pub chunk_overlap: usize,
    /// Character budget of one chunk.
    pub max_chunk_length: usize,
    pub embedding_model: String,
    /// Replaces the task's prompt template.
    pub customized_prompt: Option<String>,
    /// A reply lacking this prefix asks for more context. Stored upper-cased.
    pub customized_answer_prefix: String,
    /// Whether the agent may retry with further documents.
    pub update_context: bool,
    /// Reuse an existing collection when indexing `docs_path`.
    pub get_or_create: Option<bool>,
    /// Walk `docs_path` recursively.
    pub recursive: bool,
    pub task: PromptTask,
    /// Documents retrieved per query.
    pub n_results: usize,
    /// Alternative phrasings requested from the refiner; 0 disables it.
    pub refine_count: usize,
    pub batch_size: usize,
    pub distance: Distance,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        Self {
            retriever: VectorStoreKind::InMemory.as_str().to_string(),
            docs_path: None,
            collection_name: "adk-docs".to_string(),
            model: "gpt-4".to_string(),
            chunk_token_size: None,
            chunk_mode: ChunkMode::MultiLines,
            must_break_at_empty_line: true,
            chunk_overlap: 0,
            max_chunk_length: 4000,
            embedding_model: HASHING_EMBEDDING_MODEL.to_string(),
            customized_prompt: None,
            customized_answer_prefix: String::new(),
            update_context: true,
            get_or_create: None,
            recursive: true,
            task: PromptTask::Default,
            n_results: 20,
            refine_count: 0,
            batch_size: DEFAULT_BATCH_SIZE,
            distance: Distance::InnerProduct,
        }
    }
}

impl RetrieveConfig {
    /// Create a new builder for constructing a [`RetrieveConfig`].
    pub fn builder() -> RetrieveConfigBuilder {
        RetrieveConfigBuilder::default()
    }

    /// Parse and validate a JSON configuration object.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            RagError::Configuration(format!("invalid retrieve config: {e}"))
        })?;
        RetrieveConfigBuilder { config }.build()
    }

    /// Check that the parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if:
    /// - `n_results == 0` or `batch_size == 0`
    /// - `chunk_token_size == Some(0)`
    /// - `chunk_overlap >= max_chunk_length`
    /// - `retriever` or `embedding_model` is unknown
    /// - `customized_prompt` lacks a placeholder
    pub fn validate(&self) -> Result<()> {
        if self.n_results == 0 {
            return Err(RagError::Configuration("n_results must be greater than zero".into()));
        }
        if self.batch_size == 0 {
            return Err(RagError::Configuration("batch_size must be greater than zero".into()));
        }
        if self.chunk_token_size == Some(0) {
            return Err(RagError::Configuration("chunk_token_size must be greater than zero".into()));
        }
        self.split_options().validate()?;
        self.retriever.parse::<VectorStoreKind>()?;
        check_embedding_model(&self.embedding_model)?;
        self.prompt_generator()?;
        Ok(())
    }

    /// Effective token budget of one chunk.
    pub fn chunk_token_size(&self) -> usize {
        self.chunk_token_size
            .unwrap_or_else(|| (context_window(&self.model) as f64 * CHUNK_WINDOW_SHARE) as usize)
            .max(1)
    }

    /// Effective `get_or_create`: `false` when `docs_path` is set, else `true`.
    pub fn get_or_create(&self) -> bool {
        self.get_or_create.unwrap_or(self.docs_path.is_none())
    }

    pub fn split_options(&self) -> SplitOptions {
        SplitOptions {
            max_chunk_length: self.max_chunk_length,
            max_chunk_tokens: self.chunk_token_size(),
            chunk_mode: self.chunk_mode,
            must_break_at_empty_line: self.must_break_at_empty_line,
            overlap: self.chunk_overlap,
            ..SplitOptions::default()
        }
    }

    pub fn vector_store_options(&self) -> VectorStoreOptions {
        VectorStoreOptions {
            distance: self.distance,
            batch_size: self.batch_size,
            ..VectorStoreOptions::default()
        }
    }

    /// The prompt generator for `customized_prompt`, or for `task`.
    pub fn prompt_generator(&self) -> Result<PromptGenerator> {
        match &self.customized_prompt {
            Some(template) => PromptGenerator::custom(template.clone()),
            None => Ok(PromptGenerator::new(self.task)),
        }
    }

    /// Build the embedding function named by `embedding_model`.
    pub fn embedding_function(&self) -> Result<Arc<dyn EmbeddingFunction>> {
        embedding_function_for(&self.embedding_model)
    }
}

fn hashing_dimensions(name: &str) -> Option<Option<usize>> {
    if name == HASHING_EMBEDDING_MODEL {
        return Some(None);
    }
    name.strip_prefix("hashing-").and_then(|d| d.parse().ok()).filter(|d| *d > 0).map(Some)
}

fn check_embedding_model(name: &str) -> Result<()> {
    if hashing_dimensions(name).is_some() {
        return Ok(());
    }
    #[cfg(feature = "openai")]
    if name.starts_with("text-embedding") {
        return Ok(());
    }
    Err(RagError::Configuration(format!("unsupported embedding model: {name}")))
}

/// Build an embedding function by model name.
///
/// `hashing` and `hashing-<dims>` are always available; with the `openai`
/// feature, names starting with `text-embedding` use the OpenAI API.
pub fn embedding_function_for(name: &str) -> Result<Arc<dyn EmbeddingFunction>> {
    if let Some(dimensions) = hashing_dimensions(name) {
        let function = dimensions.map(HashingEmbedding::new).unwrap_or_default();
        return Ok(Arc::new(function));
    }
    #[cfg(feature = "openai")]
    if name.starts_with("text-embedding") {
        let function = crate::openai::OpenAIEmbeddingFunction::from_env()?.with_model(name);
        return Ok(Arc::new(function));
    }
    Err(RagError::Configuration(format!("unsupported embedding model: {name}")))
}

/// Builder for constructing a validated [`RetrieveConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetrieveConfigBuilder {
    config: RetrieveConfig,
}

impl RetrieveConfigBuilder {
    /// Set the vector store backend name.
    pub fn retriever(mut self, retriever: impl Into<String>) -> Self {
        self.config.retriever = retriever.into();
        self
    }

    pub fn docs_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.docs_path = Some(path.into());
        self
    }

    pub fn collection_name(mut self, name: impl Into<String>) -> Self {
        self.config.collection_name = name.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn chunk_token_size(mut self, tokens: usize) -> Self {
        self.config.chunk_token_size = Some(tokens);
        self
    }

    pub fn chunk_mode(mut self, mode: ChunkMode) -> Self {
        self.config.chunk_mode = mode;
        self
    }

    pub fn must_break_at_empty_line(mut self, value: bool) -> Self {
        self.config.must_break_at_empty_line = value;
        self
    }

    pub fn chunk_overlap(mut self, lines: usize) -> Self {
        self.config.chunk_overlap = lines;
        self
    }

    pub fn max_chunk_length(mut self, chars: usize) -> Self {
        self.config.max_chunk_length = chars;
        self
    }

    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.config.embedding_model = model.into();
        self
    }

    pub fn customized_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.customized_prompt = Some(prompt.into());
        self
    }

    pub fn customized_answer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.customized_answer_prefix = prefix.into();
        self
    }

    pub fn update_context(mut self, value: bool) -> Self {
        self.config.update_context = value;
        self
    }

    pub fn get_or_create(mut self, value: bool) -> Self {
        self.config.get_or_create = Some(value);
        self
    }

    pub fn recursive(mut self, value: bool) -> Self {
        self.config.recursive = value;
        self
    }

    pub fn task(mut self, task: PromptTask) -> Self {
        self.config.task = task;
        self
    }

    pub fn n_results(mut self, n: usize) -> Self {
        self.config.n_results = n;
        self
    }

    pub fn refine_count(mut self, n: usize) -> Self {
        self.config.refine_count = n;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    pub fn distance(mut self, distance: Distance) -> Self {
        self.config.distance = distance;
        self
    }

    /// Build the [`RetrieveConfig`], upper-casing the answer prefix and
    /// validating the parameters.
    ///
    /// # Errors
    ///
    /// See [`RetrieveConfig::validate`].
    pub fn build(mut self) -> Result<RetrieveConfig> {
        self.config.customized_answer_prefix = self.config.customized_answer_prefix.to_uppercase();
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_the_model() {
        let config = RetrieveConfig::builder().build().unwrap();
        assert_eq!(config.chunk_token_size(), 3276);
        assert!(config.get_or_create());
        assert_eq!(config.split_options().max_chunk_tokens, 3276);

        let config = RetrieveConfig::builder().model("gpt-4o").docs_path("docs").build().unwrap();
        assert_eq!(config.chunk_token_size(), 51200);
        assert!(!config.get_or_create());
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let cases = [
            RetrieveConfig::builder().n_results(0),
            RetrieveConfig::builder().batch_size(0),
            RetrieveConfig::builder().chunk_token_size(0),
            RetrieveConfig::builder().chunk_overlap(10).max_chunk_length(10),
            RetrieveConfig::builder().retriever("chromadb"),
            RetrieveConfig::builder().embedding_model("all-MiniLM-L6-v2"),
            RetrieveConfig::builder().customized_prompt("no placeholders"),
        ];
        for builder in cases {
            assert!(builder.build().unwrap_err().is_configuration());
        }
    }

    #[test]
    fn json_config_is_normalized() {
        let config = RetrieveConfig::from_json(
            r#"{"collection_name": "guides", "chunk_mode": "one_line",
                "customized_answer_prefix": "the answer is", "embedding_model": "hashing-32"}"#,
        )
        .unwrap();
        assert_eq!(config.collection_name, "guides");
        assert_eq!(config.chunk_mode, ChunkMode::OneLine);
        assert_eq!(config.customized_answer_prefix, "THE ANSWER IS");
        assert_eq!(config.n_results, 20);
        assert_eq!(config.embedding_function().unwrap().dimensions(), Some(32));

        let err = RetrieveConfig::from_json(r#"{"chunk_mode": "paragraphs"}"#).unwrap_err();
        assert!(err.to_string().contains("paragraphs"));
    }
}
