//! Retrieval pipeline core for ADK-Rust agents.
//!
//! This crate provides:
//! - Line-oriented text splitting bounded by character and token budgets
//! - Embedding functions with resolved model name and dimensionality
//! - A vector store contract with an in-memory backend (Qdrant behind the
//!   `qdrant` feature)
//! - Lexical reranking and language-model question refinement
//! - [`RagAgent`], which indexes a docs path and answers questions from
//!   retrieved context, asking for more context when the model needs it
//!
//! OpenAI embeddings and chat completions are available behind the `openai`
//! feature.

mod agent;
mod config;
mod document;
mod embedding;
mod encoder;
mod error;
mod inmemory;
mod llm;
mod loader;
mod prompt;
mod refiner;
mod reranker;
mod retriever;
mod splitter;
mod tokens;
mod vectorstore;

#[cfg(feature = "openai")]
pub mod openai;
#[cfg(feature = "qdrant")]
pub mod qdrant;

pub use agent::{
    Answer, DEFAULT_SYSTEM_MESSAGE, FALLBACK_ANSWER, RagAgent, RagAgentBuilder, Retrieval,
};
pub use config::{
    HASHING_EMBEDDING_MODEL, RetrieveConfig, RetrieveConfigBuilder, embedding_function_for,
};
pub use document::{
    Chunk, DEFAULT_K, Document, ItemId, Metadata, MetadataValue, Query, QueryMatch, QueryResults,
    TITLE_KEY,
};
pub use embedding::{
    EmbeddingCapability, EmbeddingFunction, HashingEmbedding, PROBE_TEXT, UNDECLARED_MODEL_NAME,
};
pub use encoder::Encoder;
pub use error::{RagError, Result};
pub use inmemory::InMemoryVectorStore;
pub use llm::LanguageModel;
pub use loader::{SourceText, TEXT_FORMATS, load_documents};
pub use prompt::{
    PROMPT_CODE, PROMPT_DEFAULT, PROMPT_QA, PromptGenerator, PromptTask, UPDATE_CONTEXT,
};
pub use refiner::{
    DEFAULT_REFINE_TEMPLATE, PostProcessor, QuestionRefiner, parse_numbered_questions,
    validate_template,
};
pub use reranker::{
    ConstantReranker, RankedDocument, Reranker, RerankerKind, TfidfReranker, create_reranker,
};
pub use retriever::Retriever;
pub use splitter::{
    CHUNK_INDEX_KEY, CONTINUES_PREVIOUS_KEY, ChunkMode, OVERLAP_KEY, SplitOptions, Splitter,
    TextSplitter, split_text,
};
pub use tokens::{DEFAULT_CONTEXT_WINDOW, TokenCounter, context_window};
pub use vectorstore::{
    Collection, DEFAULT_BATCH_SIZE, Distance, VectorStore, VectorStoreConstructor,
    VectorStoreKind, VectorStoreOptions, VectorStoreRegistry, batches, check_insert_schema,
    check_queries,
};
