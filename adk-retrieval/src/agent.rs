//! Retrieval-augmented question answering.
//!
//! The [`RagAgent`] ties the pipeline together: it indexes `docs_path` into a
//! collection (load → split → encode → upsert), retrieves and reranks
//! candidates for a question, packs them into a prompt and asks a
//! [`LanguageModel`], retrying with further documents while the model asks
//! for more context.
//!
//! # Example
//!
//! ```rust,ignore
//! use adk_retrieval::{RagAgent, RetrieveConfig};
//!
//! let config = RetrieveConfig::builder().docs_path("./docs").build()?;
//! let agent = RagAgent::builder().config(config).model(model).build().await?;
//!
//! let answer = agent.answer("How do I enable tracing?").await?;
//! println!("{}", answer.text);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::config::RetrieveConfig;
use crate::document::{Document, ItemId, Query};
use crate::embedding::EmbeddingFunction;
use crate::encoder::Encoder;
use crate::error::{RagError, Result};
use crate::llm::LanguageModel;
use crate::loader::load_documents;
use crate::prompt::{PromptGenerator, UPDATE_CONTEXT};
use crate::refiner::QuestionRefiner;
use crate::reranker::{Reranker, TfidfReranker};
use crate::retriever::Retriever;
use crate::splitter::{Splitter, TextSplitter};
use crate::tokens::{TokenCounter, context_window};
use crate::vectorstore::{VectorStore, VectorStoreOptions, VectorStoreRegistry};

/// System message sent with every answer prompt unless overridden.
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful AI assistant.";

/// Reply returned when the language model fails.
pub const FALLBACK_ANSWER: &str =
    "Sorry, I could not generate an answer right now. Please try again later.";

/// Share of the model's context window filled with retrieved documents.
const CONTEXT_WINDOW_SHARE: f64 = 0.8;

/// Characters at each end of a reply searched for [`UPDATE_CONTEXT`].
const UPDATE_MARKER_SPAN: usize = 20;

/// The outcome of [`RagAgent::answer`].
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// The model's final reply, or [`FALLBACK_ANSWER`].
    pub text: String,
    /// The question variants that were searched, original first.
    pub queries: Vec<String>,
    /// Documents packed into the context of the last round.
    pub context_ids: Vec<ItemId>,
    /// Number of model calls made for the answer.
    pub rounds: usize,
    /// Whether the model failed and `text` is the fallback reply.
    pub fallback: bool,
    /// Whether the model still wanted more context when candidates ran out.
    pub exhausted: bool,
}

/// Candidates retrieved for a question, most relevant first.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieval {
    pub queries: Vec<String>,
    pub documents: Vec<Document>,
}

/// One prompt's worth of documents.
struct PackedContext {
    text: String,
    ids: Vec<ItemId>,
    next: usize,
}

/// A retrieval-augmented question answering agent.
///
/// Construct one via [`RagAgent::builder()`]. The collection is prepared
/// lazily by the first call that needs it, or explicitly with
/// [`initialize`](RagAgent::initialize).
pub struct RagAgent {
    config: RetrieveConfig,
    model: Arc<dyn LanguageModel>,
    retriever: Retriever,
    splitter: Arc<dyn Splitter>,
    reranker: Option<Arc<dyn Reranker>>,
    refiner: QuestionRefiner,
    prompt: PromptGenerator,
    counter: TokenCounter,
    system_message: String,
    initialized: OnceCell<()>,
}

impl RagAgent {
    /// Create a new [`RagAgentBuilder`].
    pub fn builder() -> RagAgentBuilder {
        RagAgentBuilder::default()
    }

    pub fn config(&self) -> &RetrieveConfig {
        &self.config
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Token budget for the documents of one prompt.
    pub fn context_budget(&self) -> usize {
        (context_window(&self.config.model) as f64 * CONTEXT_WINDOW_SHARE) as usize
    }

    /// Prepare the collection once.
    ///
    /// With `docs_path`, the collection is created (or reused when
    /// `get_or_create`) and the documents are loaded, split, encoded and
    /// upserted. Without it, the collection must already exist.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::NotFound`] for a missing collection or docs path,
    /// [`RagError::AlreadyExists`] if the collection exists and may not be
    /// reused, and any store or encoder error.
    pub async fn initialize(&self) -> Result<()> {
        self.initialized.get_or_try_init(|| self.prepare_collection()).await.map(|_| ())
    }

    async fn prepare_collection(&self) -> Result<()> {
        let name = self.retriever.collection();
        let store = self.retriever.store();

        let Some(docs_path) = &self.config.docs_path else {
            store.get_collection(Some(name)).await?;
            info!(collection = name, "using existing collection");
            return Ok(());
        };

        store.create_collection(name, false, self.config.get_or_create()).await?;
        let sources = load_documents(docs_path, self.config.recursive)?;
        let chunks: Vec<_> = sources
            .iter()
            .flat_map(|source| self.splitter.split(&source.text, &source.title))
            .collect();
        self.retriever.insert_chunks(&chunks, true).await?;

        info!(
            collection = name,
            path = %docs_path.display(),
            files = sources.len(),
            chunks = chunks.len(),
            "indexed documents"
        );
        Ok(())
    }

    /// Retrieve candidates for `question`.
    ///
    /// The question is refined into variants when a refiner is enabled, each
    /// variant retrieves `n_results` documents, duplicates keep their closest
    /// distance, and the merged set is reranked against the original
    /// question.
    pub async fn retrieve(&self, question: &str) -> Result<Retrieval> {
        self.initialize().await?;

        let mut queries = vec![question.to_string()];
        if self.refiner.is_enabled() && self.config.refine_count > 0 {
            for variant in self.refiner.refine(question, self.config.refine_count).await {
                if !queries.contains(&variant) {
                    queries.push(variant);
                }
            }
        }

        let requests: Vec<Query> =
            queries.iter().map(|q| Query::new(q.clone()).with_k(self.config.n_results)).collect();
        let results = self.retriever.retrieve_batch(&requests).await?;

        let mut order: Vec<ItemId> = Vec::new();
        let mut best: HashMap<ItemId, (Document, f32)> = HashMap::new();
        for row in 0..results.len() {
            let distances = results.distances[row].iter().copied();
            for (document, distance) in results.documents(row).into_iter().zip(distances) {
                match best.get_mut(&document.id) {
                    Some(entry) if distance < entry.1 => *entry = (document, distance),
                    Some(_) => {}
                    None => {
                        order.push(document.id.clone());
                        best.insert(document.id.clone(), (document, distance));
                    }
                }
            }
        }
        let mut merged: Vec<(Document, f32)> =
            order.iter().filter_map(|id| best.remove(id)).collect();
        merged.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut documents: Vec<Document> = merged.into_iter().map(|(d, _)| d).collect();

        if let Some(reranker) = self.reranker.as_ref().filter(|_| !documents.is_empty()) {
            let query = Query::new(question).with_k(documents.len());
            let ranked = reranker.rerank(&query, Some(&documents), false).await?;
            let mut slots: Vec<Option<Document>> = documents.into_iter().map(Some).collect();
            documents = ranked
                .iter()
                .filter_map(|r| slots.get_mut(r.index).and_then(Option::take))
                .collect();
        }

        debug!(queries = queries.len(), candidates = documents.len(), "retrieved candidates");
        Ok(Retrieval { queries, documents })
    }

    /// Answer `question` from retrieved context.
    ///
    /// While `update_context` is on and the reply asks for more context, the
    /// next unseen candidates are packed into a fresh prompt and the model
    /// is asked again, until the reply is final or the candidates run out.
    /// Model failures produce an [`Answer`] with `fallback` set instead of
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns store, encoder and reranker errors.
    pub async fn answer(&self, question: &str) -> Result<Answer> {
        let Retrieval { queries, documents } = self.retrieve(question).await?;
        let budget = self.context_budget();

        let mut answer = Answer {
            text: String::new(),
            queries,
            context_ids: Vec::new(),
            rounds: 0,
            fallback: false,
            exhausted: false,
        };
        let mut cursor = 0;

        loop {
            let packed = self.pack_context(&documents, cursor, budget);
            if packed.ids.is_empty() && answer.rounds > 0 {
                info!(rounds = answer.rounds, "no more documents to add to the context");
                answer.exhausted = true;
                return Ok(answer);
            }
            cursor = packed.next;

            let prompt = self.prompt.generate(question, &packed.text);
            answer.rounds += 1;
            answer.context_ids = packed.ids;

            let reply = match self.model.complete(&self.system_message, &prompt).await {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, round = answer.rounds, "language model call failed");
                    answer.text = FALLBACK_ANSWER.to_string();
                    answer.fallback = true;
                    return Ok(answer);
                }
            };
            answer.text = reply;

            if !self.wants_more_context(&answer.text) {
                debug!(rounds = answer.rounds, "answer is final");
                return Ok(answer);
            }
            info!(round = answer.rounds, next = cursor, "updating context");
        }
    }

    /// Whether `reply` asks for another round with more context.
    fn wants_more_context(&self, reply: &str) -> bool {
        if !self.config.update_context {
            return false;
        }
        let upper = reply.to_uppercase();
        let head: String = upper.chars().take(UPDATE_MARKER_SPAN).collect();
        let mut tail: Vec<char> = upper.chars().rev().take(UPDATE_MARKER_SPAN).collect();
        tail.reverse();
        let tail: String = tail.into_iter().collect();
        if head.contains(UPDATE_CONTEXT) || tail.contains(UPDATE_CONTEXT) {
            return true;
        }
        let prefix = &self.config.customized_answer_prefix;
        !prefix.is_empty() && !upper.contains(prefix.as_str())
    }

    /// Pack documents from `start` on until the token budget is reached.
    /// A document larger than the whole budget is skipped.
    fn pack_context(&self, documents: &[Document], start: usize, budget: usize) -> PackedContext {
        let mut packed = PackedContext { text: String::new(), ids: Vec::new(), next: start };
        let mut used = 0;
        let mut seen = HashSet::new();
        for document in &documents[start.min(documents.len())..] {
            let tokens = self.counter.count(&document.content);
            if tokens > budget {
                warn!(
                    id = %document.id,
                    tokens,
                    budget,
                    "skipping document larger than the context budget"
                );
                packed.next += 1;
                continue;
            }
            if used + tokens > budget {
                break;
            }
            used += tokens;
            packed.next += 1;
            if seen.insert(document.id.clone()) {
                packed.text.push_str(&document.content);
                packed.text.push('\n');
                packed.ids.push(document.id.clone());
            }
        }
        packed
    }
}

/// Builder for constructing a [`RagAgent`].
///
/// Only the language model is required. Every other part defaults from the
/// [`RetrieveConfig`]: the embedding function from `embedding_model`, the
/// vector store from `retriever`, a [`TfidfReranker`], and a refiner when
/// `refine_count > 0`.
///
/// # Example
///
/// ```rust,ignore
/// let agent = RagAgent::builder()
///     .config(config)
///     .model(model)
///     .vector_store(store)       // optional
///     .reranker(reranker)        // optional
///     .build()
///     .await?;
/// ```
#[derive(Default)]
pub struct RagAgentBuilder {
    config: Option<RetrieveConfig>,
    model: Option<Arc<dyn LanguageModel>>,
    embedding_function: Option<Arc<dyn EmbeddingFunction>>,
    vector_store: Option<Arc<dyn VectorStore>>,
    registry: Option<VectorStoreRegistry>,
    splitter: Option<Arc<dyn Splitter>>,
    reranker: Option<Option<Arc<dyn Reranker>>>,
    refiner: Option<QuestionRefiner>,
    system_message: Option<String>,
}

impl RagAgentBuilder {
    pub fn config(mut self, config: RetrieveConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the language model used for answers (and the default refiner).
    pub fn model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Override the embedding function named by `embedding_model`.
    pub fn embedding_function(mut self, function: Arc<dyn EmbeddingFunction>) -> Self {
        self.embedding_function = Some(function);
        self
    }

    /// Use an existing vector store instead of creating one from `retriever`.
    pub fn vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    /// Resolve `retriever` against a custom backend registry.
    pub fn registry(mut self, registry: VectorStoreRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn splitter(mut self, splitter: Arc<dyn Splitter>) -> Self {
        self.splitter = Some(splitter);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(Some(reranker));
        self
    }

    /// Keep the retrieval order instead of reranking.
    pub fn without_reranker(mut self) -> Self {
        self.reranker = Some(None);
        self
    }

    pub fn refiner(mut self, refiner: QuestionRefiner) -> Self {
        self.refiner = Some(refiner);
        self
    }

    pub fn system_message(mut self, message: impl Into<String>) -> Self {
        self.system_message = Some(message.into());
        self
    }

    /// Build the [`RagAgent`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the model is missing, the
    /// configuration is invalid, or the embedding function or vector store
    /// cannot be set up.
    pub async fn build(self) -> Result<RagAgent> {
        let model =
            self.model.ok_or_else(|| RagError::Configuration("model is required".to_string()))?;
        let config = self.config.unwrap_or_else(|| {
            let mut config = RetrieveConfig::default();
            if let Some(name) = model.model_name() {
                config.model = name.to_string();
            }
            config
        });
        config.validate()?;

        let function = match self.embedding_function {
            Some(function) => function,
            None => config.embedding_function()?,
        };
        let encoder = Arc::new(Encoder::new(Arc::clone(&function)).await?);

        let store = match self.vector_store {
            Some(store) => store,
            None => {
                let options = VectorStoreOptions {
                    embedding_function: Some(function),
                    dimensions: Some(encoder.dimensions().await),
                    ..config.vector_store_options()
                };
                self.registry.unwrap_or_default().create(&config.retriever, &options)?
            }
        };

        let counter = TokenCounter::for_model(&config.model)?;
        let splitter: Arc<dyn Splitter> = match self.splitter {
            Some(splitter) => splitter,
            None => Arc::new(TextSplitter::with_counter(config.split_options(), counter.clone())?),
        };
        let reranker = self.reranker.unwrap_or_else(|| {
            let reranker: Arc<dyn Reranker> = Arc::new(TfidfReranker::new());
            Some(reranker)
        });
        let refiner = self.refiner.unwrap_or_else(|| {
            if config.refine_count > 0 {
                QuestionRefiner::new(Arc::clone(&model))
            } else {
                QuestionRefiner::disabled()
            }
        });
        let prompt = config.prompt_generator()?;
        let system_message =
            self.system_message.unwrap_or_else(|| DEFAULT_SYSTEM_MESSAGE.to_string());

        let embedding_model = encoder.model_name().await;
        info!(
            collection = %config.collection_name,
            retriever = %config.retriever,
            model = %config.model,
            embedding_model = %embedding_model,
            "built rag agent"
        );

        Ok(RagAgent {
            retriever: Retriever::new(store, encoder, config.collection_name.clone()),
            config,
            model,
            splitter,
            reranker,
            refiner,
            prompt,
            counter,
            system_message,
            initialized: OnceCell::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::inmemory::InMemoryVectorStore;

    /// Replays canned replies and records every user message.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self { replies: Mutex::new(replies.into()), prompts: Mutex::new(Vec::new()) })
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn complete(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("UPDATE CONTEXT".to_string()))
        }
    }

    fn ok(reply: &str) -> Result<String> {
        Ok(reply.to_string())
    }

    /// An agent over a prepared collection of large documents, one per
    /// context round.
    async fn agent_with_large_docs(
        model: Arc<Scripted>,
        config: RetrieveConfig,
        count: usize,
    ) -> RagAgent {
        let store: Arc<dyn VectorStore> = Arc::new(InMemoryVectorStore::new());
        store.create_collection(&config.collection_name, false, false).await.unwrap();
        let agent = RagAgent::builder()
            .config(config)
            .model(model)
            .vector_store(store)
            .build()
            .await
            .unwrap();

        let docs: Vec<Document> = (0..count)
            .map(|i| Document::new(i as u64, "", format!("marker{i} {}", "the ".repeat(4000))))
            .collect();
        agent.retriever().insert_docs(docs, false).await.unwrap();
        agent
    }

    #[tokio::test]
    async fn indexes_docs_path_and_answers_from_context() {
        let temp = tempfile::tempdir().unwrap();
        let rust = "Rust guarantees memory safety through ownership.";
        std::fs::write(temp.path().join("rust.md"), rust).unwrap();
        std::fs::write(temp.path().join("go.md"), "Go schedules goroutines on threads.").unwrap();

        let model = Scripted::new(vec![ok("Ownership.")]);
        let config = RetrieveConfig::builder().docs_path(temp.path()).n_results(1).build().unwrap();
        let agent = RagAgent::builder().config(config).model(model.clone()).build().await.unwrap();

        let answer = agent.answer("How does Rust guarantee memory safety?").await.unwrap();
        assert_eq!(answer.text, "Ownership.");
        assert_eq!(answer.rounds, 1);
        assert!(!answer.fallback);
        assert_eq!(answer.context_ids, vec![ItemId::from("rust.md#0")]);
        assert!(model.prompts()[0].contains("memory safety through ownership"));

        // A second call reuses the indexed collection.
        agent.initialize().await.unwrap();
        let store = agent.retriever().store();
        let stored = store.get_docs_by_ids(None, Some("adk-docs")).await.unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn missing_collection_without_docs_path_is_not_found() {
        let model = Scripted::new(Vec::new());
        let agent = RagAgent::builder().model(model).build().await.unwrap();
        assert!(agent.initialize().await.unwrap_err().is_not_found());
        assert!(agent.answer("anything").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn update_context_moves_to_unseen_documents() {
        let model = Scripted::new(vec![ok("Sorry. UPDATE CONTEXT"), ok("Found it.")]);
        let agent = agent_with_large_docs(model.clone(), RetrieveConfig::default(), 3).await;

        let answer = agent.answer("the").await.unwrap();
        assert_eq!(answer.text, "Found it.");
        assert_eq!(answer.rounds, 2);
        assert!(!answer.exhausted);

        let prompts = model.prompts();
        let first = (0..3).find(|i| prompts[0].contains(&format!("marker{i} "))).unwrap();
        assert!(!prompts[1].contains(&format!("marker{first} ")));
    }

    #[tokio::test]
    async fn candidates_run_out() {
        let model = Scripted::new(Vec::new());
        let agent = agent_with_large_docs(model.clone(), RetrieveConfig::default(), 2).await;

        let answer = agent.answer("the").await.unwrap();
        assert!(answer.exhausted);
        assert_eq!(answer.rounds, 2);
        assert_eq!(answer.text, "UPDATE CONTEXT");
    }

    #[tokio::test]
    async fn missing_answer_prefix_requests_more_context() {
        let model = Scripted::new(vec![ok("I am not sure"), ok("Answer: 42")]);
        let config = RetrieveConfig::builder().customized_answer_prefix("answer:").build().unwrap();
        let agent = agent_with_large_docs(model, config, 2).await;

        let answer = agent.answer("the").await.unwrap();
        assert_eq!(answer.text, "Answer: 42");
        assert_eq!(answer.rounds, 2);
    }

    #[tokio::test]
    async fn update_context_disabled_stops_after_one_round() {
        let model = Scripted::new(vec![ok("UPDATE CONTEXT")]);
        let config = RetrieveConfig::builder().update_context(false).build().unwrap();
        let agent = agent_with_large_docs(model, config, 2).await;

        let answer = agent.answer("the").await.unwrap();
        assert_eq!(answer.rounds, 1);
        assert!(!answer.exhausted);
    }

    #[tokio::test]
    async fn model_failure_yields_fallback_answer() {
        let model = Scripted::new(vec![Err(RagError::external("llm", "timeout"))]);
        let agent = agent_with_large_docs(model, RetrieveConfig::default(), 1).await;

        let answer = agent.answer("the").await.unwrap();
        assert!(answer.fallback);
        assert_eq!(answer.text, FALLBACK_ANSWER);
    }

    #[tokio::test]
    async fn refined_questions_widen_the_search() {
        let model =
            Scripted::new(vec![ok("1. What is the marker?\n2. Which marker is it?"), ok("done")]);
        let config = RetrieveConfig::builder().refine_count(2).build().unwrap();
        let agent = agent_with_large_docs(model, config, 1).await;

        let answer = agent.answer("the").await.unwrap();
        assert_eq!(answer.queries, vec!["the", "What is the marker?", "Which marker is it?"]);
        assert_eq!(answer.text, "done");
        assert_eq!(answer.context_ids, vec![ItemId::Int(0)]);
    }

    /// Reports its model name; never called.
    struct Named;

    #[async_trait]
    impl LanguageModel for Named {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            Ok(String::new())
        }

        fn model_name(&self) -> Option<&str> {
            Some("gpt-4o")
        }
    }

    #[tokio::test]
    async fn default_config_follows_the_model_name() {
        let agent = RagAgent::builder().model(Arc::new(Named)).build().await.unwrap();
        assert_eq!(agent.config().model, "gpt-4o");
        assert_eq!(agent.context_budget(), 102_400);

        let config = RetrieveConfig::builder().model("gpt-4").build().unwrap();
        let agent =
            RagAgent::builder().config(config).model(Arc::new(Named)).build().await.unwrap();
        assert_eq!(agent.config().model, "gpt-4");
    }

    #[tokio::test]
    async fn building_without_a_model_fails() {
        let err = RagAgent::builder().build().await.err().unwrap();
        assert!(err.is_configuration());
    }
}
