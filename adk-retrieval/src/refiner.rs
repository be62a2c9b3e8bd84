//! Pre-retrieval question refinement.
//!
//! A [`QuestionRefiner`] asks a [`LanguageModel`] for alternative phrasings of
//! a question so retrieval can cast a wider net.

use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, error};

use crate::error::{RagError, Result};
use crate::llm::LanguageModel;

/// Placeholder replaced by the question.
pub const QUESTION_PLACEHOLDER: &str = "{input_question}";

/// Placeholder replaced by the number of wanted alternatives.
pub const COUNT_PLACEHOLDER: &str = "{n}";

/// Instruction used when no custom template is given.
pub const DEFAULT_REFINE_TEMPLATE: &str = "You are an AI language model assistant. \
Your task is to generate {n} different versions of the given user question to retrieve \
relevant documents from a vector database. By generating multiple perspectives on the \
user question, your goal is to help the user overcome some of the limitations of \
distance-based similarity search.
Provide these alternative questions as a numbered list, one per line, for example:
1. <first alternative question>?
2. <second alternative question>?

Original question: {input_question}";

const SYSTEM_MESSAGE: &str = "You are a helpful AI assistant.";

static NUMBERED_QUESTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*\d+\.\s+(.+?(?:\?|\.\.\.|…))")
        .expect("unreachable error: failed to compile numbered question pattern")
});

/// Replaces the default parser: receives the raw model reply and the wanted
/// count, returns the alternatives.
pub type PostProcessor = Arc<dyn Fn(&str, usize) -> Vec<String> + Send + Sync>;

/// Extract up to `n` questions from a numbered list.
///
/// Only lines starting with `<number>. ` count; each question runs to its
/// first question mark or ellipsis.
pub fn parse_numbered_questions(reply: &str, n: usize) -> Vec<String> {
    NUMBERED_QUESTION
        .captures_iter(reply)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|q| !q.is_empty())
        .take(n)
        .collect()
}

/// Check that a refine template carries both placeholders.
pub fn validate_template(template: &str) -> Result<()> {
    let missing: Vec<&str> = [QUESTION_PLACEHOLDER, COUNT_PLACEHOLDER]
        .into_iter()
        .filter(|p| !template.contains(p))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(RagError::Configuration(format!(
            "refine template is missing placeholder(s): {}",
            missing.join(", ")
        )))
    }
}

/// Generates alternative phrasings of a question with a language model.
///
/// Without a model or a template the refiner is a no-op that returns the
/// question unchanged. Model failures are logged and also yield the
/// original question.
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::QuestionRefiner;
///
/// let refiner = QuestionRefiner::new(model);
/// let variants = refiner.refine("How do I configure logging?", 3).await;
/// ```
#[derive(Clone, Default)]
pub struct QuestionRefiner {
    model: Option<Arc<dyn LanguageModel>>,
    template: Option<String>,
    post_processor: Option<PostProcessor>,
}

impl QuestionRefiner {
    /// A refiner using `model` and [`DEFAULT_REFINE_TEMPLATE`].
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            model: Some(model),
            template: Some(DEFAULT_REFINE_TEMPLATE.to_string()),
            post_processor: None,
        }
    }

    /// A refiner that never calls a model.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Use a custom instruction template.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Configuration`] if the template lacks
    /// `{input_question}` or `{n}`.
    pub fn with_template(mut self, template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        validate_template(&template)?;
        self.template = Some(template);
        Ok(self)
    }

    /// Replace [`parse_numbered_questions`] with a custom parser.
    pub fn with_post_processor(
        mut self,
        post_processor: impl Fn(&str, usize) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.post_processor = Some(Arc::new(post_processor));
        self
    }

    /// Whether [`refine`](Self::refine) will call a model.
    pub fn is_enabled(&self) -> bool {
        self.model.is_some() && self.template.is_some()
    }

    /// Produce up to `n` alternative phrasings of `question`.
    ///
    /// Falls back to `[question]` when disabled, when `n` is zero, when the
    /// model fails, or when nothing could be parsed.
    pub async fn refine(&self, question: &str, n: usize) -> Vec<String> {
        let (Some(model), Some(template)) = (&self.model, &self.template) else {
            return vec![question.to_string()];
        };
        if n == 0 {
            return vec![question.to_string()];
        }

        let prompt = template
            .replace(COUNT_PLACEHOLDER, &n.to_string())
            .replace(QUESTION_PLACEHOLDER, question);
        let reply = match model.complete(SYSTEM_MESSAGE, &prompt).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "question refinement failed, using the original question");
                return vec![question.to_string()];
            }
        };

        let mut questions = match &self.post_processor {
            Some(post_processor) => post_processor(&reply, n),
            None => parse_numbered_questions(&reply, n),
        };
        questions.truncate(n);
        debug!(requested = n, parsed = questions.len(), "refined question");
        if questions.is_empty() {
            return vec![question.to_string()];
        }
        questions
    }
}

impl fmt::Debug for QuestionRefiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuestionRefiner")
            .field("enabled", &self.is_enabled())
            .field("template", &self.template)
            .field("custom_post_processor", &self.post_processor.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    struct Scripted {
        reply: Result<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(reply: Result<String>) -> Arc<Self> {
            Arc::new(Self { reply, prompts: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn complete(&self, _system: &str, user: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            match &self.reply {
                Ok(reply) => Ok(reply.clone()),
                Err(e) => Err(RagError::external("scripted", e.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn refiner_without_model_is_a_no_op() {
        let refiner = QuestionRefiner::disabled();
        assert!(!refiner.is_enabled());
        assert_eq!(refiner.refine("What is X?", 3).await, vec!["What is X?".to_string()]);
    }

    #[tokio::test]
    async fn numbered_alternatives_are_parsed_and_capped() {
        let model = Scripted::new(Ok("Sure!\n1. What does X mean?\n2. How is X defined?\n\
             3. Where is X used...\n4. Why X?"
            .to_string()));
        let refiner = QuestionRefiner::new(model.clone());
        let questions = refiner.refine("What is X?", 3).await;
        assert_eq!(
            questions,
            vec!["What does X mean?", "How is X defined?", "Where is X used..."]
        );

        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("generate 3 different versions"));
        assert!(prompt.contains("Original question: What is X?"));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_the_question() {
        let refiner = QuestionRefiner::new(Scripted::new(Err(RagError::external("x", "down"))));
        assert_eq!(refiner.refine("What is X?", 2).await, vec!["What is X?".to_string()]);
    }

    #[tokio::test]
    async fn custom_post_processor_replaces_the_parser() {
        let refiner = QuestionRefiner::new(Scripted::new(Ok("a|b|c".to_string())))
            .with_post_processor(|reply, _| reply.split('|').map(str::to_string).collect());
        assert_eq!(refiner.refine("q", 2).await, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn templates_must_carry_both_placeholders() {
        let refiner = QuestionRefiner::disabled();
        let err = refiner.clone().with_template("Rephrase {input_question}").unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("{n}"));
        assert!(refiner.with_template("Give {n} versions of {input_question}").is_ok());
    }
}
