//! Language model seam used by the question refiner and the RAG agent.

use async_trait::async_trait;

use crate::error::Result;

/// A chat-style text completion backend.
///
/// The pipeline only needs a single round trip: a system message and a user
/// message in, the assistant's reply out. Implementations map transport and
/// API failures to [`RagError::ExternalService`](crate::RagError::ExternalService).
///
/// # Example
///
/// ```rust,ignore
/// use adk_retrieval::LanguageModel;
///
/// let reply = model.complete("You are terse.", "Name one prime number.").await?;
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a reply to `user_message` under `system_message`.
    async fn complete(&self, system_message: &str, user_message: &str) -> Result<String>;

    /// Name of the underlying model.
    ///
    /// [`RagAgentBuilder`](crate::RagAgentBuilder) sizes chunks and the
    /// context budget for this model when no configuration is given.
    fn model_name(&self) -> Option<&str> {
        None
    }
}
