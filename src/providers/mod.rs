use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse};
use crate::LLMError;

pub mod limited;
pub mod mock;
pub mod openai;
pub mod scripted;

/// Model adapter capability: given a conversation prefix and tool schemas,
/// produce the next assistant message, which may carry tool calls.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    fn name(&self) -> &'static str;

    /// True when identical requests always yield identical responses.
    fn is_deterministic(&self) -> bool {
        false
    }
}
