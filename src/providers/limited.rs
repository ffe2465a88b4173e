use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse},
    LLMError,
};

/// Caps the number of in-flight calls to a shared backend.
pub struct ConcurrencyLimited {
    inner: Arc<dyn LLMProvider>,
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimited {
    pub fn new(inner: Arc<dyn LLMProvider>, max_in_flight: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }
}

#[async_trait]
impl LLMProvider for ConcurrencyLimited {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| LLMError::Fatal("provider limiter closed".to_string()))?;
        self.inner.complete(request).await
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn is_deterministic(&self) -> bool {
        self.inner.is_deterministic()
    }
}
