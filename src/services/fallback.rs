//! Fallback wrapper for the main conversation LLM.
//!
//! When a fallback profile is configured, the active service starts as the
//! primary and is swapped permanently to the fallback on the first failure.
//! The LLM processor reports turn-level failures through
//! [`LlmService::notify_failure`] and retries the turn once against the
//! swapped service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::Result;
use crate::services::llm::{ChatRequest, LlmEvent, LlmService};

/// Primary/fallback pair presented as one [`LlmService`].
pub struct FallbackLlm {
    primary: Arc<dyn LlmService>,
    fallback: Arc<dyn LlmService>,
    on_fallback: AtomicBool,
}

impl FallbackLlm {
    /// Wrap a primary service with a fallback.
    pub fn new(primary: Arc<dyn LlmService>, fallback: Arc<dyn LlmService>) -> Self {
        Self {
            primary,
            fallback,
            on_fallback: AtomicBool::new(false),
        }
    }

    fn active(&self) -> &Arc<dyn LlmService> {
        if self.on_fallback.load(Ordering::SeqCst) {
            &self.fallback
        } else {
            &self.primary
        }
    }

    /// Whether the fallback service is currently active.
    pub fn is_on_fallback(&self) -> bool {
        self.on_fallback.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmService for FallbackLlm {
    fn service_name(&self) -> &str {
        self.active().service_name()
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<mpsc::Receiver<Result<LlmEvent>>> {
        if self.on_fallback.load(Ordering::SeqCst) {
            return self.fallback.stream_chat(request).await;
        }
        match self.primary.stream_chat(request.clone()).await {
            Ok(rx) => Ok(rx),
            Err(e) => {
                warn!(
                    primary = self.primary.service_name(),
                    fallback = self.fallback.service_name(),
                    error = %e,
                    "primary LLM failed, swapping to fallback"
                );
                self.on_fallback.store(true, Ordering::SeqCst);
                self.fallback.stream_chat(request).await
            }
        }
    }

    fn notify_failure(&self) {
        if !self.on_fallback.swap(true, Ordering::SeqCst) {
            warn!(
                primary = self.primary.service_name(),
                fallback = self.fallback.service_name(),
                "mid-stream failure reported, swapping to fallback"
            );
        }
    }
}
