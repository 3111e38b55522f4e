//! One-shot model calls.
//!
//! Compaction summaries and commentary both need a single, stateless
//! completion from a cheap model. The vendor integration lives outside this
//! crate; the gateway only sees this trait.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// A stateless prompt-in, text-out model call.
#[async_trait]
pub trait OneShotModel: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// Run a one-shot call under a deadline. Timeouts surface as errors so
/// callers can fall back.
pub async fn complete_with_timeout(
    model: &dyn OneShotModel,
    system_prompt: &str,
    user_prompt: &str,
    deadline: Duration,
) -> Result<String> {
    match tokio::time::timeout(deadline, model.complete(system_prompt, user_prompt)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow!("one-shot model call timed out after {:?}", deadline)),
    }
}

/// Placeholder used when no model integration is wired up. Every call fails,
/// which routes callers onto their deterministic fallbacks.
pub struct NullModel;

#[async_trait]
impl OneShotModel for NullModel {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Err(anyhow!("no one-shot model configured"))
    }
}

/// Canned-response model for tests and demos.
pub struct StaticModel {
    pub reply: String,
}

impl StaticModel {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
        }
    }
}

#[async_trait]
impl OneShotModel for StaticModel {
    async fn complete(&self, _system_prompt: &str, _user_prompt: &str) -> Result<String> {
        Ok(self.reply.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowModel;

    #[async_trait]
    impl OneShotModel for SlowModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok("too late".to_string())
        }
    }

    #[tokio::test]
    async fn test_null_model_always_errors() {
        let result = NullModel.complete("sys", "user").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_static_model_replies() {
        let model = StaticModel::new("hello");
        assert_eq!(model.complete("s", "u").await.unwrap(), "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_as_error() {
        let result =
            complete_with_timeout(&SlowModel, "s", "u", Duration::from_secs(1)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }
}
