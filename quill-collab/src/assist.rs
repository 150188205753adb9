//! Code-suggestion seam.
//!
//! The server only needs `suggest(context, position) -> text`. The default
//! [`MockAssistant`] picks a canned snippet; a real provider plugs in behind
//! the same trait. Calls never hold a room lock.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssistError {
    #[error("assistant timed out after {0:?}")]
    Timeout(Duration),
    #[error("assistant unavailable: {0}")]
    Unavailable(String),
    #[error("too many assistance requests in flight")]
    Busy,
}

pub trait Assistant: Send + Sync {
    fn suggest<'a>(
        &'a self,
        context: &'a str,
        position: usize,
    ) -> BoxFuture<'a, Result<String, AssistError>>;
}

const CANNED_SUGGESTIONS: &[&str] = &[
    "console.log('Debug:', value);",
    "if (!value) {\n  return null;\n}",
    "for (let i = 0; i < items.length; i++) {\n  \n}",
    "const result = await fetch(url).then((res) => res.json());",
    "try {\n  \n} catch (error) {\n  console.error(error);\n}",
    "function handler(event) {\n  event.preventDefault();\n}",
    "export default {};",
];

/// Stand-in provider: a random canned snippet after an optional delay.
#[derive(Debug, Clone, Default)]
pub struct MockAssistant {
    latency: Duration,
}

impl MockAssistant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Assistant for MockAssistant {
    fn suggest<'a>(
        &'a self,
        context: &'a str,
        position: usize,
    ) -> BoxFuture<'a, Result<String, AssistError>> {
        async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            log::trace!("Mock suggestion at {} ({} context chars)", position, context.len());
            let index = fastrand::usize(..CANNED_SUGGESTIONS.len());
            Ok(CANNED_SUGGESTIONS[index].to_string())
        }
        .boxed()
    }
}

/// Run `assistant.suggest` with a deadline.
pub async fn suggest_within(
    assistant: &dyn Assistant,
    context: &str,
    position: usize,
    timeout: Duration,
) -> Result<String, AssistError> {
    match tokio::time::timeout(timeout, assistant.suggest(context, position)).await {
        Ok(result) => result,
        Err(_) => Err(AssistError::Timeout(timeout)),
    }
}
