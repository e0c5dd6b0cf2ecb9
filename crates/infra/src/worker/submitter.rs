//! The injected call to the external authority.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::jobs::Job;

/// Failure reported by a [`Submitter`].
///
/// The message is stored on the job row and classified on dead-letter
/// escalation, so it should name what went wrong ("connection reset",
/// "rejected: invalid CNPJ").
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SubmissionError {
    message: String,
}

impl SubmissionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for SubmissionError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for SubmissionError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Performs the remote call for one job and returns the authority's answer.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(&self, job: &Job) -> Result<JsonValue, SubmissionError>;
}

#[async_trait]
impl<F, Fut> Submitter for F
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = Result<JsonValue, SubmissionError>> + Send + 'static,
{
    async fn submit(&self, job: &Job) -> Result<JsonValue, SubmissionError> {
        (self)(job.clone()).await
    }
}
