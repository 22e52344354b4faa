//! Processing failures and what to do about them.

use tracing_error::SpanTrace;

use crate::{Envelope, ResponseStatus, transport::RawPayload};

/// Error returned by a processing function.
///
/// The kind decides whether the default [`FailurePolicy`] may retry the
/// message or has to dead-letter it right away.
#[derive(Debug)]
pub struct ProcessingError {
    context: SpanTrace,
    kind: ProcessingErrorKind,
    error_code: String,
    source: tower::BoxError,
}

/// Retry classification of a [`ProcessingError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingErrorKind {
    /// Transient failure, the message may be attempted again.
    Retryable,
    /// Permanent failure, the message goes straight to the dead letter queue.
    NonRetryable,
}

impl ProcessingError {
    /// A failure that may succeed on a later attempt.
    pub fn retryable(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ProcessingErrorKind::Retryable, "ProcessingFailed", err.into())
    }

    /// A failure that no amount of retrying will fix.
    pub fn non_retryable(err: impl Into<tower::BoxError>) -> Self {
        Self::new(ProcessingErrorKind::NonRetryable, "UnretryableMessage", err.into())
    }

    fn new(kind: ProcessingErrorKind, error_code: &str, source: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
            error_code: error_code.to_owned(),
            source,
        }
    }

    /// Override the error code reported in [`ResponseStatus`].
    pub fn with_error_code(mut self, error_code: impl Into<String>) -> Self {
        self.error_code = error_code.into();
        self
    }

    pub fn kind(&self) -> ProcessingErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProcessingErrorKind::Retryable
    }

    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    /// Structured form attached to failed envelopes.
    pub fn to_response_status(&self) -> ResponseStatus {
        ResponseStatus::new(self.error_code.clone(), self.source.to_string())
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ProcessingErrorKind::Retryable => writeln!(f, "Processing error: {}", self.source),
            ProcessingErrorKind::NonRetryable => {
                writeln!(f, "Non-retryable processing error: {}", self.source)
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Outcome of a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Count a retry and redeliver the message.
    Retry,
    /// Move the message to the dead letter queue.
    DeadLetter,
    /// Acknowledge and drop the message.
    Discard,
}

/// Decides what happens to a message whose processing failed.
///
/// `retry_count` is the number of retries allowed after the first attempt.
/// An error returned by the policy is logged and the message is
/// dead-lettered.
pub trait FailurePolicy: Send + Sync {
    fn on_failure(
        &self,
        envelope: &Envelope<RawPayload>,
        error: &ProcessingError,
        retry_count: u32,
    ) -> Result<FailureAction, tower::BoxError>;
}

impl<F> FailurePolicy for F
where
    F: Fn(&Envelope<RawPayload>, &ProcessingError, u32) -> Result<FailureAction, tower::BoxError>
        + Send
        + Sync,
{
    fn on_failure(
        &self,
        envelope: &Envelope<RawPayload>,
        error: &ProcessingError,
        retry_count: u32,
    ) -> Result<FailureAction, tower::BoxError> {
        self(envelope, error, retry_count)
    }
}

/// Bounded retry with dead-letter fallback.
///
/// A message is dead-lettered when its error is non-retryable or when it has
/// already been retried `retry_count` times, otherwise it is retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFailurePolicy;

impl FailurePolicy for DefaultFailurePolicy {
    fn on_failure(
        &self,
        envelope: &Envelope<RawPayload>,
        error: &ProcessingError,
        retry_count: u32,
    ) -> Result<FailureAction, tower::BoxError> {
        if !error.is_retryable() || envelope.retry_attempts() >= retry_count {
            Ok(FailureAction::DeadLetter)
        } else {
            Ok(FailureAction::Retry)
        }
    }
}
