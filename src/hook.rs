//! Observability hooks for message handlers.

use crate::{
    Destination, Envelope,
    handler::{FailureAction, ProcessingError},
    transport::RawPayload,
};

/// Hook trait for observing handler events.
///
/// One hook is injected into the service and shared by every handler it
/// builds. Hooks are invoked synchronously from the drain loop and should
/// avoid heavy or blocking work. Typical use cases include logging, metrics,
/// and tracing integration.
pub trait HandlerHook: Send + Sync {
    fn on_message_received(&self, queue_name: &str, envelope: &Envelope<RawPayload>);
    fn on_message_processed(&self, queue_name: &str, envelope: &Envelope<RawPayload>);
    fn on_message_failed(
        &self,
        queue_name: &str,
        envelope: &Envelope<RawPayload>,
        error: &ProcessingError,
        action: FailureAction,
    );
    fn on_dequeue_error(&self, queue_name: &str, error: &dyn std::error::Error);
    fn on_decode_error(
        &self,
        queue_name: &str,
        envelope: &Envelope<RawPayload>,
        error: &dyn std::error::Error,
    );
    fn on_transport_error(&self, queue_name: &str, error: &dyn std::error::Error);
    fn on_reply_error(&self, destination: &Destination, error: &dyn std::error::Error);
    fn on_failure_policy_error(&self, queue_name: &str, error: &dyn std::error::Error);
}

/// Default handler hook implementation.
///
/// Logs handler events using `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHandlerHook;

impl HandlerHook for DefaultHandlerHook {
    fn on_message_received(&self, queue_name: &str, envelope: &Envelope<RawPayload>) {
        tracing::debug!(
            queue = queue_name,
            id = %envelope.id,
            retry_attempts = envelope.retry_attempts(),
            "Message received"
        );
    }

    fn on_message_processed(&self, queue_name: &str, envelope: &Envelope<RawPayload>) {
        tracing::debug!(queue = queue_name, id = %envelope.id, "Message processed");
    }

    fn on_message_failed(
        &self,
        queue_name: &str,
        envelope: &Envelope<RawPayload>,
        error: &ProcessingError,
        action: FailureAction,
    ) {
        tracing::warn!(
            queue = queue_name,
            id = %envelope.id,
            retry_attempts = envelope.retry_attempts(),
            ?action,
            %error,
            "Message processing failed"
        );
    }

    fn on_dequeue_error(&self, queue_name: &str, error: &dyn std::error::Error) {
        tracing::error!(queue = queue_name, ?error, "Error receiving message");
    }

    fn on_decode_error(
        &self,
        queue_name: &str,
        envelope: &Envelope<RawPayload>,
        error: &dyn std::error::Error,
    ) {
        tracing::error!(
            queue = queue_name,
            id = %envelope.id,
            message_type = envelope.body.message_type(),
            ?error,
            "Could not decode message"
        );
    }

    fn on_transport_error(&self, queue_name: &str, error: &dyn std::error::Error) {
        tracing::error!(queue = queue_name, ?error, "Transport operation failed");
    }

    fn on_reply_error(&self, destination: &Destination, error: &dyn std::error::Error) {
        tracing::warn!(%destination, ?error, "Failed to deliver reply");
    }

    fn on_failure_policy_error(&self, queue_name: &str, error: &dyn std::error::Error) {
        tracing::error!(queue = queue_name, ?error, "Failure policy raised an error");
    }
}
