//! Transport contract consumed by the dispatcher.
//!
//! The engine never talks to a broker directly. It drives a
//! [`MessageQueueClient`], obtained once per drain pass from a
//! [`MessageFactory`], and delivers direct replies through
//! [`OneWayClient`]s handed out by a [`ReplyClientResolver`].
//!
//! ## Key components
//!
//! - [`MessageQueueClient`]: non-blocking dequeue, ack/nak, publish and notify
//! - [`MessageQueueClientExt`]: typed helpers on top of any client
//! - [`RawPayload`]: serialized message body crossing the transport boundary
//! - [`create_envelope`]: deserialization boundary from raw to typed envelopes
//! - [`TransportError`]: unified error type with tracing context
//!
//! Bodies are encoded as JSON with `serde_json`.

mod failover;
mod inmemory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing_error::SpanTrace;

use crate::{Envelope, Message};

pub use failover::{FailoverSettings, ReconnectBackoff};
pub use inmemory::{InMemoryTransport, InMemoryTransportError, InMemoryTransportErrorKind};

/// Queue operations the dispatcher relies on.
///
/// Implementations own the queues of every message type they carry and are
/// responsible for routing a non-requeued [`nak`](MessageQueueClient::nak)
/// to the dead letter queue of the envelope's type.
#[async_trait]
pub trait MessageQueueClient: Send {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;

    /// Take the next message from `queue_name` without blocking.
    async fn get(
        &mut self,
        queue_name: &str,
    ) -> Result<Option<Envelope<RawPayload>>, Self::Error>;

    /// Acknowledge a successfully processed message.
    async fn ack(&mut self, envelope: &Envelope<RawPayload>) -> Result<(), Self::Error>;

    /// Reject a message.
    ///
    /// `requeue = true` redelivers it, `requeue = false` moves it to the dead
    /// letter queue of its type.
    async fn nak(
        &mut self,
        envelope: Envelope<RawPayload>,
        requeue: bool,
    ) -> Result<(), Self::Error>;

    /// Enqueue a message.
    async fn publish(
        &mut self,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
    ) -> Result<(), Self::Error>;

    /// Enqueue a fire-and-forget notification.
    async fn notify(
        &mut self,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
    ) -> Result<(), Self::Error>;

    /// Release the client at the end of a drain pass.
    async fn close(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Source of transport clients.
pub trait MessageFactory: Send + Sync + 'static {
    type Client: MessageQueueClient + 'static;

    /// Open a client for one drain pass.
    fn create_message_queue_client(&self) -> Self::Client;
}

/// Typed convenience methods available on every [`MessageQueueClient`].
#[async_trait]
pub trait MessageQueueClientExt: MessageQueueClient {
    /// Dequeue and decode a typed envelope.
    async fn dequeue<T: Message>(
        &mut self,
        queue_name: &str,
    ) -> Result<Option<Envelope<T>>, TransportError> {
        match self.get(queue_name).await {
            Ok(Some(raw)) => create_envelope(&raw).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(TransportError::sender(e.into())),
        }
    }

    /// Encode and publish an envelope to the queue chosen by its priority.
    async fn publish_message<T: Message>(
        &mut self,
        envelope: Envelope<T>,
    ) -> Result<(), TransportError> {
        let queue_name = envelope.in_queue_name();
        self.publish_to(&queue_name, envelope).await
    }

    /// Encode and publish an envelope to an explicit queue.
    async fn publish_to<T: Message>(
        &mut self,
        queue_name: &str,
        envelope: Envelope<T>,
    ) -> Result<(), TransportError> {
        let raw = encode_envelope(envelope)?;
        self.publish(queue_name, raw)
            .await
            .map_err(|e| TransportError::sender(e.into()))
    }
}

impl<C: MessageQueueClient> MessageQueueClientExt for C {}

/// Direct reply channel to a caller.
#[async_trait]
pub trait OneWayClient: Send {
    /// Deliver `payload` to `destination_uri` without waiting for an answer.
    async fn send_one_way(
        &mut self,
        destination_uri: &str,
        payload: RawPayload,
    ) -> Result<(), tower::BoxError>;
}

/// Resolves direct reply clients by destination.
pub trait ReplyClientResolver: Send + Sync {
    /// Return a client able to reach `destination_uri`, if one exists.
    fn resolve_reply_client(&self, destination_uri: &str) -> Option<Box<dyn OneWayClient>>;
}

/// Resolver without direct reply channels.
///
/// Every reply falls back to being published on the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoReplyClients;

impl ReplyClientResolver for NoReplyClients {
    fn resolve_reply_client(&self, _destination_uri: &str) -> Option<Box<dyn OneWayClient>> {
        None
    }
}

/// Serialized message body.
///
/// Carries the type identifier of the encoded message next to its JSON
/// bytes so that transports can route the envelope without knowing the
/// concrete type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPayload {
    message_type: String,
    data: Vec<u8>,
}

impl RawPayload {
    pub fn new(message_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            message_type: message_type.into(),
            data,
        }
    }

    /// Serialize a message as JSON.
    pub fn encode<T: Message>(message: &T) -> Result<Self, TransportError> {
        let data = serde_json::to_vec(message).map_err(|e| TransportError::serde(Box::new(e)))?;
        Ok(Self::new(T::TYPE_NAME, data))
    }

    /// Deserialize the payload as `T`.
    ///
    /// Fails when the payload was encoded from another message type.
    pub fn decode<T: Message>(&self) -> Result<T, TransportError> {
        if self.message_type != T::TYPE_NAME {
            return Err(TransportError::serde(
                format!(
                    "expected a {} payload, got {}",
                    T::TYPE_NAME,
                    self.message_type
                )
                .into(),
            ));
        }
        serde_json::from_slice(&self.data).map_err(|e| TransportError::serde(Box::new(e)))
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Decode a raw envelope into a typed one.
pub fn create_envelope<T: Message>(
    raw: &Envelope<RawPayload>,
) -> Result<Envelope<T>, TransportError> {
    raw.clone().try_map_body(RawPayload::decode::<T>)
}

/// Encode a typed envelope for the transport.
pub fn encode_envelope<T: Message>(
    envelope: Envelope<T>,
) -> Result<Envelope<RawPayload>, TransportError> {
    envelope.try_map_body(RawPayload::encode::<T>)
}

/// Error returned by transport operations.
///
/// Each error captures:
/// - The underlying error kind
/// - A tracing span backtrace for improved diagnostics
#[derive(Debug)]
pub struct TransportError {
    context: SpanTrace,
    kind: TransportErrorKind,
}

/// Transport errors kind.
#[derive(Debug)]
pub enum TransportErrorKind {
    /// Errors originating from the queue backend.
    Sender(tower::BoxError),
    /// Errors related to serialization or deserialization.
    Serde(tower::BoxError),
}

impl TransportError {
    /// Create a backend-related transport error.
    pub fn sender(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Sender(err),
        }
    }

    /// Create a serialization-related transport error.
    pub fn serde(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: TransportErrorKind::Serde(err),
        }
    }

    pub fn kind(&self) -> &TransportErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            TransportErrorKind::Sender(err) => writeln!(f, "Sender error: {err}"),
            TransportErrorKind::Serde(err) => writeln!(f, "Serde error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Sender(err) => Some(err.as_ref()),
            TransportErrorKind::Serde(err) => Some(err.as_ref()),
        }
    }
}
