//! Message envelopes and addressing.
//!
//! An [`Envelope`] bundles a message body together with the delivery
//! metadata the dispatcher needs: identity, reply routing, retry
//! bookkeeping and the last processing error.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::queue_names::QueueNames;

/// A message type that can travel through the dispatcher.
///
/// `TYPE_NAME` is the stable identifier used to derive queue names and to
/// key handler registrations. It must be unique across every message type
/// used with the same transport.
///
/// ## Example
///
/// ```rust
/// use postmaster::Message;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Greet {
///     name: String,
/// }
///
/// impl Message for Greet {
///     const TYPE_NAME: &'static str = "Greet";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable type identifier.
    const TYPE_NAME: &'static str;

    /// Logical error status carried by a response, if any.
    ///
    /// Responses that report an application-level failure override this.
    /// A response with an error status is still acknowledged (it is not
    /// retried) but it is counted as failed and its default reply goes to
    /// the response type's dead letter queue.
    fn response_status(&self) -> Option<&ResponseStatus> {
        None
    }
}

/// Structured error attached to envelopes and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseStatus {
    /// Machine readable error code.
    pub error_code: String,
    /// Human readable description.
    pub message: String,
}

impl ResponseStatus {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

/// Kind of an addressable destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Addressable queue or topic.
///
/// Destinations are immutable values compared by kind and uri.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    kind: DestinationKind,
    uri: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, uri: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
        }
    }

    /// Shorthand for a queue destination.
    pub fn queue(uri: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, uri)
    }

    /// Shorthand for a topic destination.
    pub fn topic(uri: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, uri)
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue://{}", self.uri),
            DestinationKind::Topic => write!(f, "topic://{}", self.uri),
        }
    }
}

/// Envelope option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeOptions(u32);

impl EnvelopeOptions {
    /// No options.
    pub const NONE: Self = Self(0);
    /// Echo the request to its out queue once it has been processed without a response.
    pub const NOTIFY_ONE_WAY: Self = Self(1);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for EnvelopeOptions {
    /// New envelopes request one-way notifications.
    fn default() -> Self {
        Self::NOTIFY_ONE_WAY
    }
}

impl std::ops::BitOr for EnvelopeOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// Typed message plus delivery metadata.
///
/// ## Invariants
///
/// - `retry_attempts` only ever increases
/// - `error` is only set after a failed processing attempt
/// - `reply_id` is only set on envelopes created with [`Envelope::reply`]
///
/// Those three fields are therefore private and only changed through
/// [`Envelope::record_retry`] and [`Envelope::record_failure`].
///
/// ## Example
///
/// ```rust
/// use postmaster::{Envelope, EnvelopeOptions};
///
/// let envelope = Envelope::new(42).with_options(EnvelopeOptions::NONE);
/// assert_eq!(envelope.retry_attempts(), 0);
///
/// // or, equivalently
/// let envelope: Envelope<_> = 42.into();
/// assert!(envelope.reply_id().is_none());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Unique message identifier.
    pub id: Uuid,
    /// Message payload.
    pub body: T,
    pub correlation_id: Option<String>,
    /// Explicit reply destination requested by the sender.
    pub reply_to: Option<Destination>,
    pub to: Option<Destination>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub expiration: Option<DateTime<Utc>>,
    pub persist: bool,
    pub options: EnvelopeOptions,
    /// Messages with a positive priority are routed to the priority queue.
    pub priority: i64,
    retry_attempts: u32,
    error: Option<ResponseStatus>,
    reply_id: Option<Uuid>,
}

impl<T> Envelope<T> {
    /// Wrap a body in a fresh envelope.
    pub fn new(body: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            correlation_id: None,
            reply_to: None,
            to: None,
            session_id: None,
            timestamp: Utc::now(),
            expiration: None,
            persist: false,
            options: EnvelopeOptions::default(),
            priority: 0,
            retry_attempts: 0,
            error: None,
            reply_id: None,
        }
    }

    /// Create a reply envelope for the message identified by `reply_id`.
    pub fn reply(reply_id: Uuid, body: T) -> Self {
        Self {
            reply_id: Some(reply_id),
            ..Self::new(body)
        }
    }

    pub fn with_options(mut self, options: EnvelopeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_reply_to(mut self, destination: Destination) -> Self {
        self.reply_to = Some(destination);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn retry_attempts(&self) -> u32 {
        self.retry_attempts
    }

    pub fn error(&self) -> Option<&ResponseStatus> {
        self.error.as_ref()
    }

    pub fn reply_id(&self) -> Option<Uuid> {
        self.reply_id
    }

    /// Record a failed attempt that will be retried.
    pub fn record_retry(&mut self, error: ResponseStatus) {
        self.retry_attempts = self.retry_attempts.saturating_add(1);
        self.error = Some(error);
    }

    /// Record a failed attempt without consuming retry budget.
    pub fn record_failure(&mut self, error: ResponseStatus) {
        self.error = Some(error);
    }

    /// Replace the body while keeping every piece of metadata.
    pub fn map_body<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        let body = f(self.body);
        Envelope {
            id: self.id,
            body,
            correlation_id: self.correlation_id,
            reply_to: self.reply_to,
            to: self.to,
            session_id: self.session_id,
            timestamp: self.timestamp,
            expiration: self.expiration,
            persist: self.persist,
            options: self.options,
            priority: self.priority,
            retry_attempts: self.retry_attempts,
            error: self.error,
            reply_id: self.reply_id,
        }
    }

    /// Fallible version of [`Envelope::map_body`].
    pub fn try_map_body<U, E>(
        self,
        f: impl FnOnce(&T) -> Result<U, E>,
    ) -> Result<Envelope<U>, E> {
        let body = f(&self.body)?;
        Ok(self.map_body(|_| body))
    }
}

impl<T: Message> Envelope<T> {
    /// Queues of the body's message type.
    pub fn queue_names(&self) -> QueueNames {
        QueueNames::of::<T>()
    }

    /// Queue this envelope is published to by default.
    pub fn in_queue_name(&self) -> String {
        let names = self.queue_names();
        if self.priority > 0 {
            names.priority
        } else {
            names.normal
        }
    }
}

impl<T> From<T> for Envelope<T> {
    fn from(body: T) -> Self {
        Envelope::new(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    impl Message for Ping {
        const TYPE_NAME: &'static str = "Ping";
    }

    #[test]
    fn new_envelopes_start_clean() {
        let envelope = Envelope::new(Ping { seq: 1 });

        assert_eq!(envelope.retry_attempts(), 0);
        assert!(envelope.error().is_none());
        assert!(envelope.reply_id().is_none());
        assert!(envelope.options.contains(EnvelopeOptions::NOTIFY_ONE_WAY));
    }

    #[test]
    fn reply_envelopes_reference_the_original() {
        let request = Envelope::new(Ping { seq: 1 });
        let reply = Envelope::reply(request.id, Ping { seq: 2 });

        assert_eq!(reply.reply_id(), Some(request.id));
        assert_ne!(reply.id, request.id);
    }

    #[test]
    fn retries_only_increase_attempts() {
        let mut envelope = Envelope::new(Ping { seq: 1 });
        envelope.record_failure(ResponseStatus::new("Boom", "first"));
        assert_eq!(envelope.retry_attempts(), 0);

        envelope.record_retry(ResponseStatus::new("Boom", "second"));
        envelope.record_retry(ResponseStatus::new("Boom", "third"));
        assert_eq!(envelope.retry_attempts(), 2);
        assert_eq!(envelope.error().map(|e| e.message.as_str()), Some("third"));
    }

    #[test]
    fn map_body_keeps_metadata() {
        let mut envelope = Envelope::new(Ping { seq: 7 })
            .with_correlation_id("abc")
            .with_priority(3);
        envelope.record_retry(ResponseStatus::new("Boom", "retry"));

        let mapped = envelope.clone().map_body(|p| p.seq);

        assert_eq!(mapped.body, 7);
        assert_eq!(mapped.id, envelope.id);
        assert_eq!(mapped.correlation_id.as_deref(), Some("abc"));
        assert_eq!(mapped.priority, 3);
        assert_eq!(mapped.retry_attempts(), 1);
    }

    #[test]
    fn priority_selects_in_queue() {
        let normal = Envelope::new(Ping { seq: 1 });
        let urgent = Envelope::new(Ping { seq: 2 }).with_priority(1);

        assert_eq!(normal.in_queue_name(), "mq:Ping.inq");
        assert_eq!(urgent.in_queue_name(), "mq:Ping.priorityq");
    }

    #[test]
    fn destinations_compare_by_kind_and_uri() {
        assert_eq!(Destination::queue("a"), Destination::queue("a"));
        assert_ne!(Destination::queue("a"), Destination::topic("a"));
        assert_eq!(Destination::topic("news").to_string(), "topic://news");
    }

    #[test]
    fn options_combine_as_bitmask() {
        let options = EnvelopeOptions::NONE | EnvelopeOptions::NOTIFY_ONE_WAY;
        assert!(options.contains(EnvelopeOptions::NOTIFY_ONE_WAY));
        let cleared = options.without(EnvelopeOptions::NOTIFY_ONE_WAY);
        assert!(!cleared.contains(EnvelopeOptions::NOTIFY_ONE_WAY));
        assert_eq!(EnvelopeOptions::NONE.bits(), 0);
    }
}
