use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing_error::SpanTrace;

use crate::{
    Envelope,
    queue_names::QueueNames,
    service::WakeSignal,
    transport::{MessageFactory, MessageQueueClient, RawPayload},
};

const DEFAULT_OUT_QUEUE_MAX_SIZE: usize = 100;

/// In-memory transport for testing or local pipelines.
///
/// Queues are plain FIFO buffers shared by every clone of the transport, so
/// the transport doubles as its own [`MessageFactory`]: each client handed
/// out is a clone pointing at the same queues. It is useful for:
/// - Unit and integration testing
/// - Running handlers inside a single process without a broker
/// - Debugging message flows
///
/// ## Delivery semantics
///
/// - Messages are removed at dequeue time, `ack` is a no-op
/// - A requeued `nak` goes back to the envelope's in queue (priority queue
///   when its priority is positive)
/// - A non-requeued `nak` goes to the dead letter queue of the body's type
///   as named by the payload, not of the queue it was taken from
/// - Out queues keep at most `out_queue_max_size` notifications, dropping
///   the oldest ones
/// - Every successful publish fires the wake signal, when one is attached
#[derive(Clone)]
pub struct InMemoryTransport {
    /// Shared queues keyed by queue name
    queues: Arc<Mutex<HashMap<String, VecDeque<Envelope<RawPayload>>>>>,
    disposed: Arc<AtomicBool>,
    wake: Option<WakeSignal>,
    out_queue_max_size: usize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            disposed: Arc::new(AtomicBool::new(false)),
            wake: None,
            out_queue_max_size: DEFAULT_OUT_QUEUE_MAX_SIZE,
        }
    }

    /// Fire `signal` after every successful publish.
    pub fn with_wake_signal(mut self, signal: WakeSignal) -> Self {
        self.wake = Some(signal);
        self
    }

    /// Set the maximum number of notifications kept per out queue.
    pub fn with_out_queue_max_size(mut self, size: usize) -> Self {
        self.out_queue_max_size = size;
        self
    }

    /// Number of messages currently waiting in `queue_name`.
    pub async fn queue_len(&self, queue_name: &str) -> usize {
        self.queues
            .lock()
            .await
            .get(queue_name)
            .map_or(0, VecDeque::len)
    }

    /// Copy of the messages waiting in `queue_name`, oldest first.
    ///
    /// The queue is left untouched.
    pub async fn peek_messages(&self, queue_name: &str) -> Vec<Envelope<RawPayload>> {
        self.queues
            .lock()
            .await
            .get(queue_name)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every message waiting in `queue_name`.
    pub async fn clear(&self, queue_name: &str) {
        let mut queues = self.queues.lock().await;
        if let Some(queue) = queues.get_mut(queue_name) {
            tracing::debug!(queue = queue_name, count = queue.len(), "Clearing in-memory queue");
            queue.clear();
        }
    }

    /// Reject every later operation on this transport and all its clones.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn ensure_not_disposed(&self) -> Result<(), InMemoryTransportError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(InMemoryTransportError::disposed());
        }
        Ok(())
    }

    async fn push(&self, queue_name: &str, envelope: Envelope<RawPayload>) {
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(queue_name.to_owned()).or_default();
        queue.push_back(envelope);
        tracing::debug!(
            queue = queue_name,
            total = queue.len(),
            "Message added to in-memory queue"
        );
    }

    async fn enqueue(
        &self,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
    ) -> Result<(), InMemoryTransportError> {
        self.ensure_not_disposed()?;
        self.push(queue_name, envelope).await;
        if let Some(wake) = &self.wake {
            wake.wake();
        }
        Ok(())
    }
}

impl Default for InMemoryTransport {
    /// Create a new transport with empty queues.
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFactory for InMemoryTransport {
    type Client = InMemoryTransport;

    fn create_message_queue_client(&self) -> Self::Client {
        self.clone()
    }
}

#[async_trait]
impl MessageQueueClient for InMemoryTransport {
    type Error = InMemoryTransportError;

    async fn get(
        &mut self,
        queue_name: &str,
    ) -> Result<Option<Envelope<RawPayload>>, Self::Error> {
        self.ensure_not_disposed()?;
        let mut queues = self.queues.lock().await;
        Ok(queues.get_mut(queue_name).and_then(VecDeque::pop_front))
    }

    async fn ack(&mut self, _envelope: &Envelope<RawPayload>) -> Result<(), Self::Error> {
        self.ensure_not_disposed()
    }

    async fn nak(
        &mut self,
        envelope: Envelope<RawPayload>,
        requeue: bool,
    ) -> Result<(), Self::Error> {
        let names = QueueNames::for_type(envelope.body.message_type());
        let queue_name = match (requeue, envelope.priority > 0) {
            (true, true) => names.priority,
            (true, false) => names.normal,
            (false, _) => names.dlq,
        };
        self.enqueue(&queue_name, envelope).await
    }

    #[tracing::instrument(skip_all, fields(queue = queue_name))]
    async fn publish(
        &mut self,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
    ) -> Result<(), Self::Error> {
        self.enqueue(queue_name, envelope).await
    }

    async fn notify(
        &mut self,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
    ) -> Result<(), Self::Error> {
        self.ensure_not_disposed()?;
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(queue_name.to_owned()).or_default();
        queue.push_back(envelope);
        while queue.len() > self.out_queue_max_size {
            if let Some(overflow) = queue.pop_front() {
                tracing::debug!(
                    queue = queue_name,
                    id = %overflow.id,
                    "Discarding notification from overflowed out queue"
                );
            }
        }
        Ok(())
    }
}

/// Error type for [`InMemoryTransport`] operations.
#[derive(Debug)]
pub struct InMemoryTransportError {
    context: SpanTrace,
    kind: InMemoryTransportErrorKind,
}

/// In-memory transport error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InMemoryTransportErrorKind {
    /// The transport has been disposed.
    Disposed,
}

impl InMemoryTransportError {
    fn disposed() -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: InMemoryTransportErrorKind::Disposed,
        }
    }

    pub fn kind(&self) -> InMemoryTransportErrorKind {
        self.kind
    }
}

impl std::fmt::Display for InMemoryTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryTransportErrorKind::Disposed => {
                writeln!(f, "In-memory transport has been disposed")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for InMemoryTransportError {}
