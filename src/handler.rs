//! Per-type message handlers.
//!
//! A [`MessageHandler`] drains the queues of one message type through a
//! single transport client:
//!
//! - Dequeues from the priority queue, then from the normal queue, until each
//!   is observed empty
//! - Invokes the processing function for every message
//! - Acknowledges successes and routes their responses
//! - Retries or dead-letters failures according to its [`FailurePolicy`]
//!
//! Handlers are built by a [`MessageHandlerFactory`] and are driven through
//! `&mut self`: one task, one client at a time.

mod factory;
mod failure;
mod stats;

use std::{
    any::Any,
    collections::HashSet,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use async_trait::async_trait;
use futures::FutureExt as _;
use tower::{Service, ServiceExt as _, util::BoxCloneService};

use crate::{
    Destination, Envelope, EnvelopeOptions, Message, ResponseStatus,
    hook::{DefaultHandlerHook, HandlerHook},
    queue_names::QueueNames,
    transport::{
        MessageQueueClient, NoReplyClients, RawPayload, ReplyClientResolver, TransportError,
        TransportErrorKind, create_envelope,
    },
};

pub use factory::{CreateQueueHandler, MessageHandlerFactory};
pub use failure::{
    DefaultFailurePolicy, FailureAction, FailurePolicy, ProcessingError, ProcessingErrorKind,
};
pub use stats::{HandlerStats, QueueKind};

/// Retries allowed after the first attempt unless configured otherwise.
pub const DEFAULT_RETRY_COUNT: u32 = 2;

/// Error code of failures raised by a panicking processing function.
pub const PANIC_ERROR_CODE: &str = "ProcessingPanicked";

pub(crate) type ProcessingService<T, R> =
    BoxCloneService<Envelope<T>, Option<R>, ProcessingError>;
pub(crate) type RequestFilter<T> =
    Arc<dyn Fn(Envelope<T>) -> Result<Envelope<T>, ProcessingError> + Send + Sync>;
pub(crate) type ResponseFilter<R> = Arc<dyn Fn(Option<R>) -> Option<R> + Send + Sync>;

/// Collaborators shared by every handler of a service.
#[derive(Clone)]
pub struct HandlerContext {
    hook: Arc<dyn HandlerHook>,
    reply_clients: Arc<dyn ReplyClientResolver>,
}

impl HandlerContext {
    pub fn new(hook: Arc<dyn HandlerHook>, reply_clients: Arc<dyn ReplyClientResolver>) -> Self {
        Self {
            hook,
            reply_clients,
        }
    }
}

impl Default for HandlerContext {
    /// Log through `tracing`, publish every reply on the transport.
    fn default() -> Self {
        Self::new(Arc::new(DefaultHandlerHook), Arc::new(NoReplyClients))
    }
}

/// Drain loop for messages of type `T` answered with responses of type `R`.
pub struct MessageHandler<T, R> {
    service: ProcessingService<T, R>,
    request_filter: Option<RequestFilter<T>>,
    response_filter: Option<ResponseFilter<R>>,
    failure_policy: Arc<dyn FailurePolicy>,
    publish_responses_whitelist: Option<Arc<HashSet<String>>>,
    publish_to_outq_whitelist: Option<Arc<HashSet<String>>>,
    retry_count: u32,
    queue_names: QueueNames,
    hook: Arc<dyn HandlerHook>,
    reply_clients: Arc<dyn ReplyClientResolver>,
    stats: HandlerStats,
}

impl<T: Message, R: Message> MessageHandler<T, R> {
    pub fn message_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    pub fn queue_names(&self) -> &QueueNames {
        &self.queue_names
    }

    /// Snapshot of the handler counters.
    pub fn stats(&self) -> HandlerStats {
        self.stats.clone()
    }

    /// Drain the priority queue, then the normal queue.
    ///
    /// Returns the number of messages taken from both queues. Messages
    /// arriving after a queue was observed empty are left for the next call.
    #[tracing::instrument(skip_all, fields(message_type = T::TYPE_NAME))]
    pub async fn process<C: MessageQueueClient>(&mut self, client: &mut C) -> usize {
        let queues = self.queue_names.process_queues().map(str::to_owned);

        let mut total = 0;
        for (queue_name, source) in queues.iter().zip([QueueKind::Priority, QueueKind::Normal]) {
            total += self.process_queue(client, queue_name, source).await;
        }

        if total > 0 {
            tracing::debug!(total, "Drained message queues");
        }
        total
    }

    /// Drain one queue until it is observed empty.
    ///
    /// A dequeue error, or a message that cannot be decoded, abandons the
    /// queue for this pass.
    pub async fn process_queue<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        queue_name: &str,
        source: QueueKind,
    ) -> usize {
        let mut taken = 0;
        loop {
            let envelope = match client.get(queue_name).await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => break,
                Err(e) => {
                    let error = TransportError::sender(e.into());
                    self.hook.on_dequeue_error(queue_name, &error);
                    break;
                }
            };

            taken += 1;
            if self.process_message(client, queue_name, envelope, source).await.is_err() {
                break;
            }
        }
        taken
    }

    /// Run one message through the processing function and settle it.
    ///
    /// Only a message that cannot be decoded is reported as an error; it is
    /// dead-lettered before returning. Every other outcome is expressed
    /// through ack/nak, replies and the handler counters.
    pub async fn process_message<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
        source: QueueKind,
    ) -> Result<(), TransportError> {
        self.hook.on_message_received(queue_name, &envelope);

        let result = match create_envelope::<T>(&envelope) {
            Ok(typed) => {
                match self.invoke(typed).await {
                    Ok(response) => self.complete(client, queue_name, envelope, response).await,
                    Err(error) => self.fail(client, queue_name, envelope, error).await,
                }
                Ok(())
            }
            Err(error) => {
                self.reject_undecodable(client, queue_name, envelope, &error).await;
                Err(error)
            }
        };

        self.stats.record_received(source);
        result
    }

    /// Run the filters and the processing function.
    ///
    /// A panic in any of them is reported as a non-retryable error.
    async fn invoke(&mut self, envelope: Envelope<T>) -> Result<Option<R>, ProcessingError> {
        let request_filter = self.request_filter.clone();
        let response_filter = self.response_filter.clone();
        let service = &mut self.service;

        let call = async move {
            let envelope = match &request_filter {
                Some(filter) => filter(envelope)?,
                None => envelope,
            };

            let response = service.ready().await?.call(envelope).await?;

            Ok::<_, ProcessingError>(match &response_filter {
                Some(filter) => filter(response),
                None => response,
            })
        };

        AssertUnwindSafe(call)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(ProcessingError::non_retryable(format!(
                    "processing panicked: {}",
                    panic_message(panic.as_ref())
                ))
                .with_error_code(PANIC_ERROR_CODE))
            })
    }

    async fn complete<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        queue_name: &str,
        envelope: Envelope<RawPayload>,
        response: Option<R>,
    ) {
        if let Err(e) = client.ack(&envelope).await {
            self.hook
                .on_transport_error(queue_name, &TransportError::sender(e.into()));
        }

        if response.as_ref().and_then(Message::response_status).is_some() {
            self.stats.total_failed += 1;
        } else {
            self.stats.total_processed += 1;
        }
        self.hook.on_message_processed(queue_name, &envelope);

        match response {
            Some(response) => self.reply(client, &envelope, response).await,
            None => self.notify_one_way(client, envelope).await,
        }
    }

    async fn notify_one_way<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        envelope: Envelope<RawPayload>,
    ) {
        if !envelope.options.contains(EnvelopeOptions::NOTIFY_ONE_WAY)
            || !is_allowed(&self.publish_to_outq_whitelist, T::TYPE_NAME)
        {
            return;
        }

        let out = self.queue_names.out.clone();
        if let Err(e) = client.notify(&out, envelope).await {
            self.hook
                .on_transport_error(&out, &TransportError::sender(e.into()));
        }
    }

    async fn reply<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        request: &Envelope<RawPayload>,
        response: R,
    ) {
        let destination = match &request.reply_to {
            Some(destination) => destination.clone(),
            None if !is_allowed(&self.publish_responses_whitelist, R::TYPE_NAME) => {
                tracing::trace!(response_type = R::TYPE_NAME, "Response not whitelisted");
                return;
            }
            None => {
                let names = QueueNames::of::<R>();
                match response.response_status() {
                    None => Destination::queue(names.normal),
                    Some(_) => Destination::queue(names.dlq),
                }
            }
        };

        let payload = match RawPayload::encode(&response) {
            Ok(payload) => payload,
            Err(e) => {
                self.hook.on_reply_error(&destination, &e);
                return;
            }
        };

        let reply_client = self.reply_clients.resolve_reply_client(destination.uri());
        if let Some(mut reply_client) = reply_client {
            match reply_client
                .send_one_way(destination.uri(), payload.clone())
                .await
            {
                Ok(()) => return,
                Err(e) => self.hook.on_reply_error(&destination, e.as_ref()),
            }
        }

        let mut reply = Envelope::reply(request.id, payload);
        reply.correlation_id = request.correlation_id.clone();
        if let Err(e) = client.publish(destination.uri(), reply).await {
            self.hook
                .on_reply_error(&destination, &TransportError::sender(e.into()));
        }
    }

    async fn fail<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        queue_name: &str,
        mut envelope: Envelope<RawPayload>,
        error: ProcessingError,
    ) {
        let decision = catch_unwind(AssertUnwindSafe(|| {
            self.failure_policy
                .on_failure(&envelope, &error, self.retry_count)
        }))
        .unwrap_or_else(|panic| {
            Err(format!("failure policy panicked: {}", panic_message(panic.as_ref())).into())
        });

        let action = match decision {
            Ok(action) => action,
            Err(e) => {
                self.hook.on_failure_policy_error(queue_name, e.as_ref());
                FailureAction::DeadLetter
            }
        };
        self.hook.on_message_failed(queue_name, &envelope, &error, action);

        let status = error.to_response_status();
        let result = match action {
            FailureAction::Retry => {
                self.stats.total_retries += 1;
                envelope.record_retry(status);
                client.nak(envelope, true).await
            }
            FailureAction::DeadLetter => {
                self.stats.total_failed += 1;
                envelope.record_failure(status);
                client.nak(envelope, false).await
            }
            FailureAction::Discard => {
                self.stats.total_failed += 1;
                client.ack(&envelope).await
            }
        };

        if let Err(e) = result {
            self.hook
                .on_transport_error(queue_name, &TransportError::sender(e.into()));
        }
    }

    async fn reject_undecodable<C: MessageQueueClient>(
        &mut self,
        client: &mut C,
        queue_name: &str,
        mut envelope: Envelope<RawPayload>,
        error: &TransportError,
    ) {
        self.hook.on_decode_error(queue_name, &envelope, error);
        self.stats.total_failed += 1;

        if let Err(e) = client.ack(&envelope).await {
            self.hook
                .on_transport_error(queue_name, &TransportError::sender(e.into()));
        }

        let message = match error.kind() {
            TransportErrorKind::Sender(e) | TransportErrorKind::Serde(e) => e.to_string(),
        };
        envelope.record_failure(ResponseStatus::new("SerializationError", message));

        // the payload may name another type, keep it in this queue's dlq
        let dlq = self.queue_names.dlq.clone();
        if let Err(e) = client.publish(&dlq, envelope).await {
            self.hook
                .on_transport_error(&dlq, &TransportError::sender(e.into()));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn is_allowed(whitelist: &Option<Arc<HashSet<String>>>, type_name: &str) -> bool {
    whitelist
        .as_ref()
        .is_none_or(|allowed| allowed.contains(type_name))
}

/// Type-erased handler driven by the service.
#[async_trait]
pub trait QueueHandler<C: MessageQueueClient>: Send {
    fn message_type(&self) -> &'static str;

    fn stats(&self) -> HandlerStats;

    /// Drain every queue of the handler's message type.
    async fn process(&mut self, client: &mut C) -> usize;
}

#[async_trait]
impl<T, R, C> QueueHandler<C> for MessageHandler<T, R>
where
    T: Message,
    R: Message,
    C: MessageQueueClient,
{
    fn message_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn stats(&self) -> HandlerStats {
        MessageHandler::stats(self)
    }

    async fn process(&mut self, client: &mut C) -> usize {
        MessageHandler::process(self, client).await
    }
}
