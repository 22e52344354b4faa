use std::{collections::HashSet, sync::Arc};

use tower::{Service, util::BoxCloneService};

use crate::{
    Envelope, Message,
    handler::{
        DEFAULT_RETRY_COUNT, DefaultFailurePolicy, FailurePolicy, HandlerContext, HandlerStats,
        MessageHandler, ProcessingError, ProcessingService, QueueHandler, RequestFilter,
        ResponseFilter,
    },
    queue_names::QueueNames,
    transport::MessageQueueClient,
};

/// Builds [`MessageHandler`]s around a processing function.
///
/// The processing function is any `tower::Service` taking an
/// [`Envelope<T>`] and answering with an optional response. Every handler
/// created by the same factory shares its filters, failure policy,
/// whitelists and retry budget, and starts with fresh counters.
///
/// ## Example
///
/// ```rust
/// use postmaster::{Envelope, Message, MessageHandlerFactory, ProcessingError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Greet { name: String }
/// impl Message for Greet { const TYPE_NAME: &'static str = "Greet"; }
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Greeting { text: String }
/// impl Message for Greeting { const TYPE_NAME: &'static str = "Greeting"; }
///
/// let factory = MessageHandlerFactory::new(tower::service_fn(|req: Envelope<Greet>| async move {
///     Ok::<_, ProcessingError>(Some(Greeting { text: format!("hello {}", req.body.name) }))
/// }))
/// .with_retry_count(5);
/// ```
pub struct MessageHandlerFactory<T, R> {
    service: ProcessingService<T, R>,
    request_filter: Option<RequestFilter<T>>,
    response_filter: Option<ResponseFilter<R>>,
    failure_policy: Arc<dyn FailurePolicy>,
    publish_responses_whitelist: Option<Arc<HashSet<String>>>,
    publish_to_outq_whitelist: Option<Arc<HashSet<String>>>,
    retry_count: u32,
}

impl<T: Message, R: Message> MessageHandlerFactory<T, R> {
    /// Create a factory with the default retry budget and failure policy.
    pub fn new<S>(service: S) -> Self
    where
        S: Service<Envelope<T>, Response = Option<R>, Error = ProcessingError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            service: BoxCloneService::new(service),
            request_filter: None,
            response_filter: None,
            failure_policy: Arc::new(DefaultFailurePolicy),
            publish_responses_whitelist: None,
            publish_to_outq_whitelist: None,
            retry_count: DEFAULT_RETRY_COUNT,
        }
    }

    /// Transform or reject inbound envelopes before processing.
    ///
    /// A rejection takes the same failure path as a processing error.
    pub fn with_request_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Envelope<T>) -> Result<Envelope<T>, ProcessingError> + Send + Sync + 'static,
    {
        self.request_filter = Some(Arc::new(filter));
        self
    }

    /// Transform responses before they are acknowledged and routed.
    pub fn with_response_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(Option<R>) -> Option<R> + Send + Sync + 'static,
    {
        self.response_filter = Some(Arc::new(filter));
        self
    }

    /// Replace the default retry/dead-letter policy.
    pub fn with_failure_policy(mut self, policy: impl FailurePolicy + 'static) -> Self {
        self.failure_policy = Arc::new(policy);
        self
    }

    /// Retries allowed after the first attempt.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Only publish default replies for the listed response types.
    ///
    /// `None` publishes every response. Replies to an explicit `reply_to`
    /// are always delivered.
    pub fn with_publish_responses_whitelist(mut self, whitelist: Option<Vec<String>>) -> Self {
        self.publish_responses_whitelist = whitelist.map(|w| Arc::new(w.into_iter().collect()));
        self
    }

    /// Only publish one-way notifications for the listed message types.
    ///
    /// `None` notifies for every type.
    pub fn with_publish_to_outq_whitelist(mut self, whitelist: Option<Vec<String>>) -> Self {
        self.publish_to_outq_whitelist = whitelist.map(|w| Arc::new(w.into_iter().collect()));
        self
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Build a fresh handler with zeroed counters.
    pub fn create_message_handler(&self, context: &HandlerContext) -> MessageHandler<T, R> {
        MessageHandler {
            service: self.service.clone(),
            request_filter: self.request_filter.clone(),
            response_filter: self.response_filter.clone(),
            failure_policy: Arc::clone(&self.failure_policy),
            publish_responses_whitelist: self.publish_responses_whitelist.clone(),
            publish_to_outq_whitelist: self.publish_to_outq_whitelist.clone(),
            retry_count: self.retry_count,
            queue_names: QueueNames::of::<T>(),
            hook: Arc::clone(&context.hook),
            reply_clients: Arc::clone(&context.reply_clients),
            stats: HandlerStats::new(T::TYPE_NAME),
        }
    }
}

/// Type-erased factory stored in the service registry.
pub trait CreateQueueHandler<C: MessageQueueClient>: Send {
    fn message_type(&self) -> &'static str;

    fn create_queue_handler(&self, context: &HandlerContext) -> Box<dyn QueueHandler<C>>;
}

impl<T, R, C> CreateQueueHandler<C> for MessageHandlerFactory<T, R>
where
    T: Message,
    R: Message,
    C: MessageQueueClient,
{
    fn message_type(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn create_queue_handler(&self, context: &HandlerContext) -> Box<dyn QueueHandler<C>> {
        Box::new(self.create_message_handler(context))
    }
}
