//! Handler registry and run lifecycle.
//!
//! An [`MqService`] owns one processing function per message type and runs
//! drain passes over all of them with a single transport client:
//!
//! - [`register_handler`](MqService::register_handler) adds a type to the
//!   registry
//! - [`start`](MqService::start) runs one pass over every handler in
//!   registration order, then returns to [`WorkerStatus::Stopped`]
//! - [`stop`](MqService::stop) interrupts a running pass between handlers
//!   and resets the handler counters
//! - [`dispose`](MqService::dispose) shuts the service down for good
//!
//! A [`WakeWorker`] fed by a [`wake_channel`] turns transport publish
//! signals into passes.

mod lifecycle;
mod wake;

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::Mutex;
use tower::Service;
use tracing_error::SpanTrace;

use crate::{
    Envelope, Message,
    handler::{
        CreateQueueHandler, HandlerContext, HandlerStats, MessageHandlerFactory, ProcessingError,
        QueueHandler,
    },
    hook::{DefaultHandlerHook, HandlerHook},
    settings::ServiceSettings,
    transport::{MessageFactory, MessageQueueClient, NoReplyClients, ReplyClientResolver},
};

use lifecycle::Lifecycle;
pub use lifecycle::WorkerStatus;
pub use wake::{WakeReceiver, WakeSignal, WakeWorker, wake_channel};

const TOTAL_STATS_NAME: &str = "ALL HANDLERS";

struct ServiceState<C> {
    registrations: Vec<Box<dyn CreateQueueHandler<C>>>,
    /// Built lazily by `start`, aligned with `registrations`. A disposed
    /// handler leaves an empty slot.
    handlers: Option<Vec<Option<Box<dyn QueueHandler<C>>>>>,
}

/// Brings the lifecycle back to `Stopped` when a pass ends, however it ends.
struct PassGuard<'a>(&'a Lifecycle);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0
            .transition(WorkerStatus::Starting, WorkerStatus::Stopped);
        self.0
            .transition(WorkerStatus::Started, WorkerStatus::Stopping);
        self.0
            .transition(WorkerStatus::Stopping, WorkerStatus::Stopped);
    }
}

/// Message processing service.
///
/// ## Example
///
/// ```rust
/// use postmaster::{Envelope, Message, MqService, ProcessingError, transport::InMemoryTransport};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct Ping;
/// impl Message for Ping { const TYPE_NAME: &'static str = "Ping"; }
///
/// # async fn run() -> Result<(), postmaster::ServiceError> {
/// let service = MqService::new(InMemoryTransport::new());
/// service
///     .register_handler(tower::service_fn(|_: Envelope<Ping>| async {
///         Ok::<Option<Ping>, ProcessingError>(None)
///     }))
///     .await?;
/// service.start().await?;
/// # Ok(())
/// # }
/// ```
pub struct MqService<F: MessageFactory> {
    factory: F,
    settings: ServiceSettings,
    hook: Arc<dyn HandlerHook>,
    reply_clients: Arc<dyn ReplyClientResolver>,
    lifecycle: Lifecycle,
    times_started: AtomicU64,
    state: Mutex<ServiceState<F::Client>>,
}

impl<F: MessageFactory> MqService<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            settings: ServiceSettings::default(),
            hook: Arc::new(DefaultHandlerHook),
            reply_clients: Arc::new(NoReplyClients),
            lifecycle: Lifecycle::new(),
            times_started: AtomicU64::new(0),
            state: Mutex::new(ServiceState {
                registrations: Vec::new(),
                handlers: None,
            }),
        }
    }

    /// Defaults applied by [`register_handler`](Self::register_handler).
    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Install a custom handler hook.
    pub fn with_hook(mut self, hook: Arc<dyn HandlerHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Deliver replies directly through `reply_clients` when possible.
    pub fn with_reply_clients(mut self, reply_clients: Arc<dyn ReplyClientResolver>) -> Self {
        self.reply_clients = reply_clients;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    pub fn status(&self) -> WorkerStatus {
        self.lifecycle.current()
    }

    /// Number of passes run so far.
    pub fn times_started(&self) -> u64 {
        self.times_started.load(Ordering::Relaxed)
    }

    /// Register the processing function for `T` with the service settings.
    pub async fn register_handler<T, R, S>(&self, service: S) -> Result<(), ServiceError>
    where
        T: Message,
        R: Message,
        S: Service<Envelope<T>, Response = Option<R>, Error = ProcessingError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        let factory = MessageHandlerFactory::new(service)
            .with_retry_count(self.settings.retry_count)
            .with_publish_responses_whitelist(self.settings.publish_responses_whitelist.clone())
            .with_publish_to_outq_whitelist(self.settings.publish_to_outq_whitelist.clone());
        self.register_handler_factory(factory).await
    }

    /// Register a preconfigured factory, ignoring the service settings.
    #[tracing::instrument(skip_all, fields(message_type = T::TYPE_NAME))]
    pub async fn register_handler_factory<T: Message, R: Message>(
        &self,
        factory: MessageHandlerFactory<T, R>,
    ) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        self.ensure_not_disposed()?;

        if state
            .registrations
            .iter()
            .any(|r| r.message_type() == T::TYPE_NAME)
        {
            return Err(ServiceError::already_registered(T::TYPE_NAME));
        }

        if let Some(handlers) = &mut state.handlers {
            handlers.push(Some(CreateQueueHandler::<F::Client>::create_queue_handler(
                &factory,
                &self.context(),
            )));
        }
        state.registrations.push(Box::new(factory));
        tracing::debug!("Message handler registered");
        Ok(())
    }

    /// Message types in registration order.
    pub async fn registered_types(&self) -> Vec<&'static str> {
        let state = self.state.lock().await;
        state
            .registrations
            .iter()
            .map(|r| r.message_type())
            .collect()
    }

    /// Run one drain pass over every registered handler.
    ///
    /// Handlers are built on the first pass after construction or
    /// [`stop`](Self::stop), with fresh counters. Per-message failures never
    /// surface here; the only error is calling a disposed service.
    #[tracing::instrument(skip_all)]
    pub async fn start(&self) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        self.ensure_not_disposed()?;

        if !self
            .lifecycle
            .transition(WorkerStatus::Stopped, WorkerStatus::Starting)
        {
            tracing::debug!(status = %self.status(), "Service is not stopped, skipping pass");
            return Ok(());
        }
        let _pass = PassGuard(&self.lifecycle);
        self.times_started.fetch_add(1, Ordering::Relaxed);

        let context = self.context();
        let ServiceState {
            registrations,
            handlers,
        } = &mut *state;
        let handlers = handlers.get_or_insert_with(|| {
            registrations
                .iter()
                .map(|r| Some(r.create_queue_handler(&context)))
                .collect()
        });

        let mut client = self.factory.create_message_queue_client();
        self.lifecycle
            .transition(WorkerStatus::Starting, WorkerStatus::Started);

        let mut total = 0;
        for handler in handlers.iter_mut().flatten() {
            if self.status() != WorkerStatus::Started {
                tracing::debug!("Service stopping, pass interrupted");
                break;
            }
            total += handler.process(&mut client).await;
        }

        if let Err(e) = client.close().await {
            let error: tower::BoxError = e.into();
            tracing::warn!(?error, "Failed to close transport client");
        }

        tracing::debug!(total, "Drain pass finished");
        Ok(())
    }

    /// Interrupt a running pass and discard the handlers.
    ///
    /// A pass in flight finishes the handler it is running before it
    /// notices. The next [`start`](Self::start) rebuilds handlers with
    /// zeroed counters.
    #[tracing::instrument(skip_all)]
    pub async fn stop(&self) -> Result<(), ServiceError> {
        self.ensure_not_disposed()?;
        if !self
            .lifecycle
            .transition(WorkerStatus::Started, WorkerStatus::Stopping)
        {
            self.lifecycle
                .transition(WorkerStatus::Starting, WorkerStatus::Stopping);
        }

        let mut state = self.state.lock().await;
        self.ensure_not_disposed()?;
        self.stop_locked(&mut state);
        Ok(())
    }

    /// Drop the running handler of `message_type`.
    ///
    /// The type stays registered. Once every handler slot is empty the
    /// service stops, and the next [`start`](Self::start) rebuilds all
    /// handlers.
    #[tracing::instrument(skip(self))]
    pub async fn dispose_message_handler(&self, message_type: &str) -> Result<(), ServiceError> {
        let mut state = self.state.lock().await;
        self.ensure_not_disposed()?;

        let Some(index) = state
            .registrations
            .iter()
            .position(|r| r.message_type() == message_type)
        else {
            return Err(ServiceError::not_registered(message_type));
        };

        let Some(handlers) = &mut state.handlers else {
            tracing::debug!("Handlers not built, nothing to dispose");
            return Ok(());
        };
        handlers[index] = None;
        tracing::debug!("Message handler disposed");

        if handlers.iter().all(Option::is_none) {
            self.lifecycle
                .transition(WorkerStatus::Started, WorkerStatus::Stopping);
            self.stop_locked(&mut state);
        }
        Ok(())
    }

    /// Shut the service down. Calling it again does nothing.
    #[tracing::instrument(skip_all)]
    pub async fn dispose(&self) {
        if self.lifecycle.dispose() == WorkerStatus::Disposed {
            return;
        }

        let mut state = self.state.lock().await;
        state.handlers = None;
        state.registrations.clear();
        tracing::info!("Message service disposed");
    }

    /// Snapshot of every handler's counters, in registration order.
    ///
    /// Empty until the first pass builds the handlers.
    pub async fn stats(&self) -> Vec<HandlerStats> {
        let state = self.state.lock().await;
        state
            .handlers
            .iter()
            .flatten()
            .flatten()
            .map(|h| h.stats())
            .collect()
    }

    /// Counters of every handler added together.
    pub async fn total_stats(&self) -> HandlerStats {
        self.stats()
            .await
            .iter()
            .fold(HandlerStats::new(TOTAL_STATS_NAME), |mut total, stats| {
                total.add(stats);
                total
            })
    }

    /// Human readable report of the service counters.
    pub async fn stats_description(&self) -> String {
        let stats = self.stats().await;
        let mut total = HandlerStats::new(TOTAL_STATS_NAME);
        let mut description = format!(
            "===============\nCurrent Status: {}\nTimes Started: {}\n",
            self.status(),
            self.times_started()
        );
        for handler_stats in &stats {
            total.add(handler_stats);
            description.push_str("---------------\n");
            description.push_str(&handler_stats.to_string());
        }
        description.push_str("---------------\n");
        description.push_str(&total.to_string());
        description.push_str("===============\n");
        description
    }

    fn context(&self) -> HandlerContext {
        HandlerContext::new(Arc::clone(&self.hook), Arc::clone(&self.reply_clients))
    }

    fn stop_locked(&self, state: &mut ServiceState<F::Client>) {
        state.handlers = None;
        self.lifecycle
            .transition(WorkerStatus::Stopping, WorkerStatus::Stopped);
        tracing::info!("Message service stopped");
    }

    fn ensure_not_disposed(&self) -> Result<(), ServiceError> {
        if self.lifecycle.is_disposed() {
            return Err(ServiceError::disposed());
        }
        Ok(())
    }
}

/// Error returned by service registry and lifecycle operations.
#[derive(Debug)]
pub struct ServiceError {
    context: SpanTrace,
    kind: ServiceErrorKind,
}

/// Service error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// A handler for this message type is already registered.
    AlreadyRegistered(String),
    /// The service has been disposed.
    Disposed,
    /// No handler is registered for this message type.
    NotRegistered(String),
}

impl ServiceError {
    fn already_registered(message_type: &str) -> Self {
        Self::new(ServiceErrorKind::AlreadyRegistered(message_type.to_owned()))
    }

    fn not_registered(message_type: &str) -> Self {
        Self::new(ServiceErrorKind::NotRegistered(message_type.to_owned()))
    }

    fn disposed() -> Self {
        Self::new(ServiceErrorKind::Disposed)
    }

    fn new(kind: ServiceErrorKind) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind,
        }
    }

    pub fn kind(&self) -> &ServiceErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ServiceErrorKind::AlreadyRegistered(message_type) => writeln!(
                f,
                "Message handler has already been registered for type: {message_type}"
            ),
            ServiceErrorKind::Disposed => writeln!(f, "Message service has been disposed"),
            ServiceErrorKind::NotRegistered(message_type) => {
                writeln!(f, "No message handler registered for type: {message_type}")
            }
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for ServiceError {}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::Duration,
    };

    use serde::{Deserialize, Serialize};
    use tokio::sync::{Notify, mpsc};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        Destination,
        handler::FailureAction,
        queue_names::QueueNames,
        transport::{InMemoryTransport, MessageQueueClientExt, RawPayload},
    };

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Hello {
        name: String,
    }

    impl Message for Hello {
        const TYPE_NAME: &'static str = "Hello";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct HelloReply {
        greeting: String,
    }

    impl Message for HelloReply {
        const TYPE_NAME: &'static str = "HelloReply";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Audit {
        entry: u32,
    }

    impl Message for Audit {
        const TYPE_NAME: &'static str = "Audit";
    }

    fn greeter(
        calls: Arc<AtomicUsize>,
    ) -> impl Service<
        Envelope<Hello>,
        Response = Option<HelloReply>,
        Error = ProcessingError,
        Future = impl Future<Output = Result<Option<HelloReply>, ProcessingError>> + Send + 'static,
    > + Clone
    + Send
    + 'static {
        tower::service_fn(move |envelope: Envelope<Hello>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProcessingError>(Some(HelloReply {
                    greeting: format!("hello {}", envelope.body.name),
                }))
            }
        })
    }

    fn auditor() -> impl Service<
        Envelope<Audit>,
        Response = Option<Audit>,
        Error = ProcessingError,
        Future = impl Future<Output = Result<Option<Audit>, ProcessingError>> + Send + 'static,
    > + Clone
    + Send
    + 'static {
        tower::service_fn(|_: Envelope<Audit>| async { Ok::<_, ProcessingError>(None) })
    }

    fn hello(name: &str) -> Envelope<Hello> {
        Envelope::new(Hello {
            name: name.to_owned(),
        })
    }

    #[tokio::test]
    async fn registering_a_type_twice_fails() {
        let service = MqService::new(InMemoryTransport::new());
        let calls = Arc::new(AtomicUsize::new(0));

        service.register_handler(greeter(calls.clone())).await.unwrap();
        let error = service.register_handler(greeter(calls)).await.unwrap_err();

        assert_eq!(
            error.kind(),
            &ServiceErrorKind::AlreadyRegistered("Hello".into())
        );
        assert!(
            error
                .to_string()
                .contains("Message handler has already been registered for type: Hello")
        );
        assert_eq!(service.registered_types().await, vec!["Hello"]);
    }

    #[tokio::test]
    async fn messages_published_before_registration_are_processed_once() {
        let mut transport = InMemoryTransport::new();
        transport.publish_message(hello("early")).await.unwrap();

        let service = MqService::new(transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(greeter(calls.clone())).await.unwrap();

        service.start().await.unwrap();
        service.start().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let reply = transport
            .dequeue::<HelloReply>(&QueueNames::of::<HelloReply>().normal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.body.greeting, "hello early");
        assert_eq!(service.times_started(), 2);
        assert_eq!(service.status(), WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_report_stats() {
        let mut transport = InMemoryTransport::new();
        let service = MqService::new(transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(auditor()).await.unwrap();
        service.register_handler(greeter(calls.clone())).await.unwrap();

        transport.publish_message(hello("a")).await.unwrap();
        transport.publish_message(hello("b")).await.unwrap();
        transport
            .publish_message(Envelope::new(Audit { entry: 1 }))
            .await
            .unwrap();
        service.start().await.unwrap();

        let stats = service.stats().await;
        let names: Vec<&str> = stats.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Audit", "Hello"]);
        assert_eq!(stats[0].total_processed, 1);
        assert_eq!(stats[1].total_processed, 2);

        let total = service.total_stats().await;
        assert_eq!(total.total_processed, 3);
        assert_eq!(total.total_received(), 3);

        let description = service.stats_description().await;
        assert!(description.contains("STATS for Hello:"));
        assert!(description.contains("STATS for ALL HANDLERS:"));
        assert!(description.contains("Times Started: 1"));
    }

    #[tokio::test]
    async fn stop_resets_handler_counters() {
        let mut transport = InMemoryTransport::new();
        let service = MqService::new(transport.clone());
        service
            .register_handler(greeter(Arc::default()))
            .await
            .unwrap();

        transport.publish_message(hello("a")).await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.total_stats().await.total_processed, 1);

        service.stop().await.unwrap();
        assert!(service.stats().await.is_empty());

        service.start().await.unwrap();
        assert_eq!(service.total_stats().await.total_processed, 0);
    }

    #[tokio::test]
    async fn settings_apply_to_registered_handlers() {
        let mut transport = InMemoryTransport::new();
        let service = MqService::new(transport.clone())
            .with_settings(ServiceSettings::default().disable_publishing_responses());
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(greeter(calls.clone())).await.unwrap();

        transport.publish_message(hello("quiet")).await.unwrap();
        service.start().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport
                .queue_len(&QueueNames::of::<HelloReply>().normal)
                .await,
            0
        );
    }

    #[tokio::test]
    async fn disposing_every_handler_stops_until_the_next_start() {
        let mut transport = InMemoryTransport::new();
        let service = MqService::new(transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(auditor()).await.unwrap();
        service.register_handler(greeter(calls.clone())).await.unwrap();
        service.start().await.unwrap();

        let error = service.dispose_message_handler("Missing").await.unwrap_err();
        assert_eq!(error.kind(), &ServiceErrorKind::NotRegistered("Missing".into()));

        service.dispose_message_handler("Audit").await.unwrap();
        assert_eq!(service.registered_types().await, vec!["Audit", "Hello"]);
        let stats = service.stats().await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].name, "Hello");

        transport.publish_message(hello("skipped")).await.unwrap();
        transport
            .publish_message(Envelope::new(Audit { entry: 1 }))
            .await
            .unwrap();
        service.start().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            transport.queue_len(&QueueNames::of::<Audit>().normal).await,
            1
        );

        service.dispose_message_handler("Hello").await.unwrap();
        assert!(service.stats().await.is_empty());
        assert_eq!(service.status(), WorkerStatus::Stopped);
        assert_eq!(service.registered_types().await, vec!["Audit", "Hello"]);

        transport.publish_message(hello("late")).await.unwrap();
        service.start().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            transport.queue_len(&QueueNames::of::<Audit>().normal).await,
            0
        );
        assert_eq!(service.stats().await.len(), 2);
    }

    #[tokio::test]
    async fn panicking_handlers_leave_the_service_usable() {
        let mut transport = InMemoryTransport::new();
        let service = MqService::new(transport.clone());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        service
            .register_handler(tower::service_fn(move |envelope: Envelope<Hello>| {
                let calls = Arc::clone(&counted);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if envelope.body.name == "bad" {
                        panic!("cannot greet");
                    }
                    Ok::<Option<HelloReply>, ProcessingError>(None)
                }
            }))
            .await
            .unwrap();

        transport.publish_message(hello("bad")).await.unwrap();
        service.start().await.unwrap();
        assert_eq!(service.status(), WorkerStatus::Stopped);

        transport.publish_message(hello("good")).await.unwrap();
        service.start().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            transport.queue_len(&QueueNames::of::<Hello>().dlq).await,
            1
        );
        let total = service.total_stats().await;
        assert_eq!(total.total_processed, 1);
        assert_eq!(total.total_failed, 1);
    }

    #[derive(Default)]
    struct PanicOnceHook {
        panicked: AtomicBool,
    }

    impl HandlerHook for PanicOnceHook {
        fn on_message_received(&self, _: &str, _: &Envelope<RawPayload>) {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("hook bug");
            }
        }
        fn on_message_processed(&self, _: &str, _: &Envelope<RawPayload>) {}
        fn on_message_failed(
            &self,
            _: &str,
            _: &Envelope<RawPayload>,
            _: &ProcessingError,
            _: FailureAction,
        ) {
        }
        fn on_dequeue_error(&self, _: &str, _: &dyn std::error::Error) {}
        fn on_decode_error(&self, _: &str, _: &Envelope<RawPayload>, _: &dyn std::error::Error) {}
        fn on_transport_error(&self, _: &str, _: &dyn std::error::Error) {}
        fn on_reply_error(&self, _: &Destination, _: &dyn std::error::Error) {}
        fn on_failure_policy_error(&self, _: &str, _: &dyn std::error::Error) {}
    }

    #[tokio::test]
    async fn a_pass_that_unwinds_still_returns_to_stopped() {
        let mut transport = InMemoryTransport::new();
        let service = Arc::new(
            MqService::new(transport.clone()).with_hook(Arc::new(PanicOnceHook::default())),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(greeter(calls.clone())).await.unwrap();

        transport.publish_message(hello("first")).await.unwrap();
        let pass = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.start().await }
        });
        assert!(pass.await.unwrap_err().is_panic());
        assert_eq!(service.status(), WorkerStatus::Stopped);

        transport.publish_message(hello("second")).await.unwrap();
        service.start().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.status(), WorkerStatus::Stopped);
    }

    /// Two handlers where the first blocks until `interrupt` has run
    /// against the service, with the pass still holding the lock.
    async fn interrupt_after_first_handler<Fut>(
        interrupt: impl FnOnce(Arc<MqService<InMemoryTransport>>) -> Fut + Send + 'static,
    ) -> (Arc<MqService<InMemoryTransport>>, InMemoryTransport, Arc<AtomicUsize>)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut transport = InMemoryTransport::new();
        let service = Arc::new(MqService::new(transport.clone()));
        let (reached, mut first_handler) = mpsc::channel::<()>(1);
        let resume = Arc::new(Notify::new());

        let waiting = Arc::clone(&resume);
        service
            .register_handler(tower::service_fn(move |_: Envelope<Audit>| {
                let reached = reached.clone();
                let resume = Arc::clone(&waiting);
                async move {
                    let _ = reached.send(()).await;
                    resume.notified().await;
                    Ok::<Option<Audit>, ProcessingError>(None)
                }
            }))
            .await
            .unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(greeter(calls.clone())).await.unwrap();

        transport
            .publish_message(Envelope::new(Audit { entry: 1 }))
            .await
            .unwrap();
        transport.publish_message(hello("never")).await.unwrap();

        let interrupter = tokio::spawn({
            let service = Arc::clone(&service);
            async move {
                first_handler.recv().await;
                let interrupted = interrupt(service);
                tokio::pin!(interrupted);
                // first poll flips the status, the lock is still held by the pass
                tokio::select! {
                    biased;
                    _ = &mut interrupted => {}
                    _ = std::future::ready(()) => {}
                }
                resume.notify_one();
                interrupted.await;
            }
        });

        service.start().await.unwrap();
        interrupter.await.unwrap();
        (service, transport, calls)
    }

    #[tokio::test]
    async fn stop_interrupts_a_pass_before_the_next_handler() {
        let (service, transport, calls) = interrupt_after_first_handler(|service| async move {
            service.stop().await.unwrap();
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            transport.queue_len(&QueueNames::of::<Hello>().normal).await,
            1
        );
        assert_eq!(
            transport.queue_len(&QueueNames::of::<Audit>().normal).await,
            0
        );
        assert_eq!(service.status(), WorkerStatus::Stopped);
        assert!(service.stats().await.is_empty());
    }

    #[tokio::test]
    async fn dispose_during_a_pass_stays_disposed() {
        let (service, transport, calls) = interrupt_after_first_handler(|service| async move {
            service.dispose().await;
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            transport.queue_len(&QueueNames::of::<Hello>().normal).await,
            1
        );
        assert_eq!(service.status(), WorkerStatus::Disposed);
        assert_eq!(
            service.start().await.unwrap_err().kind(),
            &ServiceErrorKind::Disposed
        );
    }

    #[tokio::test]
    async fn disposed_services_reject_lifecycle_calls() {
        let service = MqService::new(InMemoryTransport::new());
        service.register_handler(auditor()).await.unwrap();

        service.dispose().await;
        service.dispose().await;

        assert_eq!(service.status(), WorkerStatus::Disposed);
        for error in [
            service.start().await.unwrap_err(),
            service.stop().await.unwrap_err(),
            service.register_handler(auditor()).await.unwrap_err(),
            service.dispose_message_handler("Audit").await.unwrap_err(),
        ] {
            assert_eq!(error.kind(), &ServiceErrorKind::Disposed);
        }
    }

    #[tokio::test]
    async fn wake_worker_drains_on_publish() {
        let (signal, receiver) = wake_channel(1);
        let mut transport = InMemoryTransport::new().with_wake_signal(signal);
        let service = Arc::new(MqService::new(transport.clone()));
        let calls = Arc::new(AtomicUsize::new(0));
        service.register_handler(greeter(calls.clone())).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = WakeWorker::spawn(Arc::clone(&service), receiver, cancel.clone());

        for name in ["a", "b", "c"] {
            transport.publish_message(hello(name)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        worker.join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(service.times_started() >= 1);
    }

    #[tokio::test]
    async fn wake_worker_exits_when_the_service_is_disposed() {
        let (signal, receiver) = wake_channel(1);
        let service = Arc::new(MqService::new(InMemoryTransport::new()));
        let worker = WakeWorker::spawn(Arc::clone(&service), receiver, CancellationToken::new());

        service.dispose().await;
        signal.wake();

        tokio::time::timeout(Duration::from_secs(5), worker.join())
            .await
            .unwrap();
    }
}
