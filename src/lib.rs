#![doc = include_str!("../README.md")]

pub mod envelope;
pub mod handler;
pub mod hook;
pub mod queue_names;
pub mod service;
pub mod settings;
pub mod transport;

#[doc(inline)]
pub use envelope::{
    Destination, DestinationKind, Envelope, EnvelopeOptions, Message, ResponseStatus,
};

#[doc(inline)]
pub use handler::{
    FailureAction, FailurePolicy, HandlerStats, MessageHandler, MessageHandlerFactory,
    ProcessingError, ProcessingErrorKind,
};

#[doc(inline)]
pub use hook::{DefaultHandlerHook, HandlerHook};

#[doc(inline)]
pub use queue_names::QueueNames;

#[doc(inline)]
pub use service::{MqService, ServiceError, ServiceErrorKind, WorkerStatus};

#[doc(inline)]
pub use settings::ServiceSettings;

#[doc(inline)]
pub use transport::{TransportError, TransportErrorKind};
