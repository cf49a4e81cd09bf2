//! Client-side session management for AMQP message brokers
//!
//! This library owns the lifecycle of a broker connection and the channels
//! multiplexed on it: connecting with bounded quadratic backoff, declaring
//! exchanges, queues and bindings (with optional dead-lettering), publishing
//! persistent messages, and consuming with per-consumer prefetch through a
//! cancellable [`Subscription`] stream.
//!
//! Every failure is returned as an [`Error`] value carrying its transport
//! cause; nothing in the library panics or exits on broker failures. State
//! transitions are reported as [`SessionEvent`]s, by default as structured
//! `tracing` records.
//!
//! The broker is reached through the [`Dialer`] trait. An in-process
//! [`MemoryBroker`] is always available; a lapin-backed dialer is enabled by
//! the `transport_lapin` feature.
//!

// Import all sub modules once...
mod channel;
mod consumer;
mod domain;
mod publisher;
mod session;
mod session_builder;
mod transport;

mod config;
mod correlation;
mod error;
mod events;
mod retry;

// Re-export main types
pub use channel::LogicalChannel;
pub use consumer::{Consumer, SubscribeRequest, Subscription};
pub use publisher::Publisher;
pub use session::Session;
pub use session_builder::SessionBuilder;

pub use config::{
    //
    BrokerEndpoint,
    Scheme,
    SessionConfig,
    DEFAULT_DIAL_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_SECS,
};
pub use correlation::CorrelationId;
pub use error::{Entity, Error, Result, SubscribeStage};
pub use events::{EventSink, EventSinkPtr, RecordingSink, SessionEvent, TracingSink};
pub use retry::{RetryPolicy, DEFAULT_BACKOFF_UNIT, DEFAULT_MAX_ATTEMPTS};

pub use transport::{
    //
    create_memory_dialer,
    create_memory_dialer_with_broker,
    DialRecord,
    Fault,
    MemoryBroker,
    MemoryDialer,
};

#[cfg(feature = "transport_lapin")]
pub use transport::{create_lapin_dialer, LapinDialer};

// --- public re-exports
pub use domain::{
    //
    Acker,
    Binding,
    BrokerChannel,
    BrokerConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumeOptions,
    DeliveryStream,
    DialOptions,
    Dialer,
    DialerPtr,
    ExchangeKind,
    ExchangeSpec,
    InboundDelivery,
    OutboundMessage,
    QueueArguments,
    QueueSpec,
    TransportError,
    TransportResult,
    DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG,
    PERSISTENT_DELIVERY_MODE,
};
