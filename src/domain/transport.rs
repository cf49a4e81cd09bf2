// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the session,
//! channel, publisher and consumer layers. It intentionally avoids any
//! reference to a concrete client library; the in-memory broker and the
//! lapin adapter under `src/transport/` both implement it.
//!
//! The layering mirrors AMQP 0-9-1:
//!
//! - a [`Dialer`] opens a [`BrokerConnection`] to a URI,
//! - a connection multiplexes [`BrokerChannel`]s,
//! - a channel carries declarations, publishes and consumers.
//!
//! Higher-level semantics (retry, channel health, topology readiness,
//! event reporting) are handled above this boundary.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::{ExchangeKind, InboundDelivery, OutboundMessage, QueueArguments};

/// Failure reported by a transport.
///
/// The variants follow AMQP reply classes closely enough that the layers
/// above can tell transient availability problems from permanent ones.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The broker could not be reached (refused, reset, DNS, not booted yet).
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Dialing did not complete within the configured dial timeout.
    #[error("dial timed out after {0:?}")]
    TimedOut(Duration),

    /// Authentication or virtual-host access was denied.
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The broker URI could not be parsed.
    #[error("invalid broker uri: {0}")]
    InvalidUri(String),

    /// AMQP 406: an entity exists with incompatible parameters.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// AMQP 404: the referenced exchange or queue does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Only availability failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Unreachable(_) | TransportError::TimedOut(_)
        )
    }
}

/// Result type alias for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Connection tuning passed to [`Dialer::dial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DialOptions {
    /// Heartbeat interval negotiated with the broker; `None` keeps the
    /// transport default.
    pub heartbeat: Option<Duration>,

    /// Upper bound on establishing the connection (TCP + handshake).
    pub dial_timeout: Option<Duration>,
}

/// Flags sent with `basic.consume`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConsumeOptions {
    pub auto_ack: bool,
    pub exclusive: bool,
    pub no_local: bool,
    pub no_wait: bool,
}

/// Receiver side of a registered consumer.
///
/// The sender is dropped by the transport when the consumer is cancelled
/// or its channel closes, which ends the stream for good.
pub type DeliveryStream = mpsc::UnboundedReceiver<InboundDelivery>;

/// Opens connections to a broker.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    /// Short transport name used in logs (e.g. `"memory"`, `"lapin"`).
    fn name(&self) -> &str;

    async fn dial(&self, uri: &str, options: &DialOptions) -> TransportResult<ConnectionPtr>;
}

/// One physical broker connection.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync {
    /// False once the connection was closed or the peer stopped answering
    /// heartbeats.
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> TransportResult<ChannelPtr>;

    /// Close the connection and every channel on it. Closing twice is not
    /// an error.
    async fn close(&self) -> TransportResult<()>;
}

/// One multiplexed channel on a connection.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Channel number on its connection.
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> TransportResult<()>;

    async fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> TransportResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> TransportResult<()>;

    /// `basic.qos` with a message count, no byte limit, per consumer.
    async fn set_prefetch(&self, count: u16) -> TransportResult<()>;

    /// Send with persistent delivery mode. Does not wait for confirms.
    async fn publish(&self, message: &OutboundMessage) -> TransportResult<()>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> TransportResult<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> TransportResult<()>;

    /// Close the channel. Closing twice is not an error.
    async fn close(&self) -> TransportResult<()>;
}

/// Shared dialer pointer.
pub type DialerPtr = Arc<dyn Dialer>;

/// Shared connection pointer.
pub type ConnectionPtr = Arc<dyn BrokerConnection>;

/// Shared channel pointer.
pub type ChannelPtr = Arc<dyn BrokerChannel>;
