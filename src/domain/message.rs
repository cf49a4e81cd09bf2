// src/domain/message.rs

//! Message value objects crossing the transport boundary.

use std::fmt;

use bytes::Bytes;

use crate::{CorrelationId, Error, Result, TransportResult};

/// AMQP delivery mode 2: the broker writes the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message to publish.
///
/// Transient: nothing keeps a reference to it once `publish()` returns.
///
/// # Example
///
/// ```
/// # use mom_session::OutboundMessage;
/// let msg = OutboundMessage::text("orders", "order.created", "{\"id\":7}")
///     .with_content_type("application/json")
///     .with_priority(5)
///     .with_new_correlation_id();
/// assert_eq!(msg.priority, Some(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub priority: Option<u8>,
    pub correlation_id: Option<CorrelationId>,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        // ---
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            content_type: None,
            priority: None,
            correlation_id: None,
            payload: payload.into(),
        }
    }

    /// A UTF-8 body with content type `text/plain`.
    pub fn text(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        // ---
        Self::new(exchange, routing_key, Bytes::from(body.into())).with_content_type("text/plain")
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_new_correlation_id(self) -> Self {
        self.with_correlation_id(CorrelationId::generate())
    }
}

/// Settles a single delivery with the broker.
///
/// Implemented per transport; each delivery carries its own acker when the
/// subscription is not auto-acknowledged.
#[async_trait::async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> TransportResult<()>;

    /// Negative acknowledgement. With `requeue == false` the broker
    /// dead-letters the message when the queue is configured for it.
    async fn reject(&self, requeue: bool) -> TransportResult<()>;
}

/// A message handed to a consumer.
///
/// Ownership passes to whoever reads it from the subscription; settlement
/// consumes the delivery so it cannot be acknowledged twice.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub priority: Option<u8>,
    pub persistent: bool,
    pub payload: Bytes,
    acker: Option<Box<dyn Acker>>,
}

impl InboundDelivery {
    /// Used by transports; consumers receive deliveries from a subscription.
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        // ---
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            content_type: None,
            correlation_id: None,
            priority: None,
            persistent: false,
            payload,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Box<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    /// False for deliveries of an auto-ack subscription.
    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    pub async fn ack(self) -> Result<()> {
        // ---
        let tag = self.delivery_tag;
        self.acker()?
            .ack()
            .await
            .map_err(|source| Error::Settlement {
                delivery_tag: tag,
                source,
            })
    }

    /// Reject the delivery. `requeue == false` hands it to the queue's
    /// dead-letter exchange, if any, or drops it.
    pub async fn reject(self, requeue: bool) -> Result<()> {
        // ---
        let tag = self.delivery_tag;
        self.acker()?
            .reject(requeue)
            .await
            .map_err(|source| Error::Settlement {
                delivery_tag: tag,
                source,
            })
    }

    /// Alias for [`reject`](Self::reject); AMQP `basic.nack` for one message.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.reject(requeue).await
    }

    fn acker(&self) -> Result<&dyn Acker> {
        self.acker.as_deref().ok_or(Error::AutoAcknowledged {
            delivery_tag: self.delivery_tag,
        })
    }
}

impl fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("correlation_id", &self.correlation_id)
            .field("payload_len", &self.payload.len())
            .field("requires_ack", &self.requires_ack())
            .finish()
    }
}
