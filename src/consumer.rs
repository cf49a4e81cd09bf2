//! Consuming.
//!
//! [`Consumer::subscribe`] performs three broker steps in order and reports
//! the failing one in [`Error::SubscriptionFailed`]:
//!
//! 1. `basic.qos` with the requested prefetch (per consumer, message count),
//! 2. `queue.bind` of the queue to the exchange under the routing key,
//! 3. `basic.consume` with exclusive, no-local and no-wait all off.
//!
//! The returned [`Subscription`] is a [`Stream`] of [`InboundDelivery`]. It
//! ends for good when the subscription is cancelled or its channel or
//! connection closes; unsettled deliveries are then requeued by the broker.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use crate::{
    //
    ConsumeOptions,
    DeliveryStream,
    Error,
    InboundDelivery,
    LogicalChannel,
    Result,
    SessionEvent,
    SubscribeStage,
    TransportError,
};

/// What to consume and how.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,

    /// Unacknowledged deliveries allowed in flight. Must be at least 1.
    pub qos: u16,

    /// Let the broker settle each delivery on dispatch.
    pub auto_ack: bool,

    /// Generated from the session name and channel id when `None`.
    pub consumer_tag: Option<String>,
}

impl SubscribeRequest {
    /// Manual acknowledgement, prefetch of one.
    pub fn new(
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        // ---
        Self {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            qos: 1,
            auto_ack: false,
            consumer_tag: None,
        }
    }

    pub fn qos(mut self, prefetch: u16) -> Self {
        self.qos = prefetch;
        self
    }

    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn consumer_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }

    fn validate(&self) -> Result<()> {
        // ---
        if self.qos == 0 {
            return Err(Error::invalid_spec(
                "subscribe request",
                "qos 0 would allow unbounded in-flight deliveries",
            ));
        }
        if self.queue.is_empty() {
            return Err(Error::invalid_spec("subscribe request", "queue name is empty"));
        }
        if self.exchange.is_empty() {
            return Err(Error::invalid_spec(
                "subscribe request",
                "queues cannot be bound to the default exchange",
            ));
        }
        if matches!(&self.consumer_tag, Some(tag) if tag.is_empty()) {
            return Err(Error::invalid_spec("subscribe request", "consumer tag is empty"));
        }
        Ok(())
    }
}

/// Registers subscriptions on one channel.
#[derive(Debug, Clone)]
pub struct Consumer {
    channel: LogicalChannel,
}

impl Consumer {
    pub fn new(channel: &LogicalChannel) -> Self {
        Self {
            channel: channel.clone(),
        }
    }

    pub fn channel(&self) -> &LogicalChannel {
        &self.channel
    }

    /// Set prefetch, bind and register a consumer.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSpec`] for `qos == 0` or empty names, before any I/O
    /// - [`Error::ChannelUnusable`] when the channel cannot carry traffic
    /// - [`Error::SubscriptionFailed`] naming the failed stage
    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription> {
        subscribe(&self.channel, request).await
    }
}

pub(crate) async fn subscribe(
    channel: &LogicalChannel,
    request: &SubscribeRequest,
) -> Result<Subscription> {
    // ---
    request.validate()?;
    let core = channel.core();
    core.ensure_ready()?;

    let failed = |stage: SubscribeStage, source: TransportError| {
        core.emit(SessionEvent::SubscriptionFailed {
            channel: core.id(),
            queue: request.queue.clone(),
            stage,
            error: source.to_string(),
        });
        Error::SubscriptionFailed {
            queue: request.queue.clone(),
            stage,
            source,
        }
    };

    let handle = core.handle();
    handle
        .set_prefetch(request.qos)
        .await
        .map_err(|e| failed(SubscribeStage::Prefetch, e))?;
    handle
        .bind_queue(&request.queue, &request.exchange, &request.routing_key)
        .await
        .map_err(|e| failed(SubscribeStage::Bind, e))?;

    let consumer_tag = match &request.consumer_tag {
        Some(tag) => tag.clone(),
        None => format!(
            "{}-ch{}-{}",
            core.session(),
            core.id(),
            uuid::Uuid::new_v4().simple()
        ),
    };
    let options = ConsumeOptions {
        auto_ack: request.auto_ack,
        exclusive: false,
        no_local: false,
        no_wait: false,
    };
    let inbox = handle
        .consume(&request.queue, &consumer_tag, options)
        .await
        .map_err(|e| failed(SubscribeStage::Register, e))?;

    core.emit(SessionEvent::SubscriptionRegistered {
        channel: core.id(),
        queue: request.queue.clone(),
        consumer_tag: consumer_tag.clone(),
        prefetch: request.qos,
    });

    Ok(Subscription {
        channel: channel.clone(),
        consumer_tag,
        queue: request.queue.clone(),
        inbox,
    })
}

/// A registered consumer's deliveries.
///
/// Read by one task. Dropping it without [`cancel`](Self::cancel) leaves
/// the broker-side consumer registered until the channel closes.
pub struct Subscription {
    channel: LogicalChannel,
    consumer_tag: String,
    queue: String,
    inbox: DeliveryStream,
}

impl Subscription {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Next delivery; `None` once the subscription has ended.
    pub async fn next_delivery(&mut self) -> Option<InboundDelivery> {
        self.inbox.recv().await
    }

    /// `basic.cancel` for this consumer. A channel or connection that is
    /// already closed counts as cancelled.
    pub async fn cancel(self) -> Result<()> {
        // ---
        let core = self.channel.core();
        match core.handle().cancel(&self.consumer_tag).await {
            Ok(()) | Err(TransportError::ChannelClosed(_) | TransportError::ConnectionClosed(_)) => {
                core.emit(SessionEvent::SubscriptionCancelled {
                    channel: core.id(),
                    consumer_tag: self.consumer_tag.clone(),
                });
                Ok(())
            }
            Err(source) => {
                core.emit(SessionEvent::SubscriptionFailed {
                    channel: core.id(),
                    queue: self.queue.clone(),
                    stage: SubscribeStage::Cancel,
                    error: source.to_string(),
                });
                Err(Error::SubscriptionFailed {
                    queue: self.queue.clone(),
                    stage: SubscribeStage::Cancel,
                    source,
                })
            }
        }
    }
}

impl Stream for Subscription {
    type Item = InboundDelivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbox.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("Subscription")
            .field("channel", &self.channel.id())
            .field("consumer_tag", &self.consumer_tag)
            .field("queue", &self.queue)
            .finish()
    }
}
