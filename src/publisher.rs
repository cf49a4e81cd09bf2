//! Publishing.
//!
//! There is one way to publish: build an [`OutboundMessage`] and hand it to
//! [`Publisher::publish`] (or [`LogicalChannel::publish`]). Every message is
//! sent with delivery mode 2 (persistent). Publisher confirms are not
//! requested; `Ok(())` means the broker accepted the frame on the channel,
//! not that it was routed or written to disk.

use crate::{
    //
    Error,
    LogicalChannel,
    OutboundMessage,
    Result,
    SessionEvent,
};

/// AMQP `shortstr` limit for exchange names and routing keys.
const MAX_SHORT_STRING: usize = 255;

/// Publishes on one channel.
#[derive(Debug, Clone)]
pub struct Publisher {
    channel: LogicalChannel,
}

impl Publisher {
    pub fn new(channel: &LogicalChannel) -> Self {
        Self {
            channel: channel.clone(),
        }
    }

    pub fn channel(&self) -> &LogicalChannel {
        &self.channel
    }

    /// Send one message.
    ///
    /// # Errors
    ///
    /// - [`Error::ChannelUnusable`] when the channel is closed or its
    ///   topology was never declared or failed
    /// - [`Error::InvalidSpec`] when the exchange or routing key exceeds
    ///   255 bytes
    /// - [`Error::PublishFailed`] with the transport cause
    pub async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        publish(&self.channel, message).await
    }
}

pub(crate) async fn publish(channel: &LogicalChannel, message: &OutboundMessage) -> Result<()> {
    // ---
    let core = channel.core();
    core.ensure_ready()?;

    if message.exchange.len() > MAX_SHORT_STRING {
        return Err(Error::invalid_spec("message", "exchange name exceeds 255 bytes"));
    }
    if message.routing_key.len() > MAX_SHORT_STRING {
        return Err(Error::invalid_spec("message", "routing key exceeds 255 bytes"));
    }

    match core.handle().publish(message).await {
        Ok(()) => {
            core.emit(SessionEvent::Published {
                channel: core.id(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                correlation_id: message
                    .correlation_id
                    .as_ref()
                    .map(|id| id.as_str().to_string()),
            });
            Ok(())
        }
        Err(source) => {
            core.emit(SessionEvent::PublishFailed {
                channel: core.id(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                error: source.to_string(),
            });
            Err(Error::PublishFailed {
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                source,
            })
        }
    }
}
