use std::fmt;

use thiserror::Error;

use crate::TransportError;

/// Broker entity kinds named in topology errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Exchange,
    Queue,
    Binding,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.write_str(match self {
            Entity::Exchange => "exchange",
            Entity::Queue => "queue",
            Entity::Binding => "binding",
        })
    }
}

/// The step of `subscribe()` that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeStage {
    Prefetch,
    Bind,
    Register,
    Cancel,
}

impl fmt::Display for SubscribeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.write_str(match self {
            SubscribeStage::Prefetch => "setting prefetch",
            SubscribeStage::Bind => "binding queue",
            SubscribeStage::Register => "registering consumer",
            SubscribeStage::Cancel => "cancelling consumer",
        })
    }
}

/// Errors returned by session, channel, publish and consume operations.
///
/// Every broker-facing failure carries the underlying [`TransportError`] as
/// its source so callers can decide whether to retry, escalate or degrade.
#[derive(Error, Debug)]
pub enum Error {
    /// Dialing the broker failed, after all permitted attempts.
    #[error("broker connection unavailable after {attempts} attempt(s): {source}")]
    ConnectionUnavailable {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// The connection exists but a channel could not be multiplexed on it.
    #[error("failed to open channel: {0}")]
    ChannelOpenFailed(#[source] TransportError),

    /// A declaration was rejected because the entity already exists with
    /// different parameters.
    #[error("{entity} '{name}' conflicts with an existing declaration: {source}")]
    TopologyConflict {
        entity: Entity,
        name: String,
        #[source]
        source: TransportError,
    },

    /// A declaration or binding failed for a reason other than a conflict.
    #[error("failed to declare {entity} '{name}': {source}")]
    TopologyFailed {
        entity: Entity,
        name: String,
        #[source]
        source: TransportError,
    },

    /// Transport-level send error.
    #[error("publish to exchange '{exchange}' with routing key '{routing_key}' failed: {source}")]
    PublishFailed {
        exchange: String,
        routing_key: String,
        #[source]
        source: TransportError,
    },

    /// Prefetch, bind or consumer registration failed during `subscribe()`,
    /// or the broker refused to cancel the consumer.
    #[error("subscription to queue '{queue}' failed while {stage}: {source}")]
    SubscriptionFailed {
        queue: String,
        stage: SubscribeStage,
        #[source]
        source: TransportError,
    },

    /// The channel is closed, or its topology is missing or failed.
    #[error("channel {channel} is unusable: {reason}")]
    ChannelUnusable { channel: u64, reason: String },

    /// Local validation of a spec or request failed; never retried.
    #[error("invalid {what}: {reason}")]
    InvalidSpec { what: &'static str, reason: String },

    /// Session configuration is incomplete or contradictory.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The delivery was settled by the broker on dispatch (auto-ack).
    #[error("delivery {delivery_tag} was auto-acknowledged and cannot be settled")]
    AutoAcknowledged { delivery_tag: u64 },

    /// Ack, nack or reject failed.
    #[error("failed to settle delivery {delivery_tag}: {source}")]
    Settlement {
        delivery_tag: u64,
        #[source]
        source: TransportError,
    },
}

impl Error {
    /// True when the failure is a transient broker-availability issue, the
    /// only class eligible for the reconnect backoff policy.
    pub fn is_retryable(&self) -> bool {
        // ---
        match self {
            Error::ConnectionUnavailable { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn invalid_spec(what: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidSpec {
            what,
            reason: reason.into(),
        }
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[test]
    fn only_transient_connection_failures_are_retryable() {
        // ---
        let transient = Error::ConnectionUnavailable {
            attempts: 3,
            source: TransportError::TimedOut(Duration::from_secs(1)),
        };
        let refused = Error::ConnectionUnavailable {
            attempts: 1,
            source: TransportError::AccessRefused("bad credentials".into()),
        };
        let publish = Error::PublishFailed {
            exchange: "orders".into(),
            routing_key: "created".into(),
            source: TransportError::Unreachable("reset".into()),
        };

        assert!(transient.is_retryable());
        assert!(!refused.is_retryable());
        assert!(!publish.is_retryable());
    }

    #[test]
    fn messages_name_the_failed_step() {
        // ---
        let err = Error::SubscriptionFailed {
            queue: "work".into(),
            stage: SubscribeStage::Prefetch,
            source: TransportError::ChannelClosed("gone".into()),
        };
        assert_eq!(
            err.to_string(),
            "subscription to queue 'work' failed while setting prefetch: channel closed: gone"
        );
    }
}
