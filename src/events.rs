//! Structured lifecycle events.
//!
//! Every state transition of a session, channel or subscription is reported
//! as a [`SessionEvent`] to an [`EventSink`]. The default sink,
//! [`TracingSink`], turns events into `tracing` records with typed fields;
//! [`RecordingSink`] keeps them in memory for assertions.
//!
//! Sinks are called synchronously on the task performing the operation and
//! must not block.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::SubscribeStage;

/// A lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected {
        session: Arc<str>,
        attempt: u32,
    },
    ConnectFailed {
        session: Arc<str>,
        attempt: u32,
        error: String,
        retryable: bool,
    },
    RetryScheduled {
        session: Arc<str>,
        attempt: u32,
        delay: Duration,
    },
    /// The live connection stopped answering (heartbeat loss or peer close).
    ConnectionLost {
        session: Arc<str>,
    },
    /// A dial finished after the caller stopped waiting; the connection was
    /// closed instead of installed.
    LateDialDiscarded {
        session: Arc<str>,
    },
    SessionClosed {
        session: Arc<str>,
    },
    ChannelOpened {
        session: Arc<str>,
        channel: u64,
    },
    ChannelOpenFailed {
        session: Arc<str>,
        error: String,
    },
    ChannelClosed {
        session: Arc<str>,
        channel: u64,
    },
    ExchangeDeclared {
        channel: u64,
        exchange: String,
    },
    QueueDeclared {
        channel: u64,
        queue: String,
        dead_letter_exchange: Option<String>,
    },
    QueueBound {
        channel: u64,
        queue: String,
        exchange: String,
        routing_key: String,
    },
    DeclareFailed {
        channel: u64,
        entity: String,
        name: String,
        error: String,
    },
    Published {
        channel: u64,
        exchange: String,
        routing_key: String,
        correlation_id: Option<String>,
    },
    PublishFailed {
        channel: u64,
        exchange: String,
        routing_key: String,
        error: String,
    },
    SubscriptionRegistered {
        channel: u64,
        queue: String,
        consumer_tag: String,
        prefetch: u16,
    },
    SubscriptionFailed {
        channel: u64,
        queue: String,
        stage: SubscribeStage,
        error: String,
    },
    SubscriptionCancelled {
        channel: u64,
        consumer_tag: String,
    },
}

/// Receiver of lifecycle events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &SessionEvent);
}

/// Shared event sink pointer.
pub type EventSinkPtr = Arc<dyn EventSink>;

/// Sink writing events as structured `tracing` records.
///
/// Failures and connection loss are `warn`, successful transitions `info`,
/// per-message traffic and retry scheduling `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &SessionEvent) {
        // ---
        use tracing::{debug, info, warn};

        match event {
            SessionEvent::Connected { session, attempt } => {
                info!(session = %session, attempt, "connected to broker")
            }
            SessionEvent::ConnectFailed {
                session,
                attempt,
                error,
                retryable,
            } => warn!(session = %session, attempt, retryable, error = %error, "broker dial failed"),
            SessionEvent::RetryScheduled {
                session,
                attempt,
                delay,
            } => debug!(session = %session, attempt, delay_ms = delay.as_millis() as u64, "backing off before redial"),
            SessionEvent::ConnectionLost { session } => {
                warn!(session = %session, "broker connection lost")
            }
            SessionEvent::LateDialDiscarded { session } => {
                warn!(session = %session, "discarded connection that arrived after the caller gave up")
            }
            SessionEvent::SessionClosed { session } => info!(session = %session, "session closed"),
            SessionEvent::ChannelOpened { session, channel } => {
                info!(session = %session, channel, "channel opened")
            }
            SessionEvent::ChannelOpenFailed { session, error } => {
                warn!(session = %session, error = %error, "channel open failed")
            }
            SessionEvent::ChannelClosed { session, channel } => {
                info!(session = %session, channel, "channel closed")
            }
            SessionEvent::ExchangeDeclared { channel, exchange } => {
                info!(channel, exchange = %exchange, "exchange declared")
            }
            SessionEvent::QueueDeclared {
                channel,
                queue,
                dead_letter_exchange,
            } => info!(
                channel,
                queue = %queue,
                dead_letter_exchange = dead_letter_exchange.as_deref().unwrap_or(""),
                "queue declared"
            ),
            SessionEvent::QueueBound {
                channel,
                queue,
                exchange,
                routing_key,
            } => info!(channel, queue = %queue, exchange = %exchange, routing_key = %routing_key, "queue bound"),
            SessionEvent::DeclareFailed {
                channel,
                entity,
                name,
                error,
            } => warn!(channel, entity = %entity, name = %name, error = %error, "declaration failed"),
            SessionEvent::Published {
                channel,
                exchange,
                routing_key,
                correlation_id,
            } => debug!(
                channel,
                exchange = %exchange,
                routing_key = %routing_key,
                correlation_id = correlation_id.as_deref().unwrap_or(""),
                "published"
            ),
            SessionEvent::PublishFailed {
                channel,
                exchange,
                routing_key,
                error,
            } => warn!(channel, exchange = %exchange, routing_key = %routing_key, error = %error, "publish failed"),
            SessionEvent::SubscriptionRegistered {
                channel,
                queue,
                consumer_tag,
                prefetch,
            } => info!(channel, queue = %queue, consumer_tag = %consumer_tag, prefetch, "subscription registered"),
            SessionEvent::SubscriptionFailed {
                channel,
                queue,
                stage,
                error,
            } => warn!(channel, queue = %queue, stage = %stage, error = %error, "subscription failed"),
            SessionEvent::SubscriptionCancelled {
                channel,
                consumer_tag,
            } => info!(channel, consumer_tag = %consumer_tag, "subscription cancelled"),
        }
    }
}

/// Sink that stores every event, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SessionEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the events recorded so far.
    pub fn events(&self) -> Vec<SessionEvent> {
        self.lock().clone()
    }

    /// Waits of every `RetryScheduled` event, in order.
    pub fn retry_delays(&self) -> Vec<Duration> {
        // ---
        self.lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::RetryScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&SessionEvent) -> bool) -> usize {
        self.lock().iter().filter(|event| matches(event)).count()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SessionEvent>> {
        // poisoning only happens if a test thread panicked mid-push
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &SessionEvent) {
        // ---
        TracingSink.emit(event);
        self.lock().push(event.clone());
    }
}
