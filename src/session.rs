//! Broker session.
//!
//! A [`Session`] owns at most one physical broker connection and every
//! [`LogicalChannel`] derived from it. It is cheap to clone; all clones
//! share the same connection.
//!
//! ## Lifecycle
//!
//! ```text
//! configured ──connect──▶ connected ──close / loss──▶ disconnected
//!      ▲                      │                            │
//!      └──────────────────────┴────────── connect ─────────┘
//! ```
//!
//! - Every connect first releases the previous connection and its channels,
//!   so at most one connection is ever held.
//! - Dials run on a spawned task. When the caller stops waiting (dial
//!   timeout, an outer `tokio::time::timeout`, or a concurrent `close()`),
//!   the connection produced later is closed, never installed.
//! - Liveness is checked lazily: a connection found dead by
//!   [`Session::is_connected`] or by opening a channel is dropped and its
//!   channels are invalidated.
//!
//! Each connect or close starts a new *epoch*. Work begun under an older
//! epoch (a dial, a channel open) cannot install its result afterwards, and
//! a retrying connect stops before its next attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::channel::ChannelCore;
use crate::retry::{retry_with_backoff, RetryExhausted, RetryPolicy};
use crate::{
    //
    BrokerEndpoint,
    ChannelPtr,
    ConnectionPtr,
    DialOptions,
    DialerPtr,
    Error,
    EventSinkPtr,
    LogicalChannel,
    Result,
    SessionBuilder,
    SessionConfig,
    SessionEvent,
    TracingSink,
    TransportError,
    TransportResult,
};

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A connection to one broker endpoint.
///
/// # Example
///
/// ```
/// # use mom_session::{BrokerEndpoint, MemoryBroker, Session, create_memory_dialer_with_broker};
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> mom_session::Result<()> {
/// let dialer = create_memory_dialer_with_broker(MemoryBroker::new());
/// let session = Session::configure(BrokerEndpoint::default(), dialer);
///
/// session.connect_with_retry(3).await?;
/// let channel = session.open_channel().await?;
/// assert!(channel.is_open());
///
/// session.close().await;
/// assert!(!channel.is_open());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

pub(crate) struct SessionShared {
    pub(crate) name: Arc<str>,
    pub(crate) events: EventSinkPtr,
    config: SessionConfig,
    uri: String,
    dialer: DialerPtr,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    epoch: u64,
    connection: Option<ConnectionPtr>,
    channels: HashMap<u64, Arc<ChannelCore>>,
    next_channel: u64,
}

/// Resources detached from the session, awaiting release.
#[derive(Default)]
struct Detached {
    connection: Option<ConnectionPtr>,
    channels: Vec<Arc<ChannelCore>>,
}

impl Session {
    /// Resolve the endpoint into a URI. Performs no I/O.
    pub fn configure(endpoint: BrokerEndpoint, dialer: DialerPtr) -> Self {
        // ---
        let config = SessionConfig {
            endpoint,
            ..SessionConfig::default()
        };
        Self::with_config(config, dialer, Arc::new(TracingSink))
    }

    /// Fluent construction from configuration pieces.
    pub fn builder() -> SessionBuilder {
        SessionBuilder::new()
    }

    pub(crate) fn with_config(config: SessionConfig, dialer: DialerPtr, events: EventSinkPtr) -> Self {
        // ---
        let uri = config.endpoint.uri();
        tracing::debug!(
            session = %config.name,
            uri = %config.endpoint.redacted_uri(),
            transport = dialer.name(),
            "session configured"
        );

        Self {
            shared: Arc::new(SessionShared {
                name: Arc::from(config.name.as_str()),
                events,
                config,
                uri,
                dialer,
                state: Mutex::new(SessionState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Connection URI, including credentials.
    pub fn uri(&self) -> &str {
        &self.shared.uri
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// One dial attempt with the configured heartbeat and dial timeout.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionUnavailable`] with `attempts == 1`.
    pub async fn connect(&self) -> Result<()> {
        // ---
        let options = self.shared.config.dial_options();
        self.establish(self.shared.config.retry_policy(1), options)
            .await
    }

    /// Dial until success or `max_attempts` consecutive retryable failures.
    ///
    /// The wait after the n-th failure (from 0) is `n² × backoff_unit`.
    /// Non-retryable failures (refused credentials, malformed URI) end the
    /// loop immediately. A `close()` or newer connect ends it before the next
    /// attempt, with a [`TransportError::ConnectionClosed`] cause.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] when `max_attempts == 0`
    /// - [`Error::ConnectionUnavailable`] carrying the last cause
    pub async fn connect_with_retry(&self, max_attempts: u32) -> Result<()> {
        // ---
        if max_attempts == 0 {
            return Err(Error::InvalidConfig(
                "connect_with_retry needs at least one attempt".into(),
            ));
        }
        let options = self.shared.config.dial_options();
        self.establish(self.shared.config.retry_policy(max_attempts), options)
            .await
    }

    /// [`connect_with_retry`](Self::connect_with_retry) with
    /// `max_connect_attempts` from the configuration.
    pub async fn connect_with_default_retry(&self) -> Result<()> {
        self.connect_with_retry(self.shared.config.max_connect_attempts)
            .await
    }

    /// One dial with heartbeat and dial timeout both set to `idle_timeout`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] for a zero timeout
    /// - [`Error::ConnectionUnavailable`] with a
    ///   [`TransportError::TimedOut`] cause when the dial is too slow
    pub async fn connect_with_timeout(&self, idle_timeout: Duration) -> Result<()> {
        // ---
        if idle_timeout.is_zero() {
            return Err(Error::InvalidConfig("idle timeout must be non-zero".into()));
        }
        let options = DialOptions {
            heartbeat: Some(idle_timeout),
            dial_timeout: Some(idle_timeout),
        };
        self.establish(self.shared.config.retry_policy(1), options)
            .await
    }

    /// True while a connection is held and the broker still answers.
    ///
    /// A connection found dead is dropped, its channels are invalidated and
    /// a [`SessionEvent::ConnectionLost`] is emitted.
    pub async fn is_connected(&self) -> bool {
        self.shared.live_connection().await.is_ok()
    }

    /// Open a channel on the live connection.
    pub async fn open_channel(&self) -> Result<LogicalChannel> {
        LogicalChannel::open(self).await
    }

    /// Channels currently registered with the session.
    pub fn channel_count(&self) -> usize {
        lock_ignore_poison(&self.shared.state).channels.len()
    }

    /// Close every channel exactly once, then the connection.
    ///
    /// Idempotent and safe on a session that never connected. A dial still
    /// in flight is discarded when it completes.
    pub async fn close(&self) {
        // ---
        let detached = {
            let mut state = lock_ignore_poison(&self.shared.state);
            state.epoch += 1;
            state.detach()
        };
        let had_connection = detached.connection.is_some();

        self.shared.release(detached).await;

        if had_connection {
            self.shared.emit(SessionEvent::SessionClosed {
                session: self.shared.name.clone(),
            });
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    async fn establish(&self, policy: RetryPolicy, options: DialOptions) -> Result<()> {
        // ---
        let shared = &self.shared;
        let (epoch, previous) = {
            let mut state = lock_ignore_poison(&shared.state);
            state.epoch += 1;
            (state.epoch, state.detach())
        };
        shared.release(previous).await;

        let dials = AtomicU32::new(0);
        let outcome = retry_with_backoff(
            &policy,
            |attempt, delay, _| {
                shared.emit(SessionEvent::RetryScheduled {
                    session: shared.name.clone(),
                    attempt,
                    delay,
                });
            },
            |attempt| {
                let shared = Arc::clone(shared);
                let superseded = shared.current_epoch() != epoch;
                if !superseded {
                    dials.fetch_add(1, Ordering::SeqCst);
                }
                async move {
                    if superseded {
                        tracing::debug!(session = %shared.name, attempt, "connect superseded, not dialing");
                        return Err(TransportError::ConnectionClosed(
                            "session was closed or reconnected while retrying".into(),
                        ));
                    }
                    match shared.dial(options).await {
                        Ok(connection) => Ok((connection, attempt)),
                        Err(err) => {
                            shared.emit(SessionEvent::ConnectFailed {
                                session: shared.name.clone(),
                                attempt,
                                error: err.to_string(),
                                retryable: err.is_retryable(),
                            });
                            Err(err)
                        }
                    }
                }
            },
        )
        .await;

        match outcome {
            Ok((connection, attempt)) => shared.install(epoch, connection, attempt).await,
            Err(RetryExhausted {
                attempts,
                last_error,
            }) => Err(Error::ConnectionUnavailable {
                // a superseded attempt never dialed
                attempts: attempts.min(dials.load(Ordering::SeqCst)),
                source: last_error,
            }),
        }
    }
}

impl SessionState {
    fn detach(&mut self) -> Detached {
        // ---
        Detached {
            connection: self.connection.take(),
            channels: self.channels.drain().map(|(_, core)| core).collect(),
        }
    }
}

impl SessionShared {
    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(&event);
    }

    fn current_epoch(&self) -> u64 {
        lock_ignore_poison(&self.state).epoch
    }

    /// Dial on a spawned task so a late result can still be cleaned up.
    async fn dial(&self, options: DialOptions) -> TransportResult<ConnectionPtr> {
        // ---
        let (tx, rx) = oneshot::channel::<TransportResult<ConnectionPtr>>();
        let dialer = Arc::clone(&self.dialer);
        let uri = self.uri.clone();
        let events = Arc::clone(&self.events);
        let session = self.name.clone();

        tokio::spawn(async move {
            let result = dialer.dial(&uri, &options).await;
            if let Err(Ok(late)) = tx.send(result) {
                if let Err(err) = late.close().await {
                    tracing::debug!(session = %session, error = %err, "closing late connection failed");
                }
                events.emit(&SessionEvent::LateDialDiscarded { session });
            }
        });

        let received = match options.dial_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => return Err(TransportError::TimedOut(limit)),
            },
            None => rx.await,
        };

        received.unwrap_or_else(|_| {
            Err(TransportError::ConnectionClosed(
                "dial task ended without a result".into(),
            ))
        })
    }

    /// Make `connection` the live one unless a newer epoch started.
    async fn install(&self, epoch: u64, connection: ConnectionPtr, attempt: u32) -> Result<()> {
        // ---
        let installed = {
            let mut state = lock_ignore_poison(&self.state);
            if state.epoch == epoch {
                state.connection = Some(Arc::clone(&connection));
                true
            } else {
                false
            }
        };

        if !installed {
            if let Err(err) = connection.close().await {
                tracing::debug!(session = %self.name, error = %err, "closing superseded connection failed");
            }
            self.emit(SessionEvent::LateDialDiscarded {
                session: self.name.clone(),
            });
            return Err(Error::ConnectionUnavailable {
                attempts: attempt,
                source: TransportError::ConnectionClosed(
                    "session was closed or reconnected while dialing".into(),
                ),
            });
        }

        self.emit(SessionEvent::Connected {
            session: self.name.clone(),
            attempt,
        });
        Ok(())
    }

    /// Close detached channels exactly once, then their connection.
    async fn release(&self, detached: Detached) {
        // ---
        for core in detached.channels {
            core.close().await;
        }
        if let Some(connection) = detached.connection {
            if let Err(err) = connection.close().await {
                tracing::debug!(session = %self.name, error = %err, "closing connection failed");
            }
        }
    }

    /// The held connection with its epoch, if it is still open.
    pub(crate) async fn live_connection(&self) -> TransportResult<(u64, ConnectionPtr)> {
        // ---
        let lost = {
            let mut state = lock_ignore_poison(&self.state);
            let open = state.connection.as_ref().map(|c| c.is_open());
            match (open, state.connection.clone()) {
                (Some(true), Some(connection)) => return Ok((state.epoch, connection)),
                (Some(false), _) => state.detach(),
                _ => {
                    return Err(TransportError::ConnectionClosed(
                        "session is not connected".into(),
                    ))
                }
            }
        };

        for core in &lost.channels {
            core.invalidate();
        }
        self.emit(SessionEvent::ConnectionLost {
            session: self.name.clone(),
        });
        if let Some(connection) = lost.connection {
            if let Err(err) = connection.close().await {
                tracing::debug!(session = %self.name, error = %err, "closing lost connection failed");
            }
        }

        Err(TransportError::ConnectionClosed(
            "broker connection was lost".into(),
        ))
    }

    /// Track a freshly opened channel; `None` when the epoch moved on.
    pub(crate) fn register_channel(
        self: &Arc<Self>,
        epoch: u64,
        handle: ChannelPtr,
    ) -> Option<Arc<ChannelCore>> {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if state.epoch != epoch || state.connection.is_none() {
            return None;
        }

        state.next_channel += 1;
        let core = Arc::new(ChannelCore::new(
            state.next_channel,
            self.name.clone(),
            handle,
            Arc::clone(&self.events),
        ));
        state.channels.insert(core.id(), Arc::clone(&core));
        Some(core)
    }

    pub(crate) fn forget_channel(&self, id: u64) {
        lock_ignore_poison(&self.state).channels.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{create_memory_dialer_with_broker, MemoryBroker};

    fn session() -> Session {
        Session::configure(
            BrokerEndpoint::default(),
            create_memory_dialer_with_broker(MemoryBroker::new()),
        )
    }

    #[test]
    fn configure_resolves_the_uri_without_io() {
        // ---
        let session = Session::configure(
            BrokerEndpoint::new("mq", 5672).with_virtual_host("/"),
            create_memory_dialer_with_broker(MemoryBroker::new()),
        );
        assert_eq!(session.uri(), "amqp://guest:guest@mq:5672/%2F");
        assert_eq!(session.channel_count(), 0);
    }

    #[tokio::test]
    async fn zero_attempts_is_an_input_error() {
        // ---
        let err = session().connect_with_retry(0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn zero_idle_timeout_is_an_input_error() {
        // ---
        let err = session()
            .connect_with_timeout(Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn close_before_connect_is_a_no_op() {
        // ---
        let session = session();
        session.close().await;
        session.close().await;
        assert!(!session.is_connected().await);
    }
}
