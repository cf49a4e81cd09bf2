//! Logical channels and their topology.
//!
//! A [`LogicalChannel`] is one multiplexed AMQP channel plus what has been
//! declared through it. Declarations are channel scoped: publishing and
//! consuming require at least one successful declaration on the same
//! channel, and any failed declaration leaves the channel unusable.
//!
//! Health is tracked in three places, all checked before each operation:
//!
//! - the local `closed` flag (set by `close()`, session close, or
//!   connection loss),
//! - the broker-side channel state (AMQP channel exceptions close it),
//! - the recorded topology failure.
//!
//! Nothing is torn down implicitly when a declaration fails; the caller
//! decides when to close the channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::consumer::{self, Subscription};
use crate::publisher;
use crate::session::SessionShared;
use crate::{
    //
    Binding,
    ChannelPtr,
    Entity,
    Error,
    EventSinkPtr,
    ExchangeSpec,
    OutboundMessage,
    QueueSpec,
    Result,
    Session,
    SessionEvent,
    SubscribeRequest,
    TransportError,
};

#[derive(Default)]
struct Topology {
    exchange: Option<ExchangeSpec>,
    queue: Option<QueueSpec>,
    failure: Option<String>,
}

/// Shared state of one channel, owned jointly by the session and every
/// clone of the [`LogicalChannel`].
pub(crate) struct ChannelCore {
    id: u64,
    session: Arc<str>,
    handle: ChannelPtr,
    closed: AtomicBool,
    topology: Mutex<Topology>,
    events: EventSinkPtr,
}

impl ChannelCore {
    pub(crate) fn new(id: u64, session: Arc<str>, handle: ChannelPtr, events: EventSinkPtr) -> Self {
        // ---
        Self {
            id,
            session,
            handle,
            closed: AtomicBool::new(false),
            topology: Mutex::new(Topology::default()),
            events,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn session(&self) -> &str {
        &self.session
    }

    pub(crate) fn handle(&self) -> &ChannelPtr {
        &self.handle
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(&event);
    }

    fn topology(&self) -> MutexGuard<'_, Topology> {
        // ---
        match self.topology.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn mark_closed(&self) -> bool {
        // ---
        let first = !self.closed.swap(true, Ordering::SeqCst);
        if first {
            self.emit(SessionEvent::ChannelClosed {
                session: self.session.clone(),
                channel: self.id,
            });
        }
        first
    }

    /// Close the broker channel. Only the first call does anything.
    pub(crate) async fn close(&self) {
        // ---
        if self.mark_closed() {
            if let Err(err) = self.handle.close().await {
                tracing::debug!(channel = self.id, error = %err, "closing channel failed");
            }
        }
    }

    /// Mark closed without talking to the broker; the connection is gone.
    pub(crate) fn invalidate(&self) {
        self.mark_closed();
    }

    fn unusable(&self, reason: impl Into<String>) -> Error {
        Error::ChannelUnusable {
            channel: self.id,
            reason: reason.into(),
        }
    }

    /// Fail fast when the channel cannot carry traffic.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.unusable("channel is closed"));
        }
        if let Some(failure) = &self.topology().failure {
            return Err(self.unusable(format!("topology declaration failed: {failure}")));
        }
        if !self.handle.is_open() {
            return Err(self.unusable("channel was closed by the broker"));
        }
        Ok(())
    }

    /// As [`ensure_open`](Self::ensure_open), and topology is in place.
    pub(crate) fn ensure_ready(&self) -> Result<()> {
        // ---
        self.ensure_open()?;
        let topology = self.topology();
        if topology.exchange.is_none() && topology.queue.is_none() {
            return Err(self.unusable("no exchange or queue has been declared on this channel"));
        }
        Ok(())
    }

    /// Record a failed declaration and classify it.
    fn declaration_failed(&self, entity: Entity, name: &str, source: TransportError) -> Error {
        // ---
        self.topology().failure = Some(format!("{entity} '{name}': {source}"));
        self.emit(SessionEvent::DeclareFailed {
            channel: self.id,
            entity: entity.to_string(),
            name: name.to_string(),
            error: source.to_string(),
        });

        let name = name.to_string();
        match source {
            TransportError::PreconditionFailed(_) => Error::TopologyConflict {
                entity,
                name,
                source,
            },
            _ => Error::TopologyFailed {
                entity,
                name,
                source,
            },
        }
    }
}

/// A multiplexed channel on a session's connection.
///
/// Clones share the same channel. Operations on one channel are applied by
/// the broker in call order.
#[derive(Clone)]
pub struct LogicalChannel {
    core: Arc<ChannelCore>,
    session: Weak<SessionShared>,
}

impl LogicalChannel {
    /// Open a channel on the session's live connection.
    ///
    /// # Errors
    ///
    /// [`Error::ChannelOpenFailed`] when the session is not connected, the
    /// connection was lost, the broker refused the channel, or the session
    /// was closed or reconnected while the channel was being opened.
    pub async fn open(session: &Session) -> Result<Self> {
        // ---
        let shared = session.shared();
        let failed = |err: TransportError| {
            shared.emit(SessionEvent::ChannelOpenFailed {
                session: shared.name.clone(),
                error: err.to_string(),
            });
            Error::ChannelOpenFailed(err)
        };

        let (epoch, connection) = shared.live_connection().await.map_err(failed)?;
        let handle = connection.open_channel().await.map_err(failed)?;

        let Some(core) = shared.register_channel(epoch, Arc::clone(&handle)) else {
            if let Err(err) = handle.close().await {
                tracing::debug!(session = %shared.name, error = %err, "closing orphaned channel failed");
            }
            return Err(failed(TransportError::ConnectionClosed(
                "session was closed or reconnected while opening the channel".into(),
            )));
        };

        shared.emit(SessionEvent::ChannelOpened {
            session: shared.name.clone(),
            channel: core.id(),
        });
        Ok(Self {
            core,
            session: Arc::downgrade(shared),
        })
    }

    /// Session-unique channel id.
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    pub fn is_open(&self) -> bool {
        !self.core.closed.load(Ordering::SeqCst) && self.core.handle.is_open()
    }

    pub fn declared_exchange(&self) -> Option<ExchangeSpec> {
        self.core.topology().exchange.clone()
    }

    pub fn declared_queue(&self) -> Option<QueueSpec> {
        self.core.topology().queue.clone()
    }

    /// Why the channel became unusable, if a declaration failed.
    pub fn failure(&self) -> Option<String> {
        self.core.topology().failure.clone()
    }

    pub(crate) fn core(&self) -> &ChannelCore {
        &self.core
    }

    /// Declare an exchange. Redeclaring identically is a no-op.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidSpec`] for an empty or `amq.` name (channel stays usable)
    /// - [`Error::TopologyConflict`] when it exists with other parameters
    /// - [`Error::TopologyFailed`] for any other broker failure
    /// - [`Error::ChannelUnusable`] when an earlier step failed
    pub async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        spec.validate()?;
        self.core.ensure_open()?;

        match self
            .core
            .handle
            .declare_exchange(&spec.name, spec.kind, spec.durable)
            .await
        {
            Ok(()) => {
                self.core.topology().exchange = Some(spec.clone());
                self.core.emit(SessionEvent::ExchangeDeclared {
                    channel: self.id(),
                    exchange: spec.name.clone(),
                });
                Ok(())
            }
            Err(err) => Err(self.core.declaration_failed(Entity::Exchange, &spec.name, err)),
        }
    }

    /// Declare a queue, with `x-dead-letter-exchange` exactly when
    /// [`QueueSpec::dead_letter_exchange`] is set.
    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<()> {
        // ---
        spec.validate()?;
        self.core.ensure_open()?;

        let arguments = spec.arguments();
        match self
            .core
            .handle
            .declare_queue(&spec.name, spec.durable, &arguments)
            .await
        {
            Ok(()) => {
                self.core.topology().queue = Some(spec.clone());
                self.core.emit(SessionEvent::QueueDeclared {
                    channel: self.id(),
                    queue: spec.name.clone(),
                    dead_letter_exchange: arguments.dead_letter_exchange,
                });
                Ok(())
            }
            Err(err) => Err(self.core.declaration_failed(Entity::Queue, &spec.name, err)),
        }
    }

    /// Bind a queue to an exchange; both must already exist.
    pub async fn bind(&self, binding: &Binding) -> Result<()> {
        // ---
        binding.validate()?;
        self.core.ensure_open()?;

        match self
            .core
            .handle
            .bind_queue(&binding.queue, &binding.exchange, &binding.routing_key)
            .await
        {
            Ok(()) => {
                self.core.emit(SessionEvent::QueueBound {
                    channel: self.id(),
                    queue: binding.queue.clone(),
                    exchange: binding.exchange.clone(),
                    routing_key: binding.routing_key.clone(),
                });
                Ok(())
            }
            Err(err) => {
                let name = format!("{} -> {}", binding.queue, binding.exchange);
                Err(self.core.declaration_failed(Entity::Binding, &name, err))
            }
        }
    }

    /// Declare the exchange, declare the queue, bind them. Stops at the
    /// first failure.
    pub async fn setup(
        &self,
        exchange: &ExchangeSpec,
        queue: &QueueSpec,
        routing_key: &str,
    ) -> Result<()> {
        // ---
        self.declare_exchange(exchange).await?;
        self.declare_queue(queue).await?;
        self.bind(&Binding::new(&queue.name, &exchange.name, routing_key))
            .await
    }

    /// See [`Publisher::publish`](crate::Publisher::publish).
    pub async fn publish(&self, message: &OutboundMessage) -> Result<()> {
        publisher::publish(self, message).await
    }

    /// See [`Consumer::subscribe`](crate::Consumer::subscribe).
    pub async fn subscribe(&self, request: &SubscribeRequest) -> Result<Subscription> {
        consumer::subscribe(self, request).await
    }

    /// Close the channel and remove it from its session. Idempotent.
    pub async fn close(&self) {
        // ---
        self.core.close().await;
        if let Some(session) = self.session.upgrade() {
            session.forget_channel(self.id());
        }
    }
}

impl std::fmt::Debug for LogicalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("LogicalChannel")
            .field("session", &self.core.session())
            .field("id", &self.id())
            .field("open", &self.is_open())
            .field("failure", &self.failure())
            .finish()
    }
}
