// src/transport/memory/broker.rs

//! In-process broker state.
//!
//! A [`MemoryBroker`] holds exchanges, queues, bindings, connections and
//! channels behind one mutex. Every operation runs to completion while the
//! lock is held and never awaits, so the broker behaves like a single
//! serialized AMQP server.
//!
//! ## Modelled behaviour
//!
//! - `direct`, `topic` (`*` one word, `#` zero or more), `fanout` and
//!   `headers` exchanges; `headers` routes to every binding since header
//!   tables are not modelled. The default exchange `""` routes by queue name.
//! - Redeclaring with different parameters fails with 406 and closes the
//!   channel; referencing an unknown entity fails with 404 and closes the
//!   channel.
//! - Prefetch is per consumer and counts unacknowledged deliveries;
//!   auto-ack consumers are not limited.
//! - Consumers on one queue are served round-robin.
//! - Closing a channel or connection ends its consumer streams and requeues
//!   its unacknowledged deliveries at the head of their queues, flagged
//!   `redelivered`.
//! - `reject(requeue = false)` dead-letters through the queue's
//!   `x-dead-letter-exchange`, dropping the message when there is none.
//!
//! Unroutable publishes are dropped (no `mandatory` flag, no returns).

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::transport::MemoryAcker;
use crate::{
    //
    Binding,
    ConsumeOptions,
    DeliveryStream,
    ExchangeKind,
    ExchangeSpec,
    InboundDelivery,
    OutboundMessage,
    QueueArguments,
    QueueSpec,
    TransportError,
    TransportResult,
};

/// `(connection id, channel number)`
pub(crate) type ChannelKey = (u64, u16);

/// Broker-side failures that can be injected for tests.
///
/// Each injected fault fails the next matching operation once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `channel.open` is refused.
    ChannelOpen,
    /// `basic.qos` is refused.
    Prefetch,
    /// The next publish fails as if the socket write broke.
    Publish,
    /// `basic.consume` is refused.
    Consume,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    content_type: Option<String>,
    correlation_id: Option<String>,
    priority: Option<u8>,
    persistent: bool,
    payload: Bytes,
    redelivered: bool,
}

impl StoredMessage {
    fn from_outbound(message: &OutboundMessage) -> Self {
        // ---
        Self {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            content_type: message.content_type.clone(),
            correlation_id: message
                .correlation_id
                .as_ref()
                .map(|id| id.as_str().to_string()),
            priority: message.priority,
            persistent: true,
            payload: message.payload.clone(),
            redelivered: false,
        }
    }

    fn to_delivery(&self, tag: u64) -> InboundDelivery {
        // ---
        let mut delivery = InboundDelivery::new(
            tag,
            self.exchange.clone(),
            self.routing_key.clone(),
            self.payload.clone(),
        );
        delivery.redelivered = self.redelivered;
        delivery.content_type = self.content_type.clone();
        delivery.correlation_id = self.correlation_id.clone();
        delivery.priority = self.priority;
        delivery.persistent = self.persistent;
        delivery
    }
}

#[derive(Debug)]
struct ExchangeState {
    kind: ExchangeKind,
    durable: bool,
}

struct ConsumerSlot {
    channel: ChannelKey,
    tag: String,
    auto_ack: bool,
    exclusive: bool,
    prefetch: u16,
    sender: mpsc::UnboundedSender<InboundDelivery>,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    arguments: QueueArguments,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
    consumers: HashSet<String>,
}

#[derive(Default)]
struct ConnectionState {
    next_channel: u16,
    channels: Vec<u16>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<ChannelKey, ChannelState>,
    next_connection: u64,
    faults: HashMap<Fault, usize>,
}

/// In-process AMQP broker.
///
/// Share one broker between several [`MemoryDialer`](super::MemoryDialer)s
/// to let sessions talk to each other, exactly as clients of one real broker
/// would. Use a fresh broker per test for isolation.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    this: Weak<MemoryBroker>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new_cyclic(|this| Self {
            state: Mutex::new(BrokerState::default()),
            this: this.clone(),
        })
    }

    /// Fail the next `times` operations of the given kind.
    pub fn inject(&self, fault: Fault, times: usize) {
        *self.lock().faults.entry(fault).or_insert(0) += times;
    }

    /// Drop every open connection as if heartbeats had stopped.
    ///
    /// Clients observe `is_open() == false`; consumers end and unacked
    /// deliveries are requeued.
    pub fn sever_connections(&self) {
        // ---
        let mut state = self.lock();
        let open: Vec<u64> = state.connections.keys().copied().collect();

        for id in open {
            state.close_connection(&self.this, id);
        }
        tracing::debug!("memory broker: severed all connections");
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        // ---
        self.lock().exchanges.get(name).map(|ex| ExchangeSpec {
            name: name.to_string(),
            kind: ex.kind,
            durable: ex.durable,
        })
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        // ---
        self.lock().queues.get(name).map(|q| QueueSpec {
            name: name.to_string(),
            durable: q.durable,
            dead_letter_exchange: q.arguments.dead_letter_exchange.clone(),
            dead_letter_routing_key: q.arguments.dead_letter_routing_key.clone(),
        })
    }

    /// Arguments the queue was declared with.
    pub fn queue_arguments(&self, name: &str) -> Option<QueueArguments> {
        self.lock().queues.get(name).map(|q| q.arguments.clone())
    }

    /// Messages waiting in the queue, not yet delivered.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.ready.len())
    }

    /// Deliveries from the queue handed out and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        // ---
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn has_binding(&self, binding: &Binding) -> bool {
        self.lock().bindings.contains(binding)
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // ---
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    //
    // Operations used by the memory transport
    //

    pub(crate) fn open_connection(&self) -> u64 {
        // ---
        let mut state = self.lock();
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(id, ConnectionState::default());
        id
    }

    pub(crate) fn connection_open(&self, id: u64) -> bool {
        self.lock().connections.contains_key(&id)
    }

    pub(crate) fn close_connection(&self, id: u64) {
        self.lock().close_connection(&self.this, id);
    }

    pub(crate) fn open_channel(&self, connection: u64) -> TransportResult<u16> {
        // ---
        let mut state = self.lock();
        if state.take_fault(Fault::ChannelOpen) {
            return Err(TransportError::Protocol(
                "channel.open refused (injected)".into(),
            ));
        }

        let conn = state
            .connections
            .get_mut(&connection)
            .ok_or_else(|| TransportError::ConnectionClosed("connection is closed".into()))?;

        conn.next_channel += 1;
        let number = conn.next_channel;
        conn.channels.push(number);

        state.channels.insert(
            (connection, number),
            ChannelState {
                next_tag: 1,
                ..ChannelState::default()
            },
        );
        Ok(number)
    }

    pub(crate) fn channel_open(&self, key: ChannelKey) -> bool {
        self.lock().channels.contains_key(&key)
    }

    pub(crate) fn close_channel(&self, key: ChannelKey) {
        self.lock().close_channel(&self.this, key);
    }

    pub(crate) fn declare_exchange(
        &self,
        key: ChannelKey,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;

        if let Some(existing) = state.exchanges.get(name) {
            if existing.kind != kind || existing.durable != durable {
                let reason = format!(
                    "inequivalent arguments for exchange '{name}': declared {}/durable={}, requested {kind}/durable={durable}",
                    existing.kind, existing.durable
                );
                return Err(state.channel_exception(&self.this, key, TransportError::PreconditionFailed(reason)));
            }
            return Ok(());
        }

        state
            .exchanges
            .insert(name.to_string(), ExchangeState { kind, durable });
        Ok(())
    }

    pub(crate) fn declare_queue(
        &self,
        key: ChannelKey,
        name: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;

        if let Some(existing) = state.queues.get(name) {
            if existing.durable != durable || &existing.arguments != arguments {
                let reason = format!(
                    "inequivalent arguments for queue '{name}': declared durable={} {:?}, requested durable={durable} {:?}",
                    existing.durable,
                    existing.arguments.entries(),
                    arguments.entries()
                );
                return Err(state.channel_exception(&self.this, key, TransportError::PreconditionFailed(reason)));
            }
            return Ok(());
        }

        state.queues.insert(
            name.to_string(),
            QueueState {
                durable,
                arguments: arguments.clone(),
                ..QueueState::default()
            },
        );
        Ok(())
    }

    pub(crate) fn bind(
        &self,
        key: ChannelKey,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;

        if !state.exchanges.contains_key(exchange) {
            let err = TransportError::NotFound(format!("no exchange '{exchange}'"));
            return Err(state.channel_exception(&self.this, key, err));
        }
        if !state.queues.contains_key(queue) {
            let err = TransportError::NotFound(format!("no queue '{queue}'"));
            return Err(state.channel_exception(&self.this, key, err));
        }

        let binding = Binding::new(queue, exchange, routing_key);
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    pub(crate) fn set_prefetch(&self, key: ChannelKey, count: u16) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;
        if state.take_fault(Fault::Prefetch) {
            return Err(TransportError::Protocol("basic.qos refused (injected)".into()));
        }
        if let Some(channel) = state.channels.get_mut(&key) {
            channel.prefetch = count;
        }
        Ok(())
    }

    pub(crate) fn publish(&self, key: ChannelKey, message: &OutboundMessage) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;
        if state.take_fault(Fault::Publish) {
            return Err(TransportError::ConnectionClosed(
                "socket write failed (injected)".into(),
            ));
        }

        let stored = StoredMessage::from_outbound(message);
        match state.route(&self.this, &message.exchange, &message.routing_key, stored) {
            Ok(_) => Ok(()),
            Err(err) => Err(state.channel_exception(&self.this, key, err)),
        }
    }

    pub(crate) fn consume(
        &self,
        key: ChannelKey,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> TransportResult<DeliveryStream> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;
        if state.take_fault(Fault::Consume) {
            return Err(TransportError::Protocol("basic.consume refused (injected)".into()));
        }

        let Some(target) = state.queues.get(queue) else {
            let err = TransportError::NotFound(format!("no queue '{queue}'"));
            return Err(state.channel_exception(&self.this, key, err));
        };
        let locked = target.consumers.iter().any(|c| c.exclusive);
        if locked || (options.exclusive && !target.consumers.is_empty()) {
            let err = TransportError::AccessRefused(format!(
                "queue '{queue}' is in exclusive use"
            ));
            return Err(state.channel_exception(&self.this, key, err));
        }

        let prefetch = match state.channels.get_mut(&key) {
            Some(channel) if channel.consumers.contains(consumer_tag) => {
                return Err(TransportError::Protocol(format!(
                    "consumer tag '{consumer_tag}' already in use on this channel"
                )));
            }
            Some(channel) => {
                channel.consumers.insert(consumer_tag.to_string());
                channel.prefetch
            }
            None => return Err(TransportError::ChannelClosed("unknown channel".into())),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        if let Some(target) = state.queues.get_mut(queue) {
            target.consumers.push(ConsumerSlot {
                channel: key,
                tag: consumer_tag.to_string(),
                auto_ack: options.auto_ack,
                exclusive: options.exclusive,
                prefetch,
                sender,
            });
        }
        state.dispatch(&self.this, queue);
        Ok(receiver)
    }

    pub(crate) fn cancel(&self, key: ChannelKey, consumer_tag: &str) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        state.ensure_channel(key)?;
        if let Some(channel) = state.channels.get_mut(&key) {
            channel.consumers.remove(consumer_tag);
        }
        for queue in state.queues.values_mut() {
            queue.remove_consumers(|slot| slot.channel == key && slot.tag == consumer_tag);
        }
        Ok(())
    }

    pub(crate) fn ack(&self, key: ChannelKey, tag: u64) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        let unacked = state.take_unacked(&self.this, key, tag)?;
        state.dispatch(&self.this, &unacked.queue);
        Ok(())
    }

    pub(crate) fn reject(&self, key: ChannelKey, tag: u64, requeue: bool) -> TransportResult<()> {
        // ---
        let mut state = self.lock();
        let Unacked {
            queue, mut message, ..
        } = state.take_unacked(&self.this, key, tag)?;

        if requeue {
            message.redelivered = true;
            if let Some(target) = state.queues.get_mut(&queue) {
                target.ready.push_front(message);
            }
        } else {
            state.dead_letter(&self.this, &queue, message);
        }
        state.dispatch(&self.this, &queue);
        Ok(())
    }
}

impl QueueState {
    fn remove_consumers(&mut self, matches: impl Fn(&ConsumerSlot) -> bool) {
        // ---
        self.consumers.retain(|slot| !matches(slot));
        if self.next_consumer >= self.consumers.len() {
            self.next_consumer = 0;
        }
    }
}

impl BrokerState {
    fn take_fault(&mut self, fault: Fault) -> bool {
        // ---
        match self.faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn ensure_channel(&self, key: ChannelKey) -> TransportResult<()> {
        // ---
        match self.channels.get(&key) {
            Some(_) => Ok(()),
            None => Err(TransportError::ChannelClosed(format!(
                "channel {} is closed",
                key.1
            ))),
        }
    }

    /// AMQP channel exceptions close the channel before the error is seen.
    fn channel_exception(
        &mut self,
        broker: &Weak<MemoryBroker>,
        key: ChannelKey,
        err: TransportError,
    ) -> TransportError {
        // ---
        tracing::debug!(connection = key.0, channel = key.1, error = %err, "memory broker: channel exception");
        self.close_channel(broker, key);
        err
    }

    fn take_unacked(
        &mut self,
        broker: &Weak<MemoryBroker>,
        key: ChannelKey,
        tag: u64,
    ) -> TransportResult<Unacked> {
        // ---
        self.ensure_channel(key)?;
        match self.channels.get_mut(&key).and_then(|c| c.unacked.remove(&tag)) {
            Some(unacked) => Ok(unacked),
            None => {
                let err = TransportError::PreconditionFailed(format!("unknown delivery tag {tag}"));
                Err(self.channel_exception(broker, key, err))
            }
        }
    }

    fn route(
        &mut self,
        broker: &Weak<MemoryBroker>,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> TransportResult<usize> {
        // ---
        let mut targets: Vec<String> = if exchange.is_empty() {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|ex| ex.kind)
                .ok_or_else(|| TransportError::NotFound(format!("no exchange '{exchange}'")))?;

            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(target) = self.queues.get_mut(queue) {
                target.ready.push_back(message.clone());
            }
            self.dispatch(broker, queue);
        }
        Ok(targets.len())
    }

    fn dead_letter(&mut self, broker: &Weak<MemoryBroker>, queue: &str, mut message: StoredMessage) {
        // ---
        let Some(arguments) = self.queues.get(queue).map(|q| q.arguments.clone()) else {
            return;
        };
        let Some(exchange) = arguments.dead_letter_exchange else {
            tracing::debug!(queue, "memory broker: rejected message dropped");
            return;
        };

        let routing_key = arguments
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        message.exchange = exchange.clone();
        message.routing_key = routing_key.clone();
        message.redelivered = false;

        // a missing dead-letter exchange drops the message, as RabbitMQ does
        if let Err(err) = self.route(broker, &exchange, &routing_key, message) {
            tracing::debug!(queue, error = %err, "memory broker: dead-letter route failed");
        }
    }

    fn in_flight(&self, channel: ChannelKey, consumer_tag: &str) -> usize {
        // ---
        self.channels.get(&channel).map_or(0, |c| {
            c.unacked
                .values()
                .filter(|u| u.consumer_tag == consumer_tag)
                .count()
        })
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, broker: &Weak<MemoryBroker>, queue_name: &str) {
        // ---
        loop {
            let Some(queue) = self.queues.get(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.next_consumer + offset) % count)
                .find(|&idx| {
                    let slot = &queue.consumers[idx];
                    slot.auto_ack
                        || slot.prefetch == 0
                        || self.in_flight(slot.channel, &slot.tag) < usize::from(slot.prefetch)
                });
            let Some(idx) = chosen else {
                return;
            };

            let slot = &queue.consumers[idx];
            let (channel_key, tag, auto_ack, sender) = (
                slot.channel,
                slot.tag.clone(),
                slot.auto_ack,
                slot.sender.clone(),
            );

            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            let Some(channel) = self.channels.get_mut(&channel_key) else {
                queue.ready.push_front(message);
                queue.remove_consumers(|s| s.channel == channel_key && s.tag == tag);
                continue;
            };

            let delivery_tag = channel.next_tag;
            channel.next_tag += 1;

            let mut delivery = message.to_delivery(delivery_tag);
            if !auto_ack {
                delivery = delivery.with_acker(Box::new(MemoryAcker::new(
                    broker.clone(),
                    channel_key,
                    delivery_tag,
                )));
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        consumer_tag: tag.clone(),
                        message: message.clone(),
                    },
                );
            }

            if sender.send(delivery).is_err() {
                // the subscription was dropped without cancelling
                channel.unacked.remove(&delivery_tag);
                channel.consumers.remove(&tag);
                queue.ready.push_front(message);
                queue.remove_consumers(|s| s.channel == channel_key && s.tag == tag);
            }
        }
    }

    fn close_channel(&mut self, broker: &Weak<MemoryBroker>, key: ChannelKey) {
        // ---
        let Some(channel) = self.channels.remove(&key) else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&key.0) {
            conn.channels.retain(|number| *number != key.1);
        }
        let unacked = channel.unacked;

        for queue in self.queues.values_mut() {
            queue.remove_consumers(|slot| slot.channel == key);
        }

        // highest tag first so the original order survives push_front
        let mut touched = HashSet::new();
        for (_, Unacked { queue, mut message, .. }) in unacked.into_iter().rev() {
            if let Some(target) = self.queues.get_mut(&queue) {
                message.redelivered = true;
                target.ready.push_front(message);
                touched.insert(queue);
            }
        }
        for queue in touched {
            self.dispatch(broker, &queue);
        }
    }

    fn close_connection(&mut self, broker: &Weak<MemoryBroker>, id: u64) {
        // ---
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        for number in conn.channels {
            self.close_channel(broker, (id, number));
        }
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    // ---
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    fn walk(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| walk(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && walk(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && walk(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    walk(&pattern, &key)
}
