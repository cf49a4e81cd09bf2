// src/domain/topology.rs

//! Declarative broker topology.
//!
//! Specs in this module describe exchanges, queues and bindings as plain
//! values. They perform no I/O; [`LogicalChannel`](crate::LogicalChannel)
//! turns them into declarations against a broker channel.
//!
//! Dead-lettering is driven by [`QueueSpec::dead_letter_exchange`] alone. A
//! queue gets the `x-dead-letter-exchange` argument when, and only when, that
//! field is set, whatever the queue or exchange happen to be called.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Argument key routing rejected or expired messages to another exchange.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Argument key overriding the routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable exchange of the given kind.
    pub fn new(name: impl Into<String>, kind: ExchangeKind) -> Self {
        // ---
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }

    pub fn direct(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Direct)
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Topic)
    }

    pub fn fanout(name: impl Into<String>) -> Self {
        Self::new(name, ExchangeKind::Fanout)
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Local checks performed before any declaration is sent.
    ///
    /// The default exchange (`""`) and the `amq.` namespace belong to the
    /// broker and cannot be declared by clients.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.name.is_empty() {
            return Err(Error::invalid_spec(
                "exchange spec",
                "the default exchange cannot be declared",
            ));
        }
        if self.name.starts_with("amq.") {
            return Err(Error::invalid_spec(
                "exchange spec",
                format!("'{}' uses the reserved amq. prefix", self.name),
            ));
        }
        Ok(())
    }
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,

    /// Exchange receiving messages this queue rejects or expires.
    #[serde(default)]
    pub dead_letter_exchange: Option<String>,

    /// Routing key used for dead-lettered messages; defaults to the
    /// message's original routing key. Only valid with a dead-letter
    /// exchange.
    #[serde(default)]
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    /// A durable queue without dead-lettering.
    pub fn new(name: impl Into<String>) -> Self {
        // ---
        Self {
            name: name.into(),
            durable: true,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Route rejected and expired messages to `exchange`.
    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn dead_letter_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    /// Declaration arguments derived from this spec.
    pub fn arguments(&self) -> QueueArguments {
        // ---
        match &self.dead_letter_exchange {
            Some(exchange) => QueueArguments {
                dead_letter_exchange: Some(exchange.clone()),
                dead_letter_routing_key: self.dead_letter_routing_key.clone(),
            },
            None => QueueArguments::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // ---
        if self.name.is_empty() {
            return Err(Error::invalid_spec(
                "queue spec",
                "server-named queues are not supported; give the queue a name",
            ));
        }
        if self.name.starts_with("amq.") {
            return Err(Error::invalid_spec(
                "queue spec",
                format!("'{}' uses the reserved amq. prefix", self.name),
            ));
        }
        match (&self.dead_letter_exchange, &self.dead_letter_routing_key) {
            (Some(exchange), _) if exchange.is_empty() => Err(Error::invalid_spec(
                "queue spec",
                "dead-letter exchange name is empty",
            )),
            (None, Some(_)) => Err(Error::invalid_spec(
                "queue spec",
                "dead-letter routing key set without a dead-letter exchange",
            )),
            _ => Ok(()),
        }
    }
}

/// Optional queue arguments understood by the broker.
///
/// An empty value means the declaration carries no arguments at all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueArguments {
    pub fn is_empty(&self) -> bool {
        self.dead_letter_exchange.is_none() && self.dead_letter_routing_key.is_none()
    }

    /// Arguments as `(key, value)` pairs in wire naming.
    pub fn entries(&self) -> Vec<(&'static str, &str)> {
        // ---
        let mut entries = Vec::new();
        if let Some(exchange) = &self.dead_letter_exchange {
            entries.push((DEAD_LETTER_EXCHANGE_ARG, exchange.as_str()));
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            entries.push((DEAD_LETTER_ROUTING_KEY_ARG, routing_key.as_str()));
        }
        entries
    }
}

/// Routing rule from an exchange to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

impl Binding {
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
        }
    }

    pub fn validate(&self) -> Result<()> {
        // ---
        if self.queue.is_empty() {
            return Err(Error::invalid_spec("binding", "queue name is empty"));
        }
        if self.exchange.is_empty() {
            return Err(Error::invalid_spec(
                "binding",
                "queues cannot be bound to the default exchange",
            ));
        }
        Ok(())
    }
}
