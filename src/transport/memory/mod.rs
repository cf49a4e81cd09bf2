// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Dialer`](crate::Dialer) / [`BrokerConnection`](crate::BrokerConnection) /
//! [`BrokerChannel`](crate::BrokerChannel) traits. It is intended primarily
//! for testing, local execution, and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer. The lapin adapter approximates it as closely as a real
//! broker allows.
//!
//! In particular, the in-memory transport establishes the following
//! expectations:
//!
//! - Once `consume()` returns successfully, messages routed to the queue
//!   after that point are deliverable to the returned stream.
//! - Delivery order within one queue is publish order; requeued messages go
//!   back to the head of the queue.
//! - Conflicting declarations and references to missing entities close the
//!   channel, as AMQP channel exceptions do.
//! - Dropping all connections ([`MemoryBroker::sever_connections`]) looks to
//!   clients like a heartbeat timeout.
//!
//! ## Non-Goals
//!
//! Persistence across process restarts, message TTL, publisher confirms and
//! header-table matching are not modelled.

mod broker;
mod transport;

pub use broker::{Fault, MemoryBroker};
pub use transport::{
    //
    create_memory_dialer,
    create_memory_dialer_with_broker,
    DialRecord,
    MemoryDialer,
};
