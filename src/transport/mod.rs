//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`Dialer`](crate::Dialer) trait and the connection and channel handles
//! it produces. The lapin transport is hidden behind a feature flag; the
//! memory transport is always available.
//!
//! Session, channel, publisher and consumer code must not depend on
//! transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::{create_lapin_dialer, LapinDialer};

pub use memory::{
    //
    create_memory_dialer,
    create_memory_dialer_with_broker,
    DialRecord,
    Fault,
    MemoryBroker,
    MemoryDialer,
};
