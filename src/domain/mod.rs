//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! transport implementations: topology specs, message values, and the
//! dialer/connection/channel traits transports implement.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod message;
mod topology;
mod transport;

pub use message::{
    //
    Acker,
    InboundDelivery,
    OutboundMessage,
    PERSISTENT_DELIVERY_MODE,
};

pub use topology::{
    //
    Binding,
    ExchangeKind,
    ExchangeSpec,
    QueueArguments,
    QueueSpec,
    DEAD_LETTER_EXCHANGE_ARG,
    DEAD_LETTER_ROUTING_KEY_ARG,
};

pub use transport::{
    //
    BrokerChannel,
    BrokerConnection,
    ChannelPtr,
    ConnectionPtr,
    ConsumeOptions,
    DeliveryStream,
    DialOptions,
    Dialer,
    DialerPtr,
    TransportError,
    TransportResult,
};
