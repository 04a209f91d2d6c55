//! Broker module for AMQP sessions.
//!
//! This module provides:
//! - Publish targets (exchange-bound or queue-bound)
//! - A protocol-agnostic transport seam (connect, channel, passive check,
//!   publish, close)
//! - The lapin-backed AMQP transport and an in-process memory broker
//! - The session manager that owns one connection and one channel
//!
//! ## Session lifecycle
//!
//! ```text
//! Disconnected → Connecting → Connected → ChannelOpen → Verifying → Ready
//!        (any) → Failed            Ready | Failed → Closed
//! ```

pub mod amqp;
pub mod memory;
pub mod session;

use std::fmt;

use async_trait::async_trait;

use crate::config::{BrokerConfig, DeliveryPolicy};
use crate::error::{ChannelError, ConnectionError, TargetError};
use crate::message::MessageEnvelope;

pub use amqp::AmqpConnector;
pub use memory::{ConnectFault, MemoryBroker, PublishBehavior, PublishedMessage};
pub use session::{Session, SessionState};

/// Kind of broker entity a target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Exchange,
    Queue,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Exchange => f.write_str("exchange"),
            TargetKind::Queue => f.write_str("queue"),
        }
    }
}

/// Where a message is published.
///
/// An exchange-bound target publishes to the named exchange with its
/// routing key. A queue-bound target publishes through the default
/// exchange with the queue name as routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerTarget {
    kind: TargetKind,
    name: String,
    routing_key: String,
}

impl BrokerTarget {
    pub fn exchange(name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Exchange,
            name: name.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn queue(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: TargetKind::Queue,
            routing_key: name.clone(),
            name,
        }
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// The `(exchange, routing_key)` pair used on the wire.
    pub fn address(&self) -> (&str, &str) {
        match self.kind {
            TargetKind::Exchange => (&self.name, &self.routing_key),
            TargetKind::Queue => ("", &self.name),
        }
    }
}

impl fmt::Display for BrokerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// Broker answer to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Accepted (or confirms disabled and the frame was written).
    Accepted,
    /// Negative acknowledgement or unroutable return.
    Rejected(String),
}

/// Transport severed while a publish was in flight.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport failure: {0}")]
pub struct TransportFailure(pub String);

/// Establishes broker connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &BrokerConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a logical channel, enabling publisher confirms when requested.
    async fn open_channel(&self, confirms: bool) -> Result<Box<dyn BrokerChannel>, ChannelError>;

    async fn close(&self) -> Result<(), String>;
}

/// One logical channel over a connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Passive existence check. Never creates the exchange.
    async fn check_exchange(&self, name: &str) -> Result<(), TargetError>;

    /// Passive existence check. Never creates the queue.
    async fn check_queue(&self, name: &str) -> Result<(), TargetError>;

    /// Write one message and wait for the broker's answer.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
        delivery: &DeliveryPolicy,
    ) -> Result<Confirmation, TransportFailure>;

    /// Whether the channel can still be used.
    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), String>;
}
