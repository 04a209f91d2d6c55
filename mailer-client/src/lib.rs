//! Milky Mailer client - reliable AMQP publisher for email notifications.
//!
//! This library builds one email message for the mailer service and
//! publishes it to a pre-existing exchange or queue:
//! - `message`: validated, immutable message envelopes
//! - `broker`: transport seam, lapin and in-memory transports, sessions
//! - `publish`: bounded-time, cancellable single publish
//! - `guard`: end-to-end send that always releases the session
//!
//! ## Architecture
//!
//! ```text
//! EmailInput → EnvelopeBuilder → Session (connect, channel, verify) → publish → close
//! ```
//!
//! Exchanges and queues are never created here; they must already exist.

pub mod broker;
pub mod config;
pub mod error;
pub mod guard;
pub mod message;
pub mod publish;

// Re-export commonly used types
pub use broker::{AmqpConnector, BrokerTarget, MemoryBroker, Session, SessionState, TargetKind};
pub use config::{BrokerConfig, Config, DeliveryPolicy};
pub use error::{Error, Result};
pub use guard::{send, send_until, Dispatch};
pub use message::{ContentType, EmailInput, EnvelopeBuilder, EnvelopeDefaults, MessageEnvelope};
pub use publish::{publish, publish_until, PublishOutcome, PublishResult, SharedSession};
