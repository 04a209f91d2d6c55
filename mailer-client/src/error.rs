//! Error types for the publisher.
//!
//! Every failure is returned to the immediate caller as one of these values.
//! Publish outcomes that are not errors in the Rust sense (broker nack,
//! deadline exceeded, transport severed mid-publish) are reported through
//! [`PublishOutcome`](crate::publish::PublishOutcome) instead.

use thiserror::Error;

use crate::broker::{SessionState, TargetKind};

/// Bad caller input. Never reaches the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("recipient is empty")]
    EmptyRecipient,

    #[error("recipient '{0}' is not a single mailbox address")]
    MalformedRecipient(String),

    #[error("sender id is empty")]
    EmptySender,

    #[error("unsupported content type '{0}' (expected text/plain or text/html)")]
    UnknownContentType(String),

    #[error("priority {0} is out of range 0-9")]
    PriorityOutOfRange(u8),
}

/// Transport connection could not be established.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("network failure connecting to {endpoint}: {reason}")]
    Network { endpoint: String, reason: String },

    #[error("authentication refused by {endpoint}: {reason}")]
    Authentication { endpoint: String, reason: String },

    #[error("protocol handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    #[error("cannot connect a session in state {0}")]
    InvalidState(SessionState),
}

/// Logical channel could not be acquired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("cannot open a channel in state {0}")]
    InvalidState(SessionState),

    #[error("failed to open channel: {0}")]
    Open(String),

    #[error("failed to enable publisher confirms: {0}")]
    Confirms(String),
}

/// Target exchange or queue verification failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    /// The target does not exist. The publisher never creates it.
    #[error("{kind} '{name}' does not exist")]
    NotFound { kind: TargetKind, name: String },

    /// Publishing to a target other than the one the session verified.
    #[error("{kind} '{name}' was not verified by this session")]
    Unverified { kind: TargetKind, name: String },

    #[error("cannot verify a target in state {0}")]
    InvalidState(SessionState),

    #[error("passive check of {kind} '{name}' failed: {reason}")]
    Check {
        kind: TargetKind,
        name: String,
        reason: String,
    },
}

/// Session is not in a state that allows the requested operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("session is not ready (state: {0})")]
    NotReady(SessionState),
}

/// Releasing a channel or connection failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CloseError {
    #[error("failed to close channel: {0}")]
    Channel(String),

    #[error("failed to close connection: {0}")]
    Connection(String),

    #[error("failed to close channel ({channel}) and connection ({connection})")]
    Both { channel: String, connection: String },
}

/// Any error the publisher can return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// A step panicked; captured by the resource guard.
    #[error("unexpected fault: {0}")]
    Fault(String),
}

/// Result type alias for publisher operations.
pub type Result<T> = std::result::Result<T, Error>;
