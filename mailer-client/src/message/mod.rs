//! Message module for building email notifications.
//!
//! ## Flow
//!
//! ```text
//! EmailInput → EnvelopeBuilder::build() → MessageEnvelope
//! ```
//!
//! Validation happens here, before any broker connection is opened.

pub mod address;
pub mod envelope;

pub use address::validate_recipient;
pub use envelope::{
    ContentType, EmailInput, EnvelopeBuilder, EnvelopeDefaults, MessageEnvelope,
    DEFAULT_APPLICATION_ID, MAX_PRIORITY,
};
