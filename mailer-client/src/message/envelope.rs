//! Email notification envelope and its builder.
//!
//! The envelope carries business data only (who, what, how it is encoded)
//! plus the transport metadata the mailer expects on every message:
//! priority, expiration, timestamp, message id and application id.
//! Where and how it is delivered is decided at the publish boundary.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::address::validate_recipient;
use crate::error::ValidationError;

/// Highest AMQP priority the mailer queues are declared with.
pub const MAX_PRIORITY: u8 = 9;

/// Application id stamped on messages when none is configured.
pub const DEFAULT_APPLICATION_ID: &str = "milky-mailer-client";

/// Header carrying the recipient address.
pub const HEADER_TO: &str = "To";
/// Header carrying the subject line.
pub const HEADER_SUBJECT: &str = "Subject";
/// Header carrying the sender identifier known to the mailer.
pub const HEADER_FROM_ID: &str = "FromId";

/// Body encoding understood by the mailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "text/plain")]
    TextPlain,
    #[serde(rename = "text/html")]
    TextHtml,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::TextPlain => "text/plain",
            ContentType::TextHtml => "text/html",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text/plain" => Ok(ContentType::TextPlain),
            "text/html" => Ok(ContentType::TextHtml),
            _ => Err(ValidationError::UnknownContentType(s.to_string())),
        }
    }
}

/// Envelope metadata applied when the input does not override it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeDefaults {
    /// Message priority (0-9)
    pub priority: u8,
    /// How long the broker keeps the message before discarding it
    pub time_to_live: Duration,
    /// Identifier of the sending application
    pub application_id: String,
}

impl Default for EnvelopeDefaults {
    fn default() -> Self {
        Self {
            priority: 2,
            time_to_live: Duration::from_secs(12 * 60 * 60),
            application_id: DEFAULT_APPLICATION_ID.to_string(),
        }
    }
}

/// Caller-supplied email fields.
#[derive(Debug, Clone, Default)]
pub struct EmailInput {
    /// Recipient mailbox; a display-name form is reduced to its bare address
    pub recipient: String,
    /// Subject line
    pub subject: String,
    /// Raw content type, exactly `text/plain` or `text/html`
    pub content_type: String,
    /// Message body
    pub body: Vec<u8>,
    /// Sender identifier as configured on the mailer
    pub sender_id: String,
    /// Overrides [`EnvelopeDefaults::priority`]
    pub priority: Option<u8>,
    /// Overrides [`EnvelopeDefaults::time_to_live`]
    pub time_to_live: Option<Duration>,
}

impl EmailInput {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        content_type: impl Into<String>,
        body: impl Into<Vec<u8>>,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            content_type: content_type.into(),
            body: body.into(),
            sender_id: sender_id.into(),
            priority: None,
            time_to_live: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }
}

/// A validated, transport-ready email message.
///
/// Immutable once built. Every instance carries a freshly generated
/// message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    recipient: String,
    subject: String,
    content_type: ContentType,
    body: Vec<u8>,
    sender_id: String,
    priority: u8,
    time_to_live: Duration,
    created_at: SystemTime,
    message_id: Uuid,
    application_id: String,
}

impl MessageEnvelope {
    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn time_to_live(&self) -> Duration {
        self.time_to_live
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    /// Expiration property value: time to live in milliseconds.
    pub fn expiration_ms(&self) -> String {
        self.time_to_live.as_millis().to_string()
    }

    /// Timestamp property value: creation time in Unix seconds.
    pub fn timestamp_secs(&self) -> u64 {
        self.created_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Application headers read by the mailer.
    pub fn headers(&self) -> [(&'static str, &str); 3] {
        [
            (HEADER_TO, self.recipient.as_str()),
            (HEADER_SUBJECT, self.subject.as_str()),
            (HEADER_FROM_ID, self.sender_id.as_str()),
        ]
    }
}

/// Builds [`MessageEnvelope`]s from [`EmailInput`].
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    defaults: EnvelopeDefaults,
}

impl EnvelopeBuilder {
    pub fn new(defaults: EnvelopeDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &EnvelopeDefaults {
        &self.defaults
    }

    /// Validate the input and build an envelope.
    ///
    /// Generates a new message id and captures the current time.
    pub fn build(&self, input: EmailInput) -> Result<MessageEnvelope, ValidationError> {
        let recipient = validate_recipient(&input.recipient)?;

        let sender_id = input.sender_id.trim();
        if sender_id.is_empty() {
            return Err(ValidationError::EmptySender);
        }

        let content_type: ContentType = input.content_type.parse()?;

        let priority = input.priority.unwrap_or(self.defaults.priority);
        if priority > MAX_PRIORITY {
            return Err(ValidationError::PriorityOutOfRange(priority));
        }

        let envelope = MessageEnvelope {
            recipient,
            subject: input.subject,
            content_type,
            body: input.body,
            sender_id: sender_id.to_string(),
            priority,
            time_to_live: input.time_to_live.unwrap_or(self.defaults.time_to_live),
            created_at: SystemTime::now(),
            message_id: Uuid::new_v4(),
            application_id: self.defaults.application_id.clone(),
        };

        debug!(
            message_id = %envelope.message_id,
            to = %envelope.recipient,
            content_type = %envelope.content_type,
            priority = envelope.priority,
            body_length = envelope.body.len(),
            "envelope_built"
        );

        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_input() -> EmailInput {
        EmailInput::new("a@b.com", "Test", "text/plain", "Hi", "noreply")
    }

    #[test]
    fn test_build_applies_defaults() {
        let envelope = EnvelopeBuilder::default().build(sample_input()).unwrap();

        assert_eq!(envelope.recipient(), "a@b.com");
        assert_eq!(envelope.subject(), "Test");
        assert_eq!(envelope.content_type(), ContentType::TextPlain);
        assert_eq!(envelope.body(), b"Hi");
        assert_eq!(envelope.sender_id(), "noreply");
        assert_eq!(envelope.priority(), 2);
        assert_eq!(envelope.time_to_live(), Duration::from_secs(43_200));
        assert_eq!(envelope.expiration_ms(), "43200000");
        assert_eq!(envelope.application_id(), "milky-mailer-client");
        assert!(!envelope.message_id().is_nil());
    }

    #[test]
    fn test_message_ids_are_unique() {
        let builder = EnvelopeBuilder::default();
        let ids: HashSet<Uuid> = (0..100)
            .map(|_| builder.build(sample_input()).unwrap().message_id())
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_overrides_win_over_defaults() {
        let builder = EnvelopeBuilder::new(EnvelopeDefaults {
            priority: 5,
            time_to_live: Duration::from_secs(60),
            application_id: "billing".to_string(),
        });

        let envelope = builder
            .build(sample_input().with_priority(9).with_time_to_live(Duration::from_millis(1500)))
            .unwrap();

        assert_eq!(envelope.priority(), 9);
        assert_eq!(envelope.expiration_ms(), "1500");
        assert_eq!(envelope.application_id(), "billing");
    }

    #[test]
    fn test_rejects_empty_recipient() {
        let mut input = sample_input();
        input.recipient = String::new();
        assert_eq!(
            EnvelopeBuilder::default().build(input),
            Err(ValidationError::EmptyRecipient)
        );
    }

    #[test]
    fn test_rejects_blank_sender() {
        let mut input = sample_input();
        input.sender_id = "  ".to_string();
        assert_eq!(
            EnvelopeBuilder::default().build(input),
            Err(ValidationError::EmptySender)
        );
    }

    #[test]
    fn test_rejects_unknown_content_type() {
        let mut input = sample_input();
        input.content_type = "application/json".to_string();
        assert_eq!(
            EnvelopeBuilder::default().build(input),
            Err(ValidationError::UnknownContentType("application/json".to_string()))
        );
    }

    #[test]
    fn test_rejects_priority_out_of_range() {
        assert_eq!(
            EnvelopeBuilder::default().build(sample_input().with_priority(10)),
            Err(ValidationError::PriorityOutOfRange(10))
        );
    }

    #[test]
    fn test_content_type_parsing() {
        assert_eq!("text/html".parse::<ContentType>().unwrap(), ContentType::TextHtml);
        assert_eq!("text/plain".parse::<ContentType>().unwrap(), ContentType::TextPlain);
        assert_eq!(
            " TEXT/HTML ".parse::<ContentType>(),
            Err(ValidationError::UnknownContentType(" TEXT/HTML ".to_string()))
        );

        let json = serde_json::to_string(&ContentType::TextHtml).unwrap();
        assert_eq!(json, "\"text/html\"");
    }

    #[test]
    fn test_headers_mapping() {
        let envelope = EnvelopeBuilder::default().build(sample_input()).unwrap();
        assert_eq!(
            envelope.headers(),
            [("To", "a@b.com"), ("Subject", "Test"), ("FromId", "noreply")]
        );
    }

    #[test]
    fn test_display_name_recipient_is_reduced_to_address() {
        let mut input = sample_input();
        input.recipient = "Bob <bob@example.com>".to_string();

        let envelope = EnvelopeBuilder::default().build(input).unwrap();

        assert_eq!(envelope.recipient(), "bob@example.com");
        assert_eq!(envelope.headers()[0], ("To", "bob@example.com"));
    }

    #[test]
    fn test_created_at_is_build_time() {
        let before = SystemTime::now();
        let envelope = EnvelopeBuilder::default().build(sample_input()).unwrap();
        let after = SystemTime::now();

        assert!(envelope.created_at() >= before && envelope.created_at() <= after);

        let secs = |t: SystemTime| t.duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert!(envelope.timestamp_secs() >= secs(before));
        assert!(envelope.timestamp_secs() <= secs(after));
    }
}
