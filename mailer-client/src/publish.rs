//! Bounded-time publish of one envelope.
//!
//! A publish is a single attempt: exactly one write to the channel, then a
//! wait for the broker's answer that never outlasts the deadline. Nothing is
//! buffered and nothing is retried; callers that retry can key on the
//! envelope's message id.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{timeout, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerTarget, Confirmation, Session};
use crate::error::Result;
use crate::message::MessageEnvelope;

/// How a publish attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Broker accepted the message
    Published,
    /// Broker refused the message (nack or unroutable return)
    Rejected,
    /// No answer within the deadline, or the caller cancelled; disposition unknown
    TimedOut,
    /// Transport severed while publishing
    ConnectionFailed,
}

/// Result of one publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishResult {
    pub outcome: PublishOutcome,
    pub message_id: Uuid,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// Broker or transport reason for a non-published outcome
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PublishResult {
    pub fn is_published(&self) -> bool {
        self.outcome == PublishOutcome::Published
    }
}

fn serialize_millis<S>(elapsed: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(elapsed.as_millis() as u64)
}

/// Publish `envelope` to `target`, waiting at most `deadline` for acceptance.
///
/// Fails without touching the network when the session is not ready or did
/// not verify `target`.
pub async fn publish(
    session: &mut Session,
    target: &BrokerTarget,
    envelope: &MessageEnvelope,
    deadline: Duration,
) -> Result<PublishResult> {
    publish_until(session, target, envelope, deadline, std::future::pending::<()>()).await
}

/// Like [`publish`], but gives up as soon as `cancelled` completes.
///
/// A cancelled publish reports [`PublishOutcome::TimedOut`]; the message
/// may or may not have reached the broker.
pub async fn publish_until<F>(
    session: &mut Session,
    target: &BrokerTarget,
    envelope: &MessageEnvelope,
    deadline: Duration,
    cancelled: F,
) -> Result<PublishResult>
where
    F: Future<Output = ()>,
{
    let started = Instant::now();
    let channel = session.ready_channel(target)?;
    let delivery = session.delivery().clone();
    let (exchange, routing_key) = target.address();
    let message_id = envelope.message_id();

    info!(
        message_id = %message_id,
        exchange = %exchange,
        routing_key = %routing_key,
        deadline_ms = deadline.as_millis() as u64,
        mandatory = delivery.mandatory,
        immediate = delivery.immediate,
        "publish_starting"
    );

    let attempt = channel.publish(exchange, routing_key, envelope, &delivery);

    let (outcome, detail) = tokio::select! {
        biased;
        _ = cancelled => (PublishOutcome::TimedOut, Some("cancelled by caller".to_string())),
        answer = timeout(deadline, attempt) => match answer {
            Ok(Ok(Confirmation::Accepted)) => (PublishOutcome::Published, None),
            Ok(Ok(Confirmation::Rejected(reason))) => (PublishOutcome::Rejected, Some(reason)),
            Ok(Err(failure)) => (PublishOutcome::ConnectionFailed, Some(failure.to_string())),
            Err(_) => (
                PublishOutcome::TimedOut,
                Some(format!("no acknowledgement within {} ms", deadline.as_millis())),
            ),
        },
    };

    if outcome == PublishOutcome::ConnectionFailed {
        session.mark_failed();
    }

    let result = PublishResult {
        outcome,
        message_id,
        elapsed: started.elapsed(),
        detail,
    };

    let elapsed_ms = result.elapsed.as_millis() as u64;
    match result.outcome {
        PublishOutcome::Published => info!(
            message_id = %message_id,
            exchange = %exchange,
            body_length = envelope.body().len(),
            elapsed_ms = elapsed_ms,
            "publish_completed"
        ),
        PublishOutcome::Rejected | PublishOutcome::TimedOut => warn!(
            message_id = %message_id,
            outcome = ?result.outcome,
            detail = ?result.detail,
            elapsed_ms = elapsed_ms,
            "publish_not_confirmed"
        ),
        PublishOutcome::ConnectionFailed => error!(
            message_id = %message_id,
            detail = ?result.detail,
            elapsed_ms = elapsed_ms,
            "publish_connection_failed"
        ),
    }

    Ok(result)
}

/// A session shared between tasks; publishes are serialized by a mutex.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Session>>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Exclusive access to the underlying session.
    pub async fn lock(&self) -> MutexGuard<'_, Session> {
        self.inner.lock().await
    }

    /// Publish through the shared channel.
    ///
    /// Time spent waiting for another task's publish counts against
    /// `deadline`.
    pub async fn publish(
        &self,
        target: &BrokerTarget,
        envelope: &MessageEnvelope,
        deadline: Duration,
    ) -> Result<PublishResult> {
        let started = Instant::now();

        let mut session = match timeout(deadline, self.inner.lock()).await {
            Ok(session) => session,
            Err(_) => {
                warn!(message_id = %envelope.message_id(), "publish_session_busy");
                return Ok(PublishResult {
                    outcome: PublishOutcome::TimedOut,
                    message_id: envelope.message_id(),
                    elapsed: started.elapsed(),
                    detail: Some("session busy until deadline".to_string()),
                });
            }
        };

        let remaining = deadline.saturating_sub(started.elapsed());
        let mut result = publish(&mut session, target, envelope, remaining).await?;
        result.elapsed = started.elapsed();
        Ok(result)
    }
}
