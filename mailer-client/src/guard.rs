//! Resource guard around one complete send.
//!
//! ## Flow
//!
//! ```text
//! build → connect → open_channel → verify_target → publish → close
//! ```
//!
//! Validation runs before any connection is opened. Once a session exists it
//! is closed exactly once, whichever step ends the send, including a panic
//! inside a step. A failed close is reported next to the outcome and never
//! replaces it.
//!
//! Dropping a send future skips the release; callers that need to give up
//! early pass a cancellation future to [`send_until`] instead.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tracing::{error, info, warn};

use crate::broker::{BrokerTarget, Connector, Session};
use crate::config::Config;
use crate::error::{CloseError, Error, Result};
use crate::message::{EmailInput, EnvelopeBuilder, MessageEnvelope};
use crate::publish::{publish_until, PublishResult};

/// Outcome of [`send`] plus the result of releasing the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Publish result, or the error that stopped the send
    pub outcome: Result<PublishResult>,
    /// Result of closing the session (`Ok` when none was opened)
    pub release: std::result::Result<(), CloseError>,
}

impl Dispatch {
    pub fn is_published(&self) -> bool {
        matches!(&self.outcome, Ok(result) if result.is_published())
    }
}

/// Build, connect, verify and publish one email, always releasing the session.
pub async fn send(connector: &dyn Connector, config: &Config, input: EmailInput) -> Dispatch {
    send_until(connector, config, input, std::future::pending::<()>()).await
}

/// Like [`send`], but stops waiting for the broker once `cancelled`
/// completes. The session is still closed before returning.
pub async fn send_until<F>(
    connector: &dyn Connector,
    config: &Config,
    input: EmailInput,
    cancelled: F,
) -> Dispatch
where
    F: Future<Output = ()>,
{
    let builder = EnvelopeBuilder::new(config.envelope.clone());
    let envelope = match builder.build(input) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(error = %e, "send_validation_failed");
            return Dispatch {
                outcome: Err(e.into()),
                release: Ok(()),
            };
        }
    };

    let mut session = Session::new(config.broker.clone(), config.delivery.clone());

    let steps = run_steps(
        &mut session,
        connector,
        &config.target,
        &envelope,
        config.delivery.deadline,
        cancelled,
    );

    let outcome = match AssertUnwindSafe(steps).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(message_id = %envelope.message_id(), panic = %message, "send_step_panicked");
            Err(Error::Fault(message))
        }
    };

    let release = session.close().await;

    match &outcome {
        Ok(result) => info!(
            message_id = %result.message_id,
            outcome = ?result.outcome,
            elapsed_ms = result.elapsed.as_millis() as u64,
            release_ok = release.is_ok(),
            "send_finished"
        ),
        Err(e) => warn!(
            message_id = %envelope.message_id(),
            error = %e,
            release_ok = release.is_ok(),
            "send_failed"
        ),
    }

    Dispatch { outcome, release }
}

async fn run_steps<F>(
    session: &mut Session,
    connector: &dyn Connector,
    target: &BrokerTarget,
    envelope: &MessageEnvelope,
    deadline: Duration,
    cancelled: F,
) -> Result<PublishResult>
where
    F: Future<Output = ()>,
{
    session.connect(connector).await?;
    session.open_channel().await?;
    session.verify_target(target).await?;
    publish_until(session, target, envelope, deadline, cancelled).await
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
