//! Milky Mailer client - sends one test email through the mailer's exchange.
//!
//! Reads broker settings and the email fields from environment variables,
//! publishes a single message and exits non-zero when it was not accepted.

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailer_client::config::mail_input_from_env;
use mailer_client::{send, AmqpConnector, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("mailer_client_starting");

    // Load configuration from environment
    let config = Config::from_env();
    info!(
        endpoint = %config.broker.endpoint(),
        target_kind = %config.target.kind(),
        target = %config.target.name(),
        routing_key = %config.target.routing_key(),
        priority = config.envelope.priority,
        ttl_ms = config.envelope.time_to_live.as_millis() as u64,
        deadline_ms = config.delivery.deadline.as_millis() as u64,
        publisher_confirms = config.delivery.publisher_confirms,
        "config_loaded"
    );

    let input = mail_input_from_env();

    let dispatch = send(&AmqpConnector::new(), &config, input).await;

    if let Err(e) = &dispatch.release {
        warn!(error = %e, "amqp_release_failed");
    }

    let result = dispatch.outcome.context("Failed to send message")?;

    println!(
        "{}",
        serde_json::to_string(&result).context("Failed to serialize publish result")?
    );

    if !result.is_published() {
        bail!(
            "message {} not published: {:?} ({})",
            result.message_id,
            result.outcome,
            result.detail.as_deref().unwrap_or("no detail")
        );
    }

    info!(message_id = %result.message_id, "message_published");

    Ok(())
}
