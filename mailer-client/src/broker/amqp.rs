//! AMQP transport backed by lapin.
//!
//! Maps the transport seam onto lapin calls:
//! - connect → `Connection::connect`
//! - open channel → `create_channel` (+ `confirm_select` when confirms are on)
//! - passive check → `exchange_declare` / `queue_declare` with `passive: true`
//! - publish → `basic_publish` followed by waiting on the publisher confirm
//!
//! Passive declares never create anything; a missing entity comes back as a
//! `NOT_FOUND` channel error, which also closes the channel on the broker.

use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    BrokerChannel, BrokerConnection, Confirmation, Connector, TargetKind, TransportFailure,
};
use crate::config::{BrokerConfig, DeliveryPolicy};
use crate::error::{ChannelError, ConnectionError, TargetError};
use crate::message::MessageEnvelope;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Connects to a RabbitMQ broker over AMQP 0-9-1.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(
        &self,
        config: &BrokerConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        let endpoint = config.endpoint();
        info!(endpoint = %endpoint, user = %config.user, "amqp_connecting");

        let properties = ConnectionProperties::default()
            .with_connection_name(config.connection_name.clone().into());

        let connection = Connection::connect(&config.amqp_uri(), properties)
            .await
            .map_err(|e| classify_connect_error(endpoint.clone(), e))?;

        info!(endpoint = %endpoint, "amqp_connected");

        Ok(Box::new(AmqpConnection { connection }))
    }
}

fn classify_connect_error(endpoint: String, err: lapin::Error) -> ConnectionError {
    let reason = err.to_string();
    match &err {
        lapin::Error::IOError(_) => ConnectionError::Network { endpoint, reason },
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)) =>
        {
            ConnectionError::Authentication { endpoint, reason }
        }
        _ => ConnectionError::Handshake { endpoint, reason },
    }
}

fn classify_target_error(kind: TargetKind, name: &str, err: lapin::Error) -> TargetError {
    match &err {
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND)) =>
        {
            TargetError::NotFound {
                kind,
                name: name.to_string(),
            }
        }
        _ => TargetError::Check {
            kind,
            name: name.to_string(),
            reason: err.to_string(),
        },
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self, confirms: bool) -> Result<Box<dyn BrokerChannel>, ChannelError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| ChannelError::Open(e.to_string()))?;

        if confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| ChannelError::Confirms(e.to_string()))?;
        }

        info!(channel_id = channel.id(), confirms = confirms, "amqp_channel_created");

        Ok(Box::new(AmqpChannel { channel }))
    }

    async fn close(&self) -> Result<(), String> {
        // Already torn down by the broker or by an I/O error
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| e.to_string())
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn check_exchange(&self, name: &str) -> Result<(), TargetError> {
        // Exchange kind and flags are ignored by the broker for passive declares
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_target_error(TargetKind::Exchange, name, e))
    }

    async fn check_queue(&self, name: &str) -> Result<(), TargetError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| classify_target_error(TargetKind::Queue, name, e))?;

        debug!(
            queue = name,
            message_count = queue.message_count(),
            consumer_count = queue.consumer_count(),
            "amqp_queue_inspected"
        );

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
        delivery: &DeliveryPolicy,
    ) -> Result<Confirmation, TransportFailure> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: delivery.mandatory,
                    immediate: delivery.immediate,
                },
                envelope.body(),
                message_properties(envelope, delivery),
            )
            .await
            .map_err(|e| TransportFailure(e.to_string()))?;

        let confirmation = confirm.await.map_err(|e| TransportFailure(e.to_string()))?;

        Ok(match confirmation {
            LapinConfirmation::Ack(None) | LapinConfirmation::NotRequested => {
                Confirmation::Accepted
            }
            LapinConfirmation::Ack(Some(returned)) => Confirmation::Rejected(format!(
                "returned by broker: {} {}",
                returned.reply_code,
                returned.reply_text.as_str()
            )),
            LapinConfirmation::Nack(_) => {
                Confirmation::Rejected("negative acknowledgement from broker".to_string())
            }
        })
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), String> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| e.to_string())
    }
}

/// Map an envelope onto AMQP basic properties.
fn message_properties(envelope: &MessageEnvelope, delivery: &DeliveryPolicy) -> BasicProperties {
    let mut headers = FieldTable::default();
    for (key, value) in envelope.headers() {
        headers.insert(key.into(), AMQPValue::LongString(value.into()));
    }

    let properties = BasicProperties::default()
        .with_headers(headers)
        .with_content_type(envelope.content_type().as_str().into())
        .with_priority(envelope.priority())
        .with_expiration(envelope.expiration_ms().into())
        .with_timestamp(envelope.timestamp_secs())
        .with_message_id(envelope.message_id().to_string().into())
        .with_app_id(envelope.application_id().into());

    if delivery.persistent {
        properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT)
    } else {
        properties
    }
}
