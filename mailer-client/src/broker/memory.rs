//! In-process broker implementing the transport seam.
//!
//! Used to exercise sessions, publishing and the resource guard without a
//! running RabbitMQ. Faults can be injected at every step and every
//! connection, channel, check and publish is counted.
//!
//! ## Deviations from AMQP
//!
//! - Exchanges do not route; published messages are only recorded.
//!
//! Like RabbitMQ, a failed passive check closes the channel it ran on.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{
    BrokerChannel, BrokerConnection, Confirmation, Connector, TargetKind, TransportFailure,
};
use crate::config::{BrokerConfig, DeliveryPolicy};
use crate::error::{ChannelError, ConnectionError, TargetError};
use crate::message::{ContentType, MessageEnvelope};

/// How the broker answers a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PublishBehavior {
    /// Record the message and acknowledge it
    #[default]
    Accept,
    /// Negatively acknowledge without recording
    Nack,
    /// Wait, then record and acknowledge
    Delay(Duration),
    /// Never answer
    Hang,
    /// Drop the connection mid-publish
    Sever,
    /// Panic inside the transport
    Panic,
}

/// Reason the broker refuses new connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFault {
    Network,
    Authentication,
    Handshake,
}

/// A message accepted by the memory broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: Uuid,
    pub headers: Vec<(String, String)>,
    pub content_type: ContentType,
    pub priority: u8,
    pub expiration_ms: String,
    pub application_id: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub persistent: bool,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashSet<String>,
    queues: HashSet<String>,
    connect_fault: Option<ConnectFault>,
    fail_channel: bool,
    fail_close: bool,
    publish_behavior: PublishBehavior,
    connections_opened: usize,
    connection_closes: usize,
    channels_opened: usize,
    channel_closes: usize,
    passive_checks: usize,
    publish_attempts: usize,
    published: Vec<PublishedMessage>,
}

/// Shared handle to an in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exchange(self, name: impl Into<String>) -> Self {
        self.state().exchanges.insert(name.into());
        self
    }

    pub fn with_queue(self, name: impl Into<String>) -> Self {
        self.state().queues.insert(name.into());
        self
    }

    /// Refuse all further connection attempts.
    pub fn refuse_connections(&self, fault: ConnectFault) {
        self.state().connect_fault = Some(fault);
    }

    pub fn fail_channel_open(&self) {
        self.state().fail_channel = true;
    }

    /// Make every close report an error (resources are still released).
    pub fn fail_close(&self) {
        self.state().fail_close = true;
    }

    pub fn set_publish_behavior(&self, behavior: PublishBehavior) {
        self.state().publish_behavior = behavior;
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.state().exchanges.contains(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.state().queues.contains(name)
    }

    /// Number of exchanges plus queues.
    pub fn entity_count(&self) -> usize {
        let state = self.state();
        state.exchanges.len() + state.queues.len()
    }

    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Number of connection close calls received.
    pub fn connection_closes(&self) -> usize {
        self.state().connection_closes
    }

    pub fn channels_opened(&self) -> usize {
        self.state().channels_opened
    }

    /// Number of channel close calls received.
    pub fn channel_closes(&self) -> usize {
        self.state().channel_closes
    }

    pub fn passive_checks(&self) -> usize {
        self.state().passive_checks
    }

    pub fn publish_attempts(&self) -> usize {
        self.state().publish_attempts
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // Injected panics must not wedge later assertions
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(
        &self,
        config: &BrokerConfig,
    ) -> Result<Box<dyn BrokerConnection>, ConnectionError> {
        let mut state = self.state();
        if let Some(fault) = state.connect_fault {
            let endpoint = config.endpoint();
            return Err(match fault {
                ConnectFault::Network => ConnectionError::Network {
                    endpoint,
                    reason: "connection refused".to_string(),
                },
                ConnectFault::Authentication => ConnectionError::Authentication {
                    endpoint,
                    reason: "ACCESS_REFUSED".to_string(),
                },
                ConnectFault::Handshake => ConnectionError::Handshake {
                    endpoint,
                    reason: "unsupported protocol version".to_string(),
                },
            });
        }

        state.connections_opened += 1;

        Ok(Box::new(MemoryConnection {
            broker: self.clone(),
            severed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct MemoryConnection {
    broker: MemoryBroker,
    severed: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self, confirms: bool) -> Result<Box<dyn BrokerChannel>, ChannelError> {
        let mut state = self.broker.state();
        if state.fail_channel {
            return Err(ChannelError::Open("channel limit reached".to_string()));
        }
        if self.severed.load(Ordering::SeqCst) {
            return Err(ChannelError::Open("connection closed".to_string()));
        }

        state.channels_opened += 1;

        Ok(Box::new(MemoryChannel {
            broker: self.broker.clone(),
            severed: Arc::clone(&self.severed),
            closed: AtomicBool::new(false),
            confirms,
        }))
    }

    async fn close(&self) -> Result<(), String> {
        let mut state = self.broker.state();
        state.connection_closes += 1;
        if state.fail_close {
            return Err("injected connection close failure".to_string());
        }
        Ok(())
    }
}

struct MemoryChannel {
    broker: MemoryBroker,
    severed: Arc<AtomicBool>,
    closed: AtomicBool,
    confirms: bool,
}

impl MemoryChannel {
    fn check(&self, kind: TargetKind, name: &str) -> Result<(), TargetError> {
        let mut state = self.broker.state();
        state.passive_checks += 1;

        if !self.is_open() {
            return Err(TargetError::Check {
                kind,
                name: name.to_string(),
                reason: "channel closed".to_string(),
            });
        }

        let exists = match kind {
            // The default exchange always exists
            TargetKind::Exchange => name.is_empty() || state.exchanges.contains(name),
            TargetKind::Queue => state.queues.contains(name),
        };

        if exists {
            Ok(())
        } else {
            self.closed.store(true, Ordering::SeqCst);
            Err(TargetError::NotFound {
                kind,
                name: name.to_string(),
            })
        }
    }

    fn record(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
        delivery: &DeliveryPolicy,
    ) -> Result<Confirmation, TransportFailure> {
        let mut state = self.broker.state();

        if !exchange.is_empty() && !state.exchanges.contains(exchange) {
            self.closed.store(true, Ordering::SeqCst);
            return Err(TransportFailure(format!(
                "channel closed: NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        if delivery.mandatory && exchange.is_empty() && !state.queues.contains(routing_key) {
            return Ok(Confirmation::Rejected("returned by broker: 312 NO_ROUTE".to_string()));
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message_id: envelope.message_id(),
            headers: envelope
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            content_type: envelope.content_type(),
            priority: envelope.priority(),
            expiration_ms: envelope.expiration_ms(),
            application_id: envelope.application_id().to_string(),
            mandatory: delivery.mandatory,
            immediate: delivery.immediate,
            persistent: delivery.persistent,
            body: envelope.body().to_vec(),
        });

        Ok(Confirmation::Accepted)
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn check_exchange(&self, name: &str) -> Result<(), TargetError> {
        self.check(TargetKind::Exchange, name)
    }

    async fn check_queue(&self, name: &str) -> Result<(), TargetError> {
        self.check(TargetKind::Queue, name)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &MessageEnvelope,
        delivery: &DeliveryPolicy,
    ) -> Result<Confirmation, TransportFailure> {
        let behavior = {
            let mut state = self.broker.state();
            state.publish_attempts += 1;
            state.publish_behavior.clone()
        };

        if !self.is_open() {
            return Err(TransportFailure("channel closed".to_string()));
        }

        match behavior {
            PublishBehavior::Accept => self.record(exchange, routing_key, envelope, delivery),
            PublishBehavior::Nack if self.confirms => Ok(Confirmation::Rejected(
                "negative acknowledgement from broker".to_string(),
            )),
            // Without confirms the broker cannot tell us it dropped the message
            PublishBehavior::Nack => Ok(Confirmation::Accepted),
            PublishBehavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                self.record(exchange, routing_key, envelope, delivery)
            }
            PublishBehavior::Hang => std::future::pending().await,
            PublishBehavior::Sever => {
                self.severed.store(true, Ordering::SeqCst);
                Err(TransportFailure("connection reset by peer".to_string()))
            }
            PublishBehavior::Panic => panic!("injected publish fault"),
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.severed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), String> {
        self.closed.store(true, Ordering::SeqCst);
        let mut state = self.broker.state();
        state.channel_closes += 1;
        if state.fail_close {
            return Err("injected channel close failure".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{EmailInput, EnvelopeBuilder};

    fn envelope() -> MessageEnvelope {
        EnvelopeBuilder::default()
            .build(EmailInput::new("a@b.com", "Test", "text/plain", "Hi", "noreply"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_passive_checks_never_create() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        let channel = conn.open_channel(false).await.unwrap();

        assert!(channel.check_exchange("mail").await.is_ok());
        assert!(channel.check_exchange("").await.is_ok());
        assert!(matches!(
            channel.check_queue("mail").await,
            Err(TargetError::NotFound { kind: TargetKind::Queue, .. })
        ));
        assert!(!channel.is_open());
        assert!(!broker.has_queue("mail"));
        assert_eq!(broker.entity_count(), 1);
        assert_eq!(broker.passive_checks(), 3);
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_counted() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(ConnectFault::Authentication);

        let result = broker.connect(&BrokerConfig::default()).await;

        assert!(matches!(result, Err(ConnectionError::Authentication { .. })));
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_publish_records_message() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        let channel = conn.open_channel(false).await.unwrap();
        let envelope = envelope();

        let confirmation = channel
            .publish("mail", "", &envelope, &DeliveryPolicy::default())
            .await
            .unwrap();

        assert_eq!(confirmation, Confirmation::Accepted);
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].message_id, envelope.message_id());
        assert_eq!(published[0].body, b"Hi");
    }

    #[tokio::test]
    async fn test_sever_closes_channel() {
        let broker = MemoryBroker::new().with_exchange("mail");
        broker.set_publish_behavior(PublishBehavior::Sever);
        let conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        let channel = conn.open_channel(false).await.unwrap();

        let result = channel
            .publish("mail", "", &envelope(), &DeliveryPolicy::default())
            .await;

        assert!(result.is_err());
        assert!(!channel.is_open());
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_mandatory_unroutable_is_returned() {
        let broker = MemoryBroker::new();
        let conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        let channel = conn.open_channel(true).await.unwrap();
        let policy = DeliveryPolicy {
            mandatory: true,
            ..Default::default()
        };

        let result = channel.publish("", "missing", &envelope(), &policy).await;

        assert!(matches!(result, Ok(Confirmation::Rejected(_))));
    }
}
