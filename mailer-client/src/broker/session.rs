//! Broker session: one connection and one channel, owned exclusively.
//!
//! The session walks through `connect`, `open_channel` and `verify_target`
//! before it is ready to publish. Nothing is retried internally; a caller
//! that wants another attempt calls [`Session::reconnect`].

use std::fmt;

use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerConnection, BrokerTarget, Connector, TargetKind};
use crate::config::{BrokerConfig, DeliveryPolicy};
use crate::error::{
    ChannelError, CloseError, ConnectionError, Error, SessionError, TargetError,
};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    ChannelOpen,
    Verifying,
    Ready,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::ChannelOpen => "channel_open",
            SessionState::Verifying => "verifying",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Exclusive owner of one broker connection and one channel over it.
///
/// Methods take `&mut self`, so a channel is never used by two publishes at
/// once. Wrap the session in [`SharedSession`](crate::publish::SharedSession)
/// to share it between tasks.
pub struct Session {
    config: BrokerConfig,
    delivery: DeliveryPolicy,
    state: SessionState,
    connection: Option<Box<dyn BrokerConnection>>,
    channel: Option<Box<dyn BrokerChannel>>,
    /// Last successfully verified target
    target: Option<BrokerTarget>,
}

impl Session {
    pub fn new(config: BrokerConfig, delivery: DeliveryPolicy) -> Self {
        Self {
            config,
            delivery,
            state: SessionState::Disconnected,
            connection: None,
            channel: None,
            target: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn delivery(&self) -> &DeliveryPolicy {
        &self.delivery
    }

    /// Target verified by this session, if it is ready to publish.
    pub fn verified_target(&self) -> Option<&BrokerTarget> {
        match self.state {
            SessionState::Ready => self.target.as_ref(),
            _ => None,
        }
    }

    /// Establish the transport connection.
    pub async fn connect(&mut self, connector: &dyn Connector) -> Result<(), ConnectionError> {
        if self.state != SessionState::Disconnected {
            return Err(ConnectionError::InvalidState(self.state));
        }

        self.state = SessionState::Connecting;
        info!(endpoint = %self.config.endpoint(), "session_connecting");

        match connector.connect(&self.config).await {
            Ok(connection) => {
                self.connection = Some(connection);
                self.state = SessionState::Connected;
                info!(endpoint = %self.config.endpoint(), "session_connected");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                warn!(endpoint = %self.config.endpoint(), error = %e, "session_connect_failed");
                Err(e)
            }
        }
    }

    /// Open the session's single channel.
    pub async fn open_channel(&mut self) -> Result<(), ChannelError> {
        let connection = match (self.state, self.connection.as_deref()) {
            (SessionState::Connected, Some(connection)) => connection,
            _ => return Err(ChannelError::InvalidState(self.state)),
        };

        match connection.open_channel(self.delivery.publisher_confirms).await {
            Ok(channel) => {
                self.channel = Some(channel);
                self.state = SessionState::ChannelOpen;
                info!(
                    confirms = self.delivery.publisher_confirms,
                    "session_channel_open"
                );
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                warn!(error = %e, "session_channel_failed");
                Err(e)
            }
        }
    }

    /// Check that the target exists without creating it.
    ///
    /// On success the session becomes ready to publish to `target`.
    pub async fn verify_target(&mut self, target: &BrokerTarget) -> Result<(), TargetError> {
        let previous = self.state;
        let channel = match (previous, self.channel.as_deref()) {
            (SessionState::ChannelOpen | SessionState::Ready, Some(channel)) => channel,
            _ => return Err(TargetError::InvalidState(previous)),
        };

        self.state = SessionState::Verifying;

        let checked = match target.kind() {
            TargetKind::Exchange => channel.check_exchange(target.name()).await,
            TargetKind::Queue => channel.check_queue(target.name()).await,
        };

        match checked {
            Ok(()) => {
                self.target = Some(target.clone());
                self.state = SessionState::Ready;
                info!(
                    kind = %target.kind(),
                    name = %target.name(),
                    routing_key = %target.routing_key(),
                    "session_target_verified"
                );
                Ok(())
            }
            Err(e) => {
                // RabbitMQ closes the channel along with a failed passive check
                let still_open = channel.is_open();
                self.state = if still_open || self.replace_channel().await {
                    previous
                } else {
                    SessionState::Failed
                };
                warn!(
                    kind = %target.kind(),
                    name = %target.name(),
                    state = %self.state,
                    error = %e,
                    "session_target_check_failed"
                );
                Err(e)
            }
        }
    }

    /// Swap a channel the broker closed for a fresh one on the same
    /// connection. Returns `false` when no new channel could be opened.
    async fn replace_channel(&mut self) -> bool {
        let connection = match self.connection.as_deref() {
            Some(connection) => connection,
            None => return false,
        };

        if let Some(stale) = self.channel.take() {
            if let Err(e) = stale.close().await {
                debug!(error = %e, "session_stale_channel_close_error");
            }
        }

        match connection.open_channel(self.delivery.publisher_confirms).await {
            Ok(channel) => {
                self.channel = Some(channel);
                info!("session_channel_reopened");
                true
            }
            Err(e) => {
                warn!(error = %e, "session_channel_reopen_failed");
                false
            }
        }
    }

    /// Release the channel and the connection.
    ///
    /// Idempotent: once closed, further calls return `Ok(())` without
    /// touching the transport. Both releases are attempted even when the
    /// first one fails.
    pub async fn close(&mut self) -> Result<(), CloseError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }

        let channel_result = match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        };

        let connection_result = match self.connection.take() {
            Some(connection) => connection.close().await,
            None => Ok(()),
        };

        let from = self.state;
        self.state = SessionState::Closed;

        let result = match (channel_result, connection_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(channel), Ok(())) => Err(CloseError::Channel(channel)),
            (Ok(()), Err(connection)) => Err(CloseError::Connection(connection)),
            (Err(channel), Err(connection)) => Err(CloseError::Both {
                channel,
                connection,
            }),
        };

        match &result {
            Ok(()) => info!(from = %from, "session_closed"),
            Err(e) => warn!(from = %from, error = %e, "session_close_error"),
        }

        result
    }

    /// Tear down whatever is left and run the full setup again.
    ///
    /// Re-verifies the last verified target, if any.
    pub async fn reconnect(&mut self, connector: &dyn Connector) -> Result<(), Error> {
        info!(state = %self.state, "session_reconnecting");

        if let Err(e) = self.close().await {
            warn!(error = %e, "session_reconnect_release_error");
        }
        self.state = SessionState::Disconnected;

        self.connect(connector).await?;
        self.open_channel().await?;

        if let Some(target) = self.target.clone() {
            self.verify_target(&target).await?;
        }

        Ok(())
    }

    /// Channel to publish on, provided the session verified `target`.
    pub(crate) fn ready_channel(&self, target: &BrokerTarget) -> Result<&dyn BrokerChannel, Error> {
        let channel = match (self.state, self.channel.as_deref()) {
            (SessionState::Ready, Some(channel)) => channel,
            _ => return Err(SessionError::NotReady(self.state).into()),
        };

        if self.target.as_ref() != Some(target) {
            return Err(TargetError::Unverified {
                kind: target.kind(),
                name: target.name().to_string(),
            }
            .into());
        }

        Ok(channel)
    }

    pub(crate) fn mark_failed(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Failed;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.connection.is_some() {
            warn!(state = %self.state, "session_dropped_without_close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::{ConnectFault, MemoryBroker};

    fn session() -> Session {
        Session::new(BrokerConfig::default(), DeliveryPolicy::default())
    }

    async fn ready_session(broker: &MemoryBroker, target: &BrokerTarget) -> Session {
        let mut session = session();
        session.connect(broker).await.unwrap();
        session.open_channel().await.unwrap();
        session.verify_target(target).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_happy_path_states() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let target = BrokerTarget::exchange("mail", "");
        let mut session = session();
        assert_eq!(session.state(), SessionState::Disconnected);

        session.connect(&broker).await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);

        session.open_channel().await.unwrap();
        assert_eq!(session.state(), SessionState::ChannelOpen);

        session.verify_target(&target).await.unwrap();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.verified_target(), Some(&target));

        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.verified_target(), None);
    }

    #[tokio::test]
    async fn test_connect_failure_moves_to_failed() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(ConnectFault::Network);
        let mut session = session();

        let err = session.connect(&broker).await.unwrap_err();

        assert!(matches!(err, ConnectionError::Network { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        session.close().await.unwrap();
        assert_eq!(broker.connection_closes(), 0);
    }

    #[tokio::test]
    async fn test_open_channel_requires_connection() {
        let mut session = session();
        assert_eq!(
            session.open_channel().await,
            Err(ChannelError::InvalidState(SessionState::Disconnected))
        );
    }

    #[tokio::test]
    async fn test_missing_target_is_repeatable_and_never_created() {
        let broker = MemoryBroker::new().with_exchange("other");
        let target = BrokerTarget::exchange("mail", "");
        let mut session = session();
        session.connect(&broker).await.unwrap();
        session.open_channel().await.unwrap();

        for _ in 0..3 {
            let err = session.verify_target(&target).await.unwrap_err();
            assert!(matches!(err, TargetError::NotFound { kind: TargetKind::Exchange, .. }));
            assert_eq!(session.state(), SessionState::ChannelOpen);
        }

        assert!(!broker.has_exchange("mail"));
        assert_eq!(broker.entity_count(), 1);
        // Each failed check cost the broker-closed channel; a fresh one replaced it
        assert_eq!(broker.channels_opened(), 4);
        assert_eq!(broker.connections_opened(), 1);

        session.close().await.unwrap();
        assert_eq!(broker.channel_closes(), 4);
    }

    #[tokio::test]
    async fn test_missing_target_keeps_ready_session_usable() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let verified = BrokerTarget::exchange("mail", "");
        let mut session = ready_session(&broker, &verified).await;

        let err = session
            .verify_target(&BrokerTarget::queue("missing"))
            .await
            .unwrap_err();

        assert!(matches!(err, TargetError::NotFound { kind: TargetKind::Queue, .. }));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.verified_target(), Some(&verified));
        assert!(session.ready_channel(&verified).unwrap().is_open());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_target_fails_when_channel_cannot_reopen() {
        let broker = MemoryBroker::new();
        let mut session = session();
        session.connect(&broker).await.unwrap();
        session.open_channel().await.unwrap();
        broker.fail_channel_open();

        let err = session
            .verify_target(&BrokerTarget::exchange("mail", ""))
            .await
            .unwrap_err();

        assert!(matches!(err, TargetError::NotFound { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        session.close().await.unwrap();
        assert_eq!(broker.connection_closes(), 1);
    }

    #[tokio::test]
    async fn test_queue_target_verification() {
        let broker = MemoryBroker::new().with_queue("mail");
        let target = BrokerTarget::queue("mail");
        let mut session = ready_session(&broker, &target).await;

        assert_eq!(session.state(), SessionState::Ready);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let mut session = ready_session(&broker, &BrokerTarget::exchange("mail", "")).await;

        assert!(session.close().await.is_ok());
        assert!(session.close().await.is_ok());

        assert_eq!(broker.connection_closes(), 1);
        assert_eq!(broker.channel_closes(), 1);
    }

    #[tokio::test]
    async fn test_close_failure_still_releases_both() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let mut session = ready_session(&broker, &BrokerTarget::exchange("mail", "")).await;
        broker.fail_close();

        let err = session.close().await.unwrap_err();

        assert!(matches!(err, CloseError::Both { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(broker.connection_closes(), 1);
        assert_eq!(broker.channel_closes(), 1);
        assert!(session.close().await.is_ok());
    }

    #[tokio::test]
    async fn test_ready_channel_rejects_other_target() {
        let broker = MemoryBroker::new().with_exchange("mail").with_queue("mail");
        let mut session = ready_session(&broker, &BrokerTarget::exchange("mail", "")).await;

        let err = session.ready_channel(&BrokerTarget::queue("mail")).err().unwrap();

        assert!(matches!(err, Error::Target(TargetError::Unverified { .. })));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnect_reverifies_target() {
        let broker = MemoryBroker::new().with_exchange("mail");
        let target = BrokerTarget::exchange("mail", "");
        let mut session = ready_session(&broker, &target).await;
        session.mark_failed();

        session.reconnect(&broker).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.verified_target(), Some(&target));
        assert_eq!(broker.connections_opened(), 2);
        assert_eq!(broker.connection_closes(), 1);
        assert_eq!(broker.passive_checks(), 2);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let broker = MemoryBroker::new();
        let mut session = session();
        session.connect(&broker).await.unwrap();

        assert_eq!(
            session.connect(&broker).await,
            Err(ConnectionError::InvalidState(SessionState::Connected))
        );
        assert_eq!(broker.connections_opened(), 1);
        session.close().await.unwrap();
    }
}
