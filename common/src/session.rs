use std::time::Duration;

use log::{info, warn};

use crate::{
    command::MessageHandler,
    config::AgentConfig,
    error::{AgentError, SessionError},
    topics::{TopicName, TopicSet},
    types::{MessageId, QoS},
};

/// Upper bound on topics one session tracks for re-subscription.
pub const MAX_SUBSCRIPTIONS: usize = 4;

/// Everything a connector needs to open one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let (username, password) = match config.credentials() {
            Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string())),
            None => (None, None),
        };

        Self {
            host: config.network.mqtt_host.clone(),
            port: config.network.mqtt_port,
            client_id: config.client_id.clone(),
            username,
            password,
            keep_alive: Duration::from_secs(config.keep_alive_secs),
            clean_session: config.clean_session,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

/// An open protocol session over an established transport.
pub trait MqttSession {
    fn publish(
        &mut self,
        topic: &str,
        id: MessageId,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), SessionError>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError>;

    /// Services the session for at most `timeout`, handing each inbound
    /// publish to `handler` before returning. Protocol errors are absorbed.
    fn poll(&mut self, timeout: Duration, handler: &mut dyn MessageHandler);

    /// Closes the protocol session and then the transport.
    fn disconnect(&mut self) -> Result<(), SessionError>;
}

/// Opens transport and protocol session in one step.
pub trait Connector {
    type Session: MqttSession;

    fn connect(&mut self, settings: &BrokerSettings) -> Result<Self::Session, SessionError>;
}

/// Sole owner of the broker session and the topics bound to it.
#[derive(Debug)]
pub struct ConnectionManager<S: MqttSession> {
    session: Option<S>,
    topics: TopicSet,
    subscriptions: heapless::Vec<TopicName, MAX_SUBSCRIPTIONS>,
}

impl<S: MqttSession> ConnectionManager<S> {
    /// Connects, materializes topics and subscribes to the command topic.
    ///
    /// Any failure after the transport is up tears the session down before
    /// the error is returned.
    pub fn connect<C>(connector: &mut C, config: &AgentConfig) -> Result<Self, AgentError>
    where
        C: Connector<Session = S>,
    {
        let settings = BrokerSettings::from_config(config);
        info!("connecting to {}:{}", settings.host, settings.port);

        let session =
            connector
                .connect(&settings)
                .map_err(|source| AgentError::Connection {
                    host: settings.host.clone(),
                    port: settings.port,
                    source,
                })?;

        let topics = match TopicSet::materialize(&config.topics, &config.client_id) {
            Ok(topics) => topics,
            Err(err) => {
                Self::close(session, "topic setup");
                return Err(err.into());
            }
        };

        let mut manager = Self {
            session: Some(session),
            topics,
            subscriptions: heapless::Vec::new(),
        };

        let command_topic = manager.topics.command.clone();
        if let Err(err) = manager.subscribe(command_topic, QoS::AtMostOnce) {
            manager.teardown();
            return Err(err);
        }

        Ok(manager)
    }

    pub fn topics(&self) -> &TopicSet {
        &self.topics
    }

    pub fn subscriptions(&self) -> &[TopicName] {
        &self.subscriptions
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn subscribe(&mut self, topic: TopicName, qos: QoS) -> Result<(), AgentError> {
        if self.subscriptions.is_full() {
            return Err(AgentError::Subscribe {
                topic: topic.to_string(),
                source: SessionError::SubscriptionLimit(MAX_SUBSCRIPTIONS),
            });
        }

        let session = self.session.as_mut().ok_or_else(|| AgentError::Subscribe {
            topic: topic.to_string(),
            source: SessionError::NotConnected,
        })?;

        session
            .subscribe(topic.as_str(), qos)
            .map_err(|source| AgentError::Subscribe {
                topic: topic.to_string(),
                source,
            })?;

        info!("subscribed to `{topic}`");
        self.subscriptions
            .push(topic)
            .map_err(|topic| AgentError::Subscribe {
                topic: topic.to_string(),
                source: SessionError::SubscriptionLimit(MAX_SUBSCRIPTIONS),
            })
    }

    pub fn publish(
        &mut self,
        topic: &str,
        id: MessageId,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        match self.session.as_mut() {
            Some(session) => session.publish(topic, id, qos, payload),
            None => Err(SessionError::NotConnected),
        }
    }

    /// Publishes on the materialized stream topic.
    pub fn publish_stream(&mut self, id: MessageId, payload: &[u8]) -> Result<(), SessionError> {
        let topic = self.topics.stream.clone();
        self.publish(topic.as_str(), id, QoS::AtMostOnce, payload)
    }

    pub fn poll(&mut self, timeout: Duration, handler: &mut dyn MessageHandler) {
        match self.session.as_mut() {
            Some(session) => session.poll(timeout, handler),
            None => std::thread::sleep(timeout),
        }
    }

    /// Best-effort disconnect. Errors are logged, never returned.
    pub fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            Self::close(session, "teardown");
        }
        self.subscriptions.clear();
    }

    fn close(mut session: S, reason: &str) {
        match session.disconnect() {
            Ok(()) => info!("disconnected from broker ({reason})"),
            Err(err) => warn!("disconnect during {reason} failed: {err}"),
        }
    }
}
