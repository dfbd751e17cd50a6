use thiserror::Error;

/// Fatal initialization failures.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to connect to broker {host}:{port}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: SessionError,
    },
    #[error("failed to subscribe to `{topic}`")]
    Subscribe {
        topic: String,
        #[source]
        source: SessionError,
    },
    #[error("invalid topic configuration")]
    Topic(#[from] TopicError),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0} ms")]
    ConnectTimeout(u64),
    #[error("broker refused connection: {0}")]
    Refused(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("disconnect failed: {0}")]
    Disconnect(String),
    #[error("session is not connected")]
    NotConnected,
    #[error("subscription limit of {0} reached")]
    SubscriptionLimit(usize),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("topic of {len} bytes exceeds capacity of {capacity}")]
    TooLong { len: usize, capacity: usize },
    #[error("client id must not be empty")]
    EmptyClientId,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("telemetry batch of {needed} bytes exceeds capacity of {capacity}")]
    Overflow { needed: usize, capacity: usize },
    #[error("failed to encode telemetry: {0}")]
    Encode(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("payload is not a JSON document: {0}")]
    Malformed(String),
    #[error("payload has no string field d.action")]
    MissingAction,
    #[error("unrecognized action `{0}`")]
    Unrecognized(String),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error("sensor read failed: {0}")]
    Sensor(String),
}
