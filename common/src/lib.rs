pub mod buffer;
pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod schedule;
pub mod session;
pub mod topics;
pub mod types;
pub mod worker;

pub use buffer::{TelemetryBuffer, TELEMETRY_BUFFER_CAPACITY};
pub use command::{Command, CommandDispatcher, MessageHandler};
pub use config::{AgentConfig, NetworkConfig};
pub use error::{AcquisitionError, AgentError, BufferError, CommandError, SessionError, TopicError};
pub use lifecycle::{initialize, shutdown, AgentParts};
pub use schedule::{AcquisitionFlag, PeriodicTimer, StreamSchedule};
pub use session::{BrokerSettings, ConnectionManager, Connector, MqttSession, MAX_SUBSCRIPTIONS};
pub use topics::*;
pub use types::{MessageId, QoS, SensorSample, Step, StreamingState, TelemetryDocument};
pub use worker::{Acquisition, LoopStats, Watchdog, WorkerLoop};
