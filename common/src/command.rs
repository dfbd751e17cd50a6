use log::{info, warn};
use serde_json::Value;

use crate::{
    error::CommandError,
    schedule::{PeriodicTimer, StreamSchedule},
    topics::TopicName,
    types::StreamingState,
};

pub const ACTION_START: &str = "start";
pub const ACTION_STOP: &str = "stop";

/// Receives inbound publishes while the session is polled.
pub trait MessageHandler {
    fn handle(&mut self, topic: &str, payload: &[u8]);
}

impl<F: FnMut(&str, &[u8])> MessageHandler for F {
    fn handle(&mut self, topic: &str, payload: &[u8]) {
        self(topic, payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
}

impl Command {
    /// Parses a `{"d":{"action":"..."}}` document.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        let document: Value = serde_json::from_slice(payload)
            .map_err(|err| CommandError::Malformed(err.to_string()))?;
        let action = document
            .pointer("/d/action")
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingAction)?;

        match action {
            ACTION_START => Ok(Self::Start),
            ACTION_STOP => Ok(Self::Stop),
            other => Err(CommandError::Unrecognized(other.to_string())),
        }
    }
}

/// Maps command-topic messages onto the stream schedule.
#[derive(Debug)]
pub struct CommandDispatcher<T> {
    topic: TopicName,
    schedule: StreamSchedule<T>,
}

impl<T: PeriodicTimer> CommandDispatcher<T> {
    pub fn new(topic: TopicName, schedule: StreamSchedule<T>) -> Self {
        Self { topic, schedule }
    }

    pub fn topic(&self) -> &TopicName {
        &self.topic
    }

    pub fn state(&self) -> StreamingState {
        self.schedule.state()
    }

    pub fn schedule(&self) -> &StreamSchedule<T> {
        &self.schedule
    }

    pub fn schedule_mut(&mut self) -> &mut StreamSchedule<T> {
        &mut self.schedule
    }

    pub fn apply(&mut self, command: Command) {
        match command {
            Command::Start => self.schedule.start(),
            Command::Stop => self.schedule.stop(),
        };
    }
}

impl<T: PeriodicTimer> MessageHandler for CommandDispatcher<T> {
    fn handle(&mut self, topic: &str, payload: &[u8]) {
        if !self.topic.matches(topic) {
            return;
        }

        info!(
            "message on `{}`: {}",
            topic,
            String::from_utf8_lossy(payload)
        );

        match Command::parse(payload) {
            Ok(command) => self.apply(command),
            Err(CommandError::Unrecognized(action)) => {
                warn!("spurious action `{action}`, discarding");
            }
            Err(err) => warn!("discarding command message: {err}"),
        }
    }
}
