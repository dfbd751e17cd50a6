use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamingState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Outbound message identifier. Wraps on overflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(u32);

impl MessageId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Returns the current id and advances the counter.
    pub fn next(&mut self) -> MessageId {
        let current = *self;
        self.0 = self.0.wrapping_add(1);
        current
    }
}

/// One sensor reading as published on the stream topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub seq: u64,
    #[serde(rename = "ts", skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<i64>,
    #[serde(rename = "temperature", skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity: Option<f32>,
}

/// Wraps a sample in the `{"d": ...}` envelope the broker side expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryDocument {
    pub d: SensorSample,
}

/// Branch taken by one worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Published { id: MessageId, len: usize },
    Acquired,
    Yielded,
}
