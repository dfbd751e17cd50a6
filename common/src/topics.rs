use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TopicError;

/// Scratch capacity for a single topic name.
pub const TOPIC_CAPACITY: usize = 128;

pub const CLIENT_ID_PLACEHOLDER: &str = "{client_id}";

pub const TOPIC_LED_RED: &str = "xdk/cmd/led/red";
pub const TOPIC_LED_ORANGE: &str = "xdk/cmd/led/orange";
pub const TOPIC_LED_YELLOW: &str = "xdk/cmd/led/yellow";
pub const TOPIC_DATA_GET: &str = "xdk/cmd/data/get";
pub const TOPIC_COMMAND_VOICE: &str = "xdk/{client_id}/cmd/voice";
pub const TOPIC_DATA_STREAM: &str = "xdk/{client_id}/evt/stream";

/// Topic name with a fixed upper bound on its length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicName(heapless::String<TOPIC_CAPACITY>);

impl TopicName {
    pub fn new(topic: &str) -> Result<Self, TopicError> {
        let mut name = heapless::String::new();
        name.push_str(topic).map_err(|_| TopicError::TooLong {
            len: topic.len(),
            capacity: TOPIC_CAPACITY,
        })?;
        Ok(Self(name))
    }

    /// Substitutes every `{client_id}` in `template`.
    pub fn materialize(template: &str, client_id: &str) -> Result<Self, TopicError> {
        if client_id.is_empty() {
            return Err(TopicError::EmptyClientId);
        }

        let mut name = heapless::String::<TOPIC_CAPACITY>::new();
        let mut parts = template.split(CLIENT_ID_PLACEHOLDER);
        let overflow = || TopicError::TooLong {
            len: template.len() + client_id.len(),
            capacity: TOPIC_CAPACITY,
        };

        if let Some(first) = parts.next() {
            name.push_str(first).map_err(|_| overflow())?;
        }
        for part in parts {
            name.push_str(client_id).map_err(|_| overflow())?;
            name.push_str(part).map_err(|_| overflow())?;
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.as_str() == topic
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicTemplates {
    pub led_red: String,
    pub led_orange: String,
    pub led_yellow: String,
    pub data_get: String,
    pub command: String,
    pub stream: String,
}

impl Default for TopicTemplates {
    fn default() -> Self {
        Self {
            led_red: TOPIC_LED_RED.to_string(),
            led_orange: TOPIC_LED_ORANGE.to_string(),
            led_yellow: TOPIC_LED_YELLOW.to_string(),
            data_get: TOPIC_DATA_GET.to_string(),
            command: TOPIC_COMMAND_VOICE.to_string(),
            stream: TOPIC_DATA_STREAM.to_string(),
        }
    }
}

/// Topics in use for one session. Built once at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSet {
    pub led_red: TopicName,
    pub led_orange: TopicName,
    pub led_yellow: TopicName,
    pub data_get: TopicName,
    pub command: TopicName,
    pub stream: TopicName,
}

impl TopicSet {
    pub fn materialize(templates: &TopicTemplates, client_id: &str) -> Result<Self, TopicError> {
        Ok(Self {
            led_red: TopicName::new(&templates.led_red)?,
            led_orange: TopicName::new(&templates.led_orange)?,
            led_yellow: TopicName::new(&templates.led_yellow)?,
            data_get: TopicName::new(&templates.data_get)?,
            command: TopicName::materialize(&templates.command, client_id)?,
            stream: TopicName::materialize(&templates.stream, client_id)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn templated_topics_embed_client_id() {
        let topics = TopicSet::materialize(&TopicTemplates::default(), "xdk-42").unwrap();

        assert_eq!(topics.command.as_str(), "xdk/xdk-42/cmd/voice");
        assert_eq!(topics.stream.as_str(), "xdk/xdk-42/evt/stream");
        assert_eq!(topics.led_red.as_str(), TOPIC_LED_RED);
        assert_eq!(topics.data_get.as_str(), TOPIC_DATA_GET);
    }

    #[test]
    fn template_without_placeholder_is_kept_verbatim() {
        let topic = TopicName::materialize("fixed/topic", "abc").unwrap();
        assert_eq!(topic.as_str(), "fixed/topic");
    }

    #[test]
    fn oversized_topic_is_rejected() {
        let client_id = "x".repeat(TOPIC_CAPACITY);
        let err = TopicName::materialize(TOPIC_DATA_STREAM, &client_id).unwrap_err();
        assert!(matches!(err, TopicError::TooLong { capacity: TOPIC_CAPACITY, .. }));
    }

    #[test]
    fn empty_client_id_is_rejected() {
        assert_eq!(
            TopicName::materialize(TOPIC_COMMAND_VOICE, ""),
            Err(TopicError::EmptyClientId)
        );
    }
}
