use serde::{Deserialize, Serialize};

use crate::topics::TopicTemplates;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub client_id: String,
    pub stream_period_ms: u64,
    pub yield_timeout_ms: u64,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    pub connect_timeout_ms: u64,
    pub watchdog_timeout_secs: u32,
    #[serde(default)]
    pub topics: TopicTemplates,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            client_id: "xdk-streamer".to_string(),
            stream_period_ms: 1_000,
            yield_timeout_ms: 1_000,
            keep_alive_secs: 100,
            clean_session: true,
            connect_timeout_ms: 10_000,
            watchdog_timeout_secs: 90,
            topics: TopicTemplates::default(),
            network: NetworkConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

impl AgentConfig {
    pub fn sanitize(&mut self) {
        let client_id = self.client_id.trim();
        self.client_id = if client_id.is_empty() {
            Self::default().client_id
        } else {
            client_id.to_string()
        };

        self.stream_period_ms = self.stream_period_ms.clamp(100, 60_000);
        self.yield_timeout_ms = self.yield_timeout_ms.clamp(10, 10_000);
        // rumqttc rejects keep-alive intervals below 5 seconds.
        self.keep_alive_secs = self.keep_alive_secs.clamp(5, 3_600);
        self.connect_timeout_ms = self.connect_timeout_ms.clamp(1_000, 120_000);
        self.watchdog_timeout_secs = self.watchdog_timeout_secs.clamp(5, 600);

        if self.network.mqtt_port == 0 {
            self.network.mqtt_port = 1883;
        }
    }

    /// Broker credentials, if a username is configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.network.mqtt_user.is_empty() {
            None
        } else {
            Some((
                self.network.mqtt_user.as_str(),
                self.network.mqtt_pass.as_str(),
            ))
        }
    }
}
