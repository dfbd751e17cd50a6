use std::{
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, RecvTimeoutError,
};
use tokio::{runtime::Handle, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use streamer_common::{
    initialize, shutdown, Acquisition, AcquisitionError, AcquisitionFlag, AgentConfig,
    AgentParts, BrokerSettings, Connector, MessageHandler, MessageId, MqttSession, PeriodicTimer,
    QoS, SensorSample, SessionError, TelemetryBuffer, TelemetryDocument, TopicName, Watchdog,
    MAX_SUBSCRIPTIONS,
};

const MQTT_REQUEST_CAPACITY: usize = 32;
const DISCONNECT_DRAIN_MS: u64 = 500;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = ConfigStore::new();
    let mut config = store.load().unwrap_or_else(|err| {
        warn!("failed to load agent config from store: {err:#}");
        AgentConfig::default()
    });
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.sanitize();

    // Timers and signal handling live on their own runtime; the worker loop
    // stays on the main thread.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("streamer-timer")
        .enable_all()
        .build()
        .context("failed to build timer runtime")?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
                running.store(false, Ordering::Release);
            }
        });
    }

    let flag = AcquisitionFlag::new();
    let parts = AgentParts {
        timer: TokioStreamTimer::new(
            runtime.handle().clone(),
            Duration::from_millis(config.stream_period_ms),
            flag.clone(),
        ),
        watchdog: SoftWatchdog::spawn(Duration::from_secs(u64::from(
            config.watchdog_timeout_secs,
        )))?,
        acquisition: SimulatedSensor::default(),
        flag,
    };

    let mut connector = RumqttConnector {
        capacity: MQTT_REQUEST_CAPACITY,
    };
    let mut worker = initialize(&config, &mut connector, parts)
        .context("agent initialization failed")?;

    info!("agent `{}` started", config.client_id);
    worker.run_while(&running);

    let stats = shutdown(worker);
    info!(
        "agent stopped: {} iterations, {} publishes ({} failed), {} acquisitions",
        stats.iterations, stats.publishes, stats.publish_failures, stats.acquisitions
    );

    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

struct ConfigStore {
    runtime_path: PathBuf,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("STREAMER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.streamer"));

        Self {
            runtime_path: data_dir.join("runtime.json"),
        }
    }

    fn load(&self) -> anyhow::Result<AgentConfig> {
        match std::fs::read(&self.runtime_path) {
            Ok(raw) => serde_json::from_slice::<AgentConfig>(&raw)
                .with_context(|| format!("invalid config in {}", self.runtime_path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(AgentConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(config: &mut AgentConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(host) = lookup("MQTT_HOST") {
        config.network.mqtt_host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.network.mqtt_port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        config.network.mqtt_user = user;
        config.network.mqtt_pass = lookup("MQTT_PASS").unwrap_or_default();
    }
    if let Some(client_id) = lookup("STREAMER_CLIENT_ID") {
        config.client_id = client_id;
    }
}

fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

struct RumqttConnector {
    capacity: usize,
}

impl Connector for RumqttConnector {
    type Session = RumqttSession;

    fn connect(&mut self, settings: &BrokerSettings) -> Result<RumqttSession, SessionError> {
        let mut options =
            MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);
        options.set_clean_session(settings.clean_session);
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            options.set_credentials(user.clone(), pass.clone());
        }

        let (client, mut connection) = Client::new(options, self.capacity);
        let timeout_ms = settings.connect_timeout.as_millis() as u64;
        let deadline = Instant::now() + settings.connect_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::ConnectTimeout(timeout_ms));
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(SessionError::Refused(format!("{:?}", ack.code)));
                    }
                    info!("mqtt connected");
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(SessionError::Connect(err.to_string())),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::ConnectTimeout(timeout_ms))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Connect("event loop closed".to_string()))
                }
            }
        }

        Ok(RumqttSession {
            client,
            connection,
            subscriptions: heapless::Vec::new(),
        })
    }
}

struct RumqttSession {
    client: Client,
    connection: Connection,
    subscriptions: heapless::Vec<(TopicName, rumqttc::QoS), MAX_SUBSCRIPTIONS>,
}

impl RumqttSession {
    fn resubscribe(&mut self) {
        for (topic, qos) in &self.subscriptions {
            if let Err(err) = self.client.try_subscribe(topic.as_str(), *qos) {
                warn!("mqtt re-subscribe to `{topic}` failed: {err}");
            }
        }
    }
}

impl MqttSession for RumqttSession {
    fn publish(
        &mut self,
        topic: &str,
        id: MessageId,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        // QoS 0 publishes carry no packet id; the counter is kept for tracing.
        debug!("queueing publish #{} on `{topic}`", id.get());
        self.client
            .try_publish(topic, to_rumqttc_qos(qos), false, payload.to_vec())
            .map_err(|err| SessionError::Publish(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        let name =
            TopicName::new(topic).map_err(|err| SessionError::Subscribe(err.to_string()))?;
        if self.subscriptions.is_full() {
            return Err(SessionError::SubscriptionLimit(MAX_SUBSCRIPTIONS));
        }
        let qos = to_rumqttc_qos(qos);
        self.client
            .subscribe(topic, qos)
            .map_err(|err| SessionError::Subscribe(err.to_string()))?;
        self.subscriptions
            .push((name, qos))
            .map_err(|_| SessionError::SubscriptionLimit(MAX_SUBSCRIPTIONS))
    }

    fn poll(&mut self, timeout: Duration, handler: &mut dyn MessageHandler) {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }

            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::Publish(message)))) => {
                    handler.handle(&message.topic, &message.payload);
                }
                Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                    info!("mqtt reconnected");
                    self.resubscribe();
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    warn!("mqtt poll error: {err}");
                    // Spend the rest of the budget idle so a dead broker
                    // cannot turn the worker into a busy loop.
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return;
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("mqtt event loop closed");
                    thread::sleep(deadline.saturating_duration_since(Instant::now()));
                    return;
                }
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.client
            .disconnect()
            .map_err(|err| SessionError::Disconnect(err.to_string()))?;

        // Drive the event loop so the DISCONNECT packet reaches the broker.
        let deadline = Instant::now() + Duration::from_millis(DISCONNECT_DRAIN_MS);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.connection.recv_timeout(remaining) {
                Ok(Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect))) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return Ok(()),
            }
        }
    }
}

/// Periodic stream timer running on the tokio runtime.
struct TokioStreamTimer {
    handle: Handle,
    period: Duration,
    flag: AcquisitionFlag,
    task: Option<JoinHandle<()>>,
}

impl TokioStreamTimer {
    fn new(handle: Handle, period: Duration, flag: AcquisitionFlag) -> Self {
        Self {
            handle,
            period,
            flag,
            task: None,
        }
    }
}

impl PeriodicTimer for TokioStreamTimer {
    fn start(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        let flag = self.flag.clone();
        let period = self.period;
        self.task = Some(self.handle.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the first request is one period out.
            interval.tick().await;
            loop {
                interval.tick().await;
                flag.raise();
            }
        }));
        debug!("stream timer armed ({} ms)", period.as_millis());
    }

    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("stream timer disarmed");
        }
    }
}

impl Drop for TokioStreamTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Software stand-in for a hardware watchdog: a monitor thread reports when
/// the worker stops feeding it.
struct SoftWatchdog {
    epoch: Instant,
    last_feed_ms: Arc<AtomicU64>,
}

impl SoftWatchdog {
    fn spawn(timeout: Duration) -> anyhow::Result<Self> {
        let epoch = Instant::now();
        let last_feed_ms = Arc::new(AtomicU64::new(0));
        let monitor_feed = last_feed_ms.clone();
        let timeout_ms = timeout.as_millis() as u64;

        thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                let mut starving = false;
                loop {
                    thread::sleep(Duration::from_secs(1));
                    let now_ms = epoch.elapsed().as_millis() as u64;
                    let since_feed = now_ms.saturating_sub(monitor_feed.load(Ordering::Relaxed));
                    if since_feed > timeout_ms {
                        if !starving {
                            warn!("watchdog starved: no feed for {since_feed} ms");
                        }
                        starving = true;
                    } else {
                        starving = false;
                    }
                }
            })
            .context("failed to spawn watchdog monitor")?;

        Ok(Self {
            epoch,
            last_feed_ms,
        })
    }
}

impl Watchdog for SoftWatchdog {
    fn feed(&mut self) {
        self.last_feed_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::Relaxed);
    }
}

/// Simulated readings for hosts without sensor hardware.
#[derive(Debug, Default)]
struct SimulatedSensor {
    seq: u64,
}

impl SimulatedSensor {
    fn sample(&mut self) -> SensorSample {
        self.seq = self.seq.wrapping_add(1);
        SensorSample {
            seq: self.seq,
            timestamp_ms: Some(chrono::Utc::now().timestamp_millis()),
            temperature_c: Some(20.0 + (self.seq % 8) as f32 * 0.25),
            humidity: Some(42.0 + (self.seq % 6) as f32 * 0.5),
        }
    }
}

impl Acquisition for SimulatedSensor {
    fn collect(&mut self, buffer: &mut TelemetryBuffer) -> Result<(), AcquisitionError> {
        let document = TelemetryDocument { d: self.sample() };
        buffer.write_json(&document)?;
        Ok(())
    }
}
