use core::convert::TryInto;
use std::{
    sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht11;
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS as EspQoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    timer::{EspTaskTimerService, EspTimer},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use one_wire_bus::{Address, OneWire};

use streamer_common::{
    initialize, Acquisition, AcquisitionError, AcquisitionFlag, AgentConfig, AgentParts,
    BrokerSettings, Connector, MessageHandler, MessageId, MqttSession, NetworkConfig,
    PeriodicTimer, QoS, SensorSample, SessionError, TelemetryBuffer, TelemetryDocument, TopicName,
    Watchdog, MAX_SUBSCRIPTIONS,
};

const NVS_NAMESPACE: &str = "streamer";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const DS18B20_PIN: i32 = 4;
const DHT11_PIN: i32 = 16;

const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const INBOUND_QUEUE_DEPTH: usize = 8;
const MAX_INBOUND_PAYLOAD_BYTES: usize = 512;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut config = load_agent_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load agent config from NVS: {err:#}");
        AgentConfig::default()
    });
    ensure_wifi_defaults(&mut config.network);
    config.sanitize();

    let mut watchdog = TaskWatchdog::register(config.watchdog_timeout_secs)?;
    watchdog.feed();

    let Peripherals { modem, pins, .. } = Peripherals::take()?;
    let sensors = SensorSuite::new(pins.gpio4.downgrade(), pins.gpio16.downgrade())
        .context("failed to initialize sensor suite")?;

    let _wifi = connect_wifi(modem, sys_loop, nvs_partition, &config.network, &mut watchdog)
        .context("wifi startup failed")?;
    info!("wifi connected");

    let flag = AcquisitionFlag::new();
    let timer_service = EspTaskTimerService::new()?;
    let timer = EspStreamTimer::new(
        &timer_service,
        Duration::from_millis(config.stream_period_ms),
        flag.clone(),
    )?;

    let parts = AgentParts {
        timer,
        watchdog,
        acquisition: sensors,
        flag,
    };

    let mut connector = EspConnector;
    let mut worker = match initialize(&config, &mut connector, parts) {
        Ok(worker) => worker,
        Err(err) => {
            warn!("agent initialization failed: {err:#}; restarting");
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
    };

    worker.run()
}

fn load_agent_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<AgentConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 4096];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<AgentConfig>(value)?),
        None => Ok(AgentConfig::default()),
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if network.wifi_pass.is_empty() {
        network.wifi_pass = option_env!("WIFI_PASS").unwrap_or("CHANGE_ME").to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
    watchdog: &mut TaskWatchdog,
) -> anyhow::Result<EspWifi<'static>> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        watchdog.feed();
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        return Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err:#}"
        ));
    }

    drop(wifi);
    Ok(esp_wifi)
}

/// Hardware task watchdog, with the calling task registered.
struct TaskWatchdog;

impl TaskWatchdog {
    fn register(timeout_sec: u32) -> anyhow::Result<Self> {
        let config = esp_idf_svc::sys::esp_task_wdt_config_t {
            timeout_ms: timeout_sec.saturating_mul(1000),
            idle_core_mask: 0,
            trigger_panic: true,
        };
        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
        if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
            return Err(anyhow!("esp_task_wdt_init failed with code {}", rc));
        }

        let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
        if rc != esp_idf_svc::sys::ESP_OK && rc != esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
            return Err(anyhow!("esp_task_wdt_add failed with code {}", rc));
        }

        Ok(Self)
    }
}

impl Watchdog for TaskWatchdog {
    fn feed(&mut self) {
        let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
    }
}

struct EspStreamTimer {
    timer: EspTimer<'static>,
    period: Duration,
}

impl EspStreamTimer {
    fn new(
        service: &EspTaskTimerService,
        period: Duration,
        flag: AcquisitionFlag,
    ) -> anyhow::Result<Self> {
        let timer = service
            .timer(move || flag.raise())
            .context("failed to create stream timer")?;
        Ok(Self { timer, period })
    }
}

impl PeriodicTimer for EspStreamTimer {
    fn start(&mut self) {
        if let Err(err) = self.timer.every(self.period) {
            warn!("failed to start stream timer: {err:?}");
        }
    }

    fn stop(&mut self) {
        if let Err(err) = self.timer.cancel() {
            warn!("failed to stop stream timer: {err:?}");
        }
    }
}

enum Inbound {
    Connected,
    Disconnected,
    Message { topic: String, payload: Vec<u8> },
}

fn to_esp_qos(qos: QoS) -> EspQoS {
    match qos {
        QoS::AtMostOnce => EspQoS::AtMostOnce,
        QoS::AtLeastOnce => EspQoS::AtLeastOnce,
        QoS::ExactlyOnce => EspQoS::ExactlyOnce,
    }
}

struct EspConnector;

impl Connector for EspConnector {
    type Session = EspSession;

    fn connect(&mut self, settings: &BrokerSettings) -> Result<EspSession, SessionError> {
        let url = format!("mqtt://{}:{}", settings.host, settings.port);
        let conf = MqttClientConfiguration {
            client_id: Some(settings.client_id.as_str()),
            username: settings.username.as_deref(),
            password: settings.password.as_deref(),
            keep_alive_interval: Some(settings.keep_alive),
            disable_clean_session: !settings.clean_session,
            ..Default::default()
        };

        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|err| SessionError::Connect(format!("{err:?}")))?;

        let (tx, inbound) = mpsc::sync_channel(INBOUND_QUEUE_DEPTH);
        spawn_receiver(conn, tx).map_err(|err| SessionError::Connect(err.to_string()))?;

        let timeout_ms = settings.connect_timeout.as_millis() as u64;
        let deadline = Instant::now() + settings.connect_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match inbound.recv_timeout(remaining) {
                Ok(Inbound::Connected) => break,
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SessionError::ConnectTimeout(timeout_ms))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SessionError::Connect("mqtt receiver exited".to_string()))
                }
            }
        }
        info!("mqtt connected");

        Ok(EspSession {
            client: Some(client),
            inbound,
            subscriptions: heapless::Vec::new(),
        })
    }
}

fn spawn_receiver(mut conn: EspMqttConnection, tx: SyncSender<Inbound>) -> std::io::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || {
            while let Ok(event) = conn.next() {
                let inbound = match event.payload() {
                    EventPayload::Connected(_) => Inbound::Connected,
                    EventPayload::Disconnected => Inbound::Disconnected,
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > MAX_INBOUND_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        Inbound::Message {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        }
                    }
                    _ => continue,
                };

                match tx.try_send(inbound) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => warn!("inbound queue full, dropping event"),
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            info!("mqtt receiver stopped");
        })?;
    Ok(())
}

struct EspSession {
    client: Option<EspMqttClient<'static>>,
    inbound: Receiver<Inbound>,
    subscriptions: heapless::Vec<(TopicName, EspQoS), MAX_SUBSCRIPTIONS>,
}

impl EspSession {
    fn resubscribe(&mut self) {
        let Some(client) = self.client.as_mut() else {
            return;
        };
        for (topic, qos) in &self.subscriptions {
            if let Err(err) = client.subscribe(topic.as_str(), *qos) {
                warn!("mqtt re-subscribe to `{topic}` failed: {err:?}");
            }
        }
    }
}

impl MqttSession for EspSession {
    fn publish(
        &mut self,
        topic: &str,
        _id: MessageId,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        client
            .publish(topic, to_esp_qos(qos), false, payload)
            .map(|_| ())
            .map_err(|err| SessionError::Publish(format!("{err:?}")))
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        let name =
            TopicName::new(topic).map_err(|err| SessionError::Subscribe(err.to_string()))?;
        if self.subscriptions.is_full() {
            return Err(SessionError::SubscriptionLimit(MAX_SUBSCRIPTIONS));
        }
        let qos = to_esp_qos(qos);
        let client = self.client.as_mut().ok_or(SessionError::NotConnected)?;
        client
            .subscribe(topic, qos)
            .map_err(|err| SessionError::Subscribe(format!("{err:?}")))?;
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

            match self.inbound.recv_timeout(remaining) {
                Ok(Inbound::Message { topic, payload }) => handler.handle(&topic, &payload),
                Ok(Inbound::Connected) => {
                    info!("mqtt reconnected");
                    self.resubscribe();
                }
                Ok(Inbound::Disconnected) => warn!("mqtt disconnected"),
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(remaining);
                    return;
                }
            }
        }
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        // Dropping the client closes the session and its socket.
        self.client.take();
        Ok(())
    }
}

struct SensorSuite {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    ds18_address: Option<Address>,
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
    seq: u64,
}

impl SensorSuite {
    fn new(ds18_pin: AnyIOPin, dht_pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(ds18_pin)?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let mut dht_pin = PinDriver::input_output_od(dht_pin)?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut suite = Self {
            one_wire,
            ds18_address: None,
            dht_pin,
            delay: Ets,
            seq: 0,
        };

        suite.refresh_ds18_address();
        Ok(suite)
    }

    fn refresh_ds18_address(&mut self) {
        self.ds18_address = None;
        for addr in self.one_wire.devices(false, &mut self.delay) {
            match addr {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    self.ds18_address = Some(address);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        match self.ds18_address {
            Some(address) => info!("DS18B20 ready on GPIO{DS18B20_PIN} ({address:?})"),
            None => warn!("no DS18B20 found on GPIO{DS18B20_PIN}"),
        }
    }

    fn read_temperature_c(&mut self) -> Option<f32> {
        if self.ds18_address.is_none() {
            self.refresh_ds18_address();
        }

        let address = self.ds18_address?;
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                self.ds18_address = None;
                return None;
            }
        };

        if let Err(err) =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay)
        {
            warn!("failed to start DS18B20 conversion: {err:?}");
            self.ds18_address = None;
            return None;
        }

        Resolution::Bits12.delay_for_measurement_time(&mut self.delay);

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => Some(data.temperature),
            Err(err) => {
                warn!("failed to read DS18B20 data: {err:?}");
                self.ds18_address = None;
                None
            }
        }
    }

    fn read_humidity(&mut self) -> Option<f32> {
        if let Err(err) = self.dht_pin.set_high() {
            warn!("failed to set DHT11 line high before read: {err:?}");
            return None;
        }

        match dht11::blocking::read(&mut self.delay, &mut self.dht_pin) {
            Ok(reading) => Some(reading.relative_humidity as f32),
            Err(err) => {
                warn!("failed to read DHT11 humidity on GPIO{DHT11_PIN}: {err:?}");
                None
            }
        }
    }
}

impl Acquisition for SensorSuite {
    fn collect(&mut self, buffer: &mut TelemetryBuffer) -> Result<(), AcquisitionError> {
        let temperature_c = self.read_temperature_c();
        let humidity = self.read_humidity();
        if temperature_c.is_none() && humidity.is_none() {
            return Err(AcquisitionError::Sensor(
                "no sensor produced a reading".to_string(),
            ));
        }

        self.seq = self.seq.wrapping_add(1);
        let document = TelemetryDocument {
            d: SensorSample {
                seq: self.seq,
                timestamp_ms: None,
                temperature_c,
                humidity,
            },
        };
        buffer.write_json(&document)?;
        Ok(())
    }
}
