use std::{
    cell::RefCell,
    collections::VecDeque,
    rc::Rc,
    sync::atomic::AtomicBool,
    time::Duration,
};

use pretty_assertions::assert_eq;
use streamer_common::{
    initialize, shutdown, Acquisition, AcquisitionError, AcquisitionFlag, AgentConfig, AgentError,
    AgentParts, BrokerSettings, Connector, MessageHandler, MessageId, MqttSession, PeriodicTimer,
    QoS, SessionError, Step, StreamingState, TelemetryBuffer, Watchdog, WorkerLoop,
};

const COMMAND_TOPIC: &str = "xdk/xdk-test/cmd/voice";
const STREAM_TOPIC: &str = "xdk/xdk-test/evt/stream";

#[derive(Debug, Default)]
struct BrokerLog {
    publishes: Vec<(String, MessageId, Vec<u8>)>,
    subscriptions: Vec<String>,
    inbound: VecDeque<(String, Vec<u8>)>,
    polls: usize,
    disconnects: usize,
    fail_publish: bool,
}

type SharedLog = Rc<RefCell<BrokerLog>>;

#[derive(Debug)]
struct ScriptedSession {
    log: SharedLog,
}

impl MqttSession for ScriptedSession {
    fn publish(
        &mut self,
        topic: &str,
        id: MessageId,
        qos: QoS,
        payload: &[u8],
    ) -> Result<(), SessionError> {
        assert_eq!(qos, QoS::AtMostOnce);
        let mut log = self.log.borrow_mut();
        log.publishes
            .push((topic.to_string(), id, payload.to_vec()));
        if log.fail_publish {
            Err(SessionError::Publish("socket closed".to_string()))
        } else {
            Ok(())
        }
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> Result<(), SessionError> {
        self.log.borrow_mut().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration, handler: &mut dyn MessageHandler) {
        let pending: Vec<_> = {
            let mut log = self.log.borrow_mut();
            log.polls += 1;
            log.inbound.drain(..).collect()
        };
        for (topic, payload) in pending {
            handler.handle(&topic, &payload);
        }
    }

    fn disconnect(&mut self) -> Result<(), SessionError> {
        self.log.borrow_mut().disconnects += 1;
        Ok(())
    }
}

struct ScriptedConnector {
    log: SharedLog,
    refuse: bool,
}

impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    fn connect(&mut self, _settings: &BrokerSettings) -> Result<ScriptedSession, SessionError> {
        if self.refuse {
            return Err(SessionError::Connect("connection refused".to_string()));
        }
        Ok(ScriptedSession {
            log: self.log.clone(),
        })
    }
}

/// Timer driven by the test: `fire` stands in for a period expiring.
#[derive(Debug)]
struct ManualTimer {
    flag: AcquisitionFlag,
    running: bool,
}

impl ManualTimer {
    fn fire(&self) {
        if self.running {
            self.flag.raise();
        }
    }
}

impl PeriodicTimer for ManualTimer {
    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

#[derive(Debug, Default)]
struct CountingWatchdog {
    feeds: usize,
}

impl Watchdog for CountingWatchdog {
    fn feed(&mut self) {
        self.feeds += 1;
    }
}

#[derive(Debug, Default)]
struct FixedAcquisition {
    calls: usize,
    batch_len: usize,
    fail: bool,
}

impl Acquisition for FixedAcquisition {
    fn collect(&mut self, buffer: &mut TelemetryBuffer) -> Result<(), AcquisitionError> {
        self.calls += 1;
        if self.fail {
            buffer.fill(b"partial")?;
            return Err(AcquisitionError::Sensor("bus timeout".to_string()));
        }
        buffer.fill(&vec![0x5A; self.batch_len])?;
        Ok(())
    }
}

type TestWorker = WorkerLoop<ScriptedSession, ManualTimer, CountingWatchdog, FixedAcquisition>;

fn config() -> AgentConfig {
    AgentConfig {
        client_id: "xdk-test".to_string(),
        yield_timeout_ms: 10,
        ..AgentConfig::default()
    }
}

fn worker_with(acquisition: FixedAcquisition) -> (TestWorker, SharedLog, AcquisitionFlag) {
    let log = SharedLog::default();
    let flag = AcquisitionFlag::new();
    let mut connector = ScriptedConnector {
        log: log.clone(),
        refuse: false,
    };
    let parts = AgentParts {
        timer: ManualTimer {
            flag: flag.clone(),
            running: false,
        },
        watchdog: CountingWatchdog::default(),
        acquisition,
        flag: flag.clone(),
    };

    let worker = initialize(&config(), &mut connector, parts).unwrap();
    (worker, log, flag)
}

fn worker() -> (TestWorker, SharedLog, AcquisitionFlag) {
    worker_with(FixedAcquisition {
        batch_len: 16,
        ..FixedAcquisition::default()
    })
}

fn send(log: &SharedLog, topic: &str, payload: &str) {
    log.borrow_mut()
        .inbound
        .push_back((topic.to_string(), payload.as_bytes().to_vec()));
}

#[test]
fn initialize_subscribes_only_command_topic() {
    let (worker, log, _) = worker();

    assert_eq!(log.borrow().subscriptions, vec![COMMAND_TOPIC]);
    assert_eq!(worker.streaming_state(), StreamingState::Stopped);
    assert!(!worker.dispatcher().schedule().timer().running);
    assert_eq!(worker.watchdog().feeds, 2);
}

#[test]
fn initialize_connection_failure_is_fatal() {
    let flag = AcquisitionFlag::new();
    let mut connector = ScriptedConnector {
        log: SharedLog::default(),
        refuse: true,
    };
    let parts = AgentParts {
        timer: ManualTimer {
            flag: flag.clone(),
            running: false,
        },
        watchdog: CountingWatchdog::default(),
        acquisition: FixedAcquisition::default(),
        flag,
    };

    let result = initialize(&config(), &mut connector, parts);
    assert!(matches!(result, Err(AgentError::Connection { .. })));
}

#[test]
fn watchdog_fed_once_per_iteration_on_every_branch() {
    let (mut worker, _, flag) = worker();
    let before = worker.watchdog().feeds;

    assert_eq!(worker.step(), Step::Yielded);
    flag.raise();
    assert_eq!(worker.step(), Step::Acquired);
    assert!(matches!(worker.step(), Step::Published { .. }));

    assert_eq!(worker.watchdog().feeds, before + 3);
    assert_eq!(worker.stats().iterations, 3);
}

#[test]
fn publish_takes_priority_over_pending_acquisition() {
    let (mut worker, log, flag) = worker();
    worker.buffer_mut().fill(b"queued").unwrap();
    flag.raise();

    assert!(matches!(worker.step(), Step::Published { len: 6, .. }));
    assert_eq!(worker.acquisition().calls, 0);
    assert!(flag.is_pending());

    assert_eq!(worker.step(), Step::Acquired);
    assert_eq!(worker.acquisition().calls, 1);
    assert_eq!(log.borrow().polls, 0);
}

#[test]
fn buffered_batch_of_42_bytes_is_published_once() {
    let (mut worker, log, _) = worker();
    worker.buffer_mut().fill(&[0xAB; 42]).unwrap();

    let step = worker.step();

    assert_eq!(
        step,
        Step::Published {
            id: MessageId::new(0),
            len: 42
        }
    );
    let log = log.borrow();
    assert_eq!(log.publishes.len(), 1);
    let (topic, id, payload) = &log.publishes[0];
    assert_eq!(topic, STREAM_TOPIC);
    assert_eq!(*id, MessageId::new(0));
    assert_eq!(payload.len(), 42);
    assert_eq!(worker.buffer().len(), 0);
}

#[test]
fn failed_publish_still_clears_buffer() {
    let (mut worker, log, _) = worker();
    log.borrow_mut().fail_publish = true;
    worker.buffer_mut().fill(&[1; 8]).unwrap();

    assert!(matches!(worker.step(), Step::Published { len: 8, .. }));

    assert!(worker.buffer().is_empty());
    assert_eq!(worker.stats().publish_failures, 1);
    assert_eq!(worker.stats().publishes, 0);
    assert_eq!(worker.step(), Step::Yielded);
}

#[test]
fn message_ids_increase_per_publish() {
    let (mut worker, log, _) = worker();

    for _ in 0..3 {
        worker.buffer_mut().fill(b"x").unwrap();
        worker.step();
    }

    let ids: Vec<u32> = log
        .borrow()
        .publishes
        .iter()
        .map(|(_, id, _)| id.get())
        .collect();
    assert_eq!(ids, vec![0, 1, 2]);
    assert_eq!(worker.next_message_id(), MessageId::new(3));
}

#[test]
fn coalesced_requests_acquire_once() {
    let (mut worker, _, flag) = worker();
    flag.raise();
    flag.raise();

    assert_eq!(worker.step(), Step::Acquired);
    assert!(!flag.is_pending());
    assert_eq!(worker.acquisition().calls, 1);

    assert!(matches!(worker.step(), Step::Published { len: 16, .. }));
    assert_eq!(worker.step(), Step::Yielded);
    assert_eq!(worker.acquisition().calls, 1);
}

#[test]
fn failed_acquisition_clears_flag_and_buffer() {
    let (mut worker, log, flag) = worker_with(FixedAcquisition {
        fail: true,
        ..FixedAcquisition::default()
    });
    flag.raise();

    assert_eq!(worker.step(), Step::Acquired);
    assert!(!flag.is_pending());
    assert!(worker.buffer().is_empty());
    assert_eq!(worker.stats().acquisition_failures, 1);

    assert_eq!(worker.step(), Step::Yielded);
    assert!(log.borrow().publishes.is_empty());
}

#[test]
fn start_command_runs_stream_end_to_end() {
    let (mut worker, log, flag) = worker();
    send(&log, COMMAND_TOPIC, r#"{"d":{"action":"start"}}"#);

    assert_eq!(worker.step(), Step::Yielded);
    assert_eq!(worker.streaming_state(), StreamingState::Running);
    assert!(worker.dispatcher().schedule().timer().running);

    worker.dispatcher().schedule().timer().fire();
    assert!(flag.is_pending());
    assert_eq!(worker.step(), Step::Acquired);
    assert!(matches!(worker.step(), Step::Published { len: 16, .. }));
    assert_eq!(log.borrow().publishes[0].0, STREAM_TOPIC);
}

#[test]
fn stop_command_halts_timer() {
    let (mut worker, log, flag) = worker();
    send(&log, COMMAND_TOPIC, r#"{"d":{"action":"start"}}"#);
    worker.step();
    send(&log, COMMAND_TOPIC, r#"{"d":{"action":"stop"}}"#);
    worker.step();

    assert_eq!(worker.streaming_state(), StreamingState::Stopped);
    worker.dispatcher().schedule().timer().fire();
    assert!(!flag.is_pending());
}

#[test]
fn bogus_action_is_discarded() {
    let (mut worker, log, _) = worker();
    send(&log, COMMAND_TOPIC, r#"{"d":{"action":"bogus"}}"#);
    send(&log, COMMAND_TOPIC, "{not json");

    assert_eq!(worker.step(), Step::Yielded);
    assert_eq!(worker.streaming_state(), StreamingState::Stopped);
    assert!(!worker.dispatcher().schedule().timer().running);
}

#[test]
fn messages_on_other_topics_are_ignored() {
    let (mut worker, log, _) = worker();
    let led_topic = worker.connection().topics().led_red.to_string();
    send(&log, &led_topic, r#"{"d":{"action":"start"}}"#);

    worker.step();

    assert_eq!(worker.streaming_state(), StreamingState::Stopped);
}

#[test]
fn run_while_exits_when_cleared() {
    let (mut worker, log, _) = worker();
    let running = AtomicBool::new(false);

    worker.run_while(&running);

    assert_eq!(worker.stats().iterations, 0);
    assert_eq!(log.borrow().polls, 0);
}

#[test]
fn shutdown_stops_timer_and_disconnects() {
    let (mut worker, log, _) = worker();
    send(&log, COMMAND_TOPIC, r#"{"d":{"action":"start"}}"#);
    worker.step();
    worker.buffer_mut().fill(b"abc").unwrap();
    worker.step();

    let stats = shutdown(worker);

    assert_eq!(stats.publishes, 1);
    assert_eq!(stats.polls, 1);
    assert_eq!(log.borrow().disconnects, 1);
}
