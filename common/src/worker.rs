use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    buffer::TelemetryBuffer,
    command::CommandDispatcher,
    error::AcquisitionError,
    schedule::{AcquisitionFlag, PeriodicTimer},
    session::{ConnectionManager, MqttSession},
    types::{MessageId, Step, StreamingState},
};

/// Hardware or software liveness monitor.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Sensor acquisition routine that fills the telemetry buffer.
pub trait Acquisition {
    fn collect(&mut self, buffer: &mut TelemetryBuffer) -> Result<(), AcquisitionError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub iterations: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub acquisitions: u64,
    pub acquisition_failures: u64,
    pub polls: u64,
}

/// Single cooperative worker.
///
/// Every iteration feeds the watchdog and then runs exactly one of, in
/// priority order: publish the buffered batch, run a pending acquisition,
/// or poll the session for inbound commands.
pub struct WorkerLoop<S: MqttSession, T, W, A> {
    connection: ConnectionManager<S>,
    dispatcher: CommandDispatcher<T>,
    watchdog: W,
    acquisition: A,
    flag: AcquisitionFlag,
    buffer: TelemetryBuffer,
    message_id: MessageId,
    yield_timeout: Duration,
    stats: LoopStats,
}

impl<S, T, W, A> WorkerLoop<S, T, W, A>
where
    S: MqttSession,
    T: PeriodicTimer,
    W: Watchdog,
    A: Acquisition,
{
    pub fn new(
        connection: ConnectionManager<S>,
        dispatcher: CommandDispatcher<T>,
        watchdog: W,
        acquisition: A,
        flag: AcquisitionFlag,
        yield_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            dispatcher,
            watchdog,
            acquisition,
            flag,
            buffer: TelemetryBuffer::new(),
            message_id: MessageId::default(),
            yield_timeout,
            stats: LoopStats::default(),
        }
    }

    pub fn step(&mut self) -> Step {
        self.watchdog.feed();
        self.stats.iterations = self.stats.iterations.wrapping_add(1);

        if !self.buffer.is_empty() {
            self.publish_buffer()
        } else if self.flag.is_pending() {
            self.acquire();
            Step::Acquired
        } else {
            self.stats.polls = self.stats.polls.wrapping_add(1);
            self.connection.poll(self.yield_timeout, &mut self.dispatcher);
            Step::Yielded
        }
    }

    pub fn run(&mut self) -> ! {
        info!("worker loop started");
        loop {
            self.step();
        }
    }

    /// Runs until `running` is cleared.
    pub fn run_while(&mut self, running: &AtomicBool) {
        info!("worker loop started");
        while running.load(Ordering::Acquire) {
            self.step();
        }
        info!("worker loop stopped after {} iterations", self.stats.iterations);
    }

    /// Stops the stream timer and tears the connection down.
    pub fn shutdown(mut self) -> LoopStats {
        self.dispatcher.schedule_mut().stop();
        self.connection.teardown();
        info!(
            "shutdown: {} published, {} failed, {} acquisitions",
            self.stats.publishes, self.stats.publish_failures, self.stats.acquisitions
        );
        self.stats
    }

    fn publish_buffer(&mut self) -> Step {
        let id = self.message_id.next();
        let len = self.buffer.len();
        debug!("publishing sensor stream #{} ({len} bytes)", id.get());

        match self.connection.publish_stream(id, self.buffer.as_slice()) {
            Ok(()) => self.stats.publishes = self.stats.publishes.wrapping_add(1),
            Err(err) => {
                self.stats.publish_failures = self.stats.publish_failures.wrapping_add(1);
                warn!("stream publish #{} dropped: {err}", id.get());
            }
        }

        // At-most-once: the batch is gone whether or not the publish made it.
        self.buffer.clear();
        Step::Published { id, len }
    }

    fn acquire(&mut self) {
        debug!("preparing stream");
        match self.acquisition.collect(&mut self.buffer) {
            Ok(()) => self.stats.acquisitions = self.stats.acquisitions.wrapping_add(1),
            Err(err) => {
                self.stats.acquisition_failures = self.stats.acquisition_failures.wrapping_add(1);
                self.buffer.clear();
                warn!("acquisition failed: {err}");
            }
        }
        self.flag.take();
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    pub fn streaming_state(&self) -> StreamingState {
        self.dispatcher.state()
    }

    pub fn buffer(&self) -> &TelemetryBuffer {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut TelemetryBuffer {
        &mut self.buffer
    }

    pub fn next_message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn connection(&self) -> &ConnectionManager<S> {
        &self.connection
    }

    pub fn dispatcher(&self) -> &CommandDispatcher<T> {
        &self.dispatcher
    }

    pub fn watchdog(&self) -> &W {
        &self.watchdog
    }

    pub fn acquisition(&self) -> &A {
        &self.acquisition
    }
}
