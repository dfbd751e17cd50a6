use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use log::{debug, info};

use crate::types::StreamingState;

/// Pending acquisition request raised by the stream timer.
///
/// Requests coalesce: raising an already pending flag is a no-op.
#[derive(Debug, Clone, Default)]
pub struct AcquisitionFlag(Arc<AtomicBool>);

impl AcquisitionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Clears the flag, returning whether a request was pending.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Auto-repeating timer supplied by the target. Each expiry must call
/// [`AcquisitionFlag::raise`] on the flag it was created with.
pub trait PeriodicTimer {
    fn start(&mut self);
    fn stop(&mut self);
}

/// Streaming state machine bound to the timer it controls.
#[derive(Debug)]
pub struct StreamSchedule<T> {
    state: StreamingState,
    timer: T,
}

impl<T: PeriodicTimer> StreamSchedule<T> {
    pub fn new(timer: T) -> Self {
        Self {
            state: StreamingState::Stopped,
            timer,
        }
    }

    pub fn state(&self) -> StreamingState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == StreamingState::Running
    }

    /// Returns `true` when the schedule transitioned to running.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            debug!("stream already running; start ignored");
            return false;
        }
        self.timer.start();
        self.state = StreamingState::Running;
        info!("data stream started");
        true
    }

    /// Returns `true` when the schedule transitioned to stopped.
    pub fn stop(&mut self) -> bool {
        if !self.is_running() {
            debug!("stream already stopped; stop ignored");
            return false;
        }
        self.timer.stop();
        self.state = StreamingState::Stopped;
        info!("data stream stopped");
        true
    }

    pub fn timer(&self) -> &T {
        &self.timer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct CountingTimer {
        running: bool,
        starts: u32,
        stops: u32,
    }

    impl PeriodicTimer for CountingTimer {
        fn start(&mut self) {
            self.running = true;
            self.starts += 1;
        }

        fn stop(&mut self) {
            self.running = false;
            self.stops += 1;
        }
    }

    #[test]
    fn flag_coalesces_requests() {
        let flag = AcquisitionFlag::new();
        let timer_side = flag.clone();

        timer_side.raise();
        timer_side.raise();

        assert!(flag.take());
        assert!(!flag.take());
    }

    #[test]
    fn schedule_starts_stopped() {
        let schedule = StreamSchedule::new(CountingTimer::default());
        assert_eq!(schedule.state(), StreamingState::Stopped);
        assert!(!schedule.timer().running);
    }

    #[test]
    fn start_and_stop_drive_timer() {
        let mut schedule = StreamSchedule::new(CountingTimer::default());

        assert!(schedule.start());
        assert_eq!(schedule.state(), StreamingState::Running);
        assert!(schedule.timer().running);

        assert!(schedule.stop());
        assert_eq!(schedule.state(), StreamingState::Stopped);
        assert!(!schedule.timer().running);
    }

    #[test]
    fn repeated_start_does_not_restart_timer() {
        let mut schedule = StreamSchedule::new(CountingTimer::default());

        assert!(schedule.start());
        assert!(!schedule.start());
        assert_eq!(schedule.timer().starts, 1);

        assert!(schedule.stop());
        assert!(!schedule.stop());
        assert_eq!(schedule.timer().stops, 1);
    }
}
