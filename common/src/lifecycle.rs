use std::time::Duration;

use log::info;

use crate::{
    command::CommandDispatcher,
    config::AgentConfig,
    error::AgentError,
    schedule::{AcquisitionFlag, PeriodicTimer, StreamSchedule},
    session::{ConnectionManager, Connector, MqttSession},
    worker::{Acquisition, LoopStats, Watchdog, WorkerLoop},
};

/// Target-specific collaborators handed to [`initialize`].
///
/// `timer` must already be bound to `flag`; it stays stopped until a start
/// command arrives.
pub struct AgentParts<T, W, A> {
    pub timer: T,
    pub watchdog: W,
    pub acquisition: A,
    pub flag: AcquisitionFlag,
}

/// Connects to the broker and returns a worker ready to run.
pub fn initialize<C, T, W, A>(
    config: &AgentConfig,
    connector: &mut C,
    parts: AgentParts<T, W, A>,
) -> Result<WorkerLoop<C::Session, T, W, A>, AgentError>
where
    C: Connector,
    T: PeriodicTimer,
    W: Watchdog,
    A: Acquisition,
{
    let AgentParts {
        timer,
        mut watchdog,
        acquisition,
        flag,
    } = parts;

    watchdog.feed();
    let connection = ConnectionManager::connect(connector, config)?;
    watchdog.feed();

    let dispatcher = CommandDispatcher::new(
        connection.topics().command.clone(),
        StreamSchedule::new(timer),
    );

    info!(
        "streaming to `{}`, commands on `{}`, period {} ms",
        connection.topics().stream,
        connection.topics().command,
        config.stream_period_ms
    );

    Ok(WorkerLoop::new(
        connection,
        dispatcher,
        watchdog,
        acquisition,
        flag,
        Duration::from_millis(config.yield_timeout_ms),
    ))
}

/// Stops streaming and disconnects. Terminal.
pub fn shutdown<S, T, W, A>(worker: WorkerLoop<S, T, W, A>) -> LoopStats
where
    S: MqttSession,
    T: PeriodicTimer,
    W: Watchdog,
    A: Acquisition,
{
    worker.shutdown()
}
