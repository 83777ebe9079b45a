//! Tick scheduler: fixed-cadence, delay-after-completion driving of a runtime.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace};

use super::lifecycle::SessionState;
use super::runtime::{SandboxRuntime, TickOutcome};

/// Commands a host can send to a running sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Stop,
}

/// Why the scheduler woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The cadence elapsed; time for the next tick.
    Elapsed,
    Stop,
    /// The host dropped its handle. Treated as a stop.
    Disconnected,
}

pub struct TickScheduler {
    cadence: Duration,
    commands: Receiver<Command>,
}

impl TickScheduler {
    pub fn new(cadence: Duration, commands: Receiver<Command>) -> Self {
        Self { cadence, commands }
    }

    /// Suspend for one cadence, waking early on a command.
    pub fn wait(&self) -> Wake {
        let deadline = Instant::now() + self.cadence;
        match self.commands.recv_deadline(deadline) {
            Ok(Command::Stop) => Wake::Stop,
            Err(RecvTimeoutError::Timeout) => Wake::Elapsed,
            Err(RecvTimeoutError::Disconnected) => Wake::Disconnected,
        }
    }

    /// Evaluate the strategy, tick it until cancelled or crashed, then finish.
    ///
    /// The delay before each tick is measured from the end of the previous one,
    /// so ticks never overlap however long they take.
    pub fn drive(&self, mut runtime: SandboxRuntime) -> SessionState {
        if runtime.start().is_err() {
            return runtime.state();
        }
        debug!(
            system_id = %runtime.system_id(),
            entry_point = runtime.has_entry_point(),
            cadence_ms = self.cadence.as_millis() as u64,
            "Scheduling ticks"
        );

        loop {
            match self.wait() {
                Wake::Elapsed => {}
                Wake::Stop => {
                    runtime.request_stop();
                }
                Wake::Disconnected => {
                    debug!(system_id = %runtime.system_id(), "Command channel closed, stopping");
                    runtime.request_stop();
                }
            }

            if runtime.cancel_requested() {
                break;
            }

            match runtime.tick() {
                TickOutcome::Crashed(tick) => {
                    debug!(system_id = %runtime.system_id(), tick, "Session crashed, scheduling ends");
                    return runtime.state();
                }
                TickOutcome::Failed(tick) => {
                    debug!(system_id = %runtime.system_id(), tick, "Tick failed, scheduling continues");
                }
                TickOutcome::Completed(tick) | TickOutcome::NoEntryPoint(tick) => {
                    trace!(system_id = %runtime.system_id(), tick, "Tick done");
                }
                TickOutcome::Skipped => {}
            }
        }

        runtime.finish()
    }
}
