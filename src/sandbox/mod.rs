//! Strategy execution sandbox.
//!
//! Each session runs on its own OS thread with its own wasm store. The host
//! talks to it only through messages:
//! - commands in over a crossbeam channel ([`Command`])
//! - events out over the shared tokio channel ([`Message`])

mod capability;
mod config;
mod error;
mod lifecycle;
mod outbox;
mod runtime;
mod scheduler;

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error};
use wasmtime::Engine;

use crate::protocol::{Message, RunRequest, SystemId};

pub use config::{SandboxConfig, TickErrorPolicy};
pub use error::SandboxError;
pub use lifecycle::SessionState;
#[cfg(test)]
pub use runtime::bare_request;
pub use runtime::{build_engine, inspect_source};

use runtime::SandboxRuntime;
use scheduler::{Command, TickScheduler};

/// Host-side handle to a running sandbox thread.
pub struct SandboxHandle {
    system_id: SystemId,
    commands: Sender<Command>,
    thread: Option<JoinHandle<SessionState>>,
}

impl SandboxHandle {
    /// Start a session on a dedicated thread. Evaluation happens on that
    /// thread; its outcome arrives as messages.
    pub fn spawn(
        engine: &Engine,
        request: RunRequest,
        config: &SandboxConfig,
        events: UnboundedSender<Message>,
    ) -> Result<Self, SandboxError> {
        let system_id = request.system_id.clone();
        let (commands, command_rx) = unbounded();

        let engine = engine.clone();
        let config = config.clone();
        let thread_id = system_id.clone();

        let thread = thread::Builder::new()
            .name(format!("sandbox-{system_id}"))
            .spawn(move || {
                let panic_events = events.clone();
                let scheduler = TickScheduler::new(config.cadence, command_rx);

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    let runtime = SandboxRuntime::new(&engine, request, events, &config);
                    scheduler.drive(runtime)
                }));

                match outcome {
                    Ok(state) => state,
                    Err(_) => {
                        error!(system_id = %thread_id, "Sandbox thread panicked");
                        let _ = panic_events.send(Message::Error {
                            system_id: thread_id,
                            error: "sandbox panicked".to_string(),
                            fatal: true,
                        });
                        SessionState::Crashed
                    }
                }
            })?;

        Ok(Self {
            system_id,
            commands,
            thread: Some(thread),
        })
    }

    /// Ask the sandbox to stop. Returns `false` if it has already exited.
    pub fn stop(&self) -> bool {
        match self.commands.send(Command::Stop) {
            Ok(()) => true,
            Err(_) => {
                debug!(system_id = %self.system_id, "Sandbox already exited");
                false
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the sandbox thread to exit and return its final state.
    pub fn join(mut self) -> Option<SessionState> {
        self.thread.take().and_then(|thread| thread.join().ok())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    const METRIC_TICKS: &str = r#"(module
      (import "host" "metric" (func $metric (param f64)))
      (func (export "onTick") (param $tick i64)
        (call $metric (f64.convert_i64_u (local.get $tick)))))"#;

    fn fast_config() -> SandboxConfig {
        SandboxConfig {
            cadence: Duration::from_millis(5),
            ..SandboxConfig::default()
        }
    }

    fn recv(rx: &mut UnboundedReceiver<Message>) -> Message {
        tokio_test::block_on(async {
            tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("sandbox went quiet")
                .expect("channel closed")
        })
    }

    #[test]
    fn test_threaded_session_scenario() {
        let config = fast_config();
        let engine = build_engine(&config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle =
            SandboxHandle::spawn(&engine, bare_request("s1", METRIC_TICKS), &config, tx).unwrap();

        let mut metrics = Vec::new();
        let mut last_tick = 0;
        while metrics.len() < 3 {
            match recv(&mut rx) {
                Message::Metric { pnl, .. } => metrics.push(pnl),
                Message::Tick { tick_count, .. } => {
                    assert_eq!(tick_count, last_tick + 1);
                    last_tick = tick_count;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(metrics, vec![1.0, 2.0, 3.0]);

        assert!(handle.stop());
        handle.stop();

        let mut tail = Vec::new();
        loop {
            let msg = recv(&mut rx);
            let done = matches!(msg, Message::Stopped { .. });
            tail.push(msg);
            if done {
                break;
            }
        }

        assert_eq!(handle.join(), Some(SessionState::Stopped));
        // nothing after stopped, and only one stopped
        assert!(rx.try_recv().is_err());
        assert_eq!(
            tail.iter().filter(|m| matches!(m, Message::Stopped { .. })).count(),
            1
        );
    }

    #[test]
    fn test_threaded_compile_error() {
        let config = fast_config();
        let engine = build_engine(&config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle =
            SandboxHandle::spawn(&engine, bare_request("bad", "(module"), &config, tx).unwrap();

        assert!(matches!(recv(&mut rx), Message::Error { fatal: true, .. }));
        assert_eq!(handle.join(), Some(SessionState::Crashed));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropping_handle_stops_sandbox() {
        let config = fast_config();
        let engine = build_engine(&config).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = SandboxHandle::spawn(&engine, bare_request("s2", "(module)"), &config, tx).unwrap();
        drop(handle);

        assert!(matches!(recv(&mut rx), Message::Stopped { .. }));
    }
}
