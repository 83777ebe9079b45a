//! Session registry: maps `systemId` to a sandbox handle and its view.

use std::collections::HashMap;

use anyhow::Result;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};
use wasmtime::Engine;

use crate::protocol::{Direction, Message, ProtocolError, RunRequest, SystemId};
use crate::sandbox::{build_engine, SandboxConfig, SandboxError, SandboxHandle, SessionState};

use super::session::SessionView;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session `{0}` is still live")]
    DuplicateSession(SystemId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

/// What [`SessionRegistry::observe`] did with an inbound message.
#[derive(Debug)]
pub enum Observed {
    /// Unknown or already-evicted session, or a host-only message type.
    Dropped,
    /// Session still live. Only its progress is returned; borrow the full
    /// view through [`SessionRegistry::view`].
    Updated { tick_count: u64 },
    /// Terminal message: the session was evicted; this is its final view.
    Finished(SessionView),
}

struct SessionEntry {
    handle: SandboxHandle,
    view: SessionView,
}

/// Host-side registry of live sessions.
///
/// All sandboxes report into one channel; the caller pumps it and feeds each
/// message to [`observe`](Self::observe).
pub struct SessionRegistry {
    engine: Engine,
    config: SandboxConfig,
    events: UnboundedSender<Message>,
    sessions: HashMap<SystemId, SessionEntry>,
}

impl SessionRegistry {
    /// Create a registry and the receiver its sandboxes report into.
    pub fn new(config: SandboxConfig) -> Result<(Self, UnboundedReceiver<Message>)> {
        let engine = build_engine(&config)?;
        let (events, rx) = mpsc::unbounded_channel();

        let registry = Self {
            engine,
            config,
            events,
            sessions: HashMap::new(),
        };
        Ok((registry, rx))
    }

    /// Start a new session.
    pub fn run(&mut self, request: RunRequest) -> Result<(), RegistryError> {
        let system_id = request.system_id.clone();
        if self.sessions.contains_key(&system_id) {
            return Err(RegistryError::DuplicateSession(system_id));
        }

        let view = SessionView::new(
            system_id.clone(),
            request.meta.clone(),
            self.config.log_history,
        );
        let handle = SandboxHandle::spawn(&self.engine, request, &self.config, self.events.clone())?;

        info!(system_id = %system_id, name = %view.display_name(), "Session started");
        self.sessions.insert(system_id, SessionEntry { handle, view });
        Ok(())
    }

    /// Ask a session to stop. Returns `true` only when a stop was actually sent;
    /// repeated stops and unknown ids are no-ops.
    pub fn stop(&mut self, system_id: &SystemId) -> bool {
        let Some(entry) = self.sessions.get_mut(system_id) else {
            debug!(system_id = %system_id, "Stop for unknown session ignored");
            return false;
        };
        if entry.view.state != SessionState::Running {
            debug!(system_id = %system_id, state = %entry.view.state, "Stop already in progress");
            return false;
        }

        entry.view.state = SessionState::Stopping;
        info!(system_id = %system_id, "Stopping session");
        entry.handle.stop()
    }

    /// Stop every live session. Returns how many stops were sent.
    pub fn stop_all(&mut self) -> usize {
        let ids: Vec<SystemId> = self.sessions.keys().cloned().collect();
        ids.iter().filter(|id| self.stop(id)).count()
    }

    /// Route a host command (`run` or `stop`).
    pub fn submit(&mut self, message: Message) -> Result<(), RegistryError> {
        match message {
            Message::Run(request) => self.run(request),
            Message::Stop { system_id } => {
                self.stop(&system_id);
                Ok(())
            }
            other => Err(ProtocolError::WrongDirection(other.kind()).into()),
        }
    }

    /// Parse and route a raw command line. Bad input is logged and dropped.
    pub fn submit_raw(&mut self, raw: &str) -> bool {
        let result = Message::parse(raw)
            .map_err(RegistryError::from)
            .and_then(|message| self.submit(message));

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Dropping host command");
                false
            }
        }
    }

    /// Fold a sandbox message into the matching session view.
    pub fn observe(&mut self, message: Message) -> Observed {
        if message.direction() != Direction::SandboxToHost {
            warn!(kind = message.kind(), "Host command on event channel dropped");
            return Observed::Dropped;
        }

        let system_id = message.system_id().clone();
        let Some(entry) = self.sessions.get_mut(&system_id) else {
            debug!(system_id = %system_id, kind = message.kind(), "Message for unknown session dropped");
            return Observed::Dropped;
        };

        entry.view.apply(&message);

        if !message.is_terminal() {
            return Observed::Updated {
                tick_count: entry.view.tick_count,
            };
        }

        // Terminal message acknowledged: evict. The sandbox thread exits on its own.
        match self.sessions.remove(&system_id) {
            Some(SessionEntry { handle, view }) => {
                info!(
                    system_id = %system_id,
                    state = %view.state,
                    ticks = view.tick_count,
                    "Session finished"
                );
                // Reap the thread only if it is already gone; otherwise it is detached.
                let exit_state = if handle.is_finished() { handle.join() } else { None };
                debug!(system_id = %system_id, exit_state = ?exit_state, "Evicting sandbox handle");
                Observed::Finished(view)
            }
            None => Observed::Dropped,
        }
    }

    pub fn view(&self, system_id: &SystemId) -> Option<&SessionView> {
        self.sessions.get(system_id).map(|entry| &entry.view)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Stop everything and pump `events` until every session is terminal.
    /// `on_message` sees each drained message before it is observed.
    pub async fn shutdown<F>(
        &mut self,
        events: &mut UnboundedReceiver<Message>,
        mut on_message: F,
    ) -> Vec<SessionView>
    where
        F: FnMut(&Message),
    {
        let sent = self.stop_all();
        info!(sessions = self.len(), stops = sent, "Shutting down sessions");

        let mut finished = Vec::new();
        while !self.is_empty() {
            let Some(message) = events.recv().await else {
                break;
            };
            on_message(&message);
            if let Observed::Finished(view) = self.observe(message) {
                finished.push(view);
            }
        }
        finished
    }
}
