//! Per-session outbound message queue.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::protocol::{Message, SystemId};

/// Sends a session's messages to the host, in emission order.
///
/// The outbox seals itself after a terminal message (`stopped` or a fatal
/// `error`); anything emitted afterwards is dropped, so the terminal message is
/// always the last one the host sees for this session.
pub struct Outbox {
    system_id: SystemId,
    tx: UnboundedSender<Message>,
    sealed: bool,
}

impl Outbox {
    pub fn new(system_id: SystemId, tx: UnboundedSender<Message>) -> Self {
        Self {
            system_id,
            tx,
            sealed: false,
        }
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Queue a message. Returns `false` if it was dropped.
    pub fn emit(&mut self, message: Message) -> bool {
        if self.is_sealed() {
            debug!(
                system_id = %self.system_id,
                kind = message.kind(),
                "Dropping message emitted after terminal message"
            );
            return false;
        }
        if message.is_terminal() {
            self.sealed = true;
        }

        if self.tx.send(message).is_err() {
            debug!(system_id = %self.system_id, "Host receiver gone, message dropped");
            return false;
        }
        true
    }

    pub fn log(&mut self, msg: String, tick_count: u64) -> bool {
        let system_id = self.system_id.clone();
        self.emit(Message::Log {
            system_id,
            msg,
            tick_count,
        })
    }

    pub fn metric(&mut self, pnl: f64, tick_count: u64) -> bool {
        let system_id = self.system_id.clone();
        self.emit(Message::Metric {
            system_id,
            pnl,
            tick_count,
        })
    }

    pub fn order(&mut self, order: Value, tick_count: u64) -> bool {
        let system_id = self.system_id.clone();
        self.emit(Message::Order {
            system_id,
            order,
            tick_count,
        })
    }

    pub fn error(&mut self, error: String, fatal: bool) -> bool {
        let system_id = self.system_id.clone();
        self.emit(Message::Error {
            system_id,
            error,
            fatal,
        })
    }

    pub fn tick(&mut self, tick_count: u64) -> bool {
        let system_id = self.system_id.clone();
        self.emit(Message::Tick {
            system_id,
            tick_count,
        })
    }

    pub fn stopped(&mut self) -> bool {
        let system_id = self.system_id.clone();
        self.emit(Message::Stopped { system_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_nothing_follows_stopped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outbox = Outbox::new("s1".into(), tx);

        assert!(outbox.metric(1.0, 1));
        assert!(outbox.stopped());
        assert!(outbox.is_sealed());
        assert!(!outbox.log("late".to_string(), 2));
        assert!(!outbox.stopped());

        assert!(matches!(rx.try_recv().unwrap(), Message::Metric { pnl, .. } if pnl == 1.0));
        assert!(matches!(rx.try_recv().unwrap(), Message::Stopped { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_recoverable_error_does_not_seal() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outbox = Outbox::new("s1".into(), tx);

        assert!(outbox.error("tick 2 failed".to_string(), false));
        assert!(!outbox.is_sealed());
        assert!(outbox.error("fatal".to_string(), true));
        assert!(outbox.is_sealed());
        assert!(!outbox.tick(3));

        assert!(matches!(rx.try_recv().unwrap(), Message::Error { fatal: false, .. }));
        assert!(matches!(rx.try_recv().unwrap(), Message::Error { fatal: true, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_emit_survives_closed_host() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut outbox = Outbox::new("s1".into(), tx);
        assert!(!outbox.log("nobody listening".to_string(), 0));
    }
}
