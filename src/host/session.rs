//! Host-side view of a strategy session, as shown to the UI.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::{Message, SystemId};
use crate::sandbox::SessionState;

/// Everything the host knows about one session, built purely from messages.
///
/// `logs`, `orders` and `errors` keep only the most recent `history` entries;
/// the `*_total` counters cover the whole session.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub system_id: SystemId,
    pub meta: Value,
    pub state: SessionState,
    pub tick_count: u64,
    pub last_pnl: Option<f64>,
    pub logs: VecDeque<String>,
    pub orders: VecDeque<Value>,
    pub errors: VecDeque<String>,
    pub orders_total: u64,
    pub errors_total: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(skip)]
    history: usize,
}

impl SessionView {
    pub fn new(system_id: SystemId, meta: Value, history: usize) -> Self {
        let now = Utc::now();
        Self {
            system_id,
            meta,
            state: SessionState::Running,
            tick_count: 0,
            last_pnl: None,
            logs: VecDeque::new(),
            orders: VecDeque::new(),
            errors: VecDeque::new(),
            orders_total: 0,
            errors_total: 0,
            started_at: now,
            updated_at: now,
            history,
        }
    }

    /// Display name from metadata, falling back to the id.
    pub fn display_name(&self) -> String {
        self.meta
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| self.system_id.to_string())
    }

    /// Fold one sandbox message into the view.
    pub fn apply(&mut self, message: &Message) {
        match message {
            Message::Log { msg, tick_count, .. } => {
                self.observe_tick(*tick_count);
                push_bounded(&mut self.logs, msg.clone(), self.history);
            }
            Message::Metric { pnl, tick_count, .. } => {
                self.observe_tick(*tick_count);
                self.last_pnl = Some(*pnl);
            }
            Message::Order { order, tick_count, .. } => {
                self.observe_tick(*tick_count);
                self.orders_total += 1;
                push_bounded(&mut self.orders, order.clone(), self.history);
            }
            Message::Error { error, fatal, .. } => {
                self.errors_total += 1;
                push_bounded(&mut self.errors, error.clone(), self.history);
                if *fatal {
                    self.state = SessionState::Crashed;
                }
            }
            Message::Tick { tick_count, .. } => self.observe_tick(*tick_count),
            Message::Stopped { .. } => self.state = SessionState::Stopped,
            Message::Run(_) | Message::Stop { .. } => return,
        }
        self.updated_at = Utc::now();
    }

    // The host only ever reads the counter; it never goes backwards.
    fn observe_tick(&mut self, tick_count: u64) {
        self.tick_count = self.tick_count.max(tick_count);
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, item: T, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(item);
}

impl fmt::Display for SessionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Session {} ===", self.display_name())?;
        writeln!(f, "System ID:  {}", self.system_id)?;
        writeln!(f, "State:      {}", self.state)?;
        writeln!(f, "Ticks:      {}", self.tick_count)?;
        match self.last_pnl {
            Some(pnl) => writeln!(f, "Last P&L:   {pnl:.4}")?,
            None => writeln!(f, "Last P&L:   -")?,
        }
        writeln!(f, "Orders:     {}", self.orders_total)?;
        writeln!(f, "Errors:     {}", self.errors_total)?;
        write!(
            f,
            "Runtime:    {}s",
            (self.updated_at - self.started_at).num_seconds()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_tracks_progress() {
        let mut view = SessionView::new("s1".into(), json!({"name": "Mean Revert"}), 2);
        let id = SystemId::from("s1");

        view.apply(&Message::Tick { system_id: id.clone(), tick_count: 2 });
        view.apply(&Message::Log { system_id: id.clone(), msg: "a".into(), tick_count: 1 });
        view.apply(&Message::Log { system_id: id.clone(), msg: "b".into(), tick_count: 2 });
        view.apply(&Message::Log { system_id: id.clone(), msg: "c".into(), tick_count: 3 });
        view.apply(&Message::Metric { system_id: id.clone(), pnl: 4.5, tick_count: 3 });
        view.apply(&Message::Order { system_id: id.clone(), order: json!({"side": "buy"}), tick_count: 3 });

        assert_eq!(view.tick_count, 3);
        assert_eq!(view.logs, VecDeque::from(vec!["b".to_string(), "c".to_string()]));
        assert_eq!(view.last_pnl, Some(4.5));
        assert_eq!(view.orders.len(), 1);
        assert_eq!(view.state, SessionState::Running);
        assert_eq!(view.display_name(), "Mean Revert");
    }

    #[test]
    fn test_terminal_states() {
        let id = SystemId::from("s1");

        let mut crashed = SessionView::new(id.clone(), Value::Null, 10);
        crashed.apply(&Message::Error { system_id: id.clone(), error: "tick 1 failed".into(), fatal: false });
        assert_eq!(crashed.state, SessionState::Running);
        crashed.apply(&Message::Error { system_id: id.clone(), error: "boom".into(), fatal: true });
        assert_eq!(crashed.state, SessionState::Crashed);
        assert_eq!(crashed.errors.len(), 2);
        assert_eq!(crashed.errors_total, 2);

        let mut stopped = SessionView::new(id.clone(), Value::Null, 10);
        stopped.apply(&Message::Stopped { system_id: id });
        assert_eq!(stopped.state, SessionState::Stopped);
        assert_eq!(stopped.display_name(), "s1");
    }

    #[test]
    fn test_histories_stay_bounded() {
        let id = SystemId::from("busy");
        let mut view = SessionView::new(id.clone(), Value::Null, 2);

        for tick in 1..=1_000u64 {
            view.apply(&Message::Log { system_id: id.clone(), msg: format!("log {tick}"), tick_count: tick });
            view.apply(&Message::Order { system_id: id.clone(), order: json!({"n": tick}), tick_count: tick });
            view.apply(&Message::Error { system_id: id.clone(), error: format!("tick {tick} failed"), fatal: false });
        }

        assert_eq!(view.logs.len(), 2);
        assert_eq!(view.orders.len(), 2);
        assert_eq!(view.errors.len(), 2);
        assert_eq!(view.orders, VecDeque::from(vec![json!({"n": 999}), json!({"n": 1000})]));
        assert_eq!(view.errors.back().map(String::as_str), Some("tick 1000 failed"));
        assert_eq!(view.orders_total, 1_000);
        assert_eq!(view.errors_total, 1_000);
        assert_eq!(view.tick_count, 1_000);
        assert_eq!(view.state, SessionState::Running);

        let mut quiet = SessionView::new(id.clone(), Value::Null, 0);
        quiet.apply(&Message::Order { system_id: id, order: json!({}), tick_count: 1 });
        assert!(quiet.orders.is_empty());
        assert_eq!(quiet.orders_total, 1);
    }
}
