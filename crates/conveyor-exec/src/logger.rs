// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task logger contract.
//!
//! Every backend pushes line-oriented output and status transitions through
//! this trait. The orchestrator's implementation feeds the pool's log
//! channel; the agent's implementation buffers records for the next
//! progress report. Listeners let the execution engine observe the stream
//! it produces (terraform watches for its own prompts).

use chrono::{DateTime, Utc};
use std::sync::Mutex;

use conveyor_core::TaskStatus;

/// Callback invoked on every status transition.
pub type StatusListener = Box<dyn Fn(TaskStatus) + Send + Sync>;

/// Callback invoked on every logged line.
pub type LogListener = Box<dyn Fn(DateTime<Utc>, &str) + Send + Sync>;

/// Sink for task output and lifecycle signals.
///
/// Implementations must apply the status FSM: transitions that
/// `TaskStatus::can_transition` rejects are dropped, so a terminal status is
/// never overwritten and listeners only fire on actual changes.
pub trait TaskLogger: Send + Sync {
    /// Append one output line with an explicit timestamp.
    fn log_with_time(&self, time: DateTime<Utc>, message: &str);

    /// Append one output line stamped now.
    fn log(&self, message: &str) {
        self.log_with_time(Utc::now(), message);
    }

    /// Request a status transition.
    fn set_status(&self, status: TaskStatus);

    /// Current status.
    fn status(&self) -> TaskStatus;

    /// Record the commit the task ran against.
    fn set_commit(&self, hash: &str, message: &str);

    /// Observe future status transitions.
    fn add_status_listener(&self, listener: StatusListener);

    /// Observe future logged lines.
    fn add_log_listener(&self, listener: LogListener);
}

/// Standalone logger capturing records in memory.
///
/// Backs the agent's per-job buffer and the engine's tests. The captured
/// records are drained by the owner (progress reports on agents).
#[derive(Default)]
pub struct BufferedLogger {
    state: Mutex<BufferedState>,
}

#[derive(Default)]
struct BufferedState {
    status: TaskStatus,
    records: Vec<(DateTime<Utc>, String)>,
    commit: Option<(String, String)>,
    status_listeners: Vec<StatusListener>,
    log_listeners: Vec<LogListener>,
}

impl BufferedLogger {
    /// Empty logger in `waiting` status.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain captured records in emission order.
    pub fn drain_records(&self) -> Vec<(DateTime<Utc>, String)> {
        std::mem::take(&mut self.state.lock().unwrap().records)
    }

    /// Commit recorded via [`TaskLogger::set_commit`], if any.
    pub fn commit(&self) -> Option<(String, String)> {
        self.state.lock().unwrap().commit.clone()
    }
}

impl TaskLogger for BufferedLogger {
    fn log_with_time(&self, time: DateTime<Utc>, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.records.push((time, message.to_string()));
        // listeners run under the lock; they must not log back
        for listener in &state.log_listeners {
            listener(time, message);
        }
    }

    fn set_status(&self, status: TaskStatus) {
        let mut state = self.state.lock().unwrap();
        if state.status == status || !state.status.can_transition(status) {
            return;
        }
        state.status = status;
        for listener in &state.status_listeners {
            listener(status);
        }
    }

    fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }

    fn set_commit(&self, hash: &str, message: &str) {
        self.state.lock().unwrap().commit = Some((hash.to_string(), message.to_string()));
    }

    fn add_status_listener(&self, listener: StatusListener) {
        self.state.lock().unwrap().status_listeners.push(listener);
    }

    fn add_log_listener(&self, listener: LogListener) {
        self.state.lock().unwrap().log_listeners.push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn status_transitions_are_monotone() {
        let logger = BufferedLogger::new();
        logger.set_status(TaskStatus::Starting);
        logger.set_status(TaskStatus::Running);
        logger.set_status(TaskStatus::Success);
        // terminal is frozen
        logger.set_status(TaskStatus::Running);
        assert_eq!(logger.status(), TaskStatus::Success);
    }

    #[test]
    fn listeners_fire_only_on_change() {
        let logger = BufferedLogger::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        logger.add_status_listener(Box::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        logger.set_status(TaskStatus::Starting);
        logger.set_status(TaskStatus::Starting);
        logger.set_status(TaskStatus::Waiting); // not a legal transition
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn records_preserve_order() {
        let logger = BufferedLogger::new();
        for n in 0..10 {
            logger.log(&format!("line {n}"));
        }
        let records = logger.drain_records();
        assert_eq!(records.len(), 10);
        for (n, (_, line)) in records.iter().enumerate() {
            assert_eq!(line, &format!("line {n}"));
        }
        assert!(logger.drain_records().is_empty());
    }
}
