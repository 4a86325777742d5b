// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task lifecycle state machine.
//!
//! Every task moves through the statuses below. Transitions are validated by
//! [`TaskStatus::can_transition`]; once a terminal status is reached the task
//! is frozen and any further transition attempt is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Queued, not yet admitted by the scheduler.
    #[default]
    Waiting,
    /// Claimed by the scheduler, runner is preparing the workspace.
    Starting,
    /// Blocked on an operator decision (terraform apply approval).
    WaitingConfirmation,
    /// Operator approved the pending step.
    Confirmed,
    /// Operator rejected the pending step.
    Rejected,
    /// Child process (or remote job) is executing.
    Running,
    /// Stop requested, waiting for the backend to wind down.
    Stopping,
    /// Terminal: stopped by request.
    Stopped,
    /// Terminal: finished with exit code 0.
    Success,
    /// Terminal: failed.
    Error,
}

impl TaskStatus {
    /// Terminal statuses are frozen: no transition leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Stopped | TaskStatus::Success | TaskStatus::Error
        )
    }

    /// Statuses that trigger a history event and alerting.
    pub fn is_notifiable(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Error | TaskStatus::WaitingConfirmation
        )
    }

    /// Whether the FSM permits moving from `self` to `to`.
    ///
    /// Identity transitions are not permitted; callers treat them as no-ops
    /// before consulting this table.
    pub fn can_transition(self, to: TaskStatus) -> bool {
        use TaskStatus::*;

        if self == to {
            return false;
        }

        match self {
            Waiting => matches!(to, Starting | Error | Stopped),
            Starting => matches!(to, Running | WaitingConfirmation | Error | Stopped),
            Running => matches!(to, Success | Error | Stopping | WaitingConfirmation),
            WaitingConfirmation => matches!(to, Confirmed | Rejected),
            Confirmed => matches!(to, Running),
            Rejected => matches!(to, Error | Stopped),
            Stopping => matches!(to, Stopped | Success | Error),
            Stopped | Success | Error => false,
        }
    }

    /// Stable string form, matching the wire and database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Starting => "starting",
            TaskStatus::WaitingConfirmation => "waiting_confirmation",
            TaskStatus::Confirmed => "confirmed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Running => "running",
            TaskStatus::Stopping => "stopping",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Success => "success",
            TaskStatus::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "starting" => Ok(TaskStatus::Starting),
            "waiting_confirmation" => Ok(TaskStatus::WaitingConfirmation),
            "confirmed" => Ok(TaskStatus::Confirmed),
            "rejected" => Ok(TaskStatus::Rejected),
            "running" => Ok(TaskStatus::Running),
            "stopping" => Ok(TaskStatus::Stopping),
            "stopped" => Ok(TaskStatus::Stopped),
            "success" => Ok(TaskStatus::Success),
            "error" => Ok(TaskStatus::Error),
            other => Err(Error::Validation(format!("unknown task status: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_frozen() {
        for terminal in [TaskStatus::Stopped, TaskStatus::Success, TaskStatus::Error] {
            for to in [
                TaskStatus::Waiting,
                TaskStatus::Starting,
                TaskStatus::Running,
                TaskStatus::WaitingConfirmation,
                TaskStatus::Confirmed,
                TaskStatus::Rejected,
                TaskStatus::Stopping,
                TaskStatus::Stopped,
                TaskStatus::Success,
                TaskStatus::Error,
            ] {
                assert!(
                    !terminal.can_transition(to),
                    "{terminal} -> {to} must be rejected"
                );
            }
        }
    }

    #[test]
    fn waiting_confirmation_only_resolves() {
        let s = TaskStatus::WaitingConfirmation;
        assert!(s.can_transition(TaskStatus::Confirmed));
        assert!(s.can_transition(TaskStatus::Rejected));
        assert!(!s.can_transition(TaskStatus::Running));
        assert!(!s.can_transition(TaskStatus::Error));
    }

    #[test]
    fn confirmed_resumes_running() {
        assert!(TaskStatus::Confirmed.can_transition(TaskStatus::Running));
        assert!(!TaskStatus::Confirmed.can_transition(TaskStatus::Success));
    }

    #[test]
    fn stopping_reaches_any_terminal() {
        assert!(TaskStatus::Stopping.can_transition(TaskStatus::Stopped));
        assert!(TaskStatus::Stopping.can_transition(TaskStatus::Success));
        assert!(TaskStatus::Stopping.can_transition(TaskStatus::Error));
        assert!(!TaskStatus::Stopping.can_transition(TaskStatus::Running));
    }

    #[test]
    fn identity_transitions_rejected() {
        assert!(!TaskStatus::Running.can_transition(TaskStatus::Running));
        assert!(!TaskStatus::Waiting.can_transition(TaskStatus::Waiting));
    }

    #[test]
    fn notifiable_set() {
        assert!(TaskStatus::Success.is_notifiable());
        assert!(TaskStatus::Error.is_notifiable());
        assert!(TaskStatus::WaitingConfirmation.is_notifiable());
        assert!(!TaskStatus::Running.is_notifiable());
        assert!(!TaskStatus::Stopped.is_notifiable());
    }

    #[test]
    fn serde_round_trip() {
        let s: TaskStatus = serde_json::from_str("\"waiting_confirmation\"").unwrap();
        assert_eq!(s, TaskStatus::WaitingConfirmation);
        assert_eq!(
            serde_json::to_string(&TaskStatus::Stopping).unwrap(),
            "\"stopping\""
        );
        assert_eq!("error".parse::<TaskStatus>().unwrap(), TaskStatus::Error);
    }
}
