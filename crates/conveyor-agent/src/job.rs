// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! One job held by the agent.
//!
//! Wraps the local job in a buffered logger whose records are drained into
//! progress reports. The server is the durable journal: records travel at
//! most once, and a failed report puts them back for the next tick.

use std::sync::{Arc, Mutex};

use conveyor_core::wire::{CommitInfo, JobProgress, LogRecord};
use conveyor_core::TaskStatus;
use conveyor_exec::logger::{BufferedLogger, TaskLogger};
use conveyor_exec::LocalJob;

/// One accepted job and its buffered output.
pub struct RunningJob {
    task_id: i64,
    username: String,
    incoming_version: Option<String>,
    alias: String,
    logger: Arc<BufferedLogger>,
    job: Arc<LocalJob>,
    /// Records drained but not yet acknowledged by the server.
    carry: Mutex<Vec<LogRecord>>,
}

impl RunningJob {
    /// Job over a constructed local job and its logger.
    pub fn new(
        task_id: i64,
        username: String,
        incoming_version: Option<String>,
        alias: String,
        logger: Arc<BufferedLogger>,
        job: Arc<LocalJob>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            username,
            incoming_version,
            alias,
            logger,
            job,
            carry: Mutex::new(Vec::new()),
        })
    }

    /// Task id of this job.
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Agent-side status.
    pub fn status(&self) -> TaskStatus {
        self.logger.status()
    }

    /// Request a status transition through the FSM.
    pub fn set_status(&self, status: TaskStatus) {
        self.logger.set_status(status);
    }

    /// Kill the child process.
    pub fn kill(&self) {
        self.job.kill();
    }

    /// Execute the job and map its result onto a terminal status.
    pub async fn execute(self: Arc<Self>) {
        self.set_status(TaskStatus::Starting);

        let result = self
            .job
            .run(&self.username, self.incoming_version.as_deref(), &self.alias)
            .await;

        let status = self.status();
        if status.is_terminal() {
            return;
        }

        match (&result, status) {
            (_, TaskStatus::Stopping) => self.set_status(TaskStatus::Stopped),
            (Ok(()), _) => self.set_status(TaskStatus::Success),
            (Err(e), _) => {
                self.logger.log(&format!("Error: {e}"));
                self.set_status(TaskStatus::Error);
            }
        }

        tracing::info!(task_id = self.task_id, status = %self.status(), "task finished");
    }

    /// Build this job's progress entry, draining buffered records.
    pub fn take_progress(&self) -> JobProgress {
        let mut records: Vec<LogRecord> = std::mem::take(&mut *self.carry.lock().unwrap());
        records.extend(
            self.logger
                .drain_records()
                .into_iter()
                .map(|(time, message)| LogRecord { time, message }),
        );

        JobProgress {
            id: self.task_id,
            log_records: records,
            status: self.status(),
            commit: self
                .logger
                .commit()
                .map(|(hash, message)| CommitInfo { hash, message }),
        }
    }

    /// Put unacknowledged records back for the next report.
    pub fn restore_records(&self, records: Vec<LogRecord>) {
        let mut carry = self.carry.lock().unwrap();
        let trailing = std::mem::take(&mut *carry);
        *carry = records;
        carry.extend(trailing);
    }
}
