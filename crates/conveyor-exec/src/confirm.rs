// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Interactive confirmation reader.
//!
//! Terraform occasionally stops and asks on stdin ("Do you want to copy
//! existing state..?", "Do you want to perform these actions?"). The reader
//! bridges that prompt to the task lifecycle: it flips the task into
//! `waiting_confirmation`, then feeds `yes` or `no` once an external
//! `ConfirmTask` / `RejectTask` call resolves the status. After one
//! confirming write it closes the child's stdin.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use conveyor_core::TaskStatus;

use crate::logger::TaskLogger;

/// How often the reader observes the task status.
pub const POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Stdin driver for interactive terraform phases.
pub struct ConfirmationReader {
    logger: Arc<dyn TaskLogger>,
    closed: Arc<AtomicBool>,
}

impl ConfirmationReader {
    /// Reader observing `logger` for status resolution.
    ///
    /// A log listener is installed immediately: the copy-state prompt flips
    /// the task into `waiting_confirmation`, and an init conclusion (success
    /// banner or error) closes the reader so stdin reports EOF.
    pub fn new(logger: Arc<dyn TaskLogger>) -> Self {
        let closed = Arc::new(AtomicBool::new(false));

        let watcher_logger = logger.clone();
        let watcher_closed = closed.clone();
        logger.add_log_listener(Box::new(move |_, line| {
            if line.trim().contains("Do you want to copy ") {
                watcher_logger.set_status(TaskStatus::WaitingConfirmation);
            } else if line.contains("has been successfully initialized!") || line.contains("Error:")
            {
                watcher_closed.store(true, Ordering::SeqCst);
            }
        }));

        Self { logger, closed }
    }

    /// Close the reader; the driver task releases stdin on its next poll.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Drive the child's stdin until resolution or close.
    pub fn spawn(self, mut stdin: tokio::process::ChildStdin) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return; // dropping stdin yields EOF in the child
                }

                let status = self.logger.status();

                if status.is_terminal() {
                    return;
                }

                if status == TaskStatus::WaitingConfirmation {
                    let answer = self.await_resolution().await;
                    let _ = stdin.write_all(answer).await;
                    let _ = stdin.flush().await;
                    return; // one confirming read, then EOF
                }

                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
    }

    /// Block until confirmed, rejected or terminal; produce the stdin line.
    async fn await_resolution(&self) -> &'static [u8] {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status = self.logger.status();
            if status.is_terminal()
                || status == TaskStatus::Confirmed
                || status == TaskStatus::Rejected
            {
                break;
            }
        }

        match self.logger.status() {
            TaskStatus::Confirmed => {
                self.logger.set_status(TaskStatus::Running);
                b"yes\n"
            }
            TaskStatus::Rejected => b"no\n",
            _ => b"\n",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::BufferedLogger;

    #[test]
    fn copy_state_prompt_requests_confirmation() {
        let logger: Arc<dyn TaskLogger> = Arc::new(BufferedLogger::new());
        logger.set_status(TaskStatus::Starting);
        let _reader = ConfirmationReader::new(logger.clone());

        logger.log("Initializing the backend...");
        assert_eq!(logger.status(), TaskStatus::Starting);

        logger.log("Do you want to copy existing state to the new backend?");
        assert_eq!(logger.status(), TaskStatus::WaitingConfirmation);
    }

    #[test]
    fn init_banner_closes_reader() {
        let logger: Arc<dyn TaskLogger> = Arc::new(BufferedLogger::new());
        let reader = ConfirmationReader::new(logger.clone());
        assert!(!reader.closed.load(Ordering::SeqCst));

        logger.log("Terraform has been successfully initialized!");
        assert!(reader.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn error_line_closes_reader() {
        let logger: Arc<dyn TaskLogger> = Arc::new(BufferedLogger::new());
        let reader = ConfirmationReader::new(logger.clone());

        logger.log("Error: Failed to get existing workspaces");
        assert!(reader.closed.load(Ordering::SeqCst));
    }
}
