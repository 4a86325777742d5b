// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Child process supervision.
//!
//! Spawns tool binaries, pumps stdout/stderr line-wise into the task
//! logger, and exposes an OS-level kill handle. Lines are capped at 10 MiB;
//! an oversized line kills the child and logs a fatal record. Read errors
//! from closed pipes are swallowed.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::confirm::ConfirmationReader;
use crate::error::{Error, Result};
use crate::logger::TaskLogger;

/// Per-line ceiling for child output.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Registered PID of the currently running child, shared with the kill path.
pub type ProcessHandle = Arc<Mutex<Option<u32>>>;

/// New, empty process handle.
pub fn new_process_handle() -> ProcessHandle {
    Arc::new(Mutex::new(None))
}

/// SIGKILL the child registered in `handle`, if any.
pub fn kill_process(handle: &ProcessHandle) {
    let pid = *handle.lock().unwrap();
    if let Some(pid) = pid {
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            tracing::debug!(pid = pid, error = %e, "kill failed");
        }
    }
}

/// One tool invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Binary to execute.
    pub binary: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub cwd: PathBuf,
    /// Environment overrides applied on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Invocation of `binary` in `cwd` with no arguments yet.
    pub fn new(binary: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append environment overrides.
    pub fn envs(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(env);
        self
    }
}

/// How the child's stdin is driven.
pub enum StdinSource {
    /// Closed immediately.
    Closed,
    /// Feed a line whenever its prompt literal appears in the output.
    Prompts(HashMap<String, String>),
    /// Hand stdin to an interactive confirmation reader.
    Confirm(ConfirmationReader),
}

/// Run a command to completion, pumping its output into `logger`.
///
/// The child's PID is registered in `process` for the duration of the run so
/// a concurrent stop request can SIGKILL it. Returns `Ok(())` only for exit
/// code 0.
pub async fn run_and_log(
    spec: CommandSpec,
    logger: Arc<dyn TaskLogger>,
    process: ProcessHandle,
    stdin: StdinSource,
) -> Result<()> {
    let mut command = Command::new(&spec.binary);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &spec.env {
        command.env(key, value);
    }

    match &stdin {
        StdinSource::Closed => {
            command.stdin(std::process::Stdio::null());
        }
        StdinSource::Prompts(_) | StdinSource::Confirm(_) => {
            command.stdin(std::process::Stdio::piped());
        }
    }

    let mut child = command.spawn().map_err(|source| Error::Spawn {
        binary: spec.binary.clone(),
        source,
    })?;

    *process.lock().unwrap() = child.id();

    let mut stdin_driver = None;
    match stdin {
        StdinSource::Closed => {}
        StdinSource::Prompts(prompts) => {
            if let Some(pipe) = child.stdin.take() {
                stdin_driver = Some(spawn_prompt_writer(pipe, prompts, &logger));
            }
        }
        StdinSource::Confirm(reader) => {
            if let Some(pipe) = child.stdin.take() {
                stdin_driver = Some(reader.spawn(pipe));
            }
        }
    }

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_pump = stdout.map(|pipe| {
        tokio::spawn(pump_lines(
            BufReader::new(pipe),
            logger.clone(),
            process.clone(),
        ))
    });
    let err_pump = stderr.map(|pipe| {
        tokio::spawn(pump_lines(
            BufReader::new(pipe),
            logger.clone(),
            process.clone(),
        ))
    });

    let status = child.wait().await;

    // drain both pipes before reporting the exit status
    if let Some(pump) = out_pump {
        let _ = pump.await;
    }
    if let Some(pump) = err_pump {
        let _ = pump.await;
    }
    if let Some(driver) = stdin_driver {
        driver.abort();
    }

    *process.lock().unwrap() = None;

    let status = status?;
    match status.code() {
        Some(0) => Ok(()),
        Some(code) => Err(Error::ExitCode(code)),
        None => Err(Error::Killed),
    }
}

/// Run a command discarding its output; true on exit code 0.
///
/// Used for capability probes (`terraform workspace list`).
pub async fn run_silent(spec: CommandSpec) -> bool {
    let mut command = Command::new(&spec.binary);
    command
        .args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);

    for (key, value) in &spec.env {
        command.env(key, value);
    }

    match command.status().await {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

fn spawn_prompt_writer(
    mut pipe: tokio::process::ChildStdin,
    prompts: HashMap<String, String>,
    logger: &Arc<dyn TaskLogger>,
) -> tokio::task::JoinHandle<()> {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    logger.add_log_listener(Box::new(move |_, line| {
        for (prompt, value) in &prompts {
            if line.contains(prompt.as_str()) {
                let _ = tx.send(format!("{value}\n"));
            }
        }
    }));

    tokio::spawn(async move {
        while let Some(input) = rx.recv().await {
            if pipe.write_all(input.as_bytes()).await.is_err() {
                return;
            }
            let _ = pipe.flush().await;
        }
    })
}

enum ReadLine {
    Eof,
    Line,
    Oversize,
}

async fn read_line_capped<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    cap: usize,
) -> std::io::Result<ReadLine> {
    loop {
        let (consumed, complete) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                return Ok(ReadLine::Eof);
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    buf.extend_from_slice(&chunk[..pos]);
                    (pos + 1, true)
                }
                None => {
                    buf.extend_from_slice(chunk);
                    (chunk.len(), false)
                }
            }
        };
        reader.consume(consumed);

        if buf.len() > cap {
            return Ok(ReadLine::Oversize);
        }
        if complete {
            return Ok(ReadLine::Line);
        }
    }
}

async fn pump_lines<R: AsyncBufRead + Unpin>(
    mut reader: R,
    logger: Arc<dyn TaskLogger>,
    process: ProcessHandle,
) {
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf, MAX_LINE_BYTES).await {
            Ok(ReadLine::Line) => {
                let line = String::from_utf8_lossy(&buf);
                logger.log(line.trim_end_matches('\r'));
            }
            Ok(ReadLine::Eof) => {
                if !buf.is_empty() {
                    let line = String::from_utf8_lossy(&buf);
                    logger.log(line.trim_end_matches('\r'));
                }
                return;
            }
            Ok(ReadLine::Oversize) => {
                logger.log(
                    "Fatal error: task output exceeds the maximum allowed size of 10MB per line",
                );
                kill_process(&process);
                return;
            }
            // closed pipe / finished process; nothing left to read
            Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::BufferedLogger;

    #[tokio::test]
    async fn read_line_capped_splits_lines() {
        let data = b"alpha\nbeta\n".to_vec();
        let mut reader = BufReader::new(std::io::Cursor::new(data));

        let mut buf = Vec::new();
        assert!(matches!(
            read_line_capped(&mut reader, &mut buf, 1024).await.unwrap(),
            ReadLine::Line
        ));
        assert_eq!(buf, b"alpha");

        buf.clear();
        assert!(matches!(
            read_line_capped(&mut reader, &mut buf, 1024).await.unwrap(),
            ReadLine::Line
        ));
        assert_eq!(buf, b"beta");

        buf.clear();
        assert!(matches!(
            read_line_capped(&mut reader, &mut buf, 1024).await.unwrap(),
            ReadLine::Eof
        ));
    }

    #[tokio::test]
    async fn read_line_capped_detects_oversize() {
        let data = vec![b'x'; 4096];
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = Vec::new();
        assert!(matches!(
            read_line_capped(&mut reader, &mut buf, 1000).await.unwrap(),
            ReadLine::Oversize
        ));
    }

    #[tokio::test]
    async fn run_and_log_captures_output_in_order() {
        let logger = Arc::new(BufferedLogger::new());
        let process = new_process_handle();
        let spec = CommandSpec::new("sh", std::env::temp_dir())
            .args(["-c", "echo one; echo two; echo three"]);

        run_and_log(
            spec,
            logger.clone() as Arc<dyn TaskLogger>,
            process,
            StdinSource::Closed,
        )
        .await
        .unwrap();

        let lines: Vec<String> = logger
            .drain_records()
            .into_iter()
            .map(|(_, line)| line)
            .collect();
        assert_eq!(lines, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn run_and_log_reports_exit_code() {
        let logger = Arc::new(BufferedLogger::new());
        let spec = CommandSpec::new("sh", std::env::temp_dir()).args(["-c", "exit 3"]);

        let err = run_and_log(
            spec,
            logger as Arc<dyn TaskLogger>,
            new_process_handle(),
            StdinSource::Closed,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::ExitCode(3)));
    }
}
