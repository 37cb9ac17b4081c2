//! Command channel into a ready sandbox.
//!
//! Each call is one shell invocation in one unit. Output frames are split
//! into lines as they arrive and forwarded to the caller's channel; the
//! exit status is only known once the stream delivers it.

use crate::lifecycle::SandboxLifecycle;
use crate::quote::build_script;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kiln_core::events::LogStream;
use kiln_core::ports::{ClusterApi, ExecFrame};
use kiln_core::sandbox::PRIMARY_UNIT;
use kiln_core::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Output line from a command.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: LogStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// One command to run inside the sandbox.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub unit: String,
    pub shell: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
    pub workdir: Option<String>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            unit: PRIMARY_UNIT.to_string(),
            shell: "sh".to_string(),
            command: command.into(),
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<String>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn on_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }
}

/// How a command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: i32,
    pub stdout_lines: u32,
    pub stderr_lines: u32,
}

impl ExecStatus {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Incremental splitter turning byte frames into complete lines.
#[derive(Debug, Default)]
struct LineSplitter {
    buffer: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let rest = self.buffer.split_off(pos + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

struct LineSink<'a> {
    tx: &'a mpsc::Sender<OutputLine>,
    line_number: u32,
    stdout_lines: u32,
    stderr_lines: u32,
}

impl LineSink<'_> {
    async fn send(&mut self, stream: LogStream, content: String) {
        self.line_number += 1;
        match stream {
            LogStream::Stdout => self.stdout_lines += 1,
            LogStream::Stderr => self.stderr_lines += 1,
        }
        let line = OutputLine {
            stream,
            content,
            line_number: self.line_number,
            timestamp: Utc::now(),
        };
        // A caller that stopped listening does not stop the command.
        let _ = self.tx.send(line).await;
    }
}

/// Runs commands in one sandbox, gated on its lifecycle state.
#[derive(Clone)]
pub struct CommandChannel {
    cluster: Arc<dyn ClusterApi>,
    lifecycle: Arc<SandboxLifecycle>,
}

impl CommandChannel {
    pub fn new(cluster: Arc<dyn ClusterApi>, lifecycle: Arc<SandboxLifecycle>) -> Self {
        Self { cluster, lifecycle }
    }

    pub fn lifecycle(&self) -> &Arc<SandboxLifecycle> {
        &self.lifecycle
    }

    /// Run `request`, streaming its output to `output_tx`. A nonzero exit
    /// is a normal result; a broken stream or cancellation is an error.
    pub async fn exec(
        &self,
        request: &ExecRequest,
        output_tx: mpsc::Sender<OutputLine>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let entered = self.lifecycle.begin_command().await?;
        let result = self.run(request, &output_tx, cancel).await;
        if entered {
            self.lifecycle.finish_command().await;
        }
        result
    }

    /// Run `request` and collect its output instead of streaming it.
    pub async fn capture(
        &self,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<(ExecStatus, Vec<OutputLine>)> {
        let (tx, mut rx) = mpsc::channel(64);
        let collect = async move {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                lines.push(line);
            }
            lines
        };
        let (status, lines) = tokio::join!(self.exec(request, tx, cancel), collect);
        Ok((status?, lines))
    }

    async fn run(
        &self,
        request: &ExecRequest,
        output_tx: &mpsc::Sender<OutputLine>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus> {
        let script = build_script(&request.env, request.workdir.as_deref(), &request.command)?;
        let argv = vec![request.shell.clone(), "-c".to_string(), script];
        let reference = self.lifecycle.reference();
        debug!(sandbox = %reference, unit = %request.unit, "Starting command");

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            stream = self.cluster.exec(&reference, &request.unit, &argv) => {
                stream.map_err(|e| match e {
                    Error::Channel(_) => e,
                    other => Error::Channel(format!("command could not start: {}", other)),
                })?
            }
        };

        let mut stdout = LineSplitter::default();
        let mut stderr = LineSplitter::default();
        let mut sink = LineSink {
            tx: output_tx,
            line_number: 0,
            stdout_lines: 0,
            stderr_lines: 0,
        };

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(sandbox = %reference, "Command cancelled");
                    return Err(cancelled());
                }
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(ExecFrame::Stdout(bytes))) => {
                    for line in stdout.push(&bytes) {
                        sink.send(LogStream::Stdout, line).await;
                    }
                }
                Some(Ok(ExecFrame::Stderr(bytes))) => {
                    for line in stderr.push(&bytes) {
                        sink.send(LogStream::Stderr, line).await;
                    }
                }
                Some(Ok(ExecFrame::Exit(exit_code))) => {
                    if let Some(line) = stdout.finish() {
                        sink.send(LogStream::Stdout, line).await;
                    }
                    if let Some(line) = stderr.finish() {
                        sink.send(LogStream::Stderr, line).await;
                    }
                    debug!(sandbox = %reference, exit_code, "Command finished");
                    return Ok(ExecStatus {
                        exit_code,
                        stdout_lines: sink.stdout_lines,
                        stderr_lines: sink.stderr_lines,
                    });
                }
                Some(Err(Error::Channel(message))) => return Err(Error::Channel(message)),
                Some(Err(e)) => return Err(Error::Channel(e.to_string())),
                None => {
                    return Err(Error::Channel(
                        "output stream ended without an exit status".to_string(),
                    ));
                }
            }
        }
    }
}

fn cancelled() -> Error {
    Error::Channel("command cancelled".to_string())
}
