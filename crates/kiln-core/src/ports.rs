//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the engine and the cluster
//! it drives, and between the engine and whoever consumes its events.

use crate::Result;
use crate::events::Event;
use crate::sandbox::{ConfigObject, ConfigObjectKind, SandboxRef, SandboxSpec, SandboxStatus};
use async_trait::async_trait;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// One frame of a remote command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecFrame {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Final frame: the remote process exited with this status.
    Exit(i32),
}

/// Stream of frames from a remote command. A stream that ends without an
/// `Exit` frame, or yields an error, means the channel broke.
pub type ExecStream = Pin<Box<dyn Stream<Item = Result<ExecFrame>> + Send>>;

/// Client-side view of the shared compute cluster.
///
/// Deletions of absent objects report `Error::NotFound`; creations of
/// existing objects report `Error::AlreadyExists`; policy rejections report
/// `Error::Admission`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submit a sandbox object.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<()>;

    /// Observe a sandbox; `None` when the cluster has no such object.
    async fn get_sandbox(&self, sandbox: &SandboxRef) -> Result<Option<SandboxStatus>>;

    /// Request deletion with the given grace period (0 forces removal).
    async fn delete_sandbox(&self, sandbox: &SandboxRef, grace_seconds: u64) -> Result<()>;

    /// List sandboxes whose labels contain every pair in `selector`.
    async fn list_sandboxes(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<(SandboxRef, SandboxStatus)>>;

    /// Create an env/secret config object.
    async fn create_config_object(&self, namespace: &str, object: &ConfigObject) -> Result<()>;

    /// Read a config object back.
    async fn get_config_object(
        &self,
        namespace: &str,
        kind: ConfigObjectKind,
        name: &str,
    ) -> Result<Option<ConfigObject>>;

    /// Delete a config object.
    async fn delete_config_object(
        &self,
        namespace: &str,
        kind: ConfigObjectKind,
        name: &str,
    ) -> Result<()>;

    /// Start a command inside one unit of a running sandbox.
    async fn exec(&self, sandbox: &SandboxRef, unit: &str, argv: &[String])
    -> Result<ExecStream>;

    /// Fetch the last `tail_lines` lines of a unit's log.
    async fn logs(&self, sandbox: &SandboxRef, unit: &str, tail_lines: u32)
    -> Result<Vec<String>>;
}

/// Consumer of engine events (live reporting).
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> Result<()>;
}

/// Sink that writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        match &event {
            Event::StepOutput(p) => {
                debug!(subject = %event.subject(), line = p.line_number, "{}", p.content)
            }
            _ => info!(subject = %event.subject(), "event"),
        }
        Ok(())
    }
}

/// Sink that forwards events to a channel. Events are dropped, not
/// blocked on, once the receiver goes away.
#[derive(Debug, Clone)]
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        let _ = self.tx.send(event);
        Ok(())
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<Event>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn publish(&self, event: Event) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}
