//! # Status Publishers
//!
//! Sinks for [`StatusEvent`]s. Publication is fire-and-forget from the job's
//! point of view: [`StatusNotifier`] logs a failed publish and carries on.
//!
//! - [`InMemoryStatusChannel`]: append-only log per task id, bounded to the
//!   most recent tasks, plus a broadcast stream that subscribers filter by
//!   task id prefix
//! - [`JsonLinesStatusSink`]: one JSON event per line in a file, written by a
//!   background thread
//! - [`FanoutPublisher`]: forwards to several publishers

use super::status::{Stage, StatusEvent, TaskStatus};
use crate::error::MessagingError;
use crossbeam::channel::{self, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

/// Destination for status events.
pub trait StatusPublisher: Send + Sync {
    fn publish(&self, event: &StatusEvent) -> Result<(), MessagingError>;
}

/// Default broadcast buffer size.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default number of tasks whose events stay in memory.
pub const DEFAULT_RETAINED_TASKS: usize = 1000;

/// In-memory status log with live subscriptions.
///
/// Only the `retained_tasks` most recently started tasks keep their events;
/// publishing the first event of a new task evicts the oldest one.
pub struct InMemoryStatusChannel {
    log: DashMap<String, Vec<StatusEvent>>,
    /// Task ids in first-seen order. Also serializes publishers.
    order: Mutex<VecDeque<String>>,
    retained_tasks: usize,
    sender: broadcast::Sender<StatusEvent>,
}

impl Default for InMemoryStatusChannel {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl std::fmt::Debug for InMemoryStatusChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStatusChannel")
            .field("tasks", &self.log.len())
            .field("retained_tasks", &self.retained_tasks)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InMemoryStatusChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            log: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            retained_tasks: DEFAULT_RETAINED_TASKS,
            sender,
        }
    }

    /// Keep events for at most `tasks` task ids (minimum one).
    pub fn with_retention(mut self, tasks: usize) -> Self {
        self.retained_tasks = tasks.max(1);
        self
    }

    pub fn retained_tasks(&self) -> usize {
        self.retained_tasks
    }

    /// Subscribe to events whose task id starts with `prefix`. An empty prefix
    /// matches every task.
    pub fn subscribe(&self, prefix: impl Into<String>) -> StatusSubscription {
        StatusSubscription {
            prefix: prefix.into(),
            receiver: self.sender.subscribe(),
        }
    }

    /// Every event recorded for one task, oldest first.
    pub fn events_for(&self, task_id: &str) -> Vec<StatusEvent> {
        self.log
            .get(task_id)
            .map(|events| events.value().clone())
            .unwrap_or_default()
    }

    pub fn latest(&self, task_id: &str) -> Option<StatusEvent> {
        self.log
            .get(task_id)
            .and_then(|events| events.last().cloned())
    }

    /// Task ids with at least one event, sorted.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.log.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

}

impl StatusPublisher for InMemoryStatusChannel {
    fn publish(&self, event: &StatusEvent) -> Result<(), MessagingError> {
        {
            let mut order = self.order.lock();
            if !self.log.contains_key(&event.task_id) {
                order.push_back(event.task_id.clone());
                while order.len() > self.retained_tasks {
                    if let Some(evicted) = order.pop_front() {
                        self.log.remove(&evicted);
                        debug!(task_id = %evicted, "Evicted status history");
                    }
                }
            }
            self.log
                .entry(event.task_id.clone())
                .or_default()
                .push(event.clone());
        }
        // No receivers is fine; the log above is the durable record.
        let _ = self.sender.send(event.clone());
        Ok(())
    }
}

/// Live view of an [`InMemoryStatusChannel`] restricted to a task id prefix.
pub struct StatusSubscription {
    prefix: String,
    receiver: broadcast::Receiver<StatusEvent>,
}

impl StatusSubscription {
    /// Next matching event, or `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.task_id.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "Status subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if event.task_id.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

enum SinkCommand {
    Line(String),
    Flush(Sender<()>),
}

/// Appends each event as a JSON line to a file.
///
/// Publishing only serializes the event and queues the line; a dedicated
/// writer thread owns the file. Dropping the sink drains the queue.
pub struct JsonLinesStatusSink {
    path: PathBuf,
    sender: Option<Sender<SinkCommand>>,
    writer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for JsonLinesStatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesStatusSink")
            .field("path", &self.path)
            .field("queued", &self.sender.as_ref().map_or(0, Sender::len))
            .finish()
    }
}

impl JsonLinesStatusSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MessagingError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let (sender, receiver) = channel::unbounded();
        let writer_path = path.clone();
        let writer = std::thread::Builder::new()
            .name("status-jsonl-writer".to_string())
            .spawn(move || write_lines(file, receiver, &writer_path))?;

        Ok(Self {
            path,
            sender: Some(sender),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Block until every line queued so far is written and flushed.
    pub fn flush(&self) -> Result<(), MessagingError> {
        let (done, wait) = channel::bounded(1);
        self.send(SinkCommand::Flush(done))?;
        wait.recv()
            .map_err(|_| MessagingError::Backend("status writer stopped".to_string()))
    }

    fn send(&self, command: SinkCommand) -> Result<(), MessagingError> {
        self.sender
            .as_ref()
            .ok_or_else(|| MessagingError::Backend("status writer stopped".to_string()))?
            .send(command)
            .map_err(|_| MessagingError::Backend("status writer stopped".to_string()))
    }

    /// Read back every event in a JSON-lines file. Blank lines are skipped.
    pub fn read_events(path: impl AsRef<Path>) -> Result<Vec<StatusEvent>, MessagingError> {
        let reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }
}

impl StatusPublisher for JsonLinesStatusSink {
    fn publish(&self, event: &StatusEvent) -> Result<(), MessagingError> {
        let line = serde_json::to_string(event)?;
        self.send(SinkCommand::Line(line))
    }
}

impl Drop for JsonLinesStatusSink {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop once the queue is drained
        self.sender.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                error!(path = %self.path.display(), "Status writer thread panicked");
            }
        }
    }
}

fn write_lines(file: File, commands: Receiver<SinkCommand>, path: &Path) {
    let mut out = BufWriter::new(file);
    for command in commands.iter() {
        match command {
            SinkCommand::Line(line) => {
                if let Err(e) = writeln!(out, "{line}") {
                    warn!(path = %path.display(), error = %e, "Failed to write status event");
                }
                if commands.is_empty() {
                    if let Err(e) = out.flush() {
                        warn!(path = %path.display(), error = %e, "Failed to flush status events");
                    }
                }
            }
            SinkCommand::Flush(done) => {
                if let Err(e) = out.flush() {
                    warn!(path = %path.display(), error = %e, "Failed to flush status events");
                }
                let _ = done.send(());
            }
        }
    }
    if let Err(e) = out.flush() {
        warn!(path = %path.display(), error = %e, "Failed to flush status events");
    }
}

/// Publishes to every inner publisher, even if some of them fail.
#[derive(Default)]
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn StatusPublisher>>,
}

impl FanoutPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn len(&self) -> usize {
        self.publishers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.publishers.is_empty()
    }
}

impl StatusPublisher for FanoutPublisher {
    /// Returns the first error after attempting every publisher.
    fn publish(&self, event: &StatusEvent) -> Result<(), MessagingError> {
        let mut first_error = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Builds events for one worker and publishes them without ever failing.
#[derive(Clone)]
pub struct StatusNotifier {
    worker_id: String,
    publisher: Arc<dyn StatusPublisher>,
}

impl std::fmt::Debug for StatusNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusNotifier")
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl StatusNotifier {
    pub fn new(worker_id: impl Into<String>, publisher: Arc<dyn StatusPublisher>) -> Self {
        Self {
            worker_id: worker_id.into(),
            publisher,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn notify(&self, task_id: &str, status: TaskStatus, stage: Stage, extra: Value) {
        let event = StatusEvent::new(task_id, status, stage, &self.worker_id, extra);
        match self.publisher.publish(&event) {
            Ok(()) => debug!(task_id = %task_id, status = %status, stage = %stage, "Status published"),
            Err(e) => warn!(
                task_id = %task_id,
                status = %status,
                stage = %stage,
                error = %e,
                "Failed to publish status event"
            ),
        }
    }
}
