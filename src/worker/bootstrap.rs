//! # Worker Bootstrap
//!
//! Wires configuration, backends, registry and publishers into a running
//! consumer. Every seam defaults to its in-process implementation.
//!
//! ```rust,ignore
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register("psi", Arc::new(PsiHandler::default()))?;
//!
//! let worker = WorkerBuilder::new(WorkerConfig::load(None)?)
//!     .with_registry(registry)
//!     .build()?;
//! let handle = worker.start();
//! // ...
//! handle.stop().await;
//! ```

use super::consumer::{ConsumerSettings, QueueConsumer};
use super::timeout::HardTimeoutAction;
use crate::client::TaskClient;
use crate::config::WorkerConfig;
use crate::error::{ConfigResult, ConfigurationError};
use crate::events::{
    FanoutPublisher, InMemoryStatusChannel, JsonLinesStatusSink, StatusNotifier, StatusPublisher,
};
use crate::messaging::{InMemoryResultBackend, InMemoryTaskQueue, ResultBackend, TaskQueue};
use crate::orchestration::TaskOrchestrator;
use crate::registry::HandlerRegistry;
use crate::resources::{
    ClusterBackend, ClusterManager, DeviceBackend, DeviceManager, LocalClusterBackend,
    LocalDeviceBackend,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct WorkerBuilder {
    config: WorkerConfig,
    registry: Arc<HandlerRegistry>,
    cluster_backend: Arc<dyn ClusterBackend>,
    device_backend: Arc<dyn DeviceBackend>,
    queue: Arc<dyn TaskQueue>,
    results: Arc<dyn ResultBackend>,
    publishers: Vec<Arc<dyn StatusPublisher>>,
    hard_timeout_action: Option<Arc<dyn HardTimeoutAction>>,
}

impl WorkerBuilder {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(HandlerRegistry::new()),
            cluster_backend: Arc::new(LocalClusterBackend::new()),
            device_backend: Arc::new(LocalDeviceBackend::new()),
            queue: Arc::new(InMemoryTaskQueue::new()),
            results: Arc::new(InMemoryResultBackend::new()),
            publishers: Vec::new(),
            hard_timeout_action: None,
        }
    }

    pub fn with_registry(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_cluster_backend(mut self, backend: Arc<dyn ClusterBackend>) -> Self {
        self.cluster_backend = backend;
        self
    }

    pub fn with_device_backend(mut self, backend: Arc<dyn DeviceBackend>) -> Self {
        self.device_backend = backend;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_result_backend(mut self, results: Arc<dyn ResultBackend>) -> Self {
        self.results = results;
        self
    }

    /// Publish status events here too, next to the built-in channel.
    pub fn with_status_publisher(mut self, publisher: Arc<dyn StatusPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }

    pub fn with_hard_timeout_action(mut self, action: Arc<dyn HardTimeoutAction>) -> Self {
        self.hard_timeout_action = Some(action);
        self
    }

    /// Validate the configuration and assemble the worker.
    pub fn build(self) -> ConfigResult<Worker> {
        self.config.validate()?;

        let status_channel = Arc::new(
            InMemoryStatusChannel::with_capacity(self.config.status.channel_capacity)
                .with_retention(self.config.status.retained_tasks),
        );
        let mut fanout = FanoutPublisher::new().with(status_channel.clone());
        if let Some(path) = &self.config.status.json_lines_path {
            let sink = JsonLinesStatusSink::open(path).map_err(|e| {
                ConfigurationError::invalid_value("status.json_lines_path", e.to_string())
            })?;
            fanout = fanout.with(Arc::new(sink));
        }
        for publisher in self.publishers {
            fanout = fanout.with(publisher);
        }
        let notifier = StatusNotifier::new(self.config.worker.node_id.clone(), Arc::new(fanout));

        let orchestrator = TaskOrchestrator::new(
            Arc::new(ClusterManager::new(self.cluster_backend)),
            Arc::new(DeviceManager::new(self.device_backend)),
            self.registry.clone(),
            notifier,
        )
        .with_party_config(self.config.devices.party_config());

        let mut consumer = QueueConsumer::new(
            Arc::new(orchestrator),
            self.queue.clone(),
            self.results.clone(),
            ConsumerSettings::from_config(&self.config)?,
        );
        if let Some(action) = self.hard_timeout_action {
            consumer = consumer.with_hard_timeout_action(action);
        }

        let client = TaskClient::new(self.queue, self.results, self.config.worker.queue_name.clone())
            .with_registry(self.registry.clone());

        info!(
            worker_id = %self.config.worker.node_id,
            queue = %self.config.worker.queue_name,
            task_types = ?self.registry.list_registered(),
            "Worker assembled"
        );

        Ok(Worker {
            consumer: Arc::new(consumer),
            client,
            status_channel,
            registry: self.registry,
        })
    }
}

/// Assembled worker: one consumer plus a client bound to the same queue.
#[derive(Debug, Clone)]
pub struct Worker {
    consumer: Arc<QueueConsumer>,
    client: TaskClient,
    status_channel: Arc<InMemoryStatusChannel>,
    registry: Arc<HandlerRegistry>,
}

impl Worker {
    pub fn consumer(&self) -> &Arc<QueueConsumer> {
        &self.consumer
    }

    pub fn client(&self) -> &TaskClient {
        &self.client
    }

    pub fn status_channel(&self) -> &Arc<InMemoryStatusChannel> {
        &self.status_channel
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Run the consumer loop on a background task.
    pub fn start(&self) -> WorkerHandle {
        let shutdown = CancellationToken::new();
        let consumer = self.consumer.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { consumer.run(token).await });
        WorkerHandle {
            shutdown,
            task: Some(task),
        }
    }
}

/// Handle for a consumer loop started with [`Worker::start`].
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Ask the loop to stop after the current job and wait for it.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Consumer task ended abnormally");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
