//! # Handler Registry
//!
//! Maps a task type to the algorithm handler that runs it.
//!
//! ## Architecture
//!
//! ```text
//! TaskOrchestrator ──dispatch(task_type)──→ HandlerRegistry
//!                                               │
//!                                               ├─→ "psi"  → PsiHandler
//!                                               ├─→ "echo" → FnHandler
//!                                               └─→ ?      → UnsupportedTaskType
//! ```
//!
//! Registration happens once at startup. Registering the same task type twice is
//! a programming error and is rejected; the first handler stays in place.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = HandlerRegistry::new();
//! registry.register("psi", Arc::new(PsiHandler::default()))?;
//! registry.register_fn("echo", |_devices, params| Ok(serde_json::to_value(params)?))?;
//!
//! let result = registry.dispatch("psi", &devices, &params, &ctx).await?;
//! ```

use crate::error::{RegistryError, Result, TaskError};
use crate::logging::log_task_operation;
use crate::models::TaskParameters;
use crate::resources::DeviceSet;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

/// Per-dispatch context lent to a handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub task_id: String,
    /// Cancelled when the soft time limit expires.
    pub cancellation: CancellationToken,
}

impl HandlerContext {
    pub fn new(task_id: impl Into<String>, cancellation: CancellationToken) -> Self {
        Self {
            task_id: task_id.into(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the soft time limit has expired.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }
}

/// Algorithm handler execution trait
///
/// Handlers receive the devices created for this job and the raw task
/// parameters. Errors are reported to the queue consumer unchanged, so a handler
/// chooses between `Algorithm`, `ParameterValidation`, `DataLoad` and
/// `ResultSave` itself.
///
/// Long-running handlers should await [`HandlerContext::cancelled`] or poll
/// [`HandlerContext::is_cancelled`] at their own checkpoints; the orchestrator
/// also stops polling the handler future once the token fires.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn call(
        &self,
        devices: &DeviceSet,
        params: &TaskParameters,
        ctx: &HandlerContext,
    ) -> Result<Value>;

    /// Handler name for logging and diagnostics
    fn name(&self) -> &str;
}

/// Adapter for synchronous closures.
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&DeviceSet, &TaskParameters) -> Result<Value> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&DeviceSet, &TaskParameters) -> Result<Value> + Send + Sync + 'static,
{
    async fn call(
        &self,
        devices: &DeviceSet,
        params: &TaskParameters,
        _ctx: &HandlerContext,
    ) -> Result<Value> {
        (self.func)(devices, params)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Diagnostics for one registration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandlerInfo {
    pub task_type: String,
    pub handler_name: String,
    pub registered_at: DateTime<Utc>,
}

struct RegisteredHandler {
    handler: Arc<dyn TaskHandler>,
    registered_at: DateTime<Utc>,
}

/// Thread-safe task type → handler map.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, RegisteredHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.list_registered())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a task type.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyRegistered`] if the task type already has a
    /// handler, [`RegistryError::Invalid`] for an empty task type.
    pub fn register(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> std::result::Result<(), RegistryError> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(RegistryError::Invalid(
                "task type must not be empty".to_string(),
            ));
        }

        let mut handlers = self.handlers.write();
        if let Some(existing) = handlers.get(&task_type) {
            warn!(
                task_type = %task_type,
                existing = existing.handler.name(),
                attempted = handler.name(),
                "Rejected duplicate handler registration"
            );
            return Err(RegistryError::AlreadyRegistered {
                task_type,
                existing: existing.handler.name().to_string(),
                attempted: handler.name().to_string(),
            });
        }

        info!(task_type = %task_type, handler = handler.name(), "Registered task handler");
        handlers.insert(
            task_type,
            RegisteredHandler {
                handler,
                registered_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Register a synchronous closure, named after its task type.
    pub fn register_fn<F>(
        &self,
        task_type: impl Into<String>,
        func: F,
    ) -> std::result::Result<(), RegistryError>
    where
        F: Fn(&DeviceSet, &TaskParameters) -> Result<Value> + Send + Sync + 'static,
    {
        let task_type = task_type.into();
        let handler = FnHandler::new(format!("fn:{task_type}"), func);
        self.register(task_type, Arc::new(handler))
    }

    /// Run the handler registered for `task_type`.
    ///
    /// # Errors
    ///
    /// [`TaskError::UnsupportedTaskType`] listing every registered type when
    /// nothing handles `task_type`; otherwise whatever the handler returns.
    pub async fn dispatch(
        &self,
        task_type: &str,
        devices: &DeviceSet,
        params: &TaskParameters,
        ctx: &HandlerContext,
    ) -> Result<Value> {
        let handler = self.handler(task_type).ok_or_else(|| {
            TaskError::UnsupportedTaskType {
                task_type: task_type.to_string(),
                registered: self.list_registered(),
            }
        })?;

        debug!(
            task_id = %ctx.task_id,
            task_type = %task_type,
            handler = handler.name(),
            devices = ?devices.names(),
            "Dispatching to handler"
        );
        log_task_operation("dispatch", &ctx.task_id, Some(task_type), "started", Some(handler.name()));

        handler.call(devices, params, ctx).await
    }

    /// Handler registered for `task_type`.
    pub fn handler(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers
            .read()
            .get(task_type)
            .map(|entry| entry.handler.clone())
    }

    /// Registered task types, sorted.
    pub fn list_registered(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().keys().cloned().collect();
        types.sort();
        types
    }

    pub fn handler_info(&self, task_type: &str) -> Option<HandlerInfo> {
        self.handlers.read().get(task_type).map(|entry| HandlerInfo {
            task_type: task_type.to_string(),
            handler_name: entry.handler.name().to_string(),
            registered_at: entry.registered_at,
        })
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers.read().contains_key(task_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
