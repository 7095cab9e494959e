//! Utility System
//!
//! Process-wide catalog of callable utilities. Utilities are registered once
//! at startup; after that the registry is shared read-only between runs.
//! Dispatch validates arguments against the utility's parameter schema,
//! invokes the executor with the caller's execution context, converts any
//! failure into a [`DispatchError`] and appends an execution log entry in the
//! background.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::error::{AgentError, DispatchError, Result};
use crate::execlog::{ExecutionLog, ExecutionLogEntry, LogSchema};

/// Static description of a utility
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UtilityDescriptor {
    /// Unique utility identifier (the tool name the model calls)
    pub id: String,

    /// Human-readable description (shown to the model)
    pub description: String,

    /// JSON Schema of the argument object
    pub parameters: serde_json::Value,
}

impl UtilityDescriptor {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Id and description only, for advertising what is available
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilitySummary {
    pub id: String,
    pub description: String,
}

/// Successful executor output
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    /// Text handed back to the model
    pub output: String,

    /// Structured data (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecuteResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Utility trait - implement to add new capabilities
#[async_trait]
pub trait Utility: Send + Sync {
    /// Descriptor used for registration and advertising
    fn descriptor(&self) -> UtilityDescriptor;

    /// Execute with already-validated arguments
    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecuteResult>;
}

type UtilityHandler = dyn Fn(
        serde_json::Value,
        ExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<ExecuteResult>> + Send>>
    + Send
    + Sync;

/// Closure-based utility for quick registration
pub struct FnUtility {
    descriptor: UtilityDescriptor,
    handler: Arc<UtilityHandler>,
}

impl FnUtility {
    pub fn new<F, Fut>(descriptor: UtilityDescriptor, handler: F) -> Self
    where
        F: Fn(serde_json::Value, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ExecuteResult>> + Send + 'static,
    {
        Self {
            descriptor,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }
}

#[async_trait]
impl Utility for FnUtility {
    fn descriptor(&self) -> UtilityDescriptor {
        self.descriptor.clone()
    }

    async fn execute(
        &self,
        args: &serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ExecuteResult> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for FnUtility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnUtility")
            .field("id", &self.descriptor.id)
            .finish_non_exhaustive()
    }
}

struct Registered {
    descriptor: UtilityDescriptor,
    validator: jsonschema::Validator,
    utility: Arc<dyn Utility>,
}

/// Registry for available utilities
#[derive(Default)]
pub struct UtilityRegistry {
    entries: Vec<Registered>,
    index: HashMap<String, usize>,
    log: Option<Arc<dyn ExecutionLog>>,
}

impl UtilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the execution log every dispatch is recorded in.
    ///
    /// Attach it before registering utilities so their log layouts are
    /// checked at registration.
    #[must_use]
    pub fn with_log_store(mut self, log: Arc<dyn ExecutionLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// Register a new utility. Duplicate ids and uncompilable schemas are
    /// startup errors, as are ids or parameter names the attached log
    /// cannot store.
    pub fn register<U: Utility + 'static>(&mut self, utility: U) -> Result<()> {
        self.register_arc(Arc::new(utility))
    }

    /// Register a shared utility
    pub fn register_arc(&mut self, utility: Arc<dyn Utility>) -> Result<()> {
        let descriptor = utility.descriptor();
        if self.index.contains_key(&descriptor.id) {
            return Err(AgentError::DuplicateUtility(descriptor.id));
        }
        let validator = jsonschema::Validator::new(&descriptor.parameters).map_err(|e| {
            AgentError::Config(format!("invalid parameter schema for '{}': {e}", descriptor.id))
        })?;
        if self.log.is_some() {
            LogSchema::derive(&descriptor.id, &descriptor.parameters)?;
        }

        tracing::debug!(utility = %descriptor.id, "Registered utility");
        self.index.insert(descriptor.id.clone(), self.entries.len());
        self.entries.push(Registered {
            descriptor,
            validator,
            utility,
        });
        Ok(())
    }

    /// Get a utility's descriptor by id
    pub fn get(&self, id: &str) -> Result<&UtilityDescriptor> {
        self.entry(id)
            .map(|r| &r.descriptor)
            .ok_or_else(|| DispatchError::ToolNotFound(id.to_string()).into())
    }

    /// Id and description of every utility, in registration order
    pub fn list(&self) -> Vec<UtilitySummary> {
        self.entries
            .iter()
            .map(|r| UtilitySummary {
                id: r.descriptor.id.clone(),
                description: r.descriptor.description.clone(),
            })
            .collect()
    }

    /// Full descriptors, in registration order (for model function calling)
    pub fn descriptors(&self) -> Vec<UtilityDescriptor> {
        self.entries.iter().map(|r| r.descriptor.clone()).collect()
    }

    /// Get utility ids
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|r| r.descriptor.id.as_str()).collect()
    }

    /// Number of registered utilities
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, id: &str) -> Option<&Registered> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Validate, execute and log one call.
    ///
    /// Never panics and never propagates executor failures: every outcome is
    /// either an [`ExecuteResult`] or a [`DispatchError`].
    pub async fn dispatch(
        &self,
        id: &str,
        args: &serde_json::Value,
        ctx: &ExecutionContext,
    ) -> std::result::Result<ExecuteResult, DispatchError> {
        let Some(entry) = self.entry(id) else {
            tracing::debug!(tool = id, node_id = %ctx.node_id(), "Unknown utility requested");
            return Err(DispatchError::ToolNotFound(id.to_string()));
        };

        let started_at = Utc::now();
        let outcome = if let Err(reason) = Self::validate(entry, args) {
            Err(DispatchError::InvalidArguments {
                tool: id.to_string(),
                reason,
            })
        } else {
            Self::execute(entry, args, ctx).await
        };

        match &outcome {
            Ok(_) => tracing::debug!(tool = id, node_id = %ctx.node_id(), "Utility succeeded"),
            Err(e) => tracing::info!(tool = id, node_id = %ctx.node_id(), error = %e, "Utility failed"),
        }

        self.record(entry, args, &outcome, ctx, started_at);
        outcome
    }

    fn validate(entry: &Registered, args: &serde_json::Value) -> std::result::Result<(), String> {
        if entry.validator.is_valid(args) {
            return Ok(());
        }
        let errors: Vec<String> = entry
            .validator
            .iter_errors(args)
            .map(|e| e.to_string())
            .collect();
        Err(errors.join("; "))
    }

    async fn execute(
        entry: &Registered,
        args: &serde_json::Value,
        ctx: &ExecutionContext,
    ) -> std::result::Result<ExecuteResult, DispatchError> {
        let tool = &entry.descriptor.id;
        match AssertUnwindSafe(entry.utility.execute(args, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(AgentError::Dispatch(e))) => Err(e),
            Ok(Err(e)) => Err(DispatchError::execution_failed(tool, e.to_string())),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "executor panicked".into());
                tracing::error!(tool = %tool, %reason, "Utility panicked");
                Err(DispatchError::execution_failed(tool, reason))
            }
        }
    }

    /// Append the log entry on a background task. Failures only reach tracing.
    fn record(
        &self,
        entry: &Registered,
        args: &serde_json::Value,
        outcome: &std::result::Result<ExecuteResult, DispatchError>,
        ctx: &ExecutionContext,
        started_at: DateTime<Utc>,
    ) {
        let Some(log) = self.log.clone() else {
            return;
        };

        let (success, result) = match outcome {
            Ok(r) => (true, serde_json::to_value(r).unwrap_or_default()),
            Err(e) => (
                false,
                serde_json::json!({ "error": e.kind(), "message": e.to_string() }),
            ),
        };
        let log_entry = ExecutionLogEntry {
            tool_id: entry.descriptor.id.clone(),
            params: args.clone(),
            result,
            success,
            conversation_id: ctx.conversation_id.to_string(),
            node_id: ctx.node_id().to_string(),
            parent_node_id: ctx.node.parent_id.as_ref().map(ToString::to_string),
            started_at,
            finished_at: Utc::now(),
        };
        let parameters = entry.descriptor.parameters.clone();

        tokio::spawn(async move {
            let tool_id = log_entry.tool_id.clone();
            let written: Result<()> = async {
                log.ensure_log(&tool_id, &parameters).await?;
                log.append(log_entry).await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(tool = %tool_id, error = %e, "Failed to write execution log");
            }
        });
    }
}
