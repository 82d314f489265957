//! Functions the assistant can call during a voice session.
//!
//! Each function implements the [`Tool`] trait and is registered in a
//! [`ToolRegistry`]. [`FunctionDispatch`] turns streamed call events into
//! exactly one invocation and one output payload per call id.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use parley_core::types::ToolDefinition;

pub mod dispatch;
pub mod notes;

pub use dispatch::{CallOutcome, FunctionDispatch, PendingCall, PreparedCall};
pub use notes::WriteNoteTool;

/// A function exposed to the model.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Function name as exposed to the model (e.g. "write_note").
    fn name(&self) -> &str;

    /// JSON Schema describing the arguments.
    fn parameters_schema(&self) -> Value;

    /// Human-readable description for the model.
    fn description(&self) -> &str;

    /// Run the function with parsed arguments.
    async fn execute(&self, params: Value) -> anyhow::Result<Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

type Handler = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A tool backed by a closure.
pub struct FnTool {
    definition: ToolDefinition,
    handler: Box<Handler>,
}

impl FnTool {
    pub fn new<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            definition,
            handler: Box::new(move |args| handler(args).boxed()),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn parameters_schema(&self) -> Value {
        self.definition.parameters.clone()
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    async fn execute(&self, params: Value) -> anyhow::Result<Value> {
        (self.handler)(params).await
    }
}

/// Registry of available tools.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A later tool with the same name replaces the earlier one.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Definitions advertised in the session configuration.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }
}
