//! Streamed function-call assembly and invocation.
//!
//! Arguments arrive as string fragments keyed by call id. When the call is
//! marked done its buffer is removed, the arguments are parsed, and the call
//! becomes a [`PreparedCall`] that yields exactly one output payload.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use parley_core::types::ToolDefinition;

use crate::{Tool, ToolRegistry};

/// Arguments accumulated so far for one call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingCall {
    pub name: Option<String>,
    pub arguments: String,
}

/// The payload submitted when a call cannot produce a result.
pub fn failure(message: impl std::fmt::Display) -> Value {
    json!({ "success": false, "error": message.to_string() })
}

/// Per-session function-call state.
pub struct FunctionDispatch {
    registry: Arc<ToolRegistry>,
    pending: HashMap<String, PendingCall>,
}

impl FunctionDispatch {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            pending: HashMap::new(),
        }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    /// Append an argument fragment, creating the buffer on first sight.
    pub fn on_delta(&mut self, call_id: &str, fragment: &str, name: Option<&str>) {
        let entry = self.pending.entry(call_id.to_string()).or_default();
        if entry.name.is_none() {
            entry.name = name.map(str::to_string);
        }
        entry.arguments.push_str(fragment);
        debug!(call_id, len = entry.arguments.len(), "Buffered function arguments");
    }

    /// Close out a call.
    ///
    /// The buffer is removed whatever happens next. `arguments` from the done
    /// event win when non-empty; otherwise the buffered fragments are used.
    pub fn on_done(&mut self, call_id: &str, arguments: &str, name: Option<&str>) -> PreparedCall {
        let buffered = self.pending.remove(call_id).unwrap_or_default();
        let name = name
            .map(str::to_string)
            .or(buffered.name)
            .unwrap_or_default();
        let raw = if arguments.is_empty() {
            buffered.arguments
        } else {
            arguments.to_string()
        };

        let invocation = match serde_json::from_str::<Value>(&raw) {
            Err(e) => {
                warn!(call_id, function = %name, %e, "Unparseable function arguments");
                Invocation::Failed(failure(format!("invalid arguments: {e}")))
            }
            Ok(args) => match self.registry.get(&name) {
                None => {
                    warn!(call_id, function = %name, "No handler registered");
                    Invocation::Failed(failure(format!("no handler registered for {name}")))
                }
                Some(tool) => Invocation::Run { tool, args },
            },
        };

        PreparedCall {
            call_id: call_id.to_string(),
            name,
            invocation,
        }
    }

    pub fn pending(&self, call_id: &str) -> Option<&PendingCall> {
        self.pending.get(call_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every partially received call.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

enum Invocation {
    Failed(Value),
    Run { tool: Arc<dyn Tool>, args: Value },
}

/// A call ready to run. Consumed by [`PreparedCall::run`], so the handler
/// runs at most once.
pub struct PreparedCall {
    call_id: String,
    name: String,
    invocation: Invocation,
}

/// Result of a finished call, ready to submit.
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    pub call_id: String,
    pub name: String,
    pub output: Value,
    /// False when the output is a failure payload.
    pub ok: bool,
}

impl PreparedCall {
    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a handler will be invoked.
    pub fn will_invoke(&self) -> bool {
        matches!(self.invocation, Invocation::Run { .. })
    }

    pub async fn run(self) -> CallOutcome {
        let Self {
            call_id,
            name,
            invocation,
        } = self;

        let (output, ok) = match invocation {
            Invocation::Failed(payload) => (payload, false),
            Invocation::Run { tool, args } => {
                info!(call_id = %call_id, function = %name, "Executing function");
                match AssertUnwindSafe(tool.execute(args)).catch_unwind().await {
                    Ok(Ok(value)) => (value, true),
                    Ok(Err(e)) => {
                        warn!(call_id = %call_id, function = %name, %e, "Function failed");
                        (failure(e), false)
                    }
                    Err(_) => {
                        warn!(call_id = %call_id, function = %name, "Function panicked");
                        (failure("function handler panicked"), false)
                    }
                }
            }
        };

        CallOutcome {
            call_id,
            name,
            output,
            ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::FnTool;

    fn registry_with(name: &str, calls: Arc<AtomicUsize>) -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::new(
            ToolDefinition {
                name: name.into(),
                description: "test".into(),
                parameters: json!({"type": "object"}),
            },
            move |args| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if args.get("fail").is_some() {
                        anyhow::bail!("asked to fail");
                    }
                    Ok(json!({ "success": true, "echo": args }))
                }
            },
        )));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_fragments_accumulate_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = FunctionDispatch::new(registry_with("write_note", calls.clone()));

        dispatch.on_delta("c1", "{\"title\":", Some("write_note"));
        dispatch.on_delta("c1", "\"hi\"}", None);
        assert_eq!(dispatch.pending("c1").unwrap().arguments, "{\"title\":\"hi\"}");
        assert_eq!(dispatch.pending("c1").unwrap().name.as_deref(), Some("write_note"));

        // Empty done payload falls back to the buffer
        let call = dispatch.on_done("c1", "", None);
        assert!(dispatch.pending("c1").is_none());
        assert_eq!(call.name(), "write_note");

        let outcome = call.run().await;
        assert!(outcome.ok);
        assert_eq!(outcome.output["echo"]["title"], "hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_function_is_not_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = FunctionDispatch::new(registry_with("write_note", calls.clone()));

        let call = dispatch.on_done("c2", "{}", Some("launch_rockets"));
        assert!(!call.will_invoke());
        let outcome = call.run().await;
        assert!(!outcome.ok);
        assert_eq!(
            outcome.output,
            json!({"success": false, "error": "no handler registered for launch_rockets"})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_bad_json_yields_failure_and_clears_buffer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = FunctionDispatch::new(registry_with("write_note", calls.clone()));

        dispatch.on_delta("c3", "{\"title\": ", Some("write_note"));
        let outcome = dispatch.on_done("c3", "", None).run().await;
        assert_eq!(dispatch.pending_count(), 0);
        assert!(!outcome.ok);
        assert_eq!(outcome.output["success"], false);
        assert!(outcome.output["error"].as_str().unwrap().starts_with("invalid arguments"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_wrapped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = FunctionDispatch::new(registry_with("write_note", calls.clone()));

        let outcome = dispatch
            .on_done("c4", r#"{"fail": true}"#, Some("write_note"))
            .run()
            .await;
        assert_eq!(outcome.call_id, "c4");
        assert_eq!(
            outcome.output,
            json!({"success": false, "error": "asked to fail"})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_done_arguments_take_priority() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = FunctionDispatch::new(registry_with("write_note", calls));

        dispatch.on_delta("c5", "{\"partial", Some("write_note"));
        let outcome = dispatch
            .on_done("c5", r#"{"title":"full"}"#, None)
            .run()
            .await;
        assert!(outcome.ok);
        assert_eq!(outcome.output["echo"]["title"], "full");
    }

    #[tokio::test]
    async fn test_panicking_handler_still_produces_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::new(
            ToolDefinition {
                name: "boom".into(),
                description: "panics".into(),
                parameters: json!({"type": "object"}),
            },
            |_args| async move {
                if true {
                    panic!("boom");
                }
                Ok(Value::Null)
            },
        )));
        let mut dispatch = FunctionDispatch::new(Arc::new(registry));
        let outcome = dispatch.on_done("c6", "{}", Some("boom")).run().await;
        assert!(!outcome.ok);
        assert_eq!(outcome.output["error"], "function handler panicked");
    }

    #[test]
    fn test_separate_calls_do_not_mix() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatch = FunctionDispatch::new(registry_with("write_note", calls));
        dispatch.on_delta("a", "[1", None);
        dispatch.on_delta("b", "[2", None);
        dispatch.on_delta("a", "]", None);
        assert_eq!(dispatch.pending("a").unwrap().arguments, "[1]");
        assert_eq!(dispatch.pending("b").unwrap().arguments, "[2");
        dispatch.clear();
        assert_eq!(dispatch.pending_count(), 0);
    }
}
