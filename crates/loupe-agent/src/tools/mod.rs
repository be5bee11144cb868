mod symbols;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use loupe_core::Result;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Duration, timeout};
use tracing::warn;

use crate::Agent;

pub use symbols::core_tools;

/// Per-tool invocation budget. Symbol-indexing tools walk whole scopes and
/// get a longer leash.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(240);
pub const INDEXING_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

/// A named operation with a JSON-schema input. The dispatcher only ever
/// sees this capability; argument decoding happens inside each tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn schema(&self) -> Value;

    fn timeout(&self) -> Duration {
        DEFAULT_TOOL_TIMEOUT
    }

    async fn invoke(&self, agent: &Agent, args: Value) -> Result<Value>;
}

/// Advertised shape of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// What a dispatch produced: either a text payload (JSON-encoded result)
/// or an error kind plus message.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ToolOutcome {
    Ok { ok: bool, text: String },
    Error { error: bool, kind: String, message: String },
}

impl ToolOutcome {
    fn success(text: String) -> Self {
        ToolOutcome::Ok { ok: true, text }
    }

    fn failure(kind: &str, message: String) -> Self {
        ToolOutcome::Error {
            error: true,
            kind: kind.to_string(),
            message,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok { .. })
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_core_tools() -> Self {
        let mut registry = Self::new();
        for tool in core_tools() {
            registry.register(tool);
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.schema(),
            })
            .collect()
    }

    /// Run one tool under its timeout. Cancelling the invocation drops its
    /// outstanding waits; transport requests it was blocked on are
    /// abandoned, not cancelled server-side.
    pub async fn dispatch(&self, agent: &Agent, name: &str, args: Value) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::failure("invalid_input", format!("unknown tool: {name}"));
        };

        match timeout(tool.timeout(), tool.invoke(agent, args)).await {
            Err(_elapsed) => {
                warn!("tool {name} timed out after {:?}", tool.timeout());
                ToolOutcome::failure("timeout", format!("tool {name} timed out"))
            }
            Ok(Err(err)) => ToolOutcome::failure(err.kind(), err.to_string()),
            Ok(Ok(value)) => match serde_json::to_string(&value) {
                Ok(text) => ToolOutcome::success(text),
                Err(err) => ToolOutcome::failure("internal", err.to_string()),
            },
        }
    }
}
