pub mod builtin;

use crate::platform::Caller;
use crate::provider::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Interaction mode for a chat turn. Ask exposes only read-only tools; Agent
/// additionally exposes mutating tools behind per-call user approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatMode {
    Ask,
    Agent,
}

impl ChatMode {
    /// Wire mapping: 1 = Ask, 2 = Agent. Anything else collapses to Ask
    /// (fail-closed).
    pub fn from_wire(value: i64) -> Self {
        match value {
            2 => ChatMode::Agent,
            _ => ChatMode::Ask,
        }
    }
}

/// Output of a tool execution. Tool failures are data, not errors: the model
/// always gets feedback and the chat loop stays linear.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

pub type ToolArgs = serde_json::Map<String, serde_json::Value>;

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name.
    fn name(&self) -> &str;
    /// Human-readable description, shown to the model.
    fn description(&self) -> &str;
    /// JSON schema for the input arguments.
    fn input_schema(&self) -> serde_json::Value;
    /// True if the tool only reads platform state.
    fn is_read_only(&self) -> bool;
    /// Run the tool. Implementations should return `Ok(ToolResult::error(..))`
    /// for expected failures; an `Err` is flattened by the engine anyway.
    async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult>;
}

/// A tool decorated with mode-policy predicates. Metadata and execution
/// delegate verbatim; the wrapper only *reports* policy — the chat engine is
/// the sole enforcement point, the registry merely filters what the model
/// sees.
pub struct SecuredTool {
    inner: Arc<dyn Tool>,
}

impl SecuredTool {
    pub fn new(inner: Arc<dyn Tool>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn description(&self) -> &str {
        self.inner.description()
    }

    pub fn input_schema(&self) -> serde_json::Value {
        self.inner.input_schema()
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    pub async fn execute(&self, caller: &Caller, args: &ToolArgs) -> Result<ToolResult> {
        self.inner.execute(caller, args).await
    }

    /// Mutating tools cannot run at all in Ask mode.
    pub fn is_blocked(&self, mode: ChatMode) -> bool {
        !self.inner.is_read_only() && mode == ChatMode::Ask
    }

    /// Mutating tools need explicit user approval in Agent mode.
    pub fn needs_confirmation(&self, mode: ChatMode) -> bool {
        !self.inner.is_read_only() && mode == ChatMode::Agent
    }
}

/// Thread-safe name → tool mapping with mode-filtered enumeration.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<SecuredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tool, replacing any prior registration under the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let secured = Arc::new(SecuredTool::new(tool));
        let mut tools = self.tools.write().unwrap();
        tools.insert(secured.name().to_string(), secured);
    }

    pub fn get(&self, name: &str) -> Option<Arc<SecuredTool>> {
        let tools = self.tools.read().unwrap();
        tools.get(name).cloned()
    }

    /// Tool definitions visible in the given mode: read-only tools always
    /// pass, mutating tools only in Agent mode. Sorted by name for a stable
    /// model-facing schema.
    pub fn list_for_mode(&self, mode: ChatMode) -> Vec<ToolDefinition> {
        let tools = self.tools.read().unwrap();
        let mut defs: Vec<ToolDefinition> = tools
            .values()
            .filter(|t| mode == ChatMode::Agent || t.is_read_only())
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn tool_names(&self) -> Vec<String> {
        let tools = self.tools.read().unwrap();
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeTool {
        name: &'static str,
        read_only: bool,
    }

    #[async_trait]
    impl Tool for FakeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "fake"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        fn is_read_only(&self) -> bool {
            self.read_only
        }
        async fn execute(&self, _caller: &Caller, _args: &ToolArgs) -> Result<ToolResult> {
            Ok(ToolResult::ok("done"))
        }
    }

    fn registry_with(tools: &[(&'static str, bool)]) -> ToolRegistry {
        let registry = ToolRegistry::new();
        for (name, read_only) in tools {
            registry.register(Arc::new(FakeTool {
                name,
                read_only: *read_only,
            }));
        }
        registry
    }

    #[test]
    fn mode_collapses_to_ask() {
        assert_eq!(ChatMode::from_wire(1), ChatMode::Ask);
        assert_eq!(ChatMode::from_wire(2), ChatMode::Agent);
        assert_eq!(ChatMode::from_wire(0), ChatMode::Ask);
        assert_eq!(ChatMode::from_wire(99), ChatMode::Ask);
        assert_eq!(ChatMode::from_wire(-1), ChatMode::Ask);
    }

    #[test]
    fn secured_tool_policy_table() {
        let read_only = SecuredTool::new(Arc::new(FakeTool {
            name: "reader",
            read_only: true,
        }));
        assert!(!read_only.is_blocked(ChatMode::Ask));
        assert!(!read_only.is_blocked(ChatMode::Agent));
        assert!(!read_only.needs_confirmation(ChatMode::Ask));
        assert!(!read_only.needs_confirmation(ChatMode::Agent));

        let mutating = SecuredTool::new(Arc::new(FakeTool {
            name: "writer",
            read_only: false,
        }));
        assert!(mutating.is_blocked(ChatMode::Ask));
        assert!(!mutating.is_blocked(ChatMode::Agent));
        assert!(!mutating.needs_confirmation(ChatMode::Ask));
        assert!(mutating.needs_confirmation(ChatMode::Agent));
    }

    #[test]
    fn ask_listing_is_subset_of_agent_listing() {
        let registry = registry_with(&[("a", true), ("b", false), ("c", true)]);

        let ask: Vec<String> = registry
            .list_for_mode(ChatMode::Ask)
            .into_iter()
            .map(|d| d.name)
            .collect();
        let agent: Vec<String> = registry
            .list_for_mode(ChatMode::Agent)
            .into_iter()
            .map(|d| d.name)
            .collect();

        assert_eq!(ask, vec!["a", "c"]);
        assert_eq!(agent, vec!["a", "b", "c"]);
        assert!(ask.iter().all(|n| agent.contains(n)));
        assert_eq!(agent, registry.tool_names());
    }

    #[test]
    fn register_replaces_prior_registration() {
        let registry = registry_with(&[("dup", true)]);
        registry.register(Arc::new(FakeTool {
            name: "dup",
            read_only: false,
        }));
        assert_eq!(registry.tool_names(), vec!["dup"]);
        assert!(!registry.get("dup").unwrap().is_read_only());
    }

    #[test]
    fn unknown_tool_lookup() {
        let registry = registry_with(&[]);
        assert!(registry.get("nope").is_none());
    }
}
