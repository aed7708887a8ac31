use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// A capability the hosted model may invoke mid-conversation.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    /// Declaration advertised to the model in the session configuration.
    fn schema(&self) -> Value;
    async fn execute(&self, input: Value) -> Result<Value>;
}

#[derive(Debug, Error)]
#[error("tool `{0}` is already registered")]
pub struct DuplicateTool(pub String);

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), DuplicateTool> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(DuplicateTool(name));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn schemas(&self) -> Vec<Value> {
        let mut schemas: Vec<Value> = self.tools.values().map(|tool| tool.schema()).collect();
        // HashMap iteration order is arbitrary; keep declarations stable.
        schemas.sort_by(|a, b| {
            a.get("name").and_then(Value::as_str).cmp(&b.get("name").and_then(Value::as_str))
        });
        schemas
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    use super::{Tool, ToolRegistry};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn schema(&self) -> Value {
            json!({ "type": "function", "name": "echo" })
        }

        async fn execute(&self, input: Value) -> Result<Value> {
            Ok(input)
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = ToolRegistry::default();
        registry.register(Arc::new(EchoTool)).expect("first registration succeeds");

        let error = registry.register(Arc::new(EchoTool)).expect_err("duplicate must fail");
        assert_eq!(error.to_string(), "tool `echo` is already registered");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn registered_tools_are_dispatchable_by_name() {
        let mut registry = ToolRegistry::default();
        registry.register(Arc::new(EchoTool)).expect("registration succeeds");

        let tool = registry.get("echo").expect("tool is present");
        let output = tool.execute(json!({ "query": "hi" })).await.expect("echo never fails");
        assert_eq!(output, json!({ "query": "hi" }));
        assert!(registry.get("search").is_none());
    }
}
