//! Tool System
//!
//! Extensible tool framework for agent capabilities.
//! Tools are registered at runtime and invoked by the reasoning loop.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::Message;

/// Tool call requested by the model
///
/// Built incrementally while streaming: `arguments` holds the raw JSON text
/// and `inputs` its parsed form once the call is finalized.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call ID, unique per request
    pub id: String,

    /// Tool identifier
    pub name: String,

    /// Raw JSON arguments as sent by the provider
    #[serde(default)]
    pub arguments: String,

    /// Parsed arguments
    #[serde(default)]
    pub inputs: serde_json::Map<String, serde_json::Value>,
}

impl ToolCall {
    /// Parse raw JSON arguments into a finalized call
    ///
    /// Empty argument text is treated as `{}`.
    pub fn parse(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let name = name.into();
        let arguments = arguments.into();

        let inputs = if arguments.trim().is_empty() {
            serde_json::Map::new()
        } else {
            match serde_json::from_str::<serde_json::Value>(&arguments) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(other) => {
                    return Err(AgentError::Protocol(format!(
                        "arguments for tool call '{}' must be a JSON object, got {}",
                        id, other
                    )));
                }
                Err(e) => {
                    return Err(AgentError::Protocol(format!(
                        "invalid JSON arguments for tool call '{}': {}",
                        id, e
                    )));
                }
            }
        };

        Ok(Self {
            id,
            name,
            arguments,
            inputs,
        })
    }

    /// Get a string input
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.inputs.get(key).and_then(|v| v.as_str())
    }
}

/// Result from tool execution
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResult {
    /// Tool that was called
    pub name: String,

    /// Call ID this result answers
    pub id: String,

    /// Whether execution succeeded
    pub success: bool,

    /// Output (success message or error)
    pub output: String,

    /// Structured data (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn success(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            success: true,
            output: output.into(),
            data: None,
        }
    }

    pub fn failure(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: String::new(),
            success: false,
            output: error.into(),
            data: None,
        }
    }

    /// Tool result describing an error the model should see
    pub fn from_error(call: &ToolCall, error: &AgentError) -> Self {
        Self::failure(&call.name, error.to_string()).with_id(&call.id)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Wrap into a tool-result message correlated by call ID
    pub fn into_message(self) -> Message {
        let content = if self.success {
            self.output
        } else {
            format!("Error: {}", self.output)
        };
        let mut msg = Message::tool_result(self.id, self.name, content);
        if !self.success {
            msg = msg.add_metadata("is_error", serde_json::Value::Bool(true));
        }
        if let Some(data) = self.data {
            msg = msg.add_metadata("data", data);
        }
        msg
    }
}

/// Parameter definition for tool schema
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParameterSchema {
    /// Parameter name
    pub name: String,

    /// JSON Schema type (string, number, boolean, object, array)
    #[serde(rename = "type")]
    pub param_type: String,

    /// Human-readable description
    pub description: String,

    /// Whether this parameter is required
    #[serde(default)]
    pub required: bool,
}

impl ParameterSchema {
    pub fn required(name: impl Into<String>, param_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            param_type: param_type.into(),
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, param_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name, param_type, description)
        }
    }
}

/// Tool definition schema (for LLM function calling)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Unique tool identifier
    pub name: String,

    /// Human-readable description (shown to LLM)
    pub description: String,

    /// Parameter definitions, in declaration order
    pub parameters: Vec<ParameterSchema>,
}

impl ToolSchema {
    /// Names of the required parameters
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
            .collect()
    }

    /// JSON Schema object for the parameters
    pub fn parameters_json(&self) -> serde_json::Value {
        let properties: serde_json::Map<String, serde_json::Value> = self
            .parameters
            .iter()
            .map(|p| {
                (
                    p.name.clone(),
                    serde_json::json!({
                        "type": p.param_type,
                        "description": p.description,
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": self.required_parameters(),
        })
    }
}

/// Tool trait - implement to add new capabilities
#[async_trait]
pub trait Tool: Send + Sync {
    /// Get the tool's schema for LLM function calling
    fn schema(&self) -> ToolSchema;

    /// Execute the tool with given arguments
    async fn execute(&self, call: &ToolCall) -> Result<ToolResult>;

    /// Validate arguments before execution
    fn validate(&self, call: &ToolCall) -> Result<()> {
        let schema = self.schema();

        for param in &schema.parameters {
            if param.required && !call.inputs.contains_key(&param.name) {
                return Err(AgentError::InvalidToolInput {
                    tool: schema.name.clone(),
                    parameter: param.name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Registry for available tools
///
/// Reads are concurrent; registration takes the write lock.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    order: RwLock<Vec<String>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register a new tool
    pub fn register<T: Tool + 'static>(&self, tool: T) -> Result<()> {
        self.register_arc(Arc::new(tool))
    }

    /// Register a shared tool
    pub fn register_arc(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.schema().name;
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);

        if tools.contains_key(&name) {
            return Err(AgentError::DuplicateTool(name));
        }

        tools.insert(name.clone(), tool);
        self.order
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name);
        Ok(())
    }

    /// Find a tool by name
    pub fn find(&self, name: &str) -> Result<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| AgentError::UnknownTool(name.to_string()))
    }

    /// Invoke a tool with a parsed call
    ///
    /// Required parameters are checked first. Errors and panics raised by
    /// the tool body come back as `ToolExecution`.
    pub async fn invoke(&self, tool: &Arc<dyn Tool>, call: &ToolCall) -> Result<ToolResult> {
        tool.validate(call)?;

        let outcome = AssertUnwindSafe(tool.execute(call)).catch_unwind().await;

        match outcome {
            Ok(Ok(result)) => Ok(result.with_id(&call.id)),
            Ok(Err(e)) => Err(AgentError::ToolExecution {
                tool: call.name.clone(),
                message: match e {
                    AgentError::ToolExecution { message, .. } => message,
                    other => other.to_string(),
                },
            }),
            Err(panic) => Err(AgentError::ToolExecution {
                tool: call.name.clone(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    /// Find and invoke, never failing: every error becomes a failed result
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let outcome = match self.find(&call.name) {
            Ok(tool) => self.invoke(&tool, call).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(result) => result,
            Err(e) => {
                if e.is_tool_feedback() {
                    tracing::debug!(tool = %call.name, call_id = %call.id, error = %e, "Tool call failed");
                } else {
                    tracing::warn!(tool = %call.name, call_id = %call.id, error = %e, "Tool call hit a collaborator fault");
                }
                ToolResult::from_error(call, &e)
            }
        }
    }

    /// Get all tool schemas, in registration order
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().unwrap_or_else(PoisonError::into_inner);
        self.order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|name| tools.get(name).map(|t| t.schema()))
            .collect()
    }

    /// Get tool names, in registration order
    pub fn names(&self) -> Vec<String> {
        self.order
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "tool panicked".into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingTool, PanickingTool, SlowEchoTool};

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall::parse("call_1", name, args).unwrap()
    }

    #[test]
    fn test_parse_arguments() {
        let parsed = ToolCall::parse("1", "echo", r#"{"a":1}"#).unwrap();
        assert_eq!(parsed.inputs.get("a"), Some(&serde_json::json!(1)));

        let empty = ToolCall::parse("2", "echo", "").unwrap();
        assert!(empty.inputs.is_empty());

        assert!(matches!(
            ToolCall::parse("3", "echo", r#"{"a":"#),
            Err(AgentError::Protocol(_))
        ));
        assert!(matches!(
            ToolCall::parse("4", "echo", "[1,2]"),
            Err(AgentError::Protocol(_))
        ));
    }

    #[test]
    fn test_register_and_find() {
        let registry = ToolRegistry::new();
        registry.register(SlowEchoTool::instant("echo")).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.find("echo").is_ok());
        assert!(matches!(registry.find("missing"), Err(AgentError::UnknownTool(n)) if n == "missing"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = ToolRegistry::new();
        registry.register(SlowEchoTool::instant("echo")).unwrap();
        let err = registry.register(SlowEchoTool::instant("echo")).unwrap_err();
        assert!(matches!(err, AgentError::DuplicateTool(n) if n == "echo"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_required_parameter() {
        let registry = ToolRegistry::new();
        registry.register(SlowEchoTool::instant("echo")).unwrap();
        let tool = registry.find("echo").unwrap();

        let err = registry.invoke(&tool, &call("echo", "{}")).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::InvalidToolInput { ref parameter, .. } if parameter == "text"
        ));
    }

    #[tokio::test]
    async fn test_tool_failure_is_wrapped() {
        let registry = ToolRegistry::new();
        registry.register(FailingTool).unwrap();
        registry.register(PanickingTool).unwrap();

        let tool = registry.find("fail").unwrap();
        let err = registry.invoke(&tool, &call("fail", "{}")).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::ToolExecution { ref tool, ref message } if tool == "fail" && message.contains("boom")
        ));

        let tool = registry.find("panic").unwrap();
        let err = registry.invoke(&tool, &call("panic", "{}")).await.unwrap_err();
        assert!(matches!(err, AgentError::ToolExecution { ref message, .. } if message.contains("kaboom")));
    }

    #[tokio::test]
    async fn test_execute_never_fails() {
        let registry = ToolRegistry::new();
        let result = registry.execute(&call("nope", "{}")).await;
        assert!(!result.success);
        assert_eq!(result.id, "call_1");

        let msg = result.into_message();
        assert!(msg.content.contains("Unknown tool"));
        assert_eq!(msg.metadata.get("is_error"), Some(&serde_json::json!(true)));
    }

    #[test]
    fn test_parameters_json() {
        let schema = SlowEchoTool::instant("echo").schema();
        let json = schema.parameters_json();
        assert_eq!(json["type"], "object");
        assert_eq!(json["required"], serde_json::json!(["text"]));
        assert_eq!(json["properties"]["text"]["type"], "string");
    }
}
