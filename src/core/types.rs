//! Catalog entries and tool call results handed to callers

use crate::core::protocol::{
    ContentItem, PromptArgument, PromptDefinition, ResourceDefinition, ToolDefinition,
};
use serde::Serialize;
use serde_json::Value;

/// A tool exposed by one server, addressed as `server.tool`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub qualified_name: String,
    pub name: String,
    pub server_name: String,
    pub description: String,
    pub input_schema: Value,
}

impl Tool {
    pub fn from_definition(server: &str, def: ToolDefinition) -> Self {
        let input_schema = if def.input_schema.is_null() {
            serde_json::json!({ "type": "object", "properties": {} })
        } else {
            def.input_schema
        };
        Self {
            qualified_name: format!("{}.{}", server, def.name),
            name: def.name,
            server_name: server.to_string(),
            description: def.description.unwrap_or_default(),
            input_schema,
        }
    }

    /// Names listed under the schema's `required` key
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    pub uri: String,
    pub server_name: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl Resource {
    pub fn from_definition(server: &str, def: ResourceDefinition) -> Self {
        Self {
            uri: def.uri,
            server_name: server.to_string(),
            name: def.name,
            description: def.description,
            mime_type: def.mime_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub name: String,
    pub server_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Vec<PromptArgument>>,
}

impl Prompt {
    pub fn from_definition(server: &str, def: PromptDefinition) -> Self {
        Self {
            name: def.name,
            server_name: server.to_string(),
            description: def.description,
            arguments: def.arguments,
        }
    }
}

/// Everything discovered from one server
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

impl Catalog {
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn tool_names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name.as_str())
    }

    pub fn owns_resource(&self, uri: &str) -> bool {
        self.resources.iter().any(|r| r.uri == uri)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationMetadata {
    pub server_name: String,
    pub tool_name: String,
    pub execution_time_ms: u64,
}

/// Outcome of one tool call. Failures are values, never `Err`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub success: bool,
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<InvocationMetadata>,
}

impl ToolInvocationResult {
    pub fn success(content: Vec<ContentItem>) -> Self {
        Self {
            success: true,
            content,
            error: None,
            metadata: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: Vec::new(),
            error: Some(error.into()),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, server: &str, tool: &str, execution_time_ms: u64) -> Self {
        self.metadata = Some(InvocationMetadata {
            server_name: server.to_string(),
            tool_name: tool.to_string(),
            execution_time_ms,
        });
        self
    }

    /// Text parts joined by newlines
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentItem::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tool_qualified_name_keeps_dots_in_tool() {
        let def: ToolDefinition = serde_json::from_value(json!({
            "name": "files.read",
            "description": "Read a file",
            "inputSchema": {"type": "object", "required": ["path"]}
        }))
        .unwrap();
        let tool = Tool::from_definition("fs", def);

        assert_eq!(tool.qualified_name, "fs.files.read");
        assert_eq!(tool.name, "files.read");
        assert_eq!(tool.required_params(), vec!["path"]);
    }

    #[test]
    fn test_missing_schema_defaults_to_empty_object() {
        let def: ToolDefinition = serde_json::from_value(json!({"name": "status"})).unwrap();
        let tool = Tool::from_definition("git", def);
        assert_eq!(tool.input_schema["type"], "object");
        assert!(tool.required_params().is_empty());
        assert_eq!(tool.description, "");
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let result = ToolInvocationResult::success(vec![ContentItem::text("hi")]).with_metadata("fs", "read", 12);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["metadata"]["executionTimeMs"], 12);
        assert_eq!(value["content"][0]["type"], "text");
        assert!(value.get("error").is_none());
        assert_eq!(result.text(), "hi");
    }
}
