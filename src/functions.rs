//! Tool plumbing shared by the dispatcher, the adapters and traces: JSON
//! schemas offered to the model, the wire form of tool calls, and the
//! recorded outcome of each dispatched call.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

use crate::LLMError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: FunctionParameters,
}

impl FunctionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            parameters: FunctionParameters::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, parameter: FunctionParameter) -> Self {
        self.add_parameter(parameter);
        self
    }

    pub fn add_parameter(&mut self, parameter: FunctionParameter) {
        let FunctionParameter {
            name,
            mut schema,
            description,
            required,
            default,
        } = parameter;

        if let Some(object) = schema.as_object_mut() {
            if let Some(description) = description {
                object.insert("description".to_string(), Value::String(description));
            }
            if let Some(default) = default {
                object.insert("default".to_string(), default);
            }
        }

        if required {
            self.parameters.required.push(name.clone());
        }

        self.parameters.properties.insert(name, schema);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionParameters {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(
        rename = "additionalProperties",
        skip_serializing_if = "Option::is_none"
    )]
    pub additional_properties: Option<bool>,
}

impl FunctionParameters {
    pub fn new() -> Self {
        Self {
            kind: "object".to_string(),
            properties: BTreeMap::new(),
            required: Vec::new(),
            additional_properties: Some(false),
        }
    }
}

impl Default for FunctionParameters {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct FunctionParameter {
    pub name: String,
    pub schema: Value,
    pub description: Option<String>,
    pub required: bool,
    pub default: Option<Value>,
}

impl FunctionParameter {
    pub fn new(name: impl Into<String>, schema: Value) -> Self {
        Self {
            name: name.into(),
            schema,
            description: None,
            required: true,
            default: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub kind: ToolType,
    pub function: FunctionDefinition,
}

impl From<FunctionDefinition> for Tool {
    fn from(function: FunctionDefinition) -> Self {
        Self {
            kind: ToolType::Function,
            function,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    Function,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: Value,
    pub raw_arguments: Option<String>,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            raw_arguments: None,
        }
    }

    /// Raw argument text as it will appear on the wire and in traces.
    pub fn canonical_arguments(&self) -> String {
        match &self.raw_arguments {
            Some(raw) => raw.clone(),
            None => self.arguments.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: Option<String>,
    pub function: FunctionCall,
}

impl ToolCall {
    pub fn new(function: FunctionCall) -> Self {
        Self { id: None, function }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

impl Serialize for ToolCall {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ToolCall", 3)?;
        if let Some(id) = &self.id {
            state.serialize_field("id", id)?;
        }
        state.serialize_field("type", &ToolType::Function)?;
        state.serialize_field("function", &SerializableFunctionCall(&self.function))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolCall {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawFunctionCall {
            name: String,
            arguments: String,
        }

        #[derive(Deserialize)]
        struct RawToolCall {
            id: Option<String>,
            #[serde(rename = "type", default = "default_kind")]
            kind: String,
            function: RawFunctionCall,
        }

        fn default_kind() -> String {
            "function".to_string()
        }

        let raw = RawToolCall::deserialize(deserializer)?;
        if raw.kind != "function" {
            return Err(serde::de::Error::custom(format!(
                "unsupported tool call type '{}'",
                raw.kind
            )));
        }

        let arguments: Value = serde_json::from_str(&raw.function.arguments).map_err(|error| {
            serde::de::Error::custom(format!("failed to parse function arguments: {error}"))
        })?;

        Ok(Self {
            id: raw.id,
            function: FunctionCall {
                name: raw.function.name,
                arguments,
                raw_arguments: Some(raw.function.arguments),
            },
        })
    }
}

struct SerializableFunctionCall<'a>(&'a FunctionCall);

impl<'a> Serialize for SerializableFunctionCall<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("function", 2)?;
        state.serialize_field("name", &self.0.name)?;
        state.serialize_field("arguments", &self.0.canonical_arguments())?;
        state.end()
    }
}

/// Whether a tool's recorded output is trusted during replay or recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayMode {
    /// Always replayed from the trace.
    #[default]
    Frozen,
    /// Recomputed on replay and checked against the trace. Only for pure tools.
    Live,
}

#[async_trait]
pub trait ToolFunction: Send + Sync {
    fn definition(&self) -> FunctionDefinition;

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError>;

    fn replay_mode(&self) -> ReplayMode {
        ReplayMode::Frozen
    }
}

pub type DynToolFunction = Arc<dyn ToolFunction>;

#[derive(Default, Clone)]
pub struct ToolRegistry {
    functions: BTreeMap<String, DynToolFunction>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, function: DynToolFunction) {
        let name = function.definition().name;
        self.functions.insert(name, function);
    }

    pub fn get(&self, name: &str) -> Option<&DynToolFunction> {
        self.functions.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn definitions(&self) -> Vec<FunctionDefinition> {
        self.functions
            .values()
            .map(|function| function.definition())
            .collect()
    }

    pub fn tools(&self) -> Vec<Tool> {
        self.definitions().into_iter().map(Tool::from).collect()
    }

    pub fn replay_mode(&self, name: &str) -> ReplayMode {
        self.get(name)
            .map(|function| function.replay_mode())
            .unwrap_or_default()
    }

    pub async fn invoke(&self, call: &FunctionCall) -> Result<Value, LLMError> {
        let function = self
            .get(&call.name)
            .ok_or_else(|| LLMError::UnknownTool(call.name.clone()))?;
        function.invoke(&call.arguments).await
    }
}

/// Outcome of one dispatched tool call, as stored in traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub name: String,
    pub arguments: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub replay: ReplayMode,
}

impl ToolCallResult {
    pub fn ok(call_id: impl Into<String>, call: &FunctionCall, output: Value, replay: ReplayMode) -> Self {
        Self {
            call_id: call_id.into(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            success: true,
            output: Some(output),
            error: None,
            replay,
        }
    }

    pub fn failed(call_id: impl Into<String>, call: &FunctionCall, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: call.name.clone(),
            arguments: call.arguments.clone(),
            success: false,
            output: None,
            error: Some(error.into()),
            replay: ReplayMode::Frozen,
        }
    }

    /// Body of the tool message handed back to the model.
    pub fn content(&self) -> String {
        match (&self.output, &self.error) {
            (Some(output), None) => output.to_string(),
            (_, Some(error)) => json!({ "error": error }).to_string(),
            (None, None) => Value::Null.to_string(),
        }
    }
}

pub fn json_schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema.schema).unwrap_or_else(|_| json!({}))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    None,
    Auto,
    Required,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolFunction for Echo {
        fn definition(&self) -> FunctionDefinition {
            FunctionDefinition::new("echo").with_parameter(FunctionParameter::new(
                "text",
                json_schema_for::<String>(),
            ))
        }

        async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
            Ok(arguments.get("text").cloned().unwrap_or(Value::Null))
        }
    }

    #[tokio::test]
    async fn unknown_function_is_reported() {
        let registry = ToolRegistry::new();
        let err = registry
            .invoke(&FunctionCall::new("missing", json!({})))
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, LLMError::UnknownTool(name) if name == "missing"));
    }

    #[tokio::test]
    async fn registry_invokes_and_reports_replay_mode() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        let value = registry
            .invoke(&FunctionCall::new("echo", json!({"text": "hi"})))
            .await
            .expect("echo");
        assert_eq!(value, json!("hi"));
        assert_eq!(registry.replay_mode("echo"), ReplayMode::Frozen);
        assert_eq!(registry.tools().len(), 1);
    }

    #[test]
    fn tool_call_serializes_arguments_as_string() {
        let call = ToolCall::new(FunctionCall::new("echo", json!({"text": "hi"}))).with_id("call_1");
        let encoded = serde_json::to_string(&call).expect("encode");
        assert!(encoded.contains(r#""arguments":"{\"text\":\"hi\"}""#));

        let decoded: ToolCall = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded.function.arguments, json!({"text": "hi"}));
        assert_eq!(decoded.function.raw_arguments.as_deref(), Some(r#"{"text":"hi"}"#));
    }

    #[test]
    fn failed_result_content_is_structured() {
        let call = FunctionCall::new("nope", json!({}));
        let result = ToolCallResult::failed("call_0", &call, "unknown tool: nope");
        assert_eq!(result.content(), r#"{"error":"unknown tool: nope"}"#);
        assert!(!result.success);
    }
}
