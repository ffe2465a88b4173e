use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    functions::{json_schema_for, FunctionDefinition, FunctionParameter, ToolFunction},
    tools::required_str,
    LLMError,
};

pub const MAX_VALUE_CHARS: usize = 10_000;

/// Key-value scratch space. Stateful, so each trial gets its own instance
/// and replay always uses the recorded outputs.
#[derive(Debug, Default)]
pub struct FileStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn fail(message: impl Into<String>) -> LLMError {
        LLMError::ToolExecution {
            tool: "file_store".to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl ToolFunction for FileStore {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new("file_store")
            .with_description("Read, write, list or delete named values in a scratch store.")
            .with_parameter(
                FunctionParameter::new(
                    "action",
                    json!({"type": "string", "enum": ["read", "write", "list", "delete"]}),
                )
                .with_description("Operation to perform."),
            )
            .with_parameter(
                FunctionParameter::new("key", json_schema_for::<String>())
                    .with_description("Entry name; required except for list.")
                    .optional(),
            )
            .with_parameter(
                FunctionParameter::new("value", json_schema_for::<String>())
                    .with_description("Value to store; required for write.")
                    .optional(),
            )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        let action = required_str(arguments, "action")?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Self::fail("store lock poisoned"))?;

        match action {
            "list" => Ok(json!({ "keys": entries.keys().collect::<Vec<_>>() })),
            "write" => {
                let key = required_str(arguments, "key")?;
                let value = match arguments.get("value") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => return Err(LLMError::InvalidToolArguments("missing argument 'value'".into())),
                };
                if value.chars().count() > MAX_VALUE_CHARS {
                    return Err(Self::fail(format!("value exceeds {MAX_VALUE_CHARS} characters")));
                }
                entries.insert(key.to_string(), value);
                Ok(json!({ "status": "ok", "key": key }))
            }
            "read" => {
                let key = required_str(arguments, "key")?;
                entries
                    .get(key)
                    .map(|value| json!({ "key": key, "value": value }))
                    .ok_or_else(|| Self::fail(format!("no entry named '{key}'")))
            }
            "delete" => {
                let key = required_str(arguments, "key")?;
                entries
                    .remove(key)
                    .map(|_| json!({ "status": "deleted", "key": key }))
                    .ok_or_else(|| Self::fail(format!("no entry named '{key}'")))
            }
            other => Err(LLMError::InvalidToolArguments(format!("unknown action '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_list_delete() {
        let store = FileStore::new();
        store
            .invoke(&json!({"action": "write", "key": "a", "value": "1"}))
            .await
            .expect("write");
        let read = store.invoke(&json!({"action": "read", "key": "a"})).await.expect("read");
        assert_eq!(read["value"], "1");
        let list = store.invoke(&json!({"action": "list"})).await.expect("list");
        assert_eq!(list["keys"], json!(["a"]));
        store.invoke(&json!({"action": "delete", "key": "a"})).await.expect("delete");
        assert!(store.invoke(&json!({"action": "read", "key": "a"})).await.is_err());
    }

    #[tokio::test]
    async fn oversized_values_are_rejected() {
        let store = FileStore::new();
        let big = "x".repeat(MAX_VALUE_CHARS + 1);
        let err = store
            .invoke(&json!({"action": "write", "key": "k", "value": big}))
            .await
            .expect_err("too big");
        assert!(err.to_string().contains("exceeds"));
        assert!(store.snapshot().is_empty());
    }
}
