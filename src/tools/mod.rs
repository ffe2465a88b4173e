//! Simulated tools exposed to tool-use scenarios.

pub mod calculator;
pub mod file_store;
pub mod search;

use serde_json::Value;

use crate::LLMError;

pub(crate) fn required_str<'a>(arguments: &'a Value, key: &str) -> Result<&'a str, LLMError> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| LLMError::InvalidToolArguments(format!("missing string argument '{key}'")))
}
