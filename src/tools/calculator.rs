use async_trait::async_trait;
use evalexpr::{eval, Value as ExprValue};
use serde_json::{json, Value};

use crate::{
    functions::{json_schema_for, FunctionDefinition, FunctionParameter, ToolFunction, ReplayMode},
    tools::required_str,
    LLMError,
};

/// Arithmetic over standard operators and parentheses. Pure, so replay
/// recomputes it and checks the stored output.
#[derive(Debug, Default, Clone, Copy)]
pub struct Calculator;

pub fn evaluate(expression: &str) -> Result<f64, String> {
    let value = eval(expression).map_err(|err| err.to_string())?;
    let number = match value {
        ExprValue::Int(v) => v as f64,
        ExprValue::Float(v) => v,
        ExprValue::Boolean(v) => {
            if v {
                1.0
            } else {
                0.0
            }
        }
        other => return Err(format!("expression did not evaluate to a number: {other:?}")),
    };
    if number.is_finite() {
        Ok(number)
    } else {
        Err("expression did not evaluate to a finite number".to_string())
    }
}

#[async_trait]
impl ToolFunction for Calculator {
    fn definition(&self) -> FunctionDefinition {
        FunctionDefinition::new("calculator")
            .with_description("Evaluate a mathematical expression using standard operators and parentheses.")
            .with_parameter(
                FunctionParameter::new("expression", json_schema_for::<String>())
                    .with_description("The expression to evaluate, e.g. '7600000000.0 / 116250'."),
            )
    }

    async fn invoke(&self, arguments: &Value) -> Result<Value, LLMError> {
        let expression = required_str(arguments, "expression")?;
        evaluate(expression)
            .map(|number| json!(number))
            .map_err(|message| LLMError::ToolExecution {
                tool: "calculator".to_string(),
                message,
            })
    }

    fn replay_mode(&self) -> ReplayMode {
        ReplayMode::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_arithmetic() {
        assert_eq!(evaluate("2 * (3 + 4)"), Ok(14.0));
        let per_capita = evaluate("7600000000.0 / 116250").expect("division");
        assert!((per_capita - 65376.344).abs() < 0.01);
    }

    #[tokio::test]
    async fn bad_expression_is_a_function_error() {
        let err = Calculator
            .invoke(&json!({"expression": "2 +"}))
            .await
            .expect_err("parse failure");
        assert!(matches!(err, LLMError::ToolExecution { .. }));

        let missing = Calculator.invoke(&json!({})).await.expect_err("missing arg");
        assert!(matches!(missing, LLMError::InvalidToolArguments(_)));
    }
}
