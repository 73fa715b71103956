use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::capability::Capability;
use crate::error::CapabilityError;
use crate::schema::{ParamSpec, ParameterSchema};

pub(super) const NAME: &str = "calculator";
pub(super) const DESCRIPTION: &str = "Apply an arithmetic operation to two numbers";

const OPERATIONS: [&str; 4] = ["add", "subtract", "multiply", "divide"];

pub struct Calculator {
    schema: ParameterSchema,
}

impl Calculator {
    pub fn new() -> Self {
        let schema = ParameterSchema::new()
            .param(
                "operation",
                ParamSpec::string("One of add, subtract, multiply, divide")
                    .required()
                    .with_keyword("enum", json!(OPERATIONS)),
            )
            .param("a", ParamSpec::number("Left operand").required())
            .param("b", ParamSpec::number("Right operand").required());
        Self { schema }
    }
}

impl Default for Calculator {
    fn default() -> Self {
        Self::new()
    }
}

fn operand(arguments: &Value, name: &str) -> Result<f64, CapabilityError> {
    arguments[name]
        .as_f64()
        .ok_or_else(|| CapabilityError::Execution(format!("`{name}` is not a number")))
}

#[async_trait]
impl Capability for Calculator {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn parameter_schema(&self) -> &ParameterSchema {
        &self.schema
    }

    async fn execute(
        &self,
        arguments: Value,
        _cancel: CancellationToken,
    ) -> Result<Value, CapabilityError> {
        let a = operand(&arguments, "a")?;
        let b = operand(&arguments, "b")?;

        let result = match arguments["operation"].as_str().unwrap_or_default() {
            "add" => a + b,
            "subtract" => a - b,
            "multiply" => a * b,
            "divide" if b == 0.0 => {
                return Err(CapabilityError::Execution("division by zero".to_string()));
            }
            "divide" => a / b,
            other => {
                return Err(CapabilityError::Execution(format!(
                    "unsupported operation: {other}"
                )));
            }
        };

        if !result.is_finite() {
            return Err(CapabilityError::Execution("result is not finite".to_string()));
        }
        Ok(json!(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(arguments: Value) -> Result<Value, CapabilityError> {
        Calculator::new()
            .execute(arguments, CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn arithmetic() {
        let sum = run(json!({"operation": "add", "a": 2, "b": 3.5})).await.unwrap();
        assert_eq!(sum.as_f64(), Some(5.5));

        let quotient = run(json!({"operation": "divide", "a": 9, "b": 3})).await.unwrap();
        assert_eq!(quotient.as_f64(), Some(3.0));

        let difference = run(json!({"operation": "subtract", "a": 1, "b": 4})).await.unwrap();
        assert_eq!(difference.as_f64(), Some(-3.0));
    }

    #[tokio::test]
    async fn division_by_zero_fails() {
        let err = run(json!({"operation": "divide", "a": 1, "b": 0})).await.unwrap_err();
        assert_eq!(err.to_string(), "execution failed: division by zero");
    }

    #[tokio::test]
    async fn unknown_operation_fails() {
        let err = run(json!({"operation": "modulo", "a": 1, "b": 2})).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Execution(_)));
    }

    #[test]
    fn declares_operation_enum() {
        let declaration = Calculator::new().to_declaration();
        let parameters = &declaration.function.parameters;
        assert_eq!(parameters["required"], json!(["a", "b", "operation"]));
        assert_eq!(
            parameters["properties"]["operation"]["enum"],
            json!(["add", "subtract", "multiply", "divide"])
        );
    }
}
