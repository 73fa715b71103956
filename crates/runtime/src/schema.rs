//! Parameter schemas and argument validation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::warn;

/// Declared type of a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Integer => "integer",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(ParamType::String),
            "number" => Some(ParamType::Number),
            "integer" => Some(ParamType::Integer),
            "boolean" => Some(ParamType::Boolean),
            "array" => Some(ParamType::Array),
            "object" => Some(ParamType::Object),
            _ => None,
        }
    }

    /// Whether `value` has this type. `number` takes any JSON number,
    /// `integer` only integral ones (`3.0` is not an integer).
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Argument validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("arguments must be an object, got {found}")]
    NotAnObject { found: &'static str },

    #[error("missing required parameter(s): {}", .params.join(", "))]
    Missing { params: Vec<String> },

    #[error("parameter `{param}` must be {expected}, got {found}")]
    TypeMismatch {
        param: String,
        expected: ParamType,
        found: &'static str,
    },
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    /// `None` when the declaring side gave no type this runtime knows; such
    /// parameters are never type-checked.
    pub kind: Option<ParamType>,
    pub description: String,
    pub required: bool,
    pub default: Option<Value>,
    /// Further JSON Schema keywords (`enum`, `items`, ...) carried into the
    /// declaration untouched.
    pub keywords: Map<String, Value>,
}

impl ParamSpec {
    pub fn new(kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            description: description.into(),
            required: false,
            default: None,
            keywords: Map::new(),
        }
    }

    pub fn untyped(description: impl Into<String>) -> Self {
        Self {
            kind: None,
            ..Self::new(ParamType::Object, description)
        }
    }

    pub fn string(description: impl Into<String>) -> Self {
        Self::new(ParamType::String, description)
    }

    pub fn number(description: impl Into<String>) -> Self {
        Self::new(ParamType::Number, description)
    }

    pub fn integer(description: impl Into<String>) -> Self {
        Self::new(ParamType::Integer, description)
    }

    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new(ParamType::Boolean, description)
    }

    pub fn array(description: impl Into<String>) -> Self {
        Self::new(ParamType::Array, description)
    }

    pub fn object(description: impl Into<String>) -> Self {
        Self::new(ParamType::Object, description)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_keyword(mut self, key: impl Into<String>, value: Value) -> Self {
        self.keywords.insert(key.into(), value);
        self
    }

    fn to_property(&self) -> Value {
        let mut property = self.keywords.clone();
        if let Some(kind) = self.kind {
            property.insert("type".to_string(), json!(kind.as_str()));
        }
        property.insert("description".to_string(), json!(self.description));
        if let Some(default) = &self.default {
            property.insert("default".to_string(), default.clone());
        }
        Value::Object(property)
    }

    fn from_property(property: &Value) -> Self {
        let kind = property
            .get("type")
            .and_then(Value::as_str)
            .and_then(ParamType::parse);

        let keywords = property
            .as_object()
            .map(|object| {
                object
                    .iter()
                    .filter(|(key, _)| !matches!(key.as_str(), "type" | "description" | "default"))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            kind,
            description: property
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            required: false,
            default: property.get("default").cloned(),
            keywords,
        }
    }
}

/// Named parameters a capability accepts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSchema {
    params: BTreeMap<String, ParamSpec>,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, name: impl Into<String>, spec: ParamSpec) -> Self {
        self.params.insert(name.into(), spec);
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamSpec> {
        self.params.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.params.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Names of required parameters, in name order.
    pub fn required(&self) -> Vec<&str> {
        self.iter()
            .filter(|(_, spec)| spec.required)
            .map(|(name, _)| name)
            .collect()
    }

    /// Build from an object-typed JSON Schema, as reported by remote servers.
    pub fn from_json_schema(schema: &Value) -> Self {
        let mut params: BTreeMap<String, ParamSpec> = schema
            .get("properties")
            .and_then(Value::as_object)
            .map(|properties| {
                properties
                    .iter()
                    .map(|(name, property)| (name.clone(), ParamSpec::from_property(property)))
                    .collect()
            })
            .unwrap_or_default();

        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);

        for name in required {
            params
                .entry(name.to_string())
                .or_insert_with(|| ParamSpec::untyped(""))
                .required = true;
        }

        Self { params }
    }

    /// Render as an object-typed JSON Schema with a derived `required` list.
    pub fn to_json_schema(&self) -> Value {
        let properties: Map<String, Value> = self
            .iter()
            .map(|(name, spec)| (name.to_string(), spec.to_property()))
            .collect();

        json!({
            "type": "object",
            "properties": properties,
            "required": self.required(),
        })
    }

    /// Check `arguments` against the declared parameters.
    ///
    /// `null` arguments count as an empty object and a `null` parameter value
    /// counts as absent. Unknown parameters are passed through with a warning.
    pub fn validate(&self, arguments: &Value) -> Result<(), ValidationError> {
        let empty = Map::new();
        let arguments = match arguments {
            Value::Object(object) => object,
            Value::Null => &empty,
            other => {
                return Err(ValidationError::NotAnObject {
                    found: json_type_name(other),
                });
            }
        };

        let missing: Vec<String> = self
            .iter()
            .filter(|(name, spec)| spec.required && arguments.get(*name).is_none_or(Value::is_null))
            .map(|(name, _)| name.to_string())
            .collect();

        if !missing.is_empty() {
            return Err(ValidationError::Missing { params: missing });
        }

        for (name, value) in arguments {
            let Some(spec) = self.params.get(name) else {
                warn!(param = %name, "unknown parameter passed through");
                continue;
            };

            if value.is_null() {
                continue;
            }

            if let Some(expected) = spec.kind {
                if !expected.matches(value) {
                    return Err(ValidationError::TypeMismatch {
                        param: name.clone(),
                        expected,
                        found: json_type_name(value),
                    });
                }
            }
        }

        Ok(())
    }
}
