//! Tool Input Schemas
//!
//! A small structural schema language checked against tool input before a
//! handler runs. Full JSON Schema documents are accepted through
//! [`Schema::JsonSchema`] and validated with the `jsonschema` crate.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of an acceptable tool input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schema {
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Null,
    Array {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        items: Option<Box<Schema>>,
    },
    Object {
        #[serde(default)]
        properties: IndexMap<String, Schema>,
        #[serde(default)]
        required: Vec<String>,
        #[serde(default = "default_additional_properties", rename = "additionalProperties")]
        additional_properties: bool,
    },
    Enum {
        values: Vec<Value>,
    },
    #[serde(rename = "one_of")]
    OneOf {
        variants: Vec<Schema>,
    },
    #[serde(rename = "json_schema")]
    JsonSchema {
        schema: Value,
    },
}

fn default_additional_properties() -> bool {
    true
}

/// A mismatch between input and schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Location of the offending value, `$` being the input root
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Schema {
    /// Object schema whose listed properties are all required
    pub fn object<K: Into<String>>(properties: impl IntoIterator<Item = (K, Schema)>) -> Self {
        let properties: IndexMap<String, Schema> = properties
            .into_iter()
            .map(|(key, schema)| (key.into(), schema))
            .collect();
        let required = properties.keys().cloned().collect();
        Schema::Object {
            properties,
            required,
            additional_properties: true,
        }
    }

    /// Add an optional property to an object schema
    pub fn with_optional(mut self, key: impl Into<String>, schema: Schema) -> Self {
        if let Schema::Object { properties, .. } = &mut self {
            properties.insert(key.into(), schema);
        }
        self
    }

    /// Reject properties not declared by an object schema
    pub fn strict(mut self) -> Self {
        if let Schema::Object {
            additional_properties,
            ..
        } = &mut self
        {
            *additional_properties = false;
        }
        self
    }

    pub fn array(items: Schema) -> Self {
        Schema::Array {
            items: Some(Box::new(items)),
        }
    }

    pub fn enumeration(values: impl IntoIterator<Item = Value>) -> Self {
        Schema::Enum {
            values: values.into_iter().collect(),
        }
    }

    pub fn one_of(variants: impl IntoIterator<Item = Schema>) -> Self {
        Schema::OneOf {
            variants: variants.into_iter().collect(),
        }
    }

    pub fn json_schema(schema: Value) -> Self {
        Schema::JsonSchema { schema }
    }

    /// Check that embedded JSON Schema documents compile
    pub fn check(&self) -> Result<(), String> {
        match self {
            Schema::JsonSchema { schema } => jsonschema::validator_for(schema)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Schema::Array { items: Some(items) } => items.check(),
            Schema::Object { properties, .. } => properties.values().try_for_each(Schema::check),
            Schema::OneOf { variants } => variants.iter().try_for_each(Schema::check),
            _ => Ok(()),
        }
    }

    pub fn validate(&self, value: &Value) -> Result<(), SchemaViolation> {
        self.validate_at(value, "$")
    }

    fn validate_at(&self, value: &Value, path: &str) -> Result<(), SchemaViolation> {
        let violation = |message: String| SchemaViolation {
            path: path.to_string(),
            message,
        };
        let expected = |kind: &str| violation(format!("expected {}, got {}", kind, kind_of(value)));

        match self {
            Schema::Any => Ok(()),
            Schema::String if value.is_string() => Ok(()),
            Schema::String => Err(expected("string")),
            Schema::Number if value.is_number() => Ok(()),
            Schema::Number => Err(expected("number")),
            Schema::Integer if is_integer(value) => Ok(()),
            Schema::Integer => Err(expected("integer")),
            Schema::Boolean if value.is_boolean() => Ok(()),
            Schema::Boolean => Err(expected("boolean")),
            Schema::Null if value.is_null() => Ok(()),
            Schema::Null => Err(expected("null")),
            Schema::Array { items } => {
                let Some(elements) = value.as_array() else {
                    return Err(expected("array"));
                };
                if let Some(items) = items {
                    for (index, element) in elements.iter().enumerate() {
                        items.validate_at(element, &format!("{}[{}]", path, index))?;
                    }
                }
                Ok(())
            }
            Schema::Object {
                properties,
                required,
                additional_properties,
            } => {
                let Some(fields) = value.as_object() else {
                    return Err(expected("object"));
                };
                for key in required {
                    if !fields.contains_key(key) {
                        return Err(SchemaViolation {
                            path: format!("{}.{}", path, key),
                            message: "missing required property".to_string(),
                        });
                    }
                }
                for (key, field) in fields {
                    let field_path = format!("{}.{}", path, key);
                    match properties.get(key) {
                        Some(schema) => schema.validate_at(field, &field_path)?,
                        None if !additional_properties => {
                            return Err(SchemaViolation {
                                path: field_path,
                                message: "unexpected property".to_string(),
                            })
                        }
                        None => {}
                    }
                }
                Ok(())
            }
            Schema::Enum { values } => {
                if values.contains(value) {
                    Ok(())
                } else {
                    let allowed: Vec<String> = values.iter().map(Value::to_string).collect();
                    Err(violation(format!(
                        "expected one of [{}], got {}",
                        allowed.join(", "),
                        value
                    )))
                }
            }
            Schema::OneOf { variants } => {
                if variants
                    .iter()
                    .any(|variant| variant.validate_at(value, path).is_ok())
                {
                    Ok(())
                } else {
                    Err(violation(format!(
                        "{} does not match any allowed shape",
                        kind_of(value)
                    )))
                }
            }
            Schema::JsonSchema { schema } => {
                let validator =
                    jsonschema::validator_for(schema).map_err(|e| violation(e.to_string()))?;
                let first = validator.iter_errors(value).next().map(|e| e.to_string());
                match first {
                    Some(error) => Err(violation(error)),
                    None => Ok(()),
                }
            }
        }
    }
}

fn is_integer(value: &Value) -> bool {
    match value {
        Value::Number(n) => {
            n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => false,
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
