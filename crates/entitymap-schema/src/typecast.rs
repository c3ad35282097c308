//! Per-field type-cast rules.
//!
//! A cast normalizes a value to the storage representation of its column.
//! It is applied when rows are hydrated and when entity fields are turned
//! into column values, so diffs compare like with like.

use entitymap_core::{Error, Result, TypeError, Value};
use serde::Deserialize;

/// Storage type a field is cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cast {
    Int,
    Float,
    Bool,
    Text,
    /// JSON document; text is parsed, other values are kept as documents.
    Json,
}

impl Cast {
    /// Cast a value. `Null` passes through unchanged.
    pub fn apply(self, value: &Value) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Cast::Int => match value {
                Value::Text(s) | Value::Decimal(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::BigInt)
                    .map_err(|_| mismatch("integer", value)),
                Value::Float(_) | Value::Double(_) => value
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::BigInt(f as i64))
                    .ok_or_else(|| mismatch("integer", value)),
                other => other
                    .as_i64()
                    .map(Value::BigInt)
                    .ok_or_else(|| mismatch("integer", other)),
            },
            Cast::Float => match value {
                Value::Text(s) | Value::Decimal(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Double)
                    .map_err(|_| mismatch("float", value)),
                other => other
                    .as_f64()
                    .map(Value::Double)
                    .ok_or_else(|| mismatch("float", other)),
            },
            Cast::Bool => match value {
                Value::Text(s) => match s.as_str() {
                    "1" | "true" | "t" | "yes" => Ok(Value::Bool(true)),
                    "0" | "false" | "f" | "no" => Ok(Value::Bool(false)),
                    _ => Err(mismatch("boolean", value)),
                },
                other => other
                    .as_bool()
                    .map(Value::Bool)
                    .ok_or_else(|| mismatch("boolean", other)),
            },
            Cast::Text => Ok(match value {
                Value::Text(_) => value.clone(),
                Value::Json(j) => Value::Text(j.to_string()),
                other => Value::Text(other.label().unwrap_or_else(|| other.to_string())),
            }),
            Cast::Json => match value {
                Value::Json(_) => Ok(value.clone()),
                Value::Text(s) => serde_json::from_str(s)
                    .map(Value::Json)
                    .map_err(|_| mismatch("json document", value)),
                Value::Bool(b) => Ok(Value::Json(serde_json::Value::Bool(*b))),
                other => match (other.as_i64(), other.as_f64()) {
                    (Some(i), _) => Ok(Value::Json(i.into())),
                    (None, Some(f)) => Ok(Value::Json(serde_json::json!(f))),
                    _ => Err(mismatch("json document", other)),
                },
            },
        }
    }
}

fn mismatch(expected: &'static str, actual: &Value) -> Error {
    Error::Type(TypeError::new(expected, actual.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_cast_normalizes_width_and_text() {
        assert_eq!(Cast::Int.apply(&Value::Int(4)).unwrap(), Value::BigInt(4));
        assert_eq!(
            Cast::Int.apply(&Value::Text(" 12 ".into())).unwrap(),
            Value::BigInt(12)
        );
        assert!(Cast::Int.apply(&Value::Text("x".into())).is_err());
        assert_eq!(Cast::Int.apply(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn json_cast_parses_text() {
        let v = Cast::Json
            .apply(&Value::Text(r#"{"city":"Oslo"}"#.into()))
            .unwrap();
        assert_eq!(v, Value::Json(serde_json::json!({"city": "Oslo"})));
    }

    #[test]
    fn bool_and_text_casts() {
        assert_eq!(
            Cast::Bool.apply(&Value::Text("yes".into())).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(Cast::Bool.apply(&Value::Int(0)).unwrap(), Value::Bool(false));
        assert_eq!(
            Cast::Text.apply(&Value::BigInt(7)).unwrap(),
            Value::Text("7".into())
        );
    }
}
