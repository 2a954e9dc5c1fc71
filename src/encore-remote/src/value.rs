//! Declared member types and inbound value reconciliation.
//!
//! Values travel as [`serde_json::Value`]. Before an inbound value reaches a
//! member it is checked against the member's declared [`ValueType`]; values
//! that are not directly assignable get a best-effort primitive conversion or
//! go through a registered [`ValueConverter`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Type identity of a remoted value as declared by the receiving member.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Unit,
    Bool,
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    String,
    /// Any other serde-convertible type, by name.
    Named(String),
}

impl ValueType {
    /// Named type identity for `T`, using its unqualified type name.
    pub fn named<T: ?Sized>() -> Self {
        let full = std::any::type_name::<T>();
        let base = full.split('<').next().unwrap_or(full);
        let short = base.rsplit("::").next().unwrap_or(base);
        ValueType::Named(short.to_string())
    }

    pub fn is_primitive(&self) -> bool {
        !matches!(self, ValueType::Named(_))
    }

    /// Whether `value` can be handed to a member of this type unchanged.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Unit => value.is_null(),
            ValueType::Bool => value.is_boolean(),
            ValueType::I32 => value
                .as_i64()
                .is_some_and(|n| i32::try_from(n).is_ok()),
            ValueType::I64 => value.as_i64().is_some(),
            ValueType::U32 => value
                .as_u64()
                .is_some_and(|n| u32::try_from(n).is_ok()),
            ValueType::U64 => value.as_u64().is_some(),
            ValueType::F32 | ValueType::F64 => value.is_number(),
            ValueType::String => value.is_string(),
            ValueType::Named(_) => true,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Unit => f.write_str("()"),
            ValueType::Bool => f.write_str("bool"),
            ValueType::I32 => f.write_str("i32"),
            ValueType::I64 => f.write_str("i64"),
            ValueType::U32 => f.write_str("u32"),
            ValueType::U64 => f.write_str("u64"),
            ValueType::F32 => f.write_str("f32"),
            ValueType::F64 => f.write_str("f64"),
            ValueType::String => f.write_str("String"),
            ValueType::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error(
        "cannot convert a {received} value to {expected}; register a custom message converter \
         for {expected} or use a primitive/convertible type"
    )]
    Unsupported { expected: String, received: String },
    #[error("value {value} is not a valid {expected}: {reason}")]
    Invalid {
        expected: String,
        value: String,
        reason: String,
    },
    #[error("failed to serialize {type_name}: {message}")]
    Serialize { type_name: String, message: String },
}

/// Converts wire values into the shape a named type expects.
pub trait ValueConverter: Send + Sync {
    fn convert(&self, value: Value) -> Result<Value, ConversionError>;
}

impl<F> ValueConverter for F
where
    F: Fn(Value) -> Result<Value, ConversionError> + Send + Sync,
{
    fn convert(&self, value: Value) -> Result<Value, ConversionError> {
        self(value)
    }
}

/// Custom converters keyed by the [`ValueType::Named`] they produce.
#[derive(Clone, Default)]
pub struct ConverterRegistry {
    converters: HashMap<String, Arc<dyn ValueConverter>>,
}

impl ConverterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_name: impl Into<String>, converter: impl ValueConverter + 'static) {
        self.converters.insert(type_name.into(), Arc::new(converter));
    }

    pub fn with(mut self, type_name: impl Into<String>, converter: impl ValueConverter + 'static) -> Self {
        self.register(type_name, converter);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&Arc<dyn ValueConverter>> {
        self.converters.get(type_name)
    }

    pub fn is_empty(&self) -> bool {
        self.converters.is_empty()
    }
}

impl fmt::Debug for ConverterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.converters.keys()).finish()
    }
}

/// Rust types that can be remoted as a member value, argument or payload.
pub trait RemoteValue: Serialize + DeserializeOwned + Send + 'static {
    fn value_type() -> ValueType;
}

macro_rules! impl_remote_value {
    ($($ty:ty => $vt:ident),* $(,)?) => {
        $(impl RemoteValue for $ty {
            fn value_type() -> ValueType {
                ValueType::$vt
            }
        })*
    };
}

impl_remote_value! {
    () => Unit,
    bool => Bool,
    i32 => I32,
    i64 => I64,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
    String => String,
}

/// Short name of a value's runtime JSON kind, used in error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

pub fn to_value<V: Serialize>(value: &V) -> Result<Value, ConversionError> {
    serde_json::to_value(value).map_err(|err| ConversionError::Serialize {
        type_name: std::any::type_name::<V>().to_string(),
        message: err.to_string(),
    })
}

/// Reconciles `value` against the declared `expected` type.
pub fn reconcile(
    value: Value,
    expected: &ValueType,
    converters: &ConverterRegistry,
) -> Result<Value, ConversionError> {
    if let ValueType::Named(name) = expected {
        return match converters.get(name) {
            Some(converter) => converter.convert(value),
            None => Ok(value),
        };
    }

    if expected.accepts(&value) {
        return Ok(value);
    }

    convert_primitive(value, expected)
}

/// Reconciles `value` against `V` and deserializes it.
pub fn decode_as<V: RemoteValue>(
    value: Value,
    converters: &ConverterRegistry,
) -> Result<V, ConversionError> {
    let expected = V::value_type();
    let reconciled = reconcile(value, &expected, converters)?;
    let received = kind_of(&reconciled);
    serde_json::from_value(reconciled).map_err(|_| ConversionError::Unsupported {
        expected: expected.to_string(),
        received: received.to_string(),
    })
}

fn convert_primitive(value: Value, expected: &ValueType) -> Result<Value, ConversionError> {
    let unsupported = |value: &Value| ConversionError::Unsupported {
        expected: expected.to_string(),
        received: kind_of(value).to_string(),
    };
    let invalid = |value: &Value, reason: &str| ConversionError::Invalid {
        expected: expected.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if matches!(value, Value::Null | Value::Array(_) | Value::Object(_)) {
        return Err(unsupported(&value));
    }

    match expected {
        ValueType::Unit => Err(unsupported(&value)),
        ValueType::String => Ok(Value::String(match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ValueType::Bool => match &value {
            Value::Number(n) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid(&value, "expected true or false")),
            },
            _ => Err(unsupported(&value)),
        },
        ValueType::I32 | ValueType::I64 => {
            let n = signed_of(&value).map_err(|reason| invalid(&value, reason))?;
            let fits = match expected {
                ValueType::I32 => i32::try_from(n).is_ok(),
                _ => true,
            };
            if fits {
                Ok(Value::from(n))
            } else {
                Err(invalid(&value, "out of range"))
            }
        }
        ValueType::U32 | ValueType::U64 => {
            let n = signed_of(&value)
                .map(i128::from)
                .or_else(|reason| unsigned_of(&value).map(i128::from).map_err(|_| reason))
                .map_err(|reason| invalid(&value, reason))?;
            let limit = match expected {
                ValueType::U32 => i128::from(u32::MAX),
                _ => i128::from(u64::MAX),
            };
            match u64::try_from(n) {
                Ok(n) if i128::from(n) <= limit => Ok(Value::from(n)),
                _ => Err(invalid(&value, "out of range")),
            }
        }
        ValueType::F32 | ValueType::F64 => {
            let f = match &value {
                Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
                Value::Number(n) => n.as_f64().ok_or("not representable as a float"),
                Value::String(s) => s.trim().parse::<f64>().map_err(|_| "not a number"),
                _ => Err("not a number"),
            }
            .map_err(|reason| invalid(&value, reason))?;
            Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| invalid(&value, "not a finite number"))
        }
        ValueType::Named(_) => Ok(value),
    }
}

/// Integer view of a primitive; floats round half to even.
fn signed_of(value: &Value) -> Result<i64, &'static str> {
    match value {
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if n.as_u64().is_some() {
                Err("out of range")
            } else {
                let f = n.as_f64().ok_or("not a number")?.round_ties_even();
                if f >= i64::MIN as f64 && f < i64::MAX as f64 {
                    Ok(f as i64)
                } else {
                    Err("out of range")
                }
            }
        }
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| "not an integer"),
        _ => Err("not an integer"),
    }
}

fn unsigned_of(value: &Value) -> Result<u64, &'static str> {
    match value {
        Value::Number(n) => n.as_u64().ok_or("out of range"),
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| "not an integer"),
        _ => Err("not an integer"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn none() -> ConverterRegistry {
        ConverterRegistry::new()
    }

    #[test]
    fn assignable_values_pass_through() {
        assert_eq!(reconcile(json!(7), &ValueType::I32, &none()).unwrap(), json!(7));
        assert_eq!(
            reconcile(json!("a"), &ValueType::String, &none()).unwrap(),
            json!("a")
        );
        assert_eq!(reconcile(json!(3), &ValueType::F64, &none()).unwrap(), json!(3));
    }

    #[test]
    fn strings_parse_into_numbers() {
        assert_eq!(reconcile(json!("42"), &ValueType::I32, &none()).unwrap(), json!(42));
        assert_eq!(
            reconcile(json!(" 2.5 "), &ValueType::F64, &none()).unwrap(),
            json!(2.5)
        );
        assert_eq!(reconcile(json!("7"), &ValueType::U64, &none()).unwrap(), json!(7));
    }

    #[test]
    fn floats_round_half_to_even() {
        assert_eq!(reconcile(json!(2.5), &ValueType::I64, &none()).unwrap(), json!(2));
        assert_eq!(reconcile(json!(3.5), &ValueType::I64, &none()).unwrap(), json!(4));
    }

    #[test]
    fn numbers_and_bools_interconvert() {
        assert_eq!(reconcile(json!(true), &ValueType::U32, &none()).unwrap(), json!(1));
        assert_eq!(reconcile(json!(0), &ValueType::Bool, &none()).unwrap(), json!(false));
        assert_eq!(
            reconcile(json!(12), &ValueType::String, &none()).unwrap(),
            json!("12")
        );
    }

    #[test]
    fn out_of_range_is_invalid() {
        let err = reconcile(json!(5_000_000_000i64), &ValueType::I32, &none()).unwrap_err();
        assert!(matches!(err, ConversionError::Invalid { .. }));
        let err = reconcile(json!(-1), &ValueType::U32, &none()).unwrap_err();
        assert!(matches!(err, ConversionError::Invalid { .. }));
    }

    #[test]
    fn structured_values_are_unsupported_for_primitives() {
        let err = reconcile(json!({"a": 1}), &ValueType::I32, &none()).unwrap_err();
        assert_eq!(
            err,
            ConversionError::Unsupported {
                expected: "i32".into(),
                received: "object".into(),
            }
        );
        let message = err.to_string();
        assert!(message.contains("custom message converter"));
        assert!(message.contains("i32"));
        assert!(message.contains("object"));
    }

    #[test]
    fn named_types_use_registered_converter() {
        let converters = ConverterRegistry::new().with(
            "Rating",
            |value: Value| -> Result<Value, ConversionError> { Ok(json!({ "stars": value })) },
        );
        let out = reconcile(json!(4), &ValueType::Named("Rating".into()), &converters).unwrap();
        assert_eq!(out, json!({ "stars": 4 }));
    }

    #[test]
    fn decode_as_reports_expected_type() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Rating {
            stars: u8,
        }
        impl RemoteValue for Rating {
            fn value_type() -> ValueType {
                ValueType::named::<Self>()
            }
        }

        let rating: Rating = decode_as(json!({"stars": 5}), &none()).unwrap();
        assert_eq!(rating.stars, 5);

        let err = decode_as::<Rating>(json!("five"), &none()).unwrap_err();
        assert_eq!(
            err,
            ConversionError::Unsupported {
                expected: "Rating".into(),
                received: "string".into(),
            }
        );
    }

    #[test]
    fn named_strips_path_and_generics() {
        assert_eq!(
            ValueType::named::<Vec<u8>>(),
            ValueType::Named("Vec".into())
        );
    }
}
