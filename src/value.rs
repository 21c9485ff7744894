//! The dynamic value model flowing through a task graph.
//!
//! Tasks exchange [`Value`]s: a small self-describing data model that can
//! represent scalars, lists and records, cross process boundaries as CBOR,
//! and participate in content hashing through a canonical encoding.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail};
use serde::{Deserialize, Serialize};

/// A dynamically typed value produced or consumed by a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Human-readable name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Record(map) => Some(map),
            _ => None,
        }
    }

    /// Converts a `serde_json` value into a [`Value`].
    ///
    /// Numbers that fit an `i64` become [`Value::Int`], everything else
    /// numeric becomes [`Value::Float`].
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Record(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders the value as a `serde_json` value.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Float(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Record(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value as i64)
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Int(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Vec<f64>> for Value {
    fn from(value: Vec<f64>) -> Self {
        Value::List(value.into_iter().map(Value::Float).collect())
    }
}

impl From<Vec<i64>> for Value {
    fn from(value: Vec<i64>) -> Self {
        Value::List(value.into_iter().map(Value::Int).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Record(value)
    }
}

/// Canonical byte encoding used for content hashing.
///
/// CBOR over ordered maps is deterministic, which is what makes structural
/// task identity possible.
pub(crate) fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).expect("CBOR encoding into a Vec is infallible");
    buf
}

/// Binary operator intercepted on deferred values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }

    /// Applies the operator to two values.
    ///
    /// Integer arithmetic stays integral except for division, which always
    /// promotes to float. `+` also concatenates strings and lists. Type
    /// mismatches are run-time task failures, never build-time errors.
    pub fn apply(&self, lhs: &Value, rhs: &Value) -> anyhow::Result<Value> {
        match (self, lhs, rhs) {
            (BinOp::Add, Value::Str(a), Value::Str(b)) => {
                let mut out = a.clone();
                out.push_str(b);
                Ok(Value::Str(out))
            }
            (BinOp::Add, Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::List(out))
            }
            (BinOp::Div, _, _) => {
                let (a, b) = self.numeric_pair(lhs, rhs)?;
                if b == 0.0 {
                    bail!("division by zero");
                }
                Ok(Value::Float(a / b))
            }
            (_, Value::Int(a), Value::Int(b)) => {
                let out = match self {
                    BinOp::Add => a.checked_add(*b),
                    BinOp::Sub => a.checked_sub(*b),
                    BinOp::Mul => a.checked_mul(*b),
                    BinOp::Div => unreachable!(),
                };
                out.map(Value::Int)
                    .ok_or_else(|| anyhow!("integer overflow in {a} {} {b}", self.symbol()))
            }
            _ => {
                let (a, b) = self.numeric_pair(lhs, rhs)?;
                let out = match self {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => unreachable!(),
                };
                Ok(Value::Float(out))
            }
        }
    }

    fn numeric_pair(&self, lhs: &Value, rhs: &Value) -> anyhow::Result<(f64, f64)> {
        match (lhs.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => bail!(
                "operator '{}' is not defined for {} and {}",
                self.symbol(),
                lhs.type_name(),
                rhs.type_name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_promotes_like_the_interpreter() {
        assert_eq!(
            BinOp::Add.apply(&Value::Int(2), &Value::Int(3)).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            BinOp::Mul.apply(&Value::Int(2), &Value::Float(0.5)).unwrap(),
            Value::Float(1.0)
        );
        // Division always promotes to float.
        assert_eq!(
            BinOp::Div.apply(&Value::Int(7), &Value::Int(2)).unwrap(),
            Value::Float(3.5)
        );
    }

    #[test]
    fn add_concatenates_strings_and_lists() {
        assert_eq!(
            BinOp::Add.apply(&Value::from("ab"), &Value::from("cd")).unwrap(),
            Value::from("abcd")
        );
        let a = Value::from(vec![1.0, 2.0]);
        let b = Value::from(vec![3.0]);
        assert_eq!(
            BinOp::Add.apply(&a, &b).unwrap(),
            Value::from(vec![1.0, 2.0, 3.0])
        );
    }

    #[test]
    fn type_errors_are_reported_with_type_names() {
        let err = BinOp::Sub
            .apply(&Value::from("a"), &Value::Int(1))
            .unwrap_err();
        assert!(err.to_string().contains("str"));
    }

    #[test]
    fn division_by_zero_fails() {
        assert!(BinOp::Div.apply(&Value::Int(1), &Value::Int(0)).is_err());
    }

    #[test]
    fn canonical_bytes_are_deterministic() {
        let mut map = BTreeMap::new();
        map.insert("b".to_owned(), Value::Int(2));
        map.insert("a".to_owned(), Value::Int(1));
        let value = Value::Record(map.clone());
        assert_eq!(canonical_bytes(&value), canonical_bytes(&Value::Record(map)));
    }

    #[test]
    fn json_roundtrip() {
        let json = serde_json::json!({"n": 3, "xs": [1.5, "two", null]});
        let value = Value::from_json(json.clone());
        assert_eq!(value.to_json(), json);
    }
}
