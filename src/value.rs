use crate::types::ObjectId;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Integer(i64),
    BigInt(BigInt), // Arbitrary precision integer
    Float(f64),
    Str(String),
    Object(ObjectId),
    List(Vec<Value>),
}

impl Value {
    /// Truthiness as used by guards, switches and boolean checks.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::BigInt(b) => b.to_i64() != Some(0),
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !matches!(s.as_str(), "" | "0" | "false" | "no" | "off"),
            Value::Object(_) => true,
            Value::List(items) => !items.is_empty(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::BigInt(b) => b.to_i64(),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_integer(&self) -> bool {
        match self {
            Value::Integer(_) | Value::BigInt(_) => true,
            Value::Str(s) => s.parse::<i64>().is_ok() || BigInt::parse_bytes(s.as_bytes(), 10).is_some(),
            _ => false,
        }
    }

    pub fn is_number(&self) -> bool {
        match self {
            Value::Float(_) => true,
            Value::Str(s) => s.parse::<f64>().is_ok(),
            other => other.is_integer(),
        }
    }

    pub fn is_boolean(&self) -> bool {
        match self {
            Value::Bool(_) => true,
            Value::Integer(i) => *i == 0 || *i == 1,
            Value::Str(s) => matches!(
                s.as_str(),
                "0" | "1" | "true" | "false" | "yes" | "no" | "on" | "off"
            ),
            _ => false,
        }
    }

    /// A flag-looking argument: "-name", but not a negative number.
    pub fn is_flag(&self) -> bool {
        match self {
            Value::Str(s) => s.len() > 1 && s.starts_with('-') && s.parse::<f64>().is_err(),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => Ok(()),
            Value::Bool(b) => write!(f, "{}", if *b { 1 } else { 0 }),
            Value::Integer(i) => write!(f, "{}", i),
            Value::BigInt(b) => write!(f, "{}", b),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => f.write_str(s),
            Value::Object(id) => write!(f, "{}", id),
            Value::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<BigInt> for Value {
    fn from(b: BigInt) -> Self {
        match b.to_i64() {
            Some(i) => Value::Integer(i),
            None => Value::BigInt(b),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

// Numeric comparisons only; everything else is unordered.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::Integer(a), Value::Integer(b)) => a.partial_cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::BigInt(b)) => BigInt::from(*a).partial_cmp(b),
            (Value::BigInt(a), Value::Integer(b)) => a.partial_cmp(&BigInt::from(*b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Integer(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Integer(b)) => a.partial_cmp(&(*b as f64)),
            (Value::BigInt(a), Value::Float(b)) => {
                a.to_f64().unwrap_or(f64::INFINITY).partial_cmp(b)
            }
            (Value::Float(a), Value::BigInt(b)) => {
                a.partial_cmp(&b.to_f64().unwrap_or(f64::INFINITY))
            }
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}
