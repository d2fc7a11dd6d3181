//! Native structured values for the object store.
//!
//! The object store keeps values in structured-clone form rather than text, so
//! it can hold dates, patterns, maps, sets and binary buffers that JSON cannot
//! represent. Types opt in through [`StructuredClone`].

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{PersistError, Result};

/// A value in structured-clone form.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredValue {
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    String(String),
    Date(DateTime<Utc>),
    /// A regular-expression pattern with its flags.
    RegExp { source: String, flags: String },
    /// A binary buffer.
    Bytes(Bytes),
    Array(Vec<StructuredValue>),
    Object(BTreeMap<String, StructuredValue>),
    /// Insertion-ordered key/value pairs; keys may be any structured value.
    Map(Vec<(StructuredValue, StructuredValue)>),
    Set(Vec<StructuredValue>),
}

impl StructuredValue {
    /// Short name of the variant, used in mismatch errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            StructuredValue::Null => "null",
            StructuredValue::Bool(_) => "boolean",
            StructuredValue::Number(_) => "number",
            StructuredValue::BigInt(_) => "bigint",
            StructuredValue::String(_) => "string",
            StructuredValue::Date(_) => "date",
            StructuredValue::RegExp { .. } => "regexp",
            StructuredValue::Bytes(_) => "bytes",
            StructuredValue::Array(_) => "array",
            StructuredValue::Object(_) => "object",
            StructuredValue::Map(_) => "map",
            StructuredValue::Set(_) => "set",
        }
    }

    /// Returns the text if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            StructuredValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Approximate stored size, used for logging.
    pub fn approximate_size(&self) -> usize {
        match self {
            StructuredValue::Null | StructuredValue::Bool(_) => 1,
            StructuredValue::Number(_) | StructuredValue::Date(_) => 8,
            StructuredValue::BigInt(_) => 16,
            StructuredValue::String(s) => s.len(),
            StructuredValue::RegExp { source, flags } => source.len() + flags.len(),
            StructuredValue::Bytes(b) => b.len(),
            StructuredValue::Array(items) | StructuredValue::Set(items) => {
                items.iter().map(Self::approximate_size).sum()
            }
            StructuredValue::Object(fields) => fields
                .iter()
                .map(|(k, v)| k.len() + v.approximate_size())
                .sum(),
            StructuredValue::Map(entries) => entries
                .iter()
                .map(|(k, v)| k.approximate_size() + v.approximate_size())
                .sum(),
        }
    }
}

fn mismatch(expected: &str, found: &StructuredValue) -> PersistError {
    PersistError::Serialization(format!(
        "expected {expected}, found {}",
        found.type_name()
    ))
}

/// Conversion to and from structured-clone form.
pub trait StructuredClone: Sized {
    fn to_structured(&self) -> StructuredValue;

    fn from_structured(value: StructuredValue) -> Result<Self>;
}

/// A regular-expression pattern as stored by the object store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub source: String,
    pub flags: String,
}

impl Pattern {
    pub fn new(source: impl Into<String>, flags: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            flags: flags.into(),
        }
    }
}

impl StructuredClone for StructuredValue {
    fn to_structured(&self) -> StructuredValue {
        self.clone()
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        Ok(value)
    }
}

impl StructuredClone for Pattern {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::RegExp {
            source: self.source.clone(),
            flags: self.flags.clone(),
        }
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::RegExp { source, flags } => Ok(Self { source, flags }),
            other => Err(mismatch("regexp", &other)),
        }
    }
}

impl StructuredClone for bool {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Bool(*self)
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Bool(b) => Ok(b),
            other => Err(mismatch("boolean", &other)),
        }
    }
}

impl StructuredClone for String {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::String(self.clone())
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

// Numbers that fit a double losslessly are stored as numbers.
macro_rules! number_impl {
    ($($ty:ty),*) => {
        $(
            impl StructuredClone for $ty {
                fn to_structured(&self) -> StructuredValue {
                    StructuredValue::Number(f64::from(*self))
                }

                fn from_structured(value: StructuredValue) -> Result<Self> {
                    match value {
                        StructuredValue::Number(n) => {
                            let cast = n as $ty;
                            if f64::from(cast) == n {
                                Ok(cast)
                            } else {
                                Err(PersistError::Serialization(format!(
                                    "number {n} does not fit {}",
                                    stringify!($ty)
                                )))
                            }
                        }
                        other => Err(mismatch("number", &other)),
                    }
                }
            }
        )*
    };
}

number_impl!(i8, i16, i32, u8, u16, u32);

impl StructuredClone for f32 {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Number(f64::from(*self))
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Number(n) if n.is_nan() => Ok(f32::NAN),
            StructuredValue::Number(n) => {
                let cast = n as f32;
                if f64::from(cast) == n {
                    Ok(cast)
                } else {
                    Err(PersistError::Serialization(format!("number {n} does not fit f32")))
                }
            }
            other => Err(mismatch("number", &other)),
        }
    }
}

impl StructuredClone for f64 {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Number(*self)
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Number(n) => Ok(n),
            other => Err(mismatch("number", &other)),
        }
    }
}

// Wide integers are stored as bigints.
macro_rules! bigint_impl {
    ($($ty:ty),*) => {
        $(
            impl StructuredClone for $ty {
                fn to_structured(&self) -> StructuredValue {
                    StructuredValue::BigInt(i128::from(*self))
                }

                fn from_structured(value: StructuredValue) -> Result<Self> {
                    match value {
                        StructuredValue::BigInt(n) => <$ty>::try_from(n).map_err(|_| {
                            PersistError::Serialization(format!(
                                "bigint {n} does not fit {}",
                                stringify!($ty)
                            ))
                        }),
                        other => Err(mismatch("bigint", &other)),
                    }
                }
            }
        )*
    };
}

bigint_impl!(i64, u64, i128);

impl StructuredClone for DateTime<Utc> {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Date(*self)
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Date(d) => Ok(d),
            other => Err(mismatch("date", &other)),
        }
    }
}

impl StructuredClone for Bytes {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Bytes(self.clone())
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Bytes(b) => Ok(b),
            other => Err(mismatch("bytes", &other)),
        }
    }
}

impl<T: StructuredClone> StructuredClone for Option<T> {
    fn to_structured(&self) -> StructuredValue {
        match self {
            Some(v) => v.to_structured(),
            None => StructuredValue::Null,
        }
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Null => Ok(None),
            other => T::from_structured(other).map(Some),
        }
    }
}

impl<T: StructuredClone> StructuredClone for Vec<T> {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Array(self.iter().map(StructuredClone::to_structured).collect())
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Array(items) => items.into_iter().map(T::from_structured).collect(),
            other => Err(mismatch("array", &other)),
        }
    }
}

impl<T: StructuredClone> StructuredClone for BTreeMap<String, T> {
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Object(
            self.iter()
                .map(|(k, v)| (k.clone(), v.to_structured()))
                .collect(),
        )
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Object(fields) => fields
                .into_iter()
                .map(|(k, v)| Ok((k, T::from_structured(v)?)))
                .collect(),
            other => Err(mismatch("object", &other)),
        }
    }
}

impl<K, V> StructuredClone for HashMap<K, V>
where
    K: StructuredClone + Eq + Hash,
    V: StructuredClone,
{
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Map(
            self.iter()
                .map(|(k, v)| (k.to_structured(), v.to_structured()))
                .collect(),
        )
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Map(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((K::from_structured(k)?, V::from_structured(v)?)))
                .collect(),
            other => Err(mismatch("map", &other)),
        }
    }
}

impl<T> StructuredClone for HashSet<T>
where
    T: StructuredClone + Eq + Hash,
{
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Set(self.iter().map(StructuredClone::to_structured).collect())
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Set(items) => items.into_iter().map(T::from_structured).collect(),
            other => Err(mismatch("set", &other)),
        }
    }
}

impl<T> StructuredClone for BTreeSet<T>
where
    T: StructuredClone + Ord,
{
    fn to_structured(&self) -> StructuredValue {
        StructuredValue::Set(self.iter().map(StructuredClone::to_structured).collect())
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        match value {
            StructuredValue::Set(items) => items.into_iter().map(T::from_structured).collect(),
            other => Err(mismatch("set", &other)),
        }
    }
}

impl StructuredClone for serde_json::Value {
    fn to_structured(&self) -> StructuredValue {
        use serde_json::Value;
        match self {
            Value::Null => StructuredValue::Null,
            Value::Bool(b) => StructuredValue::Bool(*b),
            Value::Number(n) => StructuredValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => StructuredValue::String(s.clone()),
            Value::Array(items) => {
                StructuredValue::Array(items.iter().map(StructuredClone::to_structured).collect())
            }
            Value::Object(fields) => StructuredValue::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_structured()))
                    .collect(),
            ),
        }
    }

    fn from_structured(value: StructuredValue) -> Result<Self> {
        use serde_json::Value;
        Ok(match value {
            StructuredValue::Null => Value::Null,
            StructuredValue::Bool(b) => Value::Bool(b),
            StructuredValue::Number(n) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            StructuredValue::String(s) => Value::String(s),
            StructuredValue::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_structured)
                    .collect::<Result<_>>()?,
            ),
            StructuredValue::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| Ok((k, Value::from_structured(v)?)))
                    .collect::<Result<_>>()?,
            ),
            other => return Err(mismatch("JSON-compatible value", &other)),
        })
    }
}
