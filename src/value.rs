//! Owned RESP3 values and typed extraction.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use num_bigint::BigInt;

use crate::error::{Error, Result};

/// An owned RESP3 value tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A null (`_`) or missing value.
    Null,
    /// Boolean (`#`).
    Boolean(bool),
    /// Integer (`:`).
    Int(i64),
    /// Double-precision float (`,`).
    Double(f64),
    /// Arbitrarily large integer (`(`).
    BigNumber(BigInt),
    /// Status line (`+`).
    SimpleString(String),
    /// Binary-safe string (`$`), including reassembled streamed strings.
    BulkString(Vec<u8>),
    /// Verbatim string (`=`) with its three-letter format prefix.
    VerbatimString {
        format: VerbatimFormat,
        text: String,
    },
    /// Array (`*`).
    Array(Vec<Value>),
    /// Set (`~`). Order is preserved as received.
    Set(Vec<Value>),
    /// Map (`%`) as key/value pairs in wire order.
    Map(Vec<(Value, Value)>),
    /// Attribute (`|`) metadata pairs.
    Attribute(Vec<(Value, Value)>),
    /// Server-initiated push frame (`>`).
    Push { kind: PushKind, data: Vec<Value> },
}

/// Format prefix of a verbatim string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerbatimFormat {
    Text,
    Markdown,
    Unknown(String),
}

impl VerbatimFormat {
    pub(crate) fn from_prefix(prefix: &[u8]) -> VerbatimFormat {
        match prefix {
            b"txt" => VerbatimFormat::Text,
            b"mkd" => VerbatimFormat::Markdown,
            other => VerbatimFormat::Unknown(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

/// Classification of a push frame, derived from its first element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushKind {
    Message,
    PMessage,
    SMessage,
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    SSubscribe,
    SUnsubscribe,
    Invalidate,
    Other(String),
}

impl PushKind {
    pub(crate) fn from_name(name: &str) -> PushKind {
        match name {
            "message" => PushKind::Message,
            "pmessage" => PushKind::PMessage,
            "smessage" => PushKind::SMessage,
            "subscribe" => PushKind::Subscribe,
            "unsubscribe" => PushKind::Unsubscribe,
            "psubscribe" => PushKind::PSubscribe,
            "punsubscribe" => PushKind::PUnsubscribe,
            "ssubscribe" => PushKind::SSubscribe,
            "sunsubscribe" => PushKind::SUnsubscribe,
            "invalidate" => PushKind::Invalidate,
            other => PushKind::Other(other.to_owned()),
        }
    }
}

impl Value {
    /// Converts this value into `T`.
    pub fn extract<T: FromValue>(self) -> Result<T> {
        T::from_value(self)
    }

    fn type_mismatch(&self) -> Error {
        match self {
            Value::Null => Error::ExpectsResp3NonNull,
            Value::Array(_)
            | Value::Set(_)
            | Value::Map(_)
            | Value::Attribute(_)
            | Value::Push { .. } => Error::NestedAggregateNotSupported,
            _ => Error::InvalidDataType,
        }
    }
}

/// Conversion from a received [`Value`] into a user type.
///
/// The trait plays the role the typed response adapters play in the protocol
/// layer: scalar impls reject nulls with [`Error::ExpectsResp3NonNull`] and
/// aggregates with [`Error::NestedAggregateNotSupported`]; wrap the target in
/// `Option` to accept null.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl FromValue for () {
    fn from_value(_: Value) -> Result<Self> {
        Ok(())
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Boolean(b) => Ok(b),
            Value::Int(i) => Ok(i != 0),
            other => Err(other.type_mismatch()),
        }
    }
}

fn parse_str<T: std::str::FromStr>(text: &str) -> Result<T> {
    text.parse().map_err(|_| Error::NotANumber)
}

macro_rules! int_from_value {
    ($($ty:ty),*) => {
        $(impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::Int(i) => <$ty>::try_from(i).map_err(|_| Error::NotANumber),
                    Value::SimpleString(s) => parse_str(&s),
                    Value::BulkString(b) => {
                        parse_str(std::str::from_utf8(&b).map_err(|_| Error::NotANumber)?)
                    }
                    other => Err(other.type_mismatch()),
                }
            }
        })*
    };
}

int_from_value!(i64, i32, u64, u32, usize);

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Double(d) => Ok(d),
            Value::Int(i) => Ok(i as f64),
            Value::SimpleString(s) => parse_str(&s),
            Value::BulkString(b) => {
                parse_str(std::str::from_utf8(&b).map_err(|_| Error::NotANumber)?)
            }
            other => Err(other.type_mismatch()),
        }
    }
}

impl FromValue for BigInt {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::BigNumber(n) => Ok(n),
            Value::Int(i) => Ok(BigInt::from(i)),
            Value::SimpleString(s) => {
                BigInt::parse_bytes(s.as_bytes(), 10).ok_or(Error::NotANumber)
            }
            Value::BulkString(b) => BigInt::parse_bytes(&b, 10).ok_or(Error::NotANumber),
            other => Err(other.type_mismatch()),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::SimpleString(s) => Ok(s),
            Value::BulkString(b) => String::from_utf8(b).map_err(|_| Error::InvalidDataType),
            Value::VerbatimString { text, .. } => Ok(text),
            other => Err(other.type_mismatch()),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::BulkString(b) => Ok(b),
            Value::SimpleString(s) => Ok(s.into_bytes()),
            Value::VerbatimString { text, .. } => Ok(text.into_bytes()),
            other => Err(other.type_mismatch()),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) | Value::Set(items) => {
                items.into_iter().map(T::from_value).collect()
            }
            Value::Null => Ok(Vec::new()),
            other => Err(other.type_mismatch()),
        }
    }
}

impl<K, V> FromValue for HashMap<K, V>
where
    K: FromValue + Eq + Hash,
    V: FromValue,
{
    fn from_value(value: Value) -> Result<Self> {
        pairs_from_value(value)?
            .into_iter()
            .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
            .collect()
    }
}

impl<K, V> FromValue for BTreeMap<K, V>
where
    K: FromValue + Ord,
    V: FromValue,
{
    fn from_value(value: Value) -> Result<Self> {
        pairs_from_value(value)?
            .into_iter()
            .map(|(k, v)| Ok((K::from_value(k)?, V::from_value(v)?)))
            .collect()
    }
}

fn pairs_from_value(value: Value) -> Result<Vec<(Value, Value)>> {
    match value {
        Value::Map(pairs) | Value::Attribute(pairs) => Ok(pairs),
        Value::Array(items) => {
            // RESP2-shaped replies deliver maps as flat alternating arrays.
            if items.len() % 2 != 0 {
                return Err(Error::IncompatibleSize);
            }
            let mut items = items.into_iter();
            let mut pairs = Vec::with_capacity(items.len() / 2);
            while let (Some(k), Some(v)) = (items.next(), items.next()) {
                pairs.push((k, v));
            }
            Ok(pairs)
        }
        Value::Null => Ok(Vec::new()),
        other => Err(other.type_mismatch()),
    }
}

macro_rules! tuple_from_value {
    ($($name:ident),+) => {
        impl<$($name: FromValue),+> FromValue for ($($name,)+) {
            fn from_value(value: Value) -> Result<Self> {
                const ARITY: usize = [$(stringify!($name)),+].len();
                let items = match value {
                    Value::Array(items) | Value::Set(items) => items,
                    Value::Null => return Err(Error::ExpectsResp3NonNull),
                    _ => return Err(Error::InvalidDataType),
                };
                if items.len() != ARITY {
                    return Err(Error::IncompatibleSize);
                }
                let mut items = items.into_iter();
                Ok(($($name::from_value(items.next().expect("length checked"))?,)+))
            }
        }
    };
}

tuple_from_value!(A);
tuple_from_value!(A, B);
tuple_from_value!(A, B, C);
tuple_from_value!(A, B, C, D);
tuple_from_value!(A, B, C, D, E);
tuple_from_value!(A, B, C, D, E, F);
