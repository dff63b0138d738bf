use std::fmt;

use bytes::Bytes;

/// A message type that can serialize itself to protobuf wire bytes.
///
/// Implemented by generated or hand-written message types; the RPC layer
/// treats the result as an opaque embedded message.
pub trait ProtoMessage {
    fn serialize_to_vec(&self) -> Vec<u8>;
}

/// A keyword argument value for an RPC call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Bytes),
    /// An already-serialized embedded message.
    Message(Bytes),
    List(Vec<RpcValue>),
}

impl RpcValue {
    /// Wrap a message value by serializing it.
    pub fn message<M: ProtoMessage + ?Sized>(message: &M) -> Self {
        RpcValue::Message(Bytes::from(message.serialize_to_vec()))
    }

    /// Wrap a list, converting each element.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<RpcValue>,
    {
        RpcValue::List(items.into_iter().map(Into::into).collect())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            RpcValue::Bool(_) => "bool",
            RpcValue::Int(_) => "int",
            RpcValue::UInt(_) => "uint",
            RpcValue::Float(_) => "float",
            RpcValue::Str(_) => "str",
            RpcValue::Bytes(_) => "bytes",
            RpcValue::Message(_) => "message",
            RpcValue::List(_) => "list",
        }
    }
}

impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcValue::Bool(v) => write!(f, "{v}"),
            RpcValue::Int(v) => write!(f, "{v}"),
            RpcValue::UInt(v) => write!(f, "{v}"),
            RpcValue::Float(v) => write!(f, "{v}"),
            RpcValue::Str(v) => write!(f, "{v:?}"),
            RpcValue::Bytes(v) | RpcValue::Message(v) => write!(f, "<{} bytes>", v.len()),
            RpcValue::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! impl_from_signed {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RpcValue {
            fn from(value: $ty) -> Self {
                RpcValue::Int(i64::from(value))
            }
        })*
    };
}

macro_rules! impl_from_unsigned {
    ($($ty:ty),*) => {
        $(impl From<$ty> for RpcValue {
            fn from(value: $ty) -> Self {
                RpcValue::UInt(u64::from(value))
            }
        })*
    };
}

impl_from_signed!(i8, i16, i32, i64);
impl_from_unsigned!(u8, u16, u32, u64);

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        RpcValue::Bool(value)
    }
}

impl From<f32> for RpcValue {
    fn from(value: f32) -> Self {
        RpcValue::Float(f64::from(value))
    }
}

impl From<f64> for RpcValue {
    fn from(value: f64) -> Self {
        RpcValue::Float(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        RpcValue::Str(value.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        RpcValue::Str(value)
    }
}

impl From<&[u8]> for RpcValue {
    fn from(value: &[u8]) -> Self {
        RpcValue::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for RpcValue {
    fn from(value: Vec<u8>) -> Self {
        RpcValue::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for RpcValue {
    fn from(value: Bytes) -> Self {
        RpcValue::Bytes(value)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(value: Vec<RpcValue>) -> Self {
        RpcValue::List(value)
    }
}

/// Ordered keyword arguments for an RPC call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcArgs {
    entries: Vec<(String, RpcValue)>,
}

impl RpcArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument, replacing an earlier one with the same name.
    pub fn arg(mut self, name: impl Into<String>, value: impl Into<RpcValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<RpcValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RpcValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RpcValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<RpcValue>> FromIterator<(K, V)> for RpcArgs {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut args = RpcArgs::new();
        for (k, v) in iter {
            args.insert(k, v);
        }
        args
    }
}
