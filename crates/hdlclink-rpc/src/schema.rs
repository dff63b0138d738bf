//! Request message schemas.
//!
//! A method's request is described as a flat list of fields; keyword
//! arguments are matched to fields by name and encoded with the field's
//! number and kind.

use std::fmt;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};
use crate::packet::ids;
use crate::value::{RpcArgs, RpcValue};
use crate::wire::{self, FieldReader, FieldValue};

/// Largest legal protobuf field number.
pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Scalar and composite field kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Bool,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Float,
    Double,
    String,
    Bytes,
    Message,
    Enum,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Bool => "bool",
            FieldKind::Int32 => "int32",
            FieldKind::Int64 => "int64",
            FieldKind::Uint32 => "uint32",
            FieldKind::Uint64 => "uint64",
            FieldKind::Sint32 => "sint32",
            FieldKind::Sint64 => "sint64",
            FieldKind::Fixed32 => "fixed32",
            FieldKind::Fixed64 => "fixed64",
            FieldKind::Sfixed32 => "sfixed32",
            FieldKind::Sfixed64 => "sfixed64",
            FieldKind::Float => "float",
            FieldKind::Double => "double",
            FieldKind::String => "string",
            FieldKind::Bytes => "bytes",
            FieldKind::Message => "message",
            FieldKind::Enum => "enum",
        }
    }

    /// Parse a command-line token into a value of this kind.
    ///
    /// Byte and message fields take hex (`0x0a02...`) or, for bytes, plain text.
    pub fn parse_text(&self, text: &str) -> std::result::Result<RpcValue, String> {
        let text = text.trim();
        match self {
            FieldKind::Bool => match text {
                "true" | "1" | "on" => Ok(RpcValue::Bool(true)),
                "false" | "0" | "off" => Ok(RpcValue::Bool(false)),
                other => Err(format!("expected true/false, got '{other}'")),
            },
            FieldKind::Int32
            | FieldKind::Int64
            | FieldKind::Sint32
            | FieldKind::Sint64
            | FieldKind::Sfixed32
            | FieldKind::Sfixed64
            | FieldKind::Enum => text
                .parse::<i64>()
                .map(RpcValue::Int)
                .map_err(|err| format!("expected integer: {err}")),
            FieldKind::Uint32 | FieldKind::Uint64 | FieldKind::Fixed32 | FieldKind::Fixed64 => {
                text.parse::<u64>()
                    .map(RpcValue::UInt)
                    .map_err(|err| format!("expected unsigned integer: {err}"))
            }
            FieldKind::Float | FieldKind::Double => text
                .parse::<f64>()
                .map(RpcValue::Float)
                .map_err(|err| format!("expected number: {err}")),
            FieldKind::String => Ok(RpcValue::Str(text.to_string())),
            FieldKind::Bytes => match text.strip_prefix("0x") {
                Some(hex) => parse_hex(hex).map(RpcValue::Bytes),
                None => Ok(RpcValue::Bytes(Bytes::copy_from_slice(text.as_bytes()))),
            },
            FieldKind::Message => match text.strip_prefix("0x") {
                Some(hex) => parse_hex(hex).map(RpcValue::Message),
                None => Err("message fields take hex-encoded bytes (0x...)".to_string()),
            },
        }
    }

    fn encode(
        &self,
        number: u32,
        value: &RpcValue,
        dst: &mut BytesMut,
    ) -> std::result::Result<(), String> {
        match (self, value) {
            (FieldKind::Bool, RpcValue::Bool(b)) => {
                wire::put_varint_field(dst, number, u64::from(*b))
            }
            (FieldKind::Int32 | FieldKind::Enum, _) => {
                let v = signed::<i32>(value)?;
                // Negative int32 values are sign-extended to 64 bits.
                wire::put_varint_field(dst, number, i64::from(v) as u64);
            }
            (FieldKind::Int64, _) => {
                wire::put_varint_field(dst, number, signed::<i64>(value)? as u64)
            }
            (FieldKind::Uint32, _) => {
                wire::put_varint_field(dst, number, u64::from(unsigned::<u32>(value)?))
            }
            (FieldKind::Uint64, _) => wire::put_varint_field(dst, number, unsigned::<u64>(value)?),
            (FieldKind::Sint32, _) => wire::put_varint_field(
                dst,
                number,
                u64::from(wire::zigzag32(signed::<i32>(value)?)),
            ),
            (FieldKind::Sint64, _) => {
                wire::put_varint_field(dst, number, wire::zigzag64(signed::<i64>(value)?))
            }
            (FieldKind::Fixed32, _) => wire::put_fixed32_field(dst, number, unsigned::<u32>(value)?),
            (FieldKind::Fixed64, _) => wire::put_fixed64_field(dst, number, unsigned::<u64>(value)?),
            (FieldKind::Sfixed32, _) => {
                wire::put_fixed32_field(dst, number, signed::<i32>(value)? as u32)
            }
            (FieldKind::Sfixed64, _) => {
                wire::put_fixed64_field(dst, number, signed::<i64>(value)? as u64)
            }
            (FieldKind::Float, _) => {
                wire::put_fixed32_field(dst, number, (float(value)? as f32).to_bits())
            }
            (FieldKind::Double, _) => wire::put_fixed64_field(dst, number, float(value)?.to_bits()),
            (FieldKind::String, RpcValue::Str(s)) => wire::put_bytes_field(dst, number, s.as_bytes()),
            (FieldKind::Bytes, RpcValue::Bytes(b)) => wire::put_bytes_field(dst, number, b),
            (FieldKind::Message, RpcValue::Message(b) | RpcValue::Bytes(b)) => {
                wire::put_bytes_field(dst, number, b)
            }
            (kind, value) => {
                return Err(format!(
                    "{} value does not fit a {} field",
                    value.kind_name(),
                    kind.as_str()
                ))
            }
        }
        Ok(())
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn signed<T: TryFrom<i64>>(value: &RpcValue) -> std::result::Result<T, String> {
    let wide = match value {
        RpcValue::Int(v) => *v,
        RpcValue::UInt(v) => i64::try_from(*v).map_err(|_| format!("{v} is out of range"))?,
        other => return Err(format!("expected integer, got {}", other.kind_name())),
    };
    T::try_from(wide).map_err(|_| format!("{wide} is out of range"))
}

fn unsigned<T: TryFrom<u64>>(value: &RpcValue) -> std::result::Result<T, String> {
    let wide = match value {
        RpcValue::UInt(v) => *v,
        RpcValue::Int(v) => u64::try_from(*v).map_err(|_| format!("{v} is negative"))?,
        other => return Err(format!("expected unsigned integer, got {}", other.kind_name())),
    };
    T::try_from(wide).map_err(|_| format!("{wide} is out of range"))
}

fn float(value: &RpcValue) -> std::result::Result<f64, String> {
    match value {
        RpcValue::Float(v) => Ok(*v),
        RpcValue::Int(v) => Ok(*v as f64),
        RpcValue::UInt(v) => Ok(*v as f64),
        other => Err(format!("expected number, got {}", other.kind_name())),
    }
}

fn parse_hex(hex: &str) -> std::result::Result<Bytes, String> {
    if hex.len() % 2 != 0 {
        return Err("hex string has odd length".to_string());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                .ok_or_else(|| format!("invalid hex at offset {i}"))
        })
        .collect::<std::result::Result<Vec<u8>, String>>()
        .map(Bytes::from)
}

/// One field of a request message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSchema {
    pub name: String,
    pub number: u32,
    pub kind: FieldKind,
    #[serde(default)]
    pub repeated: bool,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, number: u32, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            number,
            kind,
            repeated: false,
        }
    }

    pub fn repeated(mut self) -> Self {
        self.repeated = true;
        self
    }

    fn encode(&self, value: &RpcValue, dst: &mut BytesMut) -> Result<()> {
        let invalid = |reason: String| RpcError::InvalidArgument {
            argument: self.name.clone(),
            reason,
        };

        match (self.repeated, value) {
            (true, RpcValue::List(items)) => {
                for item in items {
                    if matches!(item, RpcValue::List(_)) {
                        return Err(invalid("nested lists are not supported".to_string()));
                    }
                    self.kind.encode(self.number, item, dst).map_err(invalid)?;
                }
                Ok(())
            }
            (true, other) => Err(invalid(format!(
                "repeated field expects a list, got {}",
                other.kind_name()
            ))),
            (false, RpcValue::List(_)) => Err(invalid("field is not repeated".to_string())),
            (false, value) => self.kind.encode(self.number, value, dst).map_err(invalid),
        }
    }
}

/// A unary method and its request layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSchema {
    pub name: String,
    pub id: u32,
    pub request: Vec<FieldSchema>,
}

impl MethodSchema {
    pub fn new(name: impl Into<String>, request: Vec<FieldSchema>) -> Self {
        let name = name.into();
        Self {
            id: ids::hash(&name),
            name,
            request,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.request.iter().find(|f| f.name == name)
    }

    /// Encode keyword arguments into a request message.
    ///
    /// Arguments are written in field-number order. Missing fields take their
    /// default value and are left off the wire.
    pub fn encode_request(&self, args: &RpcArgs) -> Result<Bytes> {
        let mut matched: Vec<(&FieldSchema, &RpcValue)> = Vec::with_capacity(args.len());
        for (name, value) in args.iter() {
            let field = self.field(name).ok_or_else(|| RpcError::UnknownArgument {
                method: self.name.clone(),
                argument: name.to_string(),
            })?;
            matched.push((field, value));
        }
        matched.sort_by_key(|(field, _)| field.number);

        let mut buf = BytesMut::new();
        for (field, value) in matched {
            field.encode(value, &mut buf)?;
        }
        Ok(buf.freeze())
    }

    /// Parse `name=value` tokens from the command line against this schema.
    pub fn parse_args<'a, I>(&self, pairs: I) -> Result<RpcArgs>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut args = RpcArgs::new();
        for (name, text) in pairs {
            let field = self.field(name).ok_or_else(|| RpcError::UnknownArgument {
                method: self.name.clone(),
                argument: name.to_string(),
            })?;
            let invalid = |reason: String| RpcError::InvalidArgument {
                argument: name.to_string(),
                reason,
            };
            let value = if field.repeated {
                let items = text
                    .split(',')
                    .filter(|item| !item.trim().is_empty())
                    .map(|item| field.kind.parse_text(item))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(invalid)?;
                RpcValue::List(items)
            } else {
                field.kind.parse_text(text).map_err(invalid)?
            };
            args.insert(name, value);
        }
        Ok(args)
    }
}

/// A service and its methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSchema {
    /// Bare service name.
    pub name: String,
    /// Package-qualified name; the id is derived from this.
    pub full_name: String,
    pub id: u32,
    pub methods: Vec<MethodSchema>,
}

impl ServiceSchema {
    pub fn new(package: &str, name: impl Into<String>, methods: Vec<MethodSchema>) -> Self {
        let name = name.into();
        let full_name = if package.is_empty() {
            name.clone()
        } else {
            format!("{package}.{name}")
        };
        Self {
            id: ids::hash(&full_name),
            name,
            full_name,
            methods,
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodSchema> {
        self.methods.iter().find(|m| m.name == name)
    }

    pub fn package(&self) -> &str {
        self.full_name
            .strip_suffix(&self.name)
            .and_then(|p| p.strip_suffix('.'))
            .unwrap_or("")
    }
}

/// Package of the built-in echo service.
pub const ECHO_PACKAGE: &str = "pw.rpc";
/// Bare name of the built-in echo service.
pub const ECHO_SERVICE: &str = "EchoService";
/// The echo method.
pub const ECHO_METHOD: &str = "Echo";
/// Field number of `msg` in both the echo request and response.
pub const ECHO_MSG_FIELD: u32 = 1;

/// The `pw.rpc.EchoService` schema every registry starts with.
pub fn echo_service() -> ServiceSchema {
    ServiceSchema::new(
        ECHO_PACKAGE,
        ECHO_SERVICE,
        vec![MethodSchema::new(
            ECHO_METHOD,
            vec![FieldSchema::new("msg", ECHO_MSG_FIELD, FieldKind::String)],
        )],
    )
}

/// Read the first string field with `number` from an encoded message.
pub fn decode_string_field(message: &Bytes, number: u32) -> Result<Option<String>> {
    for field in FieldReader::new(message.clone()) {
        let (n, value) = field?;
        if n != number {
            continue;
        }
        let FieldValue::LengthDelimited(raw) = value else {
            return Err(RpcError::MalformedPacket(format!(
                "field {number} is not length-delimited"
            )));
        };
        let text = String::from_utf8(raw.to_vec()).map_err(|err| {
            RpcError::MalformedPacket(format!("field {number} is not UTF-8: {err}"))
        })?;
        return Ok(Some(text));
    }
    Ok(None)
}
