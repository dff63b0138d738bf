//! Protocol Buffers wire-format primitives.
//!
//! Just enough of the encoding to build request messages from schema data and
//! to take apart packet envelopes and simple responses.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Wire type carried in the low three bits of a field tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint = 0,
    Fixed64 = 1,
    LengthDelimited = 2,
    Fixed32 = 5,
}

/// A decoded field value, still in wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varint(u64),
    Fixed64(u64),
    LengthDelimited(Bytes),
    Fixed32(u32),
}

impl FieldValue {
    /// The value as an unsigned integer, for varint and fixed fields.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::Varint(v) | FieldValue::Fixed64(v) => Some(*v),
            FieldValue::Fixed32(v) => Some(u64::from(*v)),
            FieldValue::LengthDelimited(_) => None,
        }
    }

    /// The raw bytes of a length-delimited field.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            FieldValue::LengthDelimited(b) => Some(b),
            _ => None,
        }
    }
}

pub fn put_varint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

pub fn put_tag(dst: &mut BytesMut, field: u32, wire_type: WireType) {
    put_varint(dst, (u64::from(field) << 3) | wire_type as u64);
}

pub fn put_varint_field(dst: &mut BytesMut, field: u32, value: u64) {
    put_tag(dst, field, WireType::Varint);
    put_varint(dst, value);
}

pub fn put_fixed32_field(dst: &mut BytesMut, field: u32, value: u32) {
    put_tag(dst, field, WireType::Fixed32);
    dst.put_u32_le(value);
}

pub fn put_fixed64_field(dst: &mut BytesMut, field: u32, value: u64) {
    put_tag(dst, field, WireType::Fixed64);
    dst.put_u64_le(value);
}

pub fn put_bytes_field(dst: &mut BytesMut, field: u32, data: &[u8]) {
    put_tag(dst, field, WireType::LengthDelimited);
    put_varint(dst, data.len() as u64);
    dst.put_slice(data);
}

pub fn zigzag32(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

pub fn zigzag64(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn get_varint(buf: &mut Bytes) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(RpcError::MalformedPacket("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(RpcError::MalformedPacket("varint too long".to_string()))
}

/// Iterates over the fields of an encoded message.
pub struct FieldReader {
    buf: Bytes,
}

impl FieldReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn next_field(&mut self) -> Result<(u32, FieldValue)> {
        let tag = get_varint(&mut self.buf)?;
        let field = u32::try_from(tag >> 3)
            .map_err(|_| RpcError::MalformedPacket(format!("field number out of range: {tag}")))?;
        if field == 0 {
            return Err(RpcError::MalformedPacket("field number 0".to_string()));
        }

        let value = match tag & 0x7 {
            0 => FieldValue::Varint(get_varint(&mut self.buf)?),
            1 => {
                self.need(8)?;
                FieldValue::Fixed64(self.buf.get_u64_le())
            }
            2 => {
                let len = get_varint(&mut self.buf)?;
                let len = usize::try_from(len).map_err(|_| {
                    RpcError::MalformedPacket(format!("length out of range: {len}"))
                })?;
                self.need(len)?;
                FieldValue::LengthDelimited(self.buf.split_to(len))
            }
            5 => {
                self.need(4)?;
                FieldValue::Fixed32(self.buf.get_u32_le())
            }
            other => {
                return Err(RpcError::MalformedPacket(format!(
                    "unsupported wire type {other} on field {field}"
                )))
            }
        };
        Ok((field, value))
    }

    fn need(&self, len: usize) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(RpcError::MalformedPacket(format!(
                "field needs {len} bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }
}

impl Iterator for FieldReader {
    type Item = Result<(u32, FieldValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.buf.has_remaining() {
            return None;
        }
        let item = self.next_field();
        if item.is_err() {
            // Stop after the first error.
            self.buf.clear();
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_encoding() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 1);
        put_varint(&mut buf, 300);
        assert_eq!(buf.as_ref(), &[0x01, 0xAC, 0x02]);
    }

    #[test]
    fn zigzag_mapping() {
        assert_eq!(zigzag32(0), 0);
        assert_eq!(zigzag32(-1), 1);
        assert_eq!(zigzag32(1), 2);
        assert_eq!(zigzag32(i32::MIN), u32::MAX);
        assert_eq!(zigzag64(-2), 3);
    }

    #[test]
    fn reads_mixed_fields() {
        let mut buf = BytesMut::new();
        put_varint_field(&mut buf, 1, 150);
        put_fixed32_field(&mut buf, 3, 0xDEAD_BEEF);
        put_bytes_field(&mut buf, 5, b"abc");
        put_fixed64_field(&mut buf, 9, 7);

        let fields: Vec<_> = FieldReader::new(buf.freeze())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            fields,
            vec![
                (1, FieldValue::Varint(150)),
                (3, FieldValue::Fixed32(0xDEAD_BEEF)),
                (5, FieldValue::LengthDelimited(Bytes::from_static(b"abc"))),
                (9, FieldValue::Fixed64(7)),
            ]
        );
    }

    #[test]
    fn truncated_input_is_malformed() {
        let mut buf = BytesMut::new();
        put_bytes_field(&mut buf, 5, b"abcdef");
        buf.truncate(4);

        let mut reader = FieldReader::new(buf.freeze());
        assert!(matches!(
            reader.next(),
            Some(Err(RpcError::MalformedPacket(_)))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn rejects_group_wire_types() {
        let mut reader = FieldReader::new(Bytes::from_static(&[0x0B]));
        assert!(matches!(reader.next(), Some(Err(_))));
    }
}
