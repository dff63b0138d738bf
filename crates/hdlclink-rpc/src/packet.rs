use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::wire::{self, FieldReader, FieldValue};

/// Channel used when the configuration does not name one.
pub const DEFAULT_CHANNEL_ID: u32 = 1;

const FIELD_TYPE: u32 = 1;
const FIELD_CHANNEL_ID: u32 = 2;
const FIELD_SERVICE_ID: u32 = 3;
const FIELD_METHOD_ID: u32 = 4;
const FIELD_PAYLOAD: u32 = 5;
const FIELD_STATUS: u32 = 6;
const FIELD_CALL_ID: u32 = 7;

/// Kind of RPC packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Request,
    Response,
    ClientStream,
    ServerStream,
    ClientError,
    ServerError,
    ClientRequestCompletion,
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::Request => 0,
            PacketType::Response => 1,
            PacketType::ClientStream => 2,
            PacketType::ServerStream => 3,
            PacketType::ClientError => 4,
            PacketType::ServerError => 5,
            PacketType::ClientRequestCompletion => 8,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        let ty = match code {
            0 => PacketType::Request,
            1 => PacketType::Response,
            2 => PacketType::ClientStream,
            3 => PacketType::ServerStream,
            4 => PacketType::ClientError,
            5 => PacketType::ServerError,
            8 => PacketType::ClientRequestCompletion,
            _ => return None,
        };
        Some(ty)
    }
}

/// Completion status carried by response and error packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl Status {
    const ALL: [Status; 17] = [
        Status::Ok,
        Status::Cancelled,
        Status::Unknown,
        Status::InvalidArgument,
        Status::DeadlineExceeded,
        Status::NotFound,
        Status::AlreadyExists,
        Status::PermissionDenied,
        Status::ResourceExhausted,
        Status::FailedPrecondition,
        Status::Aborted,
        Status::OutOfRange,
        Status::Unimplemented,
        Status::Internal,
        Status::Unavailable,
        Status::DataLoss,
        Status::Unauthenticated,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    /// Map a wire code to a status; unrecognized codes become `Unknown`.
    pub fn from_code(code: u64) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(Status::Unknown)
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::Cancelled => "CANCELLED",
            Status::Unknown => "UNKNOWN",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Status::NotFound => "NOT_FOUND",
            Status::AlreadyExists => "ALREADY_EXISTS",
            Status::PermissionDenied => "PERMISSION_DENIED",
            Status::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Status::FailedPrecondition => "FAILED_PRECONDITION",
            Status::Aborted => "ABORTED",
            Status::OutOfRange => "OUT_OF_RANGE",
            Status::Unimplemented => "UNIMPLEMENTED",
            Status::Internal => "INTERNAL",
            Status::Unavailable => "UNAVAILABLE",
            Status::DataLoss => "DATA_LOSS",
            Status::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The RPC packet envelope.
///
/// Encoded as a protobuf message; fields holding their default value are
/// omitted on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcPacket {
    pub packet_type: PacketType,
    pub channel_id: u32,
    pub service_id: u32,
    pub method_id: u32,
    pub payload: Bytes,
    pub status: Status,
    pub call_id: u32,
}

impl RpcPacket {
    /// Build a unary request.
    pub fn request(
        channel_id: u32,
        service_id: u32,
        method_id: u32,
        call_id: u32,
        payload: Bytes,
    ) -> Self {
        Self {
            packet_type: PacketType::Request,
            channel_id,
            service_id,
            method_id,
            payload,
            status: Status::Ok,
            call_id,
        }
    }

    /// Build a client error telling the server a packet was not expected.
    pub fn client_error(other: &RpcPacket, status: Status) -> Self {
        Self {
            packet_type: PacketType::ClientError,
            channel_id: other.channel_id,
            service_id: other.service_id,
            method_id: other.method_id,
            payload: Bytes::new(),
            status,
            call_id: other.call_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24 + self.payload.len());
        let ty = self.packet_type.code();
        if ty != 0 {
            wire::put_varint_field(&mut buf, FIELD_TYPE, u64::from(ty));
        }
        if self.channel_id != 0 {
            wire::put_varint_field(&mut buf, FIELD_CHANNEL_ID, u64::from(self.channel_id));
        }
        if self.service_id != 0 {
            wire::put_fixed32_field(&mut buf, FIELD_SERVICE_ID, self.service_id);
        }
        if self.method_id != 0 {
            wire::put_fixed32_field(&mut buf, FIELD_METHOD_ID, self.method_id);
        }
        if !self.payload.is_empty() {
            wire::put_bytes_field(&mut buf, FIELD_PAYLOAD, &self.payload);
        }
        if !self.status.is_ok() {
            wire::put_varint_field(&mut buf, FIELD_STATUS, u64::from(self.status.code()));
        }
        if self.call_id != 0 {
            wire::put_varint_field(&mut buf, FIELD_CALL_ID, u64::from(self.call_id));
        }
        buf.freeze()
    }

    /// Decode a packet. Unknown fields are skipped.
    pub fn decode(data: Bytes) -> Result<Self> {
        let mut packet = RpcPacket {
            packet_type: PacketType::Request,
            channel_id: 0,
            service_id: 0,
            method_id: 0,
            payload: Bytes::new(),
            status: Status::Ok,
            call_id: 0,
        };

        for field in FieldReader::new(data) {
            let (number, value) = field?;
            match (number, value) {
                (FIELD_TYPE, FieldValue::Varint(v)) => {
                    packet.packet_type = PacketType::from_code(v).ok_or_else(|| {
                        RpcError::MalformedPacket(format!("unknown packet type {v}"))
                    })?;
                }
                (FIELD_CHANNEL_ID, FieldValue::Varint(v)) => packet.channel_id = truncate(v),
                (FIELD_SERVICE_ID, FieldValue::Fixed32(v)) => packet.service_id = v,
                (FIELD_METHOD_ID, FieldValue::Fixed32(v)) => packet.method_id = v,
                (FIELD_PAYLOAD, FieldValue::LengthDelimited(b)) => packet.payload = b,
                (FIELD_STATUS, FieldValue::Varint(v)) => packet.status = Status::from_code(v),
                (FIELD_CALL_ID, FieldValue::Varint(v)) => packet.call_id = truncate(v),
                (
                    FIELD_TYPE | FIELD_CHANNEL_ID | FIELD_SERVICE_ID | FIELD_METHOD_ID
                    | FIELD_PAYLOAD | FIELD_STATUS | FIELD_CALL_ID,
                    other,
                ) => {
                    return Err(RpcError::MalformedPacket(format!(
                        "field {number} has wrong wire type: {other:?}"
                    )))
                }
                _ => {}
            }
        }
        Ok(packet)
    }
}

// uint32 fields decode as the low 32 bits of the varint.
fn truncate(value: u64) -> u32 {
    value as u32
}

/// Service and method ids derived from names.
pub mod ids {
    const HASH_CONSTANT: u32 = 65599;

    /// Hash a name into a 32-bit id, the way the embedded server does.
    ///
    /// Services hash their fully qualified name (`package.Service`), methods
    /// hash their bare name.
    pub fn hash(name: &str) -> u32 {
        let mut hash = name.len() as u32;
        let mut coefficient = HASH_CONSTANT;
        for byte in name.bytes() {
            hash = hash.wrapping_add(coefficient.wrapping_mul(u32::from(byte)));
            coefficient = coefficient.wrapping_mul(HASH_CONSTANT);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: Status) -> RpcPacket {
        RpcPacket {
            packet_type: PacketType::Response,
            channel_id: 1,
            service_id: ids::hash("pw.rpc.EchoService"),
            method_id: ids::hash("Echo"),
            payload: Bytes::from_static(b"\x0a\x04pong"),
            status,
            call_id: 7,
        }
    }

    #[test]
    fn encode_decode_response() {
        let packet = response(Status::Ok);
        let decoded = RpcPacket::decode(packet.encode()).unwrap();
        assert_eq!(decoded, packet);

        let failed = response(Status::NotFound);
        let decoded = RpcPacket::decode(failed.encode()).unwrap();
        assert_eq!(decoded.status, Status::NotFound);
    }

    #[test]
    fn request_omits_default_fields() {
        let packet = RpcPacket::request(0, 0, 0, 0, Bytes::new());
        assert!(packet.encode().is_empty());

        let decoded = RpcPacket::decode(Bytes::new()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Request);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn request_wire_layout() {
        let packet = RpcPacket::request(1, 0x0403_0201, 0x0807_0605, 0, Bytes::from_static(b"x"));
        assert_eq!(
            packet.encode().as_ref(),
            &[
                0x10, 0x01, // channel_id = 1
                0x1D, 0x01, 0x02, 0x03, 0x04, // service_id fixed32
                0x25, 0x05, 0x06, 0x07, 0x08, // method_id fixed32
                0x2A, 0x01, b'x', // payload
            ]
        );
    }

    #[test]
    fn decode_skips_unknown_fields() {
        let mut buf = BytesMut::new();
        wire::put_varint_field(&mut buf, FIELD_TYPE, 1);
        wire::put_bytes_field(&mut buf, 42, b"future");
        wire::put_varint_field(&mut buf, FIELD_CALL_ID, 3);

        let decoded = RpcPacket::decode(buf.freeze()).unwrap();
        assert_eq!(decoded.packet_type, PacketType::Response);
        assert_eq!(decoded.call_id, 3);
    }

    #[test]
    fn decode_rejects_wrong_wire_type() {
        let mut buf = BytesMut::new();
        wire::put_varint_field(&mut buf, FIELD_SERVICE_ID, 5);
        assert!(matches!(
            RpcPacket::decode(buf.freeze()),
            Err(RpcError::MalformedPacket(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut buf = BytesMut::new();
        wire::put_varint_field(&mut buf, FIELD_TYPE, 6);
        assert!(RpcPacket::decode(buf.freeze()).is_err());
    }

    #[test]
    fn status_codes() {
        assert_eq!(Status::from_code(0), Status::Ok);
        assert_eq!(Status::from_code(5), Status::NotFound);
        assert_eq!(Status::from_code(16), Status::Unauthenticated);
        assert_eq!(Status::from_code(999), Status::Unknown);
        assert_eq!(Status::DeadlineExceeded.code(), 4);
        assert_eq!(Status::Unimplemented.to_string(), "UNIMPLEMENTED");
    }

    #[test]
    fn client_error_mirrors_ids() {
        let packet = response(Status::Ok);
        let err = RpcPacket::client_error(&packet, Status::FailedPrecondition);
        assert_eq!(err.packet_type, PacketType::ClientError);
        assert_eq!(err.service_id, packet.service_id);
        assert_eq!(err.call_id, 7);
    }

    #[test]
    fn id_hash() {
        assert_eq!(ids::hash(""), 0);
        // len 1 + 65599 * 'a'
        assert_eq!(ids::hash("a"), 1u32.wrapping_add(65599u32.wrapping_mul(97)));
        assert_ne!(ids::hash("Echo"), ids::hash("echo"));
    }
}
