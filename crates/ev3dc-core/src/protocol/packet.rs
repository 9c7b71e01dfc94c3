//! Message encoding/decoding
//!
//! Request format:
//! - 2 bytes: length of everything after this field (little-endian)
//! - 2 bytes: message counter (little-endian)
//! - 1 byte: command type (0x00 = reply expected, 0x08 = no reply)
//! - 2 bytes: memory allocation word (`local * 1024 + global`)
//! - N bytes: encoded parameters
//!
//! Reply format:
//! - 2 bytes: length of everything after this field (little-endian)
//! - 2 bytes: message counter (little-endian)
//! - 1 byte: status (0x02 = ok, 0x04 = error)
//! - N bytes: global memory, laid out per the request's pointer map

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::codec::{
    encode_byte, encode_memory_allocation, encode_number, encode_pointer, encode_string,
    Parameter, PointerScope, PointerType,
};
use super::{Ev3Error, Result};

/// Length of the request header in bytes
pub const REQUEST_HEAD_SIZE: usize = 5;

/// Length of the reply header in bytes
pub const RESPONSE_HEAD_SIZE: usize = 5;

/// Largest counter a request may carry
pub const MAX_COUNTER: u16 = 0x7FFF;

/// Largest body a request may carry
pub const MAX_BODY_LENGTH: usize = 32764;

const DIRECT_COMMAND_REPLY: u8 = 0x00;
const DIRECT_COMMAND_NO_REPLY: u8 = 0x08;
const DIRECT_REPLY_OK: u8 = 0x02;
const DIRECT_REPLY_ERROR: u8 = 0x04;

/// Where a requested value lands in the reply payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePointer {
    /// Byte offset within the global allocation
    pub index: u16,
    /// Size of the value in bytes
    pub bytes: u16,
    /// How to decode the value
    #[serde(rename = "type")]
    pub kind: PointerType,
}

/// An encoded request body together with its reply layout
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBody {
    /// Allocation word followed by the encoded parameters
    pub bytes: Vec<u8>,
    /// Global pointers in request order
    pub pointer_map: Vec<ResponsePointer>,
}

/// A framed reply from the brick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMessage {
    /// Status 0x02: the request ran
    Ok {
        /// Counter of the request answered
        counter: u16,
        /// Global memory as laid out by the request's pointer map
        payload: Bytes,
    },
    /// Status 0x04: the brick reported an error
    Error {
        /// Counter of the request answered
        counter: u16,
    },
}

impl ResponseMessage {
    /// Counter the reply answers
    pub fn counter(&self) -> u16 {
        match self {
            ResponseMessage::Ok { counter, .. } | ResponseMessage::Error { counter } => *counter,
        }
    }
}

/// A typed value read from the reply payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// From an int pointer of any width
    Int(i32),
    /// From a float pointer
    Float(f32),
    /// From a string pointer, without its terminator
    Str(String),
}

impl Value {
    /// The integer, if this is one
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The float, if this is one
    pub fn as_float(&self) -> Option<f32> {
        match self {
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// The string, if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A decoded reply value and the offset it was read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedValue {
    /// Byte offset the value was read from
    pub index: u16,
    /// The decoded value
    pub value: Value,
}

/// Encode the parameters of a request into its body
///
/// Global and local pointers are laid out independently, each scope
/// starting at offset 0. Only global pointers appear in the pointer map.
pub fn assemble_request_body(params: &[Parameter]) -> Result<RequestBody> {
    let mut encoded = Vec::new();
    let mut pointer_map = Vec::new();
    let mut global_offset = 0usize;
    let mut local_offset = 0usize;

    for param in params {
        match param {
            Parameter::Byte(b) => encoded.extend_from_slice(&encode_byte(*b)),
            Parameter::Number { bytes, value } => {
                encoded.extend_from_slice(&encode_number(*bytes, *value)?)
            }
            Parameter::Str(text) => encoded.extend_from_slice(&encode_string(text)?),
            Parameter::Pointer(pointer) => match pointer.scope {
                PointerScope::Global => {
                    encoded.extend_from_slice(&encode_pointer(pointer, global_offset)?);
                    pointer_map.push(ResponsePointer {
                        index: global_offset as u16,
                        bytes: pointer.bytes,
                        kind: pointer.kind,
                    });
                    global_offset += pointer.bytes as usize;
                }
                PointerScope::Local => {
                    encoded.extend_from_slice(&encode_pointer(pointer, local_offset)?);
                    local_offset += pointer.bytes as usize;
                }
            },
        }
    }

    let mut bytes = Vec::with_capacity(2 + encoded.len());
    bytes.extend_from_slice(&encode_memory_allocation(global_offset, local_offset)?);
    bytes.extend_from_slice(&encoded);

    Ok(RequestBody { bytes, pointer_map })
}

/// Encode the 5-byte request header
pub fn encode_request_head(
    counter: u16,
    body_length: usize,
    expect_response: bool,
) -> Result<[u8; REQUEST_HEAD_SIZE]> {
    if counter > MAX_COUNTER {
        return Err(Ev3Error::validation(format!(
            "counter {} out of range 0..={}",
            counter, MAX_COUNTER
        )));
    }
    if body_length > MAX_BODY_LENGTH {
        return Err(Ev3Error::validation(format!(
            "body length {} out of range 0..={}",
            body_length, MAX_BODY_LENGTH
        )));
    }

    let mut head = [0u8; REQUEST_HEAD_SIZE];
    LittleEndian::write_u16(&mut head[0..2], (body_length + 3) as u16);
    LittleEndian::write_u16(&mut head[2..4], counter);
    head[4] = if expect_response {
        DIRECT_COMMAND_REPLY
    } else {
        DIRECT_COMMAND_NO_REPLY
    };
    Ok(head)
}

/// Encode a complete request (header followed by body)
pub fn encode_request(counter: u16, body: &RequestBody, expect_response: bool) -> Result<Vec<u8>> {
    let head = encode_request_head(counter, body.bytes.len(), expect_response)?;
    let mut message = Vec::with_capacity(REQUEST_HEAD_SIZE + body.bytes.len());
    message.extend_from_slice(&head);
    message.extend_from_slice(&body.bytes);
    Ok(message)
}

/// Decode the header of a framed reply
pub fn decode_response_head(message: &Bytes) -> Result<ResponseMessage> {
    if message.len() < RESPONSE_HEAD_SIZE {
        return Err(Ev3Error::protocol(format!(
            "reply of {} bytes is shorter than its header",
            message.len()
        )));
    }

    let declared = LittleEndian::read_u16(&message[0..2]) as usize;
    if declared != message.len() - 2 {
        return Err(Ev3Error::protocol(format!(
            "length mismatch: declared {} + 2, got {} bytes",
            declared,
            message.len()
        )));
    }

    let counter = LittleEndian::read_u16(&message[2..4]);
    match message[4] {
        DIRECT_REPLY_OK => Ok(ResponseMessage::Ok {
            counter,
            payload: message.slice(RESPONSE_HEAD_SIZE..),
        }),
        DIRECT_REPLY_ERROR => Ok(ResponseMessage::Error { counter }),
        status => Err(Ev3Error::protocol(format!(
            "unknown status code {:#04x}",
            status
        ))),
    }
}

/// Decode a reply payload according to the request's pointer map
pub fn decode_response_body(
    payload: &[u8],
    pointer_map: &[ResponsePointer],
) -> Result<Vec<DecodedValue>> {
    let allocated: usize = pointer_map.iter().map(|p| p.bytes as usize).sum();
    if allocated != payload.len() {
        return Err(Ev3Error::protocol(format!(
            "payload of {} bytes does not match {} allocated bytes",
            payload.len(),
            allocated
        )));
    }

    pointer_map
        .iter()
        .map(|ptr| decode_pointer(payload, ptr))
        .collect()
}

fn decode_pointer(payload: &[u8], ptr: &ResponsePointer) -> Result<DecodedValue> {
    let start = ptr.index as usize;
    let width = ptr.bytes as usize;

    let value = match ptr.kind {
        PointerType::Int => {
            if !matches!(width, 1 | 2 | 4) {
                return Err(Ev3Error::validation(format!(
                    "int pointer must be 1, 2 or 4 bytes, got {}",
                    width
                )));
            }
            let raw = slice_at(payload, start, width)?;
            Value::Int(LittleEndian::read_int(raw, width) as i32)
        }
        PointerType::Float => {
            if width != 4 {
                return Err(Ev3Error::validation(format!(
                    "float pointer must be 4 bytes, got {}",
                    width
                )));
            }
            Value::Float(LittleEndian::read_f32(slice_at(payload, start, 4)?))
        }
        PointerType::String => {
            let rest = payload.get(start..).unwrap_or_default();
            let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
            if end > width {
                return Err(Ev3Error::protocol(format!(
                    "string at {} is {} bytes long, exceeds its {} byte budget",
                    start, end, width
                )));
            }
            Value::Str(String::from_utf8_lossy(&rest[..end]).into_owned())
        }
    };

    Ok(DecodedValue {
        index: ptr.index,
        value,
    })
}

fn slice_at(payload: &[u8], start: usize, width: usize) -> Result<&[u8]> {
    payload.get(start..start + width).ok_or_else(|| {
        Ev3Error::protocol(format!(
            "value at {}..{} lies outside a {} byte payload",
            start,
            start + width,
            payload.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::Pointer;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_head() {
        assert_eq!(encode_request_head(0, 0, true).unwrap(), [0x03, 0, 0, 0, 0]);
        assert_eq!(
            encode_request_head(0x5e, 0, true).unwrap(),
            [0x03, 0, 0x5e, 0, 0]
        );
        assert_eq!(
            encode_request_head(0, 0, false).unwrap(),
            [0x03, 0, 0, 0, 0x08]
        );
        assert_eq!(
            encode_request_head(0x1234, 0x100, true).unwrap(),
            [0x03, 0x01, 0x34, 0x12, 0]
        );
    }

    #[test]
    fn test_request_head_bounds() {
        assert!(encode_request_head(32767, 32764, true).is_ok());
        assert!(matches!(
            encode_request_head(32768, 0, true),
            Err(Ev3Error::Validation(_))
        ));
        assert!(matches!(
            encode_request_head(0, 32765, true),
            Err(Ev3Error::Validation(_))
        ));
    }

    #[test]
    fn test_body_with_mixed_parameters() {
        let params = vec![
            Parameter::Byte(0x5e),
            Parameter::number(1, 0x5e),
            Parameter::string("foo"),
            Pointer::global_int(1).into(),
        ];
        let body = assemble_request_body(&params).unwrap();

        assert_eq!(
            body.bytes,
            vec![
                0x01, 0x00, // global 1, local 0
                0x5e, // raw byte
                0x81, 0x5e, // 1-byte constant
                0x84, b'f', b'o', b'o', 0x00, // string
                0xE1, 0x00, // global pointer at 0
            ]
        );
        assert_eq!(
            body.pointer_map,
            vec![ResponsePointer {
                index: 0,
                bytes: 1,
                kind: PointerType::Int,
            }]
        );
    }

    #[test]
    fn test_scopes_are_laid_out_independently() {
        let params = vec![
            Pointer::global_float().into(),
            Pointer::local(PointerType::Int, 2).into(),
            Pointer::global_string(30).into(),
            Pointer::local(PointerType::Int, 4).into(),
            Pointer::global_int(2).into(),
        ];
        let body = assemble_request_body(&params).unwrap();

        // 36 global bytes, 6 local bytes
        assert_eq!(&body.bytes[..2], &[36, 6 << 2]);
        assert_eq!(
            &body.bytes[2..],
            &[0xE1, 0, 0xC1, 0, 0xE1, 4, 0xC1, 2, 0xE1, 34]
        );
        assert_eq!(
            body.pointer_map
                .iter()
                .map(|p| (p.index, p.bytes))
                .collect::<Vec<_>>(),
            vec![(0, 4), (4, 30), (34, 2)]
        );
    }

    #[test]
    fn test_body_propagates_validation_errors() {
        let params = vec![Parameter::number(0, 40)];
        assert!(matches!(
            assemble_request_body(&params),
            Err(Ev3Error::Validation(_))
        ));

        let too_much = vec![
            Pointer::global_string(1000).into(),
            Pointer::global_string(100).into(),
        ];
        assert!(matches!(
            assemble_request_body(&too_much),
            Err(Ev3Error::Validation(_))
        ));
    }

    #[test]
    fn test_empty_body() {
        let body = assemble_request_body(&[]).unwrap();
        assert_eq!(body.bytes, vec![0, 0]);
        assert!(body.pointer_map.is_empty());
    }

    #[test]
    fn test_encode_request() {
        let body = assemble_request_body(&[Parameter::Byte(0x01)]).unwrap();
        let message = encode_request(7, &body, false).unwrap();
        assert_eq!(message, vec![0x06, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_response_head_ok() {
        let message = decode_response_head(&Bytes::from_static(&[0x03, 0, 0, 0, 0x02])).unwrap();
        assert_eq!(
            message,
            ResponseMessage::Ok {
                counter: 0,
                payload: Bytes::new(),
            }
        );
    }

    #[test]
    fn test_response_head_error() {
        let message = decode_response_head(&Bytes::from_static(&[0x03, 0, 0, 0, 0x04])).unwrap();
        assert_eq!(message, ResponseMessage::Error { counter: 0 });
    }

    #[test]
    fn test_response_head_with_payload() {
        let message =
            decode_response_head(&Bytes::from_static(&[0x05, 0, 0x2A, 0x01, 0x02, 0xAA, 0xBB]))
                .unwrap();
        assert_eq!(message.counter(), 0x012A);
        assert_eq!(
            message,
            ResponseMessage::Ok {
                counter: 0x012A,
                payload: Bytes::from_static(&[0xAA, 0xBB]),
            }
        );
    }

    #[test]
    fn test_response_head_length_mismatch() {
        let err = decode_response_head(&Bytes::from_static(&[0x04, 0, 0, 0, 0x02])).unwrap_err();
        assert!(err.is_protocol());
        assert!(decode_response_head(&Bytes::from_static(&[0x02, 0, 0, 0, 0x02])).is_err());
    }

    #[test]
    fn test_response_head_unknown_status() {
        let err = decode_response_head(&Bytes::from_static(&[0x03, 0, 0, 0, 0x00])).unwrap_err();
        assert!(matches!(err, Ev3Error::Protocol(msg) if msg.contains("unknown status")));
    }

    #[test]
    fn test_response_head_too_short() {
        assert!(decode_response_head(&Bytes::from_static(&[0x01, 0, 0])).is_err());
    }

    #[test]
    fn test_body_ints_and_float() {
        let map = vec![
            ResponsePointer { index: 0, bytes: 1, kind: PointerType::Int },
            ResponsePointer { index: 1, bytes: 2, kind: PointerType::Int },
            ResponsePointer { index: 3, bytes: 4, kind: PointerType::Int },
            ResponsePointer { index: 7, bytes: 4, kind: PointerType::Float },
        ];
        let mut payload = vec![0xFF, 0x34, 0x12, 0xFE, 0xFF, 0xFF, 0xFF];
        payload.extend_from_slice(&7.5f32.to_le_bytes());

        let values = decode_response_body(&payload, &map).unwrap();
        assert_eq!(
            values,
            vec![
                DecodedValue { index: 0, value: Value::Int(-1) },
                DecodedValue { index: 1, value: Value::Int(0x1234) },
                DecodedValue { index: 3, value: Value::Int(-2) },
                DecodedValue { index: 7, value: Value::Float(7.5) },
            ]
        );
    }

    #[test]
    fn test_body_strings() {
        let map = vec![
            ResponsePointer { index: 0, bytes: 6, kind: PointerType::String },
            ResponsePointer { index: 6, bytes: 3, kind: PointerType::String },
        ];
        let payload = [0x66, 0x6f, 0x6f, 0, 0, 0, b'a', b'b', 0];

        let values = decode_response_body(&payload, &map).unwrap();
        assert_eq!(values[0].value, Value::Str("foo".to_string()));
        assert_eq!(values[1].value, Value::Str("ab".to_string()));
        assert_eq!(values[1].index, 6);
    }

    #[test]
    fn test_body_string_exceeding_budget() {
        let map = vec![
            ResponsePointer { index: 0, bytes: 2, kind: PointerType::String },
            ResponsePointer { index: 2, bytes: 2, kind: PointerType::Int },
        ];
        let payload = [b'a', b'b', b'c', 0];
        let err = decode_response_body(&payload, &map).unwrap_err();
        assert!(matches!(err, Ev3Error::Protocol(_)));
    }

    #[test]
    fn test_body_size_mismatch() {
        let map = vec![ResponsePointer { index: 0, bytes: 4, kind: PointerType::Int }];
        assert!(matches!(
            decode_response_body(&[0, 0], &map),
            Err(Ev3Error::Protocol(_))
        ));
    }

    #[test]
    fn test_body_invalid_widths() {
        let int3 = vec![ResponsePointer { index: 0, bytes: 3, kind: PointerType::Int }];
        assert!(matches!(
            decode_response_body(&[0, 0, 0], &int3),
            Err(Ev3Error::Validation(_))
        ));

        let float2 = vec![ResponsePointer { index: 0, bytes: 2, kind: PointerType::Float }];
        assert!(matches!(
            decode_response_body(&[0, 0], &float2),
            Err(Ev3Error::Validation(_))
        ));
    }

    #[test]
    fn test_body_empty() {
        assert!(decode_response_body(&[], &[]).unwrap().is_empty());
    }
}
