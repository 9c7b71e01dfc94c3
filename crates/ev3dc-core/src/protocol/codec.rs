//! Parameter encoding
//!
//! Encodes Direct Command parameters into the brick's bit-packed format.
//!
//! Every parameter starts with a descriptor byte:
//! - bit 7: long format (a value follows the descriptor)
//! - bit 6: variable (memory reference) instead of constant
//! - bit 5: sign for short constants, label flag for long constants,
//!   global scope for variables
//! - bit 4: handle flag (long variables only)
//! - bits 0-2: size selector for long values (1 = 1 byte, 2 = 2 bytes,
//!   3 = 4 bytes, 4 = zero-terminated string)
//!
//! Short constants carry a 5-bit magnitude in bits 0-4.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use super::{Ev3Error, Result};

const LONG_FORMAT: u8 = 0b1000_0000;
const VARIABLE: u8 = 0b0100_0000;
const SIGN_OR_SCOPE: u8 = 0b0010_0000;
const HANDLE: u8 = 0b0001_0000;
const STRING_TERMINATED: u8 = 0b0000_0100;
const SHORT_VALUE_MASK: u8 = 0b0001_1111;
const SIZE_MASK: u8 = 0b0000_0111;

/// Largest global allocation the brick accepts, in bytes
pub const MAX_GLOBAL_ALLOCATION: u16 = 1023;

/// Largest local allocation the brick accepts, in bytes
pub const MAX_LOCAL_ALLOCATION: u16 = 63;

/// Memory region a pointer parameter refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerScope {
    /// Returned to the caller in the reply payload
    Global,
    /// Scratch space, never read back
    Local,
}

/// How the bytes behind a pointer are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerType {
    /// Signed little-endian integer of 1, 2 or 4 bytes
    Int,
    /// IEEE-754 single precision, little-endian
    Float,
    /// Zero-terminated ASCII
    String,
}

/// An output slot reserved in the brick's memory for the reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    /// Region the slot lives in
    pub scope: PointerScope,
    /// Interpretation of the slot's bytes
    #[serde(rename = "type")]
    pub kind: PointerType,
    /// Size of the slot in bytes
    pub bytes: u16,
}

impl Pointer {
    /// Global pointer read back as an integer
    pub fn global_int(bytes: u16) -> Self {
        Self {
            scope: PointerScope::Global,
            kind: PointerType::Int,
            bytes,
        }
    }

    /// Global pointer read back as a 4-byte float
    pub fn global_float() -> Self {
        Self {
            scope: PointerScope::Global,
            kind: PointerType::Float,
            bytes: 4,
        }
    }

    /// Global pointer read back as a string of at most `bytes` characters
    pub fn global_string(bytes: u16) -> Self {
        Self {
            scope: PointerScope::Global,
            kind: PointerType::String,
            bytes,
        }
    }

    /// Local scratch pointer
    pub fn local(kind: PointerType, bytes: u16) -> Self {
        Self {
            scope: PointerScope::Local,
            kind,
            bytes,
        }
    }
}

/// A single request parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    /// Raw byte, written as-is (opcodes and sub-commands)
    Byte(u8),
    /// Signed constant; `bytes == 0` selects the short form
    Number {
        /// Value width: 0 (short form), 1, 2 or 4
        bytes: u8,
        /// The constant itself
        value: i64,
    },
    /// Zero-terminated string constant
    Str(String),
    /// Output slot for the reply
    Pointer(Pointer),
}

impl Parameter {
    /// Short-form constant in -31..=31
    pub fn short(value: i64) -> Self {
        Parameter::Number { bytes: 0, value }
    }

    /// Long-form constant of the given width
    pub fn number(bytes: u8, value: i64) -> Self {
        Parameter::Number { bytes, value }
    }

    /// Zero-terminated string constant
    pub fn string(text: impl Into<String>) -> Self {
        Parameter::Str(text.into())
    }
}

impl From<u8> for Parameter {
    fn from(b: u8) -> Self {
        Parameter::Byte(b)
    }
}

impl From<&str> for Parameter {
    fn from(s: &str) -> Self {
        Parameter::Str(s.to_string())
    }
}

impl From<Pointer> for Parameter {
    fn from(p: Pointer) -> Self {
        Parameter::Pointer(p)
    }
}

/// Encode a raw byte parameter
pub fn encode_byte(value: u8) -> [u8; 1] {
    [value]
}

/// Encode a signed numeric constant
///
/// `bytes == 0` packs the value into the descriptor itself and accepts
/// -31..=31. Long forms accept the open interval `(-2^(8n-1), 2^(8n-1))`,
/// so the most negative two's-complement value is rejected.
pub fn encode_number(bytes: u8, value: i64) -> Result<Vec<u8>> {
    match bytes {
        0 => {
            if !(-32 < value && value < 32) {
                return Err(Ev3Error::validation(format!(
                    "short constant {} out of range -31..=31",
                    value
                )));
            }
            let mut descriptor = (value.unsigned_abs() as u8) & SHORT_VALUE_MASK;
            if value < 0 {
                descriptor |= SIGN_OR_SCOPE;
            }
            Ok(vec![descriptor])
        }
        1 | 2 | 4 => {
            let limit = 1i64 << (8 * bytes as u32 - 1);
            if !(-limit < value && value < limit) {
                return Err(Ev3Error::validation(format!(
                    "constant {} out of range -{}..={} for {} byte(s)",
                    value,
                    limit - 1,
                    limit - 1,
                    bytes
                )));
            }
            let selector = if bytes == 4 { 0b11 } else { bytes };
            let mut buf = vec![0u8; 1 + bytes as usize];
            buf[0] = LONG_FORMAT | selector;
            LittleEndian::write_int(&mut buf[1..], value, bytes as usize);
            Ok(buf)
        }
        other => Err(Ev3Error::validation(format!(
            "invalid constant width {}: accept 0|1|2|4",
            other
        ))),
    }
}

/// Encode a zero-terminated string constant
pub fn encode_string(text: &str) -> Result<Vec<u8>> {
    if !text.is_ascii() {
        return Err(Ev3Error::validation(format!(
            "string constant {:?} is not ASCII",
            text
        )));
    }
    if text.as_bytes().contains(&0) {
        return Err(Ev3Error::validation(
            "string constant contains a NUL byte",
        ));
    }

    let mut buf = Vec::with_capacity(text.len() + 2);
    buf.push(LONG_FORMAT | STRING_TERMINATED);
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
    Ok(buf)
}

/// Check a pointer's declared size against its scope and type
pub fn validate_pointer(pointer: &Pointer) -> Result<()> {
    let (limit, scope) = match pointer.scope {
        PointerScope::Global => (MAX_GLOBAL_ALLOCATION, "global"),
        PointerScope::Local => (MAX_LOCAL_ALLOCATION, "local"),
    };
    if pointer.bytes > limit {
        return Err(Ev3Error::validation(format!(
            "pointer of {} bytes exceeds {} scope limit of {}",
            pointer.bytes, scope, limit
        )));
    }

    match pointer.kind {
        PointerType::Float if pointer.bytes != 4 => Err(Ev3Error::validation(format!(
            "float pointer must be 4 bytes, got {}",
            pointer.bytes
        ))),
        PointerType::Int if !matches!(pointer.bytes, 1 | 2 | 4) => {
            Err(Ev3Error::validation(format!(
                "int pointer must be 1, 2 or 4 bytes, got {}",
                pointer.bytes
            )))
        }
        _ => Ok(()),
    }
}

/// Encode a pointer parameter placed at `offset` within its scope's allocation
pub fn encode_pointer(pointer: &Pointer, offset: usize) -> Result<[u8; 2]> {
    validate_pointer(pointer)?;

    let index = u8::try_from(offset).map_err(|_| {
        Ev3Error::validation(format!(
            "pointer offset {} does not fit a one-byte index",
            offset
        ))
    })?;

    let mut descriptor = LONG_FORMAT | VARIABLE | 0b01;
    if pointer.scope == PointerScope::Global {
        descriptor |= SIGN_OR_SCOPE;
    }
    Ok([descriptor, index])
}

/// Encode the allocation word that opens every request body
pub fn encode_memory_allocation(global_size: usize, local_size: usize) -> Result<[u8; 2]> {
    if global_size > MAX_GLOBAL_ALLOCATION as usize {
        return Err(Ev3Error::validation(format!(
            "global allocation {} out of range 0..={}",
            global_size, MAX_GLOBAL_ALLOCATION
        )));
    }
    if local_size > MAX_LOCAL_ALLOCATION as usize {
        return Err(Ev3Error::validation(format!(
            "local allocation {} out of range 0..={}",
            local_size, MAX_LOCAL_ALLOCATION
        )));
    }

    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, (local_size * 1024 + global_size) as u16);
    Ok(buf)
}

/// A parameter read back from its wire form
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedParameter {
    /// Numeric constant; `bytes == 0` for the short form
    Number {
        /// Value width; 0 for the short form
        bytes: u8,
        /// The constant itself
        value: i64,
        /// Long-form label flag (bit 5)
        label: bool,
    },
    /// Zero-terminated string constant
    Str(String),
    /// Memory reference
    Variable {
        /// Global or local memory
        scope: PointerScope,
        /// Width of the index field; 0 for the short form
        bytes: u8,
        /// Offset within the scope's allocation
        index: i64,
        /// Handle flag (bit 4)
        handle: bool,
    },
}

/// Decode one parameter from the start of `buf`
///
/// Returns the parameter and the number of bytes it occupied.
pub fn decode_parameter(buf: &[u8]) -> Result<(DecodedParameter, usize)> {
    let descriptor = *buf
        .first()
        .ok_or_else(|| Ev3Error::protocol("empty parameter"))?;
    let variable = descriptor & VARIABLE != 0;
    let flag = descriptor & SIGN_OR_SCOPE != 0;
    let scope = if flag {
        PointerScope::Global
    } else {
        PointerScope::Local
    };

    if descriptor & LONG_FORMAT == 0 {
        let magnitude = (descriptor & SHORT_VALUE_MASK) as i64;
        let param = if variable {
            DecodedParameter::Variable {
                scope,
                bytes: 0,
                index: magnitude,
                handle: false,
            }
        } else {
            DecodedParameter::Number {
                bytes: 0,
                value: if flag { -magnitude } else { magnitude },
                label: false,
            }
        };
        return Ok((param, 1));
    }

    match descriptor & SIZE_MASK {
        0 | STRING_TERMINATED => {
            let end = buf[1..]
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| Ev3Error::protocol("string parameter without terminator"))?;
            let text = String::from_utf8_lossy(&buf[1..1 + end]).into_owned();
            Ok((DecodedParameter::Str(text), end + 2))
        }
        selector @ 1..=3 => {
            let width = if selector == 3 { 4 } else { selector as usize };
            if buf.len() < 1 + width {
                return Err(Ev3Error::protocol(format!(
                    "parameter needs {} value bytes, {} available",
                    width,
                    buf.len() - 1
                )));
            }
            let raw = &buf[1..1 + width];
            // Variable indices are unsigned offsets; constants are signed.
            let param = if variable {
                DecodedParameter::Variable {
                    scope,
                    bytes: width as u8,
                    index: LittleEndian::read_uint(raw, width) as i64,
                    handle: descriptor & HANDLE != 0,
                }
            } else {
                DecodedParameter::Number {
                    bytes: width as u8,
                    value: LittleEndian::read_int(raw, width),
                    label: flag,
                }
            };
            Ok((param, 1 + width))
        }
        other => Err(Ev3Error::protocol(format!(
            "unknown parameter size selector {}",
            other
        ))),
    }
}
