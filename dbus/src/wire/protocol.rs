//! Message framing: header layout, header fields and whole-message encoding.
//!
//! All functions operate on byte buffers and never perform I/O.

use super::marshal::{Decoder, Encoder, MAX_ARRAY_LEN};
use super::message::{Message, MessageFlags, MessageType};
use super::types::{ParseResult, Type, Value};
use crate::{Error, Result};

pub const PROTOCOL_VERSION: u8 = 1;
/// Maximum size of a whole message, header and body included.
pub const MAX_MESSAGE_SIZE: usize = 1 << 27;
/// Size of the fixed header, up to and including the header fields length.
pub const FIXED_HEADER_LEN: usize = 16;

const FIELD_PATH: u8 = 1;
const FIELD_INTERFACE: u8 = 2;
const FIELD_MEMBER: u8 = 3;
const FIELD_ERROR_NAME: u8 = 4;
const FIELD_REPLY_SERIAL: u8 = 5;
const FIELD_DESTINATION: u8 = 6;
const FIELD_SENDER: u8 = 7;
const FIELD_SIGNATURE: u8 = 8;
const FIELD_UNIX_FDS: u8 = 9;

fn header_fields_type() -> Type {
    Type::Struct(vec![Type::Byte, Type::Variant])
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Check that a message carries the header fields its type requires.
fn check_required_fields(msg: &Message) -> std::result::Result<(), String> {
    let missing = match msg.message_type {
        MessageType::MethodCall if msg.path.is_none() => Some("path"),
        MessageType::MethodCall if msg.member.is_none() => Some("member"),
        MessageType::MethodReturn if msg.reply_serial.is_none() => Some("reply serial"),
        MessageType::Error if msg.error_name.is_none() => Some("error name"),
        MessageType::Error if msg.reply_serial.is_none() => Some("reply serial"),
        MessageType::Signal if msg.path.is_none() => Some("path"),
        MessageType::Signal if msg.interface.is_none() => Some("interface"),
        MessageType::Signal if msg.member.is_none() => Some("member"),
        _ => None,
    };
    match missing {
        Some(field) => Err(format!("{:?} message without {}", msg.message_type, field)),
        None => Ok(()),
    }
}

/// Total length a message declares in its fixed header.
///
/// Returns `None` until [`FIXED_HEADER_LEN`] bytes are available.
pub fn message_length(buf: &[u8]) -> Option<std::result::Result<usize, String>> {
    if buf.len() < FIXED_HEADER_LEN {
        return None;
    }
    let big_endian = match buf[0] {
        b'l' => false,
        b'B' => true,
        c => return Some(Err(format!("invalid endianness marker 0x{:02x}", c))),
    };
    let read = |off: usize| {
        let b = [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];
        if big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        }
    };
    let body_len = read(4) as usize;
    let fields_len = read(12) as usize;
    if fields_len > MAX_ARRAY_LEN {
        return Some(Err(format!(
            "header fields of {} bytes are too long",
            fields_len
        )));
    }
    let total = align8(FIXED_HEADER_LEN + fields_len)
        .checked_add(body_len)
        .ok_or_else(|| format!("body of {} bytes overflows the message length", body_len));
    Some(total)
}

/// Decode one message from the front of `buf`.
///
/// # Returns
///
/// * `ParseResult::Complete` - A message and the number of bytes it occupied
/// * `ParseResult::Incomplete` - The buffer holds only a prefix of a message
/// * `ParseResult::Invalid` - The buffer does not start with a valid message
///
/// # Example
///
/// ```
/// use dbus::wire::{marshal, unmarshal, Message, ParseResult};
///
/// let mut msg = Message::method_call("org.example", "/", "org.example.Foo", "Bar");
/// msg.serial = 1;
/// let bytes = marshal(&msg).unwrap();
///
/// assert!(matches!(
///     unmarshal(&bytes[..10]),
///     ParseResult::Incomplete { .. }
/// ));
/// match unmarshal(&bytes) {
///     ParseResult::Complete { message, consumed } => {
///         assert_eq!(consumed, bytes.len());
///         assert_eq!(message, msg);
///     }
///     other => panic!("Expected complete message, got {:?}", other),
/// }
/// ```
pub fn unmarshal(buf: &[u8]) -> ParseResult {
    let total = match message_length(buf) {
        None => {
            return ParseResult::Incomplete {
                needed: FIXED_HEADER_LEN - buf.len(),
            }
        }
        Some(Err(error)) => return ParseResult::Invalid { error },
        Some(Ok(total)) => total,
    };
    if total > MAX_MESSAGE_SIZE {
        return ParseResult::Invalid {
            error: format!("message of {} bytes exceeds {} bytes", total, MAX_MESSAGE_SIZE),
        };
    }
    if buf.len() < total {
        return ParseResult::Incomplete {
            needed: total - buf.len(),
        };
    }
    match decode(&buf[..total]) {
        Ok(message) => ParseResult::Complete {
            message,
            consumed: total,
        },
        Err(error) => ParseResult::Invalid { error },
    }
}

fn decode(buf: &[u8]) -> std::result::Result<Message, String> {
    let big_endian = buf[0] == b'B';
    let mut dec = Decoder::new(buf, big_endian);
    dec.read_u8()?;
    let message_type = dec.read_u8()?;
    let message_type = MessageType::from_u8(message_type)
        .ok_or_else(|| format!("unknown message type {}", message_type))?;
    let flags = MessageFlags::from_bits_truncate(dec.read_u8()?);
    let version = dec.read_u8()?;
    if version != PROTOCOL_VERSION {
        return Err(format!("unsupported protocol version {}", version));
    }
    let body_len = dec.read_u32()? as usize;
    let serial = dec.read_u32()?;
    if serial == 0 {
        return Err("message with serial 0".into());
    }

    let mut msg = Message {
        message_type,
        flags,
        serial,
        path: None,
        interface: None,
        member: None,
        error_name: None,
        reply_serial: None,
        destination: None,
        sender: None,
        signature: String::new(),
        body: Vec::new(),
    };

    let fields = dec.read_value(&Type::Array(Box::new(header_fields_type())))?;
    for field in fields.as_array().unwrap_or_default() {
        let (code, value) = match field {
            Value::Struct(f) => match (&f[0], &f[1]) {
                (Value::Byte(code), Value::Variant(v)) => (*code, &**v),
                _ => return Err("malformed header field".into()),
            },
            _ => return Err("malformed header field".into()),
        };
        let bad = || format!("header field {} has type '{}'", code, value.signature());
        match code {
            FIELD_PATH => match value {
                Value::ObjectPath(p) => msg.path = Some(p.clone()),
                _ => return Err(bad()),
            },
            FIELD_INTERFACE | FIELD_MEMBER | FIELD_ERROR_NAME | FIELD_DESTINATION
            | FIELD_SENDER => {
                let s = match value {
                    Value::String(s) => s.clone(),
                    _ => return Err(bad()),
                };
                match code {
                    FIELD_INTERFACE => msg.interface = Some(s),
                    FIELD_MEMBER => msg.member = Some(s),
                    FIELD_ERROR_NAME => msg.error_name = Some(s),
                    FIELD_DESTINATION => msg.destination = Some(s),
                    _ => msg.sender = Some(s),
                }
            }
            FIELD_REPLY_SERIAL => match value {
                Value::UInt32(s) => msg.reply_serial = Some(*s),
                _ => return Err(bad()),
            },
            FIELD_SIGNATURE => match value {
                Value::Signature(s) => msg.signature = s.clone(),
                _ => return Err(bad()),
            },
            FIELD_UNIX_FDS => match value {
                Value::UInt32(0) => {}
                Value::UInt32(n) => return Err(format!("message carries {} unix fds", n)),
                _ => return Err(bad()),
            },
            _ => {}
        }
    }
    check_required_fields(&msg)?;
    dec.align(8)?;

    let body_start = dec.pos();
    let body = &buf[body_start..];
    if body.len() != body_len {
        return Err("body length does not match the header".into());
    }
    let mut dec = Decoder::new(body, big_endian);
    for ty in Type::parse_signature(&msg.signature)? {
        msg.body.push(dec.read_value(&ty)?);
    }
    if dec.pos() != body_len {
        return Err(format!(
            "body of {} bytes holds {} bytes of '{}'",
            body_len,
            dec.pos(),
            msg.signature
        ));
    }
    Ok(msg)
}

/// Encode a message, little endian.
///
/// The message must have a serial assigned, a body matching its signature and
/// the header fields its type requires.
pub fn marshal(msg: &Message) -> Result<Vec<u8>> {
    encode(msg).map_err(Error::Protocol)
}

fn encode(msg: &Message) -> std::result::Result<Vec<u8>, String> {
    if msg.serial == 0 {
        return Err("message has no serial".into());
    }
    check_required_fields(msg)?;
    let actual = super::types::signature_of(&msg.body);
    if actual != msg.signature {
        return Err(format!(
            "body has signature '{}' but message declares '{}'",
            actual, msg.signature
        ));
    }

    let mut body = Encoder::new();
    for v in &msg.body {
        body.put_value(v)?;
    }
    let body = body.into_inner();

    let mut fields = Vec::new();
    let mut field = |code: u8, v: Value| {
        fields.push(Value::Struct(vec![
            Value::Byte(code),
            Value::Variant(Box::new(v)),
        ]))
    };
    if let Some(p) = &msg.path {
        field(FIELD_PATH, Value::ObjectPath(p.clone()));
    }
    if let Some(s) = &msg.interface {
        field(FIELD_INTERFACE, Value::String(s.clone()));
    }
    if let Some(s) = &msg.member {
        field(FIELD_MEMBER, Value::String(s.clone()));
    }
    if let Some(s) = &msg.error_name {
        field(FIELD_ERROR_NAME, Value::String(s.clone()));
    }
    if let Some(s) = msg.reply_serial {
        field(FIELD_REPLY_SERIAL, Value::UInt32(s));
    }
    if let Some(s) = &msg.destination {
        field(FIELD_DESTINATION, Value::String(s.clone()));
    }
    if let Some(s) = &msg.sender {
        field(FIELD_SENDER, Value::String(s.clone()));
    }
    if !msg.signature.is_empty() {
        field(FIELD_SIGNATURE, Value::Signature(msg.signature.clone()));
    }

    let mut enc = Encoder::new();
    enc.put_u8(b'l');
    enc.put_u8(msg.message_type as u8);
    enc.put_u8(msg.flags.bits());
    enc.put_u8(PROTOCOL_VERSION);
    enc.put_u32(body.len() as u32);
    enc.put_u32(msg.serial);
    enc.put_value(&Value::Array(header_fields_type(), fields))?;
    enc.pad(8);

    let total = enc.len() + body.len();
    if total > MAX_MESSAGE_SIZE {
        return Err(format!(
            "message of {} bytes exceeds {} bytes",
            total, MAX_MESSAGE_SIZE
        ));
    }
    let mut out = enc.into_inner();
    out.extend_from_slice(&body);
    Ok(out.to_vec())
}
