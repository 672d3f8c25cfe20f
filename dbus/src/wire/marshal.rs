//! Value level encoding and decoding.
//!
//! Both directions compute alignment relative to the start of their buffer,
//! so a body encoded on its own lines up with the message as long as the
//! header ends on an 8 byte boundary.

use bytes::{BufMut, BytesMut};

use super::types::{Type, Value, MAX_SIGNATURE_LEN};

/// Maximum encoded length of a single array, in bytes.
pub const MAX_ARRAY_LEN: usize = 1 << 26;

// Variants may nest without appearing in any signature.
const MAX_DEPTH: usize = 64;

pub(crate) fn is_valid_object_path(path: &str) -> bool {
    if path == "/" {
        return true;
    }
    match path.strip_prefix('/') {
        Some(rest) => rest.split('/').all(|seg| {
            !seg.is_empty()
                && seg
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }),
        None => false,
    }
}

/// Little endian encoder.
pub(crate) struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Encoder {
            buf: BytesMut::with_capacity(256),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    pub(crate) fn pad(&mut self, align: usize) {
        while self.buf.len() % align != 0 {
            self.buf.put_u8(0);
        }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.pad(4);
        self.buf.put_u32_le(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.pad(2);
        self.buf.put_u16_le(v);
    }

    fn put_u64(&mut self, v: u64) {
        self.pad(8);
        self.buf.put_u64_le(v);
    }

    fn put_string(&mut self, s: &str) -> Result<(), String> {
        if s.contains('\0') {
            return Err("string contains a NUL byte".into());
        }
        self.put_u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    fn put_signature(&mut self, s: &str) -> Result<(), String> {
        if s.len() > MAX_SIGNATURE_LEN {
            return Err(format!("signature '{}' is too long", s));
        }
        Type::parse_signature(s)?;
        self.buf.put_u8(s.len() as u8);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
        Ok(())
    }

    pub(crate) fn put_value(&mut self, value: &Value) -> Result<(), String> {
        self.put_value_at(value, 0)
    }

    fn put_value_at(&mut self, value: &Value, depth: usize) -> Result<(), String> {
        if depth > MAX_DEPTH {
            return Err("value nesting too deep".into());
        }
        match value {
            Value::Byte(v) => self.put_u8(*v),
            Value::Boolean(v) => self.put_u32(u32::from(*v)),
            Value::Int16(v) => self.put_u16(*v as u16),
            Value::UInt16(v) => self.put_u16(*v),
            Value::Int32(v) => self.put_u32(*v as u32),
            Value::UInt32(v) => self.put_u32(*v),
            Value::Int64(v) => self.put_u64(*v as u64),
            Value::UInt64(v) => self.put_u64(*v),
            Value::Double(v) => self.put_u64(v.to_bits()),
            Value::String(s) => self.put_string(s)?,
            Value::ObjectPath(p) => {
                if !is_valid_object_path(p) {
                    return Err(format!("invalid object path '{}'", p));
                }
                self.put_string(p)?
            }
            Value::Signature(s) => self.put_signature(s)?,
            Value::Variant(inner) => {
                let sig = inner.signature();
                Type::parse_single(&sig)?;
                self.put_signature(&sig)?;
                self.put_value_at(inner, depth + 1)?;
            }
            Value::Array(elem, items) => {
                self.put_u32(0);
                let len_pos = self.buf.len() - 4;
                self.pad(elem.alignment());
                let start = self.buf.len();
                for item in items {
                    if item.value_type() != *elem {
                        return Err(format!(
                            "array element of type '{}' in array of '{}'",
                            item.signature(),
                            elem
                        ));
                    }
                    self.put_value_at(item, depth + 1)?;
                }
                let len = self.buf.len() - start;
                if len > MAX_ARRAY_LEN {
                    return Err(format!("array of {} bytes is too long", len));
                }
                self.buf[len_pos..len_pos + 4].copy_from_slice(&(len as u32).to_le_bytes());
            }
            Value::Struct(fields) => {
                if fields.is_empty() {
                    return Err("empty struct".into());
                }
                self.pad(8);
                for f in fields {
                    self.put_value_at(f, depth + 1)?;
                }
            }
            Value::DictEntry(k, v) => {
                if !k.value_type().is_basic() {
                    return Err(format!("dict key '{}' is not a basic type", k.signature()));
                }
                self.pad(8);
                self.put_value_at(k, depth + 1)?;
                self.put_value_at(v, depth + 1)?;
            }
        }
        Ok(())
    }

    pub(crate) fn into_inner(self) -> BytesMut {
        self.buf
    }
}

pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8], big_endian: bool) -> Self {
        Decoder {
            buf,
            pos: 0,
            big_endian,
        }
    }

    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn align(&mut self, align: usize) -> Result<(), String> {
        let padded = (self.pos + align - 1) / align * align;
        let padding = self.take(padded - self.pos)?;
        if padding.iter().any(|&b| b != 0) {
            return Err("non-zero padding".into());
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or("unexpected end of data")?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, String> {
        self.align(2)?;
        let b: [u8; 2] = self.take(2)?.try_into().map_err(|_| "short read")?;
        Ok(if self.big_endian {
            u16::from_be_bytes(b)
        } else {
            u16::from_le_bytes(b)
        })
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, String> {
        self.align(4)?;
        let b: [u8; 4] = self.take(4)?.try_into().map_err(|_| "short read")?;
        Ok(if self.big_endian {
            u32::from_be_bytes(b)
        } else {
            u32::from_le_bytes(b)
        })
    }

    fn read_u64(&mut self) -> Result<u64, String> {
        self.align(8)?;
        let b: [u8; 8] = self.take(8)?.try_into().map_err(|_| "short read")?;
        Ok(if self.big_endian {
            u64::from_be_bytes(b)
        } else {
            u64::from_le_bytes(b)
        })
    }

    fn read_str(&mut self, len: usize) -> Result<String, String> {
        let bytes = self.take(len)?;
        if self.read_u8()? != 0 {
            return Err("string is not NUL terminated".into());
        }
        if bytes.contains(&0) {
            return Err("string contains a NUL byte".into());
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| "string is not valid UTF-8".to_string())
    }

    fn read_string(&mut self) -> Result<String, String> {
        let len = self.read_u32()? as usize;
        self.read_str(len)
    }

    pub(crate) fn read_signature(&mut self) -> Result<String, String> {
        let len = self.read_u8()? as usize;
        let sig = self.read_str(len)?;
        Type::parse_signature(&sig)?;
        Ok(sig)
    }

    pub(crate) fn read_value(&mut self, ty: &Type) -> Result<Value, String> {
        self.read_value_at(ty, 0)
    }

    fn read_value_at(&mut self, ty: &Type, depth: usize) -> Result<Value, String> {
        if depth > MAX_DEPTH {
            return Err("value nesting too deep".into());
        }
        let v = match ty {
            Type::Byte => Value::Byte(self.read_u8()?),
            Type::Boolean => match self.read_u32()? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                v => return Err(format!("invalid boolean value {}", v)),
            },
            Type::Int16 => Value::Int16(self.read_u16()? as i16),
            Type::UInt16 => Value::UInt16(self.read_u16()?),
            Type::Int32 => Value::Int32(self.read_u32()? as i32),
            Type::UInt32 => Value::UInt32(self.read_u32()?),
            Type::Int64 => Value::Int64(self.read_u64()? as i64),
            Type::UInt64 => Value::UInt64(self.read_u64()?),
            Type::Double => Value::Double(f64::from_bits(self.read_u64()?)),
            Type::String => Value::String(self.read_string()?),
            Type::ObjectPath => {
                let p = self.read_string()?;
                if !is_valid_object_path(&p) {
                    return Err(format!("invalid object path '{}'", p));
                }
                Value::ObjectPath(p)
            }
            Type::Signature => Value::Signature(self.read_signature()?),
            Type::Variant => {
                let sig = self.read_signature()?;
                let inner = Type::parse_single(&sig)?;
                Value::Variant(Box::new(self.read_value_at(&inner, depth + 1)?))
            }
            Type::Array(elem) => {
                let len = self.read_u32()? as usize;
                if len > MAX_ARRAY_LEN {
                    return Err(format!("array of {} bytes is too long", len));
                }
                self.align(elem.alignment())?;
                let end = self.pos + len;
                if end > self.buf.len() {
                    return Err("unexpected end of data".into());
                }
                let mut items = Vec::new();
                while self.pos < end {
                    items.push(self.read_value_at(elem, depth + 1)?);
                }
                if self.pos != end {
                    return Err("array elements overrun the array length".into());
                }
                Value::Array((**elem).clone(), items)
            }
            Type::Struct(fields) => {
                self.align(8)?;
                let mut values = Vec::with_capacity(fields.len());
                for f in fields {
                    values.push(self.read_value_at(f, depth + 1)?);
                }
                Value::Struct(values)
            }
            Type::DictEntry(k, v) => {
                self.align(8)?;
                let key = self.read_value_at(k, depth + 1)?;
                let value = self.read_value_at(v, depth + 1)?;
                Value::DictEntry(Box::new(key), Box::new(value))
            }
        };
        Ok(v)
    }
}
