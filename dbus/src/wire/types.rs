//! Core types of the wire codec: signatures, values and parse results.

use std::fmt;

use super::message::Message;

/// Maximum length of a type signature in bytes.
pub const MAX_SIGNATURE_LEN: usize = 255;
/// Maximum nesting of arrays and of structs, counted separately.
pub const MAX_NESTING: usize = 32;

/// A single complete type, as described by a type signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    Variant,
    Array(Box<Type>),
    Struct(Vec<Type>),
    DictEntry(Box<Type>, Box<Type>),
}

impl Type {
    /// Parse a signature made of zero or more complete types.
    pub fn parse_signature(sig: &str) -> Result<Vec<Type>, String> {
        if sig.len() > MAX_SIGNATURE_LEN {
            return Err(format!(
                "signature of {} bytes exceeds {} bytes",
                sig.len(),
                MAX_SIGNATURE_LEN
            ));
        }
        let bytes = sig.as_bytes();
        let mut pos = 0;
        let mut types = Vec::new();
        while pos < bytes.len() {
            types.push(Self::parse_one(bytes, &mut pos, 0, 0, false)?);
        }
        Ok(types)
    }

    /// Parse a signature that must contain exactly one complete type.
    pub fn parse_single(sig: &str) -> Result<Type, String> {
        let mut types = Self::parse_signature(sig)?;
        match types.len() {
            1 => Ok(types.remove(0)),
            _ => Err(format!("'{}' is not a single complete type", sig)),
        }
    }

    fn parse_one(
        bytes: &[u8],
        pos: &mut usize,
        arrays: usize,
        structs: usize,
        in_array: bool,
    ) -> Result<Type, String> {
        let c = *bytes.get(*pos).ok_or("unexpected end of signature")?;
        *pos += 1;
        let ty = match c {
            b'y' => Type::Byte,
            b'b' => Type::Boolean,
            b'n' => Type::Int16,
            b'q' => Type::UInt16,
            b'i' => Type::Int32,
            b'u' => Type::UInt32,
            b'x' => Type::Int64,
            b't' => Type::UInt64,
            b'd' => Type::Double,
            b's' => Type::String,
            b'o' => Type::ObjectPath,
            b'g' => Type::Signature,
            b'v' => Type::Variant,
            b'a' => {
                if arrays >= MAX_NESTING {
                    return Err("array nesting too deep".into());
                }
                Type::Array(Box::new(Self::parse_one(
                    bytes,
                    pos,
                    arrays + 1,
                    structs,
                    true,
                )?))
            }
            b'(' => {
                if structs >= MAX_NESTING {
                    return Err("struct nesting too deep".into());
                }
                let mut fields = Vec::new();
                loop {
                    match bytes.get(*pos) {
                        Some(b')') => {
                            *pos += 1;
                            break;
                        }
                        Some(_) => {
                            fields.push(Self::parse_one(bytes, pos, arrays, structs + 1, false)?)
                        }
                        None => return Err("unterminated struct".into()),
                    }
                }
                if fields.is_empty() {
                    return Err("empty struct".into());
                }
                Type::Struct(fields)
            }
            b'{' => {
                if !in_array {
                    return Err("dict entry outside of an array".into());
                }
                let key = Self::parse_one(bytes, pos, arrays, structs + 1, false)?;
                if !key.is_basic() {
                    return Err(format!("dict key '{}' is not a basic type", key));
                }
                let value = Self::parse_one(bytes, pos, arrays, structs + 1, false)?;
                match bytes.get(*pos) {
                    Some(b'}') => *pos += 1,
                    _ => return Err("dict entry must have exactly two types".into()),
                }
                Type::DictEntry(Box::new(key), Box::new(value))
            }
            c => return Err(format!("invalid type code '{}'", c as char)),
        };
        Ok(ty)
    }

    pub fn is_basic(&self) -> bool {
        !matches!(
            self,
            Type::Variant | Type::Array(_) | Type::Struct(_) | Type::DictEntry(..)
        )
    }

    /// Alignment of the type on the wire, in bytes.
    pub fn alignment(&self) -> usize {
        match self {
            Type::Byte | Type::Signature | Type::Variant => 1,
            Type::Int16 | Type::UInt16 => 2,
            Type::Boolean | Type::Int32 | Type::UInt32 | Type::String | Type::ObjectPath => 4,
            Type::Array(_) => 4,
            Type::Int64 | Type::UInt64 | Type::Double => 8,
            Type::Struct(_) | Type::DictEntry(..) => 8,
        }
    }

    fn write_signature(&self, out: &mut String) {
        match self {
            Type::Byte => out.push('y'),
            Type::Boolean => out.push('b'),
            Type::Int16 => out.push('n'),
            Type::UInt16 => out.push('q'),
            Type::Int32 => out.push('i'),
            Type::UInt32 => out.push('u'),
            Type::Int64 => out.push('x'),
            Type::UInt64 => out.push('t'),
            Type::Double => out.push('d'),
            Type::String => out.push('s'),
            Type::ObjectPath => out.push('o'),
            Type::Signature => out.push('g'),
            Type::Variant => out.push('v'),
            Type::Array(t) => {
                out.push('a');
                t.write_signature(out);
            }
            Type::Struct(fields) => {
                out.push('(');
                for f in fields {
                    f.write_signature(out);
                }
                out.push(')');
            }
            Type::DictEntry(k, v) => {
                out.push('{');
                k.write_signature(out);
                v.write_signature(out);
                out.push('}');
            }
        }
    }

    pub fn signature(&self) -> String {
        let mut s = String::new();
        self.write_signature(&mut s);
        s
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// The concatenated signature of a list of values.
pub fn signature_of(values: &[Value]) -> String {
    let mut s = String::new();
    for v in values {
        v.value_type().write_signature(&mut s);
    }
    s
}

/// A typed D-Bus value.
///
/// Arrays carry their element type so that empty arrays still have a
/// signature. Dictionaries are arrays of `DictEntry` values.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    Variant(Box<Value>),
    Array(Type, Vec<Value>),
    Struct(Vec<Value>),
    DictEntry(Box<Value>, Box<Value>),
}

impl Value {
    pub fn value_type(&self) -> Type {
        match self {
            Value::Byte(_) => Type::Byte,
            Value::Boolean(_) => Type::Boolean,
            Value::Int16(_) => Type::Int16,
            Value::UInt16(_) => Type::UInt16,
            Value::Int32(_) => Type::Int32,
            Value::UInt32(_) => Type::UInt32,
            Value::Int64(_) => Type::Int64,
            Value::UInt64(_) => Type::UInt64,
            Value::Double(_) => Type::Double,
            Value::String(_) => Type::String,
            Value::ObjectPath(_) => Type::ObjectPath,
            Value::Signature(_) => Type::Signature,
            Value::Variant(_) => Type::Variant,
            Value::Array(t, _) => Type::Array(Box::new(t.clone())),
            Value::Struct(fields) => Type::Struct(fields.iter().map(Value::value_type).collect()),
            Value::DictEntry(k, v) => {
                Type::DictEntry(Box::new(k.value_type()), Box::new(v.value_type()))
            }
        }
    }

    pub fn signature(&self) -> String {
        self.value_type().signature()
    }

    /// Build an `a{kv}` dictionary from key/value pairs.
    pub fn dict(key: Type, value: Type, entries: Vec<(Value, Value)>) -> Value {
        Value::Array(
            Type::DictEntry(Box::new(key), Box::new(value)),
            entries
                .into_iter()
                .map(|(k, v)| Value::DictEntry(Box::new(k), Box::new(v)))
                .collect(),
        )
    }

    /// Borrow the text of a string, object path or signature.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            Value::UInt32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(_, items) => Some(items),
            _ => None,
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

value_from! {
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.into())
    }
}

/// Result of trying to decode one message from the front of a byte buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A complete message was decoded
    Complete {
        message: Message,
        /// Number of bytes the message occupied, padding included
        consumed: usize,
    },
    /// More data is needed to complete the message
    Incomplete {
        /// Minimum number of additional bytes needed
        needed: usize,
    },
    /// The buffer does not start with a valid message
    Invalid { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signature() {
        assert_eq!(
            Type::parse_signature("sa{sv}(ii)ay").unwrap(),
            vec![
                Type::String,
                Type::Array(Box::new(Type::DictEntry(
                    Box::new(Type::String),
                    Box::new(Type::Variant)
                ))),
                Type::Struct(vec![Type::Int32, Type::Int32]),
                Type::Array(Box::new(Type::Byte)),
            ]
        );
        assert!(Type::parse_signature("").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_signatures() {
        for sig in ["a", "(", "()", "{sv}", "a{vs}", "a{s}", "a{sss}", "z", "(i"] {
            assert!(Type::parse_signature(sig).is_err(), "'{}' should be invalid", sig);
        }
        assert!(Type::parse_signature(&format!("{}i", "a".repeat(33))).is_err());
        assert!(Type::parse_signature(&"x".repeat(256)).is_err());
        assert!(Type::parse_signature(&format!("{}i", "a".repeat(32))).is_ok());
    }

    #[test]
    fn test_parse_single() {
        assert_eq!(Type::parse_single("as").unwrap().signature(), "as");
        assert!(Type::parse_single("ss").is_err());
        assert!(Type::parse_single("").is_err());
    }

    #[test]
    fn test_value_signature() {
        let v = vec![
            Value::from("hi"),
            Value::dict(
                Type::String,
                Type::Variant,
                vec![("k".into(), Value::Variant(Box::new(Value::UInt32(1))))],
            ),
            Value::Struct(vec![Value::Boolean(true), Value::Double(1.5)]),
            Value::Array(Type::ObjectPath, vec![]),
        ];
        assert_eq!(signature_of(&v), "sa{sv}(bd)ao");
    }
}
