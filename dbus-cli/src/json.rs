//! Conversion between JSON and D-Bus values.

use anyhow::{anyhow, bail, Context, Result};
use dbus::{Type, Value};
use serde_json::{Map, Value as Json};

/// Convert the JSON `args` of a call to values matching `signature`.
///
/// `args` is a JSON array with one element per input argument. A value
/// that is not an array is taken as the only argument.
pub fn to_args(signature: &str, args: Option<&str>) -> Result<Vec<Value>> {
    let types = Type::parse_signature(signature)
        .map_err(|e| anyhow!("Invalid input signature '{}': {}", signature, e))?;

    let json = match args {
        Some(args) => serde_json::from_str(args)
            .with_context(|| format!("Failed to parse JSON for '{}'", args))?,
        None => Json::Null,
    };

    let items = match json {
        Json::Null => Vec::new(),
        Json::Array(items) => items,
        other => vec![other],
    };

    if items.len() != types.len() {
        bail!(
            "Method expects {} arguments of signature '{}', got {}",
            types.len(),
            signature,
            items.len()
        );
    }

    types
        .iter()
        .zip(items.iter())
        .enumerate()
        .map(|(i, (ty, json))| to_value(ty, json).with_context(|| format!("Argument {}", i + 1)))
        .collect()
}

fn mismatch(ty: &Type, json: &Json) -> anyhow::Error {
    anyhow!("Cannot convert '{}' to type '{}'", json, ty)
}

fn int<T: TryFrom<i64>>(ty: &Type, json: &Json) -> Result<T> {
    json.as_i64()
        .and_then(|n| T::try_from(n).ok())
        .ok_or_else(|| mismatch(ty, json))
}

fn text(ty: &Type, json: &Json) -> Result<String> {
    json.as_str()
        .map(String::from)
        .ok_or_else(|| mismatch(ty, json))
}

/// Convert `json` to a value of type `ty`.
pub fn to_value(ty: &Type, json: &Json) -> Result<Value> {
    Ok(match ty {
        Type::Byte => Value::Byte(int(ty, json)?),
        Type::Boolean => Value::Boolean(json.as_bool().ok_or_else(|| mismatch(ty, json))?),
        Type::Int16 => Value::Int16(int(ty, json)?),
        Type::UInt16 => Value::UInt16(int(ty, json)?),
        Type::Int32 => Value::Int32(int(ty, json)?),
        Type::UInt32 => Value::UInt32(int(ty, json)?),
        Type::Int64 => Value::Int64(int(ty, json)?),
        Type::UInt64 => Value::UInt64(json.as_u64().ok_or_else(|| mismatch(ty, json))?),
        Type::Double => Value::Double(json.as_f64().ok_or_else(|| mismatch(ty, json))?),
        Type::String => Value::String(text(ty, json)?),
        Type::ObjectPath => Value::ObjectPath(text(ty, json)?),
        Type::Signature => Value::Signature(text(ty, json)?),
        Type::Variant => Value::Variant(Box::new(infer(json)?)),
        Type::Array(elem) => match (&**elem, json) {
            (Type::DictEntry(k, v), Json::Object(map)) => {
                let mut entries = Vec::with_capacity(map.len());
                for (key, value) in map {
                    entries.push((dict_key(k, key)?, to_value(v, value)?));
                }
                Value::dict((**k).clone(), (**v).clone(), entries)
            }
            (Type::DictEntry(..), _) => return Err(mismatch(ty, json)),
            (elem, Json::Array(items)) => Value::Array(
                elem.clone(),
                items
                    .iter()
                    .map(|item| to_value(elem, item))
                    .collect::<Result<_>>()?,
            ),
            _ => return Err(mismatch(ty, json)),
        },
        Type::Struct(fields) => match json {
            Json::Array(items) if items.len() == fields.len() => Value::Struct(
                fields
                    .iter()
                    .zip(items)
                    .map(|(t, j)| to_value(t, j))
                    .collect::<Result<_>>()?,
            ),
            _ => return Err(mismatch(ty, json)),
        },
        Type::DictEntry(..) => bail!("A dict entry can only appear inside an array"),
    })
}

/// JSON object keys are strings; other key types are parsed from them.
fn dict_key(ty: &Type, key: &str) -> Result<Value> {
    match ty {
        Type::String | Type::ObjectPath | Type::Signature => {
            to_value(ty, &Json::String(key.into()))
        }
        _ => {
            let json: Json = serde_json::from_str(key)
                .map_err(|_| anyhow!("Cannot convert key '{}' to type '{}'", key, ty))?;
            to_value(ty, &json)
        }
    }
}

/// The value a variant holds when the JSON does not name a type.
fn infer(json: &Json) -> Result<Value> {
    Ok(match json {
        Json::Null => bail!("null cannot be sent as a variant"),
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match (n.as_i64(), n.as_u64(), n.as_f64()) {
            (Some(i), _, _) => Value::Int64(i),
            (None, Some(u), _) => Value::UInt64(u),
            (None, None, Some(f)) => Value::Double(f),
            _ => return Err(anyhow!("Cannot convert number '{}'", n)),
        },
        Json::String(s) => Value::String(s.clone()),
        Json::Array(items) => Value::Array(
            Type::Variant,
            items
                .iter()
                .map(|item| Ok(Value::Variant(Box::new(infer(item)?))))
                .collect::<Result<_>>()?,
        ),
        Json::Object(map) => Value::dict(
            Type::String,
            Type::Variant,
            map.iter()
                .map(|(k, v)| Ok((Value::from(k.as_str()), Value::Variant(Box::new(infer(v)?)))))
                .collect::<Result<_>>()?,
        ),
    })
}

/// Convert a D-Bus value to JSON. Dictionaries become objects.
pub fn from_value(value: &Value) -> Json {
    match value {
        Value::Byte(v) => Json::from(*v),
        Value::Boolean(v) => Json::from(*v),
        Value::Int16(v) => Json::from(*v),
        Value::UInt16(v) => Json::from(*v),
        Value::Int32(v) => Json::from(*v),
        Value::UInt32(v) => Json::from(*v),
        Value::Int64(v) => Json::from(*v),
        Value::UInt64(v) => Json::from(*v),
        Value::Double(v) => serde_json::Number::from_f64(*v)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Json::from(s.as_str()),
        Value::Variant(inner) => from_value(inner),
        Value::Array(Type::DictEntry(..), entries) => {
            let mut map = Map::new();
            for entry in entries {
                if let Value::DictEntry(k, v) = entry {
                    map.insert(key_string(k), from_value(v));
                }
            }
            Json::Object(map)
        }
        Value::Array(_, items) | Value::Struct(items) => {
            Json::Array(items.iter().map(from_value).collect())
        }
        Value::DictEntry(k, v) => Json::Array(vec![from_value(k), from_value(v)]),
    }
}

fn key_string(key: &Value) -> String {
    match key.as_str() {
        Some(s) => s.into(),
        None => from_value(key).to_string(),
    }
}

/// The JSON form of a reply body: `{}`, the single value, or an array.
pub fn from_body(body: &[Value]) -> Json {
    match body {
        [] => Json::Object(Map::new()),
        [single] => from_value(single),
        many => Json::Array(many.iter().map(from_value).collect()),
    }
}
