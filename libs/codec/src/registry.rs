//! # Value Type Registry
//!
//! Entry values travel as `(type code, payload, checksum)` triples. Encoding is
//! a property of the value itself ([`WireValue`]); decoding goes through a
//! registry that maps each type code to a constructor. The registry is built
//! once at startup and owned by the session that uses it.
//!
//! ```text
//! Cacheable ──write_payload──▶ EncodedValue ──TypeRegistry::decode──▶ Cacheable
//!                 │                 │
//!            type_code()      crc32 checksum
//! ```

use bytes::{Buf, BufMut, BytesMut};
use cache_types::Cacheable;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{CodecError, Result};

/// Constructs a value from its payload bytes
pub type Constructor = fn(&[u8]) -> Result<Cacheable>;

/// Serialization capability of a value
pub trait WireValue {
    fn type_code(&self) -> u8;

    fn write_payload(&self, out: &mut BytesMut);

    fn checksum(&self) -> u32 {
        let mut buf = BytesMut::new();
        self.write_payload(&mut buf);
        crc32fast::hash(&buf)
    }
}

impl WireValue for Cacheable {
    fn type_code(&self) -> u8 {
        Cacheable::type_code(self)
    }

    fn write_payload(&self, out: &mut BytesMut) {
        match self {
            Cacheable::Bool(v) => out.put_u8(u8::from(*v)),
            Cacheable::Int32(v) => out.put_i32(*v),
            Cacheable::Int64(v) => out.put_i64(*v),
            Cacheable::Double(v) => out.put_f64(*v),
            Cacheable::String(s) => out.extend_from_slice(s.as_bytes()),
            Cacheable::Bytes(b) => out.extend_from_slice(b),
            Cacheable::StringList(items) => {
                out.put_u32(items.len() as u32);
                for item in items {
                    out.put_u32(item.len() as u32);
                    out.extend_from_slice(item.as_bytes());
                }
            }
        }
    }
}

/// Value as carried inside request and response envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedValue {
    pub type_code: u8,
    pub payload: Vec<u8>,
    pub checksum: u32,
}

impl EncodedValue {
    pub fn from_value<V: WireValue + ?Sized>(value: &V) -> Self {
        let mut buf = BytesMut::new();
        value.write_payload(&mut buf);
        let payload = buf.to_vec();
        Self {
            type_code: value.type_code(),
            checksum: crc32fast::hash(&payload),
            payload,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let calculated = crc32fast::hash(&self.payload);
        if calculated != self.checksum {
            return Err(CodecError::ChecksumMismatch {
                type_code: self.type_code,
                expected: self.checksum,
                calculated,
            });
        }
        Ok(())
    }
}

/// Type code → constructor table.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    constructors: HashMap<u8, Constructor>,
}

impl TypeRegistry {
    /// Registry without any constructors
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in value shape
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let builtins: [(u8, Constructor); 7] = [
            (Cacheable::TYPE_BOOL, construct_bool),
            (Cacheable::TYPE_INT32, construct_int32),
            (Cacheable::TYPE_INT64, construct_int64),
            (Cacheable::TYPE_DOUBLE, construct_double),
            (Cacheable::TYPE_STRING, construct_string),
            (Cacheable::TYPE_BYTES, construct_bytes),
            (Cacheable::TYPE_STRING_LIST, construct_string_list),
        ];
        for (code, constructor) in builtins {
            registry.constructors.insert(code, constructor);
        }
        registry
    }

    pub fn register(&mut self, type_code: u8, constructor: Constructor) -> Result<()> {
        if self.constructors.contains_key(&type_code) {
            return Err(CodecError::DuplicateTypeCode { type_code });
        }
        self.constructors.insert(type_code, constructor);
        Ok(())
    }

    pub fn is_registered(&self, type_code: u8) -> bool {
        self.constructors.contains_key(&type_code)
    }

    pub fn encode(&self, value: &Cacheable) -> EncodedValue {
        EncodedValue::from_value(value)
    }

    /// Verify the checksum and construct the value
    pub fn decode(&self, encoded: &EncodedValue) -> Result<Cacheable> {
        encoded.verify()?;
        let constructor = self
            .constructors
            .get(&encoded.type_code)
            .ok_or(CodecError::UnknownTypeCode {
                type_code: encoded.type_code,
            })?;
        constructor(&encoded.payload)
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn require(type_code: u8, payload: &[u8], need: usize) -> Result<()> {
    if payload.len() < need {
        return Err(CodecError::Truncated {
            type_code,
            need,
            got: payload.len(),
        });
    }
    Ok(())
}

fn construct_bool(payload: &[u8]) -> Result<Cacheable> {
    require(Cacheable::TYPE_BOOL, payload, 1)?;
    Ok(Cacheable::Bool(payload[0] != 0))
}

fn construct_int32(mut payload: &[u8]) -> Result<Cacheable> {
    require(Cacheable::TYPE_INT32, payload, 4)?;
    Ok(Cacheable::Int32(payload.get_i32()))
}

fn construct_int64(mut payload: &[u8]) -> Result<Cacheable> {
    require(Cacheable::TYPE_INT64, payload, 8)?;
    Ok(Cacheable::Int64(payload.get_i64()))
}

fn construct_double(mut payload: &[u8]) -> Result<Cacheable> {
    require(Cacheable::TYPE_DOUBLE, payload, 8)?;
    Ok(Cacheable::Double(payload.get_f64()))
}

fn construct_string(payload: &[u8]) -> Result<Cacheable> {
    String::from_utf8(payload.to_vec())
        .map(Cacheable::String)
        .map_err(|e| CodecError::invalid_payload(Cacheable::TYPE_STRING, e.to_string()))
}

fn construct_bytes(payload: &[u8]) -> Result<Cacheable> {
    Ok(Cacheable::Bytes(payload.to_vec()))
}

fn construct_string_list(mut payload: &[u8]) -> Result<Cacheable> {
    let code = Cacheable::TYPE_STRING_LIST;
    require(code, payload, 4)?;
    let count = payload.get_u32() as usize;
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        require(code, payload, 4)?;
        let len = payload.get_u32() as usize;
        require(code, payload, len)?;
        let (item, rest) = payload.split_at(len);
        let item = std::str::from_utf8(item)
            .map_err(|e| CodecError::invalid_payload(code, e.to_string()))?;
        items.push(item.to_string());
        payload = rest;
    }
    if !payload.is_empty() {
        return Err(CodecError::invalid_payload(
            code,
            format!("{} trailing bytes", payload.len()),
        ));
    }
    Ok(Cacheable::StringList(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_decode_what_they_encode() {
        let registry = TypeRegistry::with_builtins();
        let values = vec![
            Cacheable::Bool(true),
            Cacheable::Int32(-12),
            Cacheable::Int64(1 << 40),
            Cacheable::Double(2.5),
            Cacheable::String("päivää".into()),
            Cacheable::Bytes(vec![0, 1, 255]),
            Cacheable::StringList(vec!["a".into(), "".into(), "ccc".into()]),
        ];
        for value in values {
            let encoded = registry.encode(&value);
            assert_eq!(encoded.type_code, value.type_code());
            assert_eq!(registry.decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let registry = TypeRegistry::with_builtins();
        let mut encoded = registry.encode(&Cacheable::from("value"));
        encoded.payload[0] ^= 0x01;
        assert!(matches!(
            registry.decode(&encoded),
            Err(CodecError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn unknown_type_code_is_rejected() {
        let registry = TypeRegistry::empty();
        let encoded = EncodedValue::from_value(&Cacheable::Int32(1));
        assert_eq!(
            registry.decode(&encoded),
            Err(CodecError::UnknownTypeCode {
                type_code: Cacheable::TYPE_INT32
            })
        );
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = TypeRegistry::with_builtins();
        assert!(registry.register(Cacheable::TYPE_STRING, construct_string).is_err());
        assert!(registry.register(200, construct_bytes).is_ok());
        assert!(registry.is_registered(200));
    }

    #[test]
    fn truncated_payload_is_reported() {
        let registry = TypeRegistry::with_builtins();
        let payload = vec![0u8, 0];
        let encoded = EncodedValue {
            type_code: Cacheable::TYPE_INT64,
            checksum: crc32fast::hash(&payload),
            payload,
        };
        assert!(matches!(
            registry.decode(&encoded),
            Err(CodecError::Truncated { need: 8, got: 2, .. })
        ));
    }
}
