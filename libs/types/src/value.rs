//! Entry values
//!
//! The set of value shapes a region can hold is closed. Each variant carries a
//! stable type code; the codec crate maps codes to constructors when decoding.

use serde::{Deserialize, Serialize};

/// Value stored in a region entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cacheable {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    StringList(Vec<String>),
}

impl Cacheable {
    pub const TYPE_BOOL: u8 = 1;
    pub const TYPE_INT32: u8 = 2;
    pub const TYPE_INT64: u8 = 3;
    pub const TYPE_DOUBLE: u8 = 4;
    pub const TYPE_STRING: u8 = 5;
    pub const TYPE_BYTES: u8 = 6;
    pub const TYPE_STRING_LIST: u8 = 7;

    pub fn type_code(&self) -> u8 {
        match self {
            Cacheable::Bool(_) => Self::TYPE_BOOL,
            Cacheable::Int32(_) => Self::TYPE_INT32,
            Cacheable::Int64(_) => Self::TYPE_INT64,
            Cacheable::Double(_) => Self::TYPE_DOUBLE,
            Cacheable::String(_) => Self::TYPE_STRING,
            Cacheable::Bytes(_) => Self::TYPE_BYTES,
            Cacheable::StringList(_) => Self::TYPE_STRING_LIST,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Cacheable::Bool(_) => "bool",
            Cacheable::Int32(_) => "int32",
            Cacheable::Int64(_) => "int64",
            Cacheable::Double(_) => "double",
            Cacheable::String(_) => "string",
            Cacheable::Bytes(_) => "bytes",
            Cacheable::StringList(_) => "string_list",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cacheable::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Cacheable::Int32(v) => Some(*v as i64),
            Cacheable::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for Cacheable {
    fn from(value: &str) -> Self {
        Cacheable::String(value.to_string())
    }
}

impl From<String> for Cacheable {
    fn from(value: String) -> Self {
        Cacheable::String(value)
    }
}

impl From<i32> for Cacheable {
    fn from(value: i32) -> Self {
        Cacheable::Int32(value)
    }
}

impl From<i64> for Cacheable {
    fn from(value: i64) -> Self {
        Cacheable::Int64(value)
    }
}

impl From<f64> for Cacheable {
    fn from(value: f64) -> Self {
        Cacheable::Double(value)
    }
}

impl From<bool> for Cacheable {
    fn from(value: bool) -> Self {
        Cacheable::Bool(value)
    }
}

impl From<Vec<u8>> for Cacheable {
    fn from(value: Vec<u8>) -> Self {
        Cacheable::Bytes(value)
    }
}

impl From<Vec<String>> for Cacheable {
    fn from(value: Vec<String>) -> Self {
        Cacheable::StringList(value)
    }
}
