//! Decoded reply values

use crate::core::error::{Error, Result};
use bytes::Bytes;

/// A decoded server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string: `+OK\r\n`
    Simple(String),
    /// Error line: `-ERR message\r\n`
    Error(String),
    /// Integer: `:1000\r\n`
    Integer(i64),
    /// Bulk string: `$6\r\nfoobar\r\n`
    Bulk(Bytes),
    /// Null bulk string: `$-1\r\n`
    Null,
    /// Array: `*2\r\n...`
    Array(Vec<Reply>),
}

impl Reply {
    /// Convert to a string if possible
    pub fn as_string(&self) -> Result<String> {
        match self {
            Self::Simple(s) => Ok(s.clone()),
            Self::Bulk(b) => String::from_utf8(b.to_vec())
                .map_err(|e| Error::Type(format!("invalid UTF-8: {e}"))),
            Self::Null => Err(Error::Type("value is null".to_string())),
            other => Err(Error::Type(format!("cannot convert {other:?} to string"))),
        }
    }

    /// Convert to an integer if possible
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Self::Integer(i) => Ok(*i),
            Self::Bulk(b) => {
                let s = String::from_utf8(b.to_vec())
                    .map_err(|e| Error::Type(format!("invalid UTF-8: {e}")))?;
                s.parse::<i64>()
                    .map_err(|e| Error::Type(format!("cannot parse integer: {e}")))
            }
            other => Err(Error::Type(format!("cannot convert {other:?} to integer"))),
        }
    }

    /// Convert to raw bytes if possible
    pub fn as_bytes(&self) -> Result<Bytes> {
        match self {
            Self::Bulk(b) => Ok(b.clone()),
            Self::Simple(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Self::Null => Err(Error::Type("value is null".to_string())),
            other => Err(Error::Type(format!("cannot convert {other:?} to bytes"))),
        }
    }

    /// Convert to an array if possible
    pub fn as_array(&self) -> Result<Vec<Self>> {
        match self {
            Self::Array(items) => Ok(items.clone()),
            other => Err(Error::Type(format!("cannot convert {other:?} to array"))),
        }
    }

    /// Whether this is the null reply
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether this is an error line
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

impl From<&str> for Reply {
    fn from(s: &str) -> Self {
        Self::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Reply {
    fn from(s: String) -> Self {
        Self::Bulk(Bytes::from(s.into_bytes()))
    }
}

impl From<i64> for Reply {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}
