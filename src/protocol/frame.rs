//! RESP2 frame types.

use bytes::Bytes;

/// A single RESP2 protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: `+OK\r\n`
    Simple(Bytes),

    /// Error: `-ERR message\r\n`
    Error(Bytes),

    /// Integer: `:1000\r\n`
    Integer(i64),

    /// Bulk string: `$5\r\nhello\r\n`, or `$-1\r\n` for null
    Bulk(Option<Bytes>),

    /// Array: `*2\r\n...`, or `*-1\r\n` for null
    Array(Option<Vec<Frame>>),
}

impl Frame {
    /// Create a simple string frame.
    #[inline]
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Frame::Simple(s.into())
    }

    /// Create an error frame.
    #[inline]
    pub fn error(s: impl Into<Bytes>) -> Self {
        Frame::Error(s.into())
    }

    /// Create an integer frame.
    #[inline]
    pub fn integer(n: i64) -> Self {
        Frame::Integer(n)
    }

    /// Create a bulk string frame.
    #[inline]
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Create a null bulk string frame.
    #[inline]
    pub fn null() -> Self {
        Frame::Bulk(None)
    }

    /// Create an array frame.
    #[inline]
    pub fn array(frames: Vec<Frame>) -> Self {
        Frame::Array(Some(frames))
    }

    /// Check if this frame is a null bulk or null array.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Bulk(None) | Frame::Array(None))
    }

    /// Get the string value if this is a Simple or Bulk frame.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Frame::Simple(b) => std::str::from_utf8(b).ok(),
            Frame::Bulk(Some(b)) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get the integer value if this is an Integer frame.
    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert to owned elements if this is a non-null Array frame.
    pub fn into_array(self) -> Option<Vec<Frame>> {
        match self {
            Frame::Array(Some(arr)) => Some(arr),
            _ => None,
        }
    }

    /// Convert to owned bytes if this is a non-null Bulk frame.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Frame::Bulk(Some(b)) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Frame {
    fn from(s: &str) -> Self {
        Frame::bulk(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Frame {
    fn from(s: String) -> Self {
        Frame::bulk(s)
    }
}

impl From<i64> for Frame {
    fn from(n: i64) -> Self {
        Frame::integer(n)
    }
}

impl From<Bytes> for Frame {
    fn from(b: Bytes) -> Self {
        Frame::bulk(b)
    }
}

impl From<Vec<u8>> for Frame {
    fn from(v: Vec<u8>) -> Self {
        Frame::bulk(Bytes::from(v))
    }
}
