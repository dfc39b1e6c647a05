//! RESP2 reply parser.
//!
//! Streaming parser: callers append raw socket bytes to a [`BytesMut`] and
//! call [`parse_frame`] until it yields a complete frame. The parser first
//! scans for a whole frame without consuming, then decodes and advances the
//! buffer, so a short read never leaves the buffer half-consumed.

use std::io::Cursor;

use bytes::{Buf, Bytes, BytesMut};

use super::Frame;

/// Maximum bulk string size accepted from a server (matches Redis
/// proto-max-bulk-len).
const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum number of elements in an array reply.
const MAX_ARRAY_ELEMENTS: usize = 16 * 1024 * 1024;

/// Parse error types.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    /// Not enough data to parse a complete frame.
    #[error("incomplete data")]
    Incomplete,

    /// Invalid protocol format.
    #[error("invalid protocol: {0}")]
    Invalid(String),

    /// Frame exceeds size limits.
    #[error("frame too large: {0}")]
    FrameTooLarge(String),
}

/// Parse a RESP2 frame from the buffer.
///
/// Returns `Ok(Some(frame))` if a complete frame was parsed, `Ok(None)` if
/// more data is needed, or `Err` if the data is invalid.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>, ParseError> {
    if buf.is_empty() {
        return Ok(None);
    }

    let mut cursor = Cursor::new(&buf[..]);
    match check_frame(&mut cursor) {
        Ok(len) => {
            cursor.set_position(0);
            let frame = parse_frame_internal(&mut cursor)?;
            buf.advance(len);
            Ok(Some(frame))
        }
        Err(ParseError::Incomplete) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Check whether a complete frame is available and return its byte length.
fn check_frame(cursor: &mut Cursor<&[u8]>) -> Result<usize, ParseError> {
    match peek_byte(cursor)? {
        b'+' | b'-' | b':' => {
            find_line(cursor)?;
            Ok(cursor.position() as usize)
        }
        b'$' => {
            cursor.advance(1);
            let len = read_decimal(cursor)?;
            if len == -1 {
                return Ok(cursor.position() as usize);
            }
            if len < -1 {
                return Err(ParseError::Invalid("negative bulk string length".into()));
            }
            let len = len as usize;
            if len > MAX_BULK_SIZE {
                return Err(ParseError::FrameTooLarge(format!(
                    "bulk string size {} exceeds limit {}",
                    len, MAX_BULK_SIZE
                )));
            }
            let total = cursor.position() as usize + len + 2;
            if cursor.get_ref().len() < total {
                Err(ParseError::Incomplete)
            } else {
                cursor.set_position(total as u64);
                Ok(total)
            }
        }
        b'*' => {
            cursor.advance(1);
            let count = read_decimal(cursor)?;
            if count == -1 {
                return Ok(cursor.position() as usize);
            }
            if count < -1 {
                return Err(ParseError::Invalid("negative array length".into()));
            }
            let count = count as usize;
            if count > MAX_ARRAY_ELEMENTS {
                return Err(ParseError::FrameTooLarge(format!(
                    "array element count {} exceeds limit {}",
                    count, MAX_ARRAY_ELEMENTS
                )));
            }
            for _ in 0..count {
                check_frame(cursor)?;
            }
            Ok(cursor.position() as usize)
        }
        b => Err(ParseError::Invalid(format!("unexpected byte: {:02x}", b))),
    }
}

/// Decode a frame the checker has already validated as complete.
fn parse_frame_internal(cursor: &mut Cursor<&[u8]>) -> Result<Frame, ParseError> {
    match read_byte(cursor)? {
        b'+' => Ok(Frame::Simple(read_line_bytes(cursor)?)),
        b'-' => Ok(Frame::Error(read_line_bytes(cursor)?)),
        b':' => {
            let line = read_line(cursor)?;
            let n = line
                .parse::<i64>()
                .map_err(|_| ParseError::Invalid(format!("invalid integer: {}", line)))?;
            Ok(Frame::Integer(n))
        }
        b'$' => {
            let len = read_decimal(cursor)?;
            if len == -1 {
                return Ok(Frame::Bulk(None));
            }
            let len = len as usize;
            let start = cursor.position() as usize;
            let data = Bytes::copy_from_slice(&cursor.get_ref()[start..start + len]);
            cursor.set_position((start + len) as u64);
            expect_crlf(cursor)?;
            Ok(Frame::Bulk(Some(data)))
        }
        b'*' => {
            let count = read_decimal(cursor)?;
            if count == -1 {
                return Ok(Frame::Array(None));
            }
            let count = count as usize;
            let mut frames = Vec::with_capacity(count);
            for _ in 0..count {
                frames.push(parse_frame_internal(cursor)?);
            }
            Ok(Frame::Array(Some(frames)))
        }
        b => Err(ParseError::Invalid(format!("unexpected byte: {:02x}", b))),
    }
}

fn peek_byte(cursor: &Cursor<&[u8]>) -> Result<u8, ParseError> {
    let pos = cursor.position() as usize;
    cursor
        .get_ref()
        .get(pos)
        .copied()
        .ok_or(ParseError::Incomplete)
}

fn read_byte(cursor: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    let b = peek_byte(cursor)?;
    cursor.advance(1);
    Ok(b)
}

/// Advance past the next CRLF-terminated line.
fn find_line(cursor: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let data = *cursor.get_ref();
    let start = cursor.position() as usize;
    for i in start..data.len().saturating_sub(1) {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(());
        }
    }
    Err(ParseError::Incomplete)
}

/// Read the next CRLF-terminated line as raw bytes (line body only).
fn read_line_bytes(cursor: &mut Cursor<&[u8]>) -> Result<Bytes, ParseError> {
    let data = *cursor.get_ref();
    let start = cursor.position() as usize;
    for i in start..data.len().saturating_sub(1) {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            cursor.set_position((i + 2) as u64);
            return Ok(Bytes::copy_from_slice(&data[start..i]));
        }
    }
    Err(ParseError::Incomplete)
}

/// Read the next CRLF-terminated line as UTF-8.
fn read_line(cursor: &mut Cursor<&[u8]>) -> Result<String, ParseError> {
    let bytes = read_line_bytes(cursor)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| ParseError::Invalid("invalid UTF-8 in line".into()))
}

/// Read a signed decimal length header terminated by CRLF.
fn read_decimal(cursor: &mut Cursor<&[u8]>) -> Result<i64, ParseError> {
    let line = read_line(cursor)?;
    line.parse::<i64>()
        .map_err(|_| ParseError::Invalid(format!("invalid length: {}", line)))
}

fn expect_crlf(cursor: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let data = *cursor.get_ref();
    let pos = cursor.position() as usize;
    if data.len() < pos + 2 {
        return Err(ParseError::Incomplete);
    }
    if &data[pos..pos + 2] != b"\r\n" {
        return Err(ParseError::Invalid("expected CRLF".into()));
    }
    cursor.set_position((pos + 2) as u64);
    Ok(())
}
