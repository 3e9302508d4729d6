//! RESP2 wire codec for the bundled transport
//!
//! Commands are framed as arrays of bulk strings; replies cover the six
//! frame kinds in [`Reply`]. Malformed framing surfaces as
//! [`TransportError::UnknownReply`] so the dispatcher can translate it into
//! the public protocol-error kind.

use crate::command::Command;
use crate::core::error::TransportError;
use crate::core::reply::Reply;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

type DecodeResult = Result<Option<Reply>, TransportError>;

/// Encode a command as a RESP array of bulk strings
pub fn encode_command(command: &Command, buf: &mut BytesMut) {
    buf.put_u8(b'*');
    buf.put_slice(command.tokens().len().to_string().as_bytes());
    buf.put_slice(CRLF);
    for token in command.tokens() {
        buf.put_u8(b'$');
        buf.put_slice(token.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        buf.put_slice(token.as_bytes());
        buf.put_slice(CRLF);
    }
}

/// Try to decode one complete reply from the buffer
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// cursor position is only meaningful on `Ok(Some(_))`.
pub fn decode(buf: &mut Cursor<&[u8]>) -> DecodeResult {
    if !buf.has_remaining() {
        return Ok(None);
    }

    match buf.chunk()[0] {
        b'+' => decode_line(buf).map(|line| line.map(Reply::Simple)),
        b'-' => decode_line(buf).map(|line| line.map(Reply::Error)),
        b':' => decode_integer(buf),
        b'$' => decode_bulk(buf),
        b'*' => decode_array(buf),
        other => Err(TransportError::UnknownReply(format!(
            "invalid reply type byte {:?}",
            other as char
        ))),
    }
}

fn decode_line(buf: &mut Cursor<&[u8]>) -> Result<Option<String>, TransportError> {
    buf.advance(1);
    match read_line(buf) {
        Some(line) => Ok(Some(String::from_utf8(line).map_err(|e| {
            TransportError::UnknownReply(format!("invalid UTF-8 in reply line: {}", e))
        })?)),
        None => Ok(None),
    }
}

fn decode_integer(buf: &mut Cursor<&[u8]>) -> DecodeResult {
    buf.advance(1);
    let line = match read_line(buf) {
        Some(line) => line,
        None => return Ok(None),
    };
    let text = std::str::from_utf8(&line)
        .map_err(|e| TransportError::UnknownReply(format!("invalid integer frame: {}", e)))?;
    let value = text
        .parse::<i64>()
        .map_err(|e| TransportError::UnknownReply(format!("invalid integer frame: {}", e)))?;
    Ok(Some(Reply::Integer(value)))
}

fn decode_bulk(buf: &mut Cursor<&[u8]>) -> DecodeResult {
    buf.advance(1);
    let len = match read_length(buf)? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len == -1 {
        return Ok(Some(Reply::Null));
    }
    let len = usize::try_from(len)
        .map_err(|_| TransportError::UnknownReply(format!("invalid bulk length {}", len)))?;
    if buf.remaining() < len + 2 {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
    buf.advance(len + 2);
    Ok(Some(Reply::Bulk(data)))
}

fn decode_array(buf: &mut Cursor<&[u8]>) -> DecodeResult {
    buf.advance(1);
    let len = match read_length(buf)? {
        Some(len) => len,
        None => return Ok(None),
    };
    if len == -1 {
        return Ok(Some(Reply::Null));
    }
    let len = usize::try_from(len)
        .map_err(|_| TransportError::UnknownReply(format!("invalid array length {}", len)))?;
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        match decode(buf)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(Reply::Array(items)))
}

fn read_length(buf: &mut Cursor<&[u8]>) -> Result<Option<i64>, TransportError> {
    let line = match read_line(buf) {
        Some(line) => line,
        None => return Ok(None),
    };
    let text = std::str::from_utf8(&line)
        .map_err(|e| TransportError::UnknownReply(format!("invalid length frame: {}", e)))?;
    let len = text
        .parse::<i64>()
        .map_err(|e| TransportError::UnknownReply(format!("invalid length frame: {}", e)))?;
    Ok(Some(len))
}

fn read_line(buf: &mut Cursor<&[u8]>) -> Option<Vec<u8>> {
    let chunk = buf.chunk();
    let end = chunk.windows(2).position(|w| w == CRLF)?;
    let line = chunk[..end].to_vec();
    buf.advance(end + 2);
    Some(line)
}
