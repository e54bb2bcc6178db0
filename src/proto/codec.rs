//! Streaming RESP2 codec.
//!
//! [`decode`] never consumes a partial frame: it parses against a cursor
//! and only advances the buffer once a whole frame is available.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

/// Largest bulk string or array we are willing to allocate for.
const MAX_LENGTH: i64 = 512 * 1024 * 1024;

/// Appends the RESP encoding of `frame` to `buf`.
pub fn encode(frame: &Frame, buf: &mut BytesMut) {
    match frame {
        Frame::SimpleString(s) => put_line(buf, b'+', s),
        Frame::Error(e) => put_line(buf, b'-', e),
        Frame::Integer(n) => put_line(buf, b':', n.to_string().as_bytes()),
        Frame::BulkString(Some(data)) => {
            put_line(buf, b'$', data.len().to_string().as_bytes());
            buf.extend_from_slice(data);
            buf.extend_from_slice(b"\r\n");
        }
        Frame::BulkString(None) | Frame::Null => buf.extend_from_slice(b"$-1\r\n"),
        Frame::Array(items) => {
            put_line(buf, b'*', items.len().to_string().as_bytes());
            for item in items {
                encode(item, buf);
            }
        }
    }
}

fn put_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.put_u8(prefix);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

/// Decodes one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; the buffer is left
/// untouched in that case.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for malformed input.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
    let mut cursor = Cursor { data: &buf[..], pos: 0 };
    match cursor.frame()? {
        Some(frame) => {
            let consumed = cursor.pos;
            buf.advance(consumed);
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn frame(&mut self) -> Result<Option<Frame>> {
        let Some(&tag) = self.data.get(self.pos) else {
            return Ok(None);
        };
        self.pos += 1;
        let Some(line) = self.line() else {
            return Ok(None);
        };

        let frame = match tag {
            b'+' => Frame::SimpleString(line.to_vec()),
            b'-' => Frame::Error(line.to_vec()),
            b':' => Frame::Integer(parse_int(line)?),
            b'$' => {
                let len = parse_length(line)?;
                if len < 0 {
                    return Ok(Some(Frame::BulkString(None)));
                }
                let len = len as usize;
                if self.data.len() < self.pos + len + 2 {
                    return Ok(None);
                }
                let body = Bytes::copy_from_slice(&self.data[self.pos..self.pos + len]);
                if &self.data[self.pos + len..self.pos + len + 2] != b"\r\n" {
                    return Err(protocol("bulk string is not terminated by CRLF"));
                }
                self.pos += len + 2;
                Frame::BulkString(Some(body))
            }
            b'*' => {
                let len = parse_length(line)?;
                if len < 0 {
                    return Ok(Some(Frame::Null));
                }
                let mut items = Vec::with_capacity(len.min(1024) as usize);
                for _ in 0..len {
                    match self.frame()? {
                        Some(item) => items.push(item),
                        None => return Ok(None),
                    }
                }
                Frame::Array(items)
            }
            other => {
                return Err(protocol(&format!("unknown frame type byte {:?}", other as char)));
            }
        };
        Ok(Some(frame))
    }

    fn line(&mut self) -> Option<&'a [u8]> {
        let data = self.data;
        let rest = &data[self.pos..];
        let end = rest.windows(2).position(|w| w == b"\r\n")?;
        let line = &rest[..end];
        self.pos += end + 2;
        Some(line)
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| protocol("invalid integer"))
}

fn parse_length(line: &[u8]) -> Result<i64> {
    let len = parse_int(line)?;
    if len > MAX_LENGTH {
        return Err(protocol("frame length exceeds limit"));
    }
    Ok(len)
}

fn protocol(message: &str) -> Error {
    Error::Protocol {
        message: message.to_string(),
    }
}
