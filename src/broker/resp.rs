//! RESP (REdis Serialization Protocol) frames.
//!
//! Only the subset needed by the benchmark and the mock broker is supported:
//! simple strings, errors, integers, bulk strings (including null) and arrays.
//! Decoding is incremental: a partial frame leaves the buffer untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{BenchError, Result};

/// Upper bound for speculative array pre-allocation
const MAX_PREALLOC: usize = 64;

/// Limits on what a peer may ask us to buffer
const MAX_DEPTH: usize = 32;
const MAX_ARRAY_LEN: i64 = 1024 * 1024;
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;
const MAX_LINE_LEN: usize = 64 * 1024;

/// A single decoded RESP value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Build a bulk string frame
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Frame::Bulk(data.into())
    }

    /// Raw bytes of a string-like frame
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Frame::Simple(s) => Some(s.as_bytes()),
            Frame::Bulk(b) => Some(b),
            _ => None,
        }
    }

    /// Serialize the frame onto `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Integer(n) => {
                dst.put_u8(b':');
                dst.put_slice(n.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            Frame::Bulk(data) => put_bulk(dst, data),
            Frame::Null => dst.put_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                put_header(dst, b'*', items.len());
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }
}

/// Encode a command as an array of bulk strings
pub fn encode_command(args: &[&[u8]], dst: &mut BytesMut) {
    put_header(dst, b'*', args.len());
    for arg in args {
        put_bulk(dst, arg);
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; on success exactly the
/// bytes of the returned frame are consumed.
pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    match parse_at(&buf[..], 0, 0)? {
        Some((frame, consumed)) => {
            buf.advance(consumed);
            Ok(Some(frame))
        }
        None => Ok(None),
    }
}

/// Read the next frame from `reader`, buffering into `buf`.
///
/// Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<Option<Frame>> {
    loop {
        if let Some(frame) = parse_frame(buf)? {
            return Ok(Some(frame));
        }

        if reader.read_buf(buf).await? == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(BenchError::Protocol(
                "connection closed in the middle of a frame".to_string(),
            ));
        }
    }
}

fn put_header(dst: &mut BytesMut, kind: u8, len: usize) {
    dst.put_u8(kind);
    dst.put_slice(len.to_string().as_bytes());
    dst.put_slice(b"\r\n");
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    put_header(dst, b'$', data.len());
    dst.put_slice(data);
    dst.put_slice(b"\r\n");
}

fn parse_at(src: &[u8], pos: usize, depth: usize) -> Result<Option<(Frame, usize)>> {
    let Some(&kind) = src.get(pos) else {
        return Ok(None);
    };
    let Some((line, next)) = read_line(src, pos + 1) else {
        if src.len() - pos > MAX_LINE_LEN {
            return Err(BenchError::Protocol(format!(
                "line exceeds {} bytes without a terminator",
                MAX_LINE_LEN
            )));
        }
        return Ok(None);
    };

    match kind {
        b'+' => Ok(Some((
            Frame::Simple(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b'-' => Ok(Some((
            Frame::Error(String::from_utf8_lossy(line).into_owned()),
            next,
        ))),
        b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
        b'$' => {
            let len = parse_int(line)?;
            if len < 0 {
                return Ok(Some((Frame::Null, next)));
            }
            if len > MAX_BULK_LEN {
                return Err(BenchError::Protocol(format!(
                    "bulk length {} exceeds {}",
                    len, MAX_BULK_LEN
                )));
            }
            let end = next + len as usize;
            if src.len() < end + 2 {
                return Ok(None);
            }
            if &src[end..end + 2] != b"\r\n" {
                return Err(BenchError::Protocol(
                    "bulk string is missing its terminator".to_string(),
                ));
            }
            Ok(Some((
                Frame::Bulk(Bytes::copy_from_slice(&src[next..end])),
                end + 2,
            )))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count < 0 {
                return Ok(Some((Frame::Null, next)));
            }
            if count > MAX_ARRAY_LEN {
                return Err(BenchError::Protocol(format!(
                    "array length {} exceeds {}",
                    count, MAX_ARRAY_LEN
                )));
            }
            if depth >= MAX_DEPTH {
                return Err(BenchError::Protocol(format!(
                    "arrays nested deeper than {}",
                    MAX_DEPTH
                )));
            }
            let mut items = Vec::with_capacity((count as usize).min(MAX_PREALLOC));
            let mut cursor = next;
            for _ in 0..count {
                match parse_at(src, cursor, depth + 1)? {
                    Some((item, after)) => {
                        items.push(item);
                        cursor = after;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Frame::Array(items), cursor)))
        }
        other => Err(BenchError::Protocol(format!(
            "invalid frame type byte {:#04x}",
            other
        ))),
    }
}

fn read_line(src: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    src[pos..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (&src[pos..pos + i], pos + i + 2))
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            BenchError::Protocol(format!(
                "invalid integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}
