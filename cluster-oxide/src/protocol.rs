//! RESP2 wire codec
//!
//! Encodes outgoing commands as arrays of bulk strings and decodes replies.
//! Decoding is incremental: `RespDecoder::decode` returns `Ok(None)` until a
//! complete frame is buffered.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cluster_oxide_core::{
    error::{RedisError, RedisResult},
    value::RespValue,
};
use std::io::Cursor;

const CRLF: &[u8] = b"\r\n";

/// Encodes commands into RESP frames
pub struct RespEncoder;

impl RespEncoder {
    /// Append a command (`name` followed by `args`) to `buf`
    pub fn encode_command(name: &str, args: &[Bytes], buf: &mut BytesMut) {
        Self::put_header(buf, b'*', 1 + args.len());
        Self::put_bulk(buf, name.as_bytes());
        for arg in args {
            Self::put_bulk(buf, arg);
        }
    }

    /// Encode an arbitrary value; used for replies in tests and simulators
    pub fn encode(value: &RespValue, buf: &mut BytesMut) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Error(e) => {
                buf.put_u8(b'-');
                buf.put_slice(e.as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::Integer(i) => {
                buf.put_u8(b':');
                buf.put_slice(i.to_string().as_bytes());
                buf.put_slice(CRLF);
            }
            RespValue::BulkString(data) => Self::put_bulk(buf, data),
            RespValue::Null => buf.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                Self::put_header(buf, b'*', items.len());
                for item in items {
                    Self::encode(item, buf);
                }
            }
        }
    }

    fn put_header(buf: &mut BytesMut, kind: u8, len: usize) {
        buf.put_u8(kind);
        buf.put_slice(len.to_string().as_bytes());
        buf.put_slice(CRLF);
    }

    fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
        Self::put_header(buf, b'$', data.len());
        buf.put_slice(data);
        buf.put_slice(CRLF);
    }
}

/// Decodes RESP values from bytes
pub struct RespDecoder;

impl RespDecoder {
    /// Decode one value, or `None` if the buffer holds an incomplete frame
    pub fn decode(buf: &mut Cursor<&[u8]>) -> RedisResult<Option<RespValue>> {
        if !buf.has_remaining() {
            return Ok(None);
        }

        let type_byte = buf.chunk()[0];
        buf.advance(1);

        let Some(line) = Self::read_line(buf) else {
            return Ok(None);
        };

        match type_byte {
            b'+' => Ok(Some(RespValue::SimpleString(Self::utf8(line)?))),
            b'-' => Ok(Some(RespValue::Error(Self::utf8(line)?))),
            b':' => Ok(Some(RespValue::Integer(Self::number(line)?))),
            b'$' => {
                let len = Self::number(line)?;
                if len < 0 {
                    return Ok(Some(RespValue::Null));
                }
                let len = Self::length(len)?;
                let framed = len
                    .checked_add(2)
                    .ok_or_else(|| RedisError::Protocol(format!("Bulk length {len} too large")))?;
                if buf.remaining() < framed {
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
                buf.advance(framed);
                Ok(Some(RespValue::BulkString(data)))
            }
            b'*' => {
                let len = Self::number(line)?;
                if len < 0 {
                    return Ok(Some(RespValue::Null));
                }
                let len = Self::length(len)?;
                // Every element takes at least 3 bytes ("+\r\n")
                let mut items = Vec::with_capacity(len.min(buf.remaining() / 3));
                for _ in 0..len {
                    match Self::decode(buf)? {
                        Some(value) => items.push(value),
                        None => return Ok(None),
                    }
                }
                Ok(Some(RespValue::Array(items)))
            }
            other => Err(RedisError::Protocol(format!(
                "Invalid RESP type byte: {}",
                other as char
            ))),
        }
    }

    fn read_line<'a>(buf: &mut Cursor<&'a [u8]>) -> Option<&'a [u8]> {
        let start = buf.position() as usize;
        let data: &'a [u8] = *buf.get_ref();
        let offset = data[start..].windows(2).position(|w| w == CRLF)?;
        buf.set_position((start + offset + 2) as u64);
        Some(&data[start..start + offset])
    }

    fn utf8(line: &[u8]) -> RedisResult<String> {
        String::from_utf8(line.to_vec())
            .map_err(|e| RedisError::Protocol(format!("Invalid UTF-8: {e}")))
    }

    fn length(len: i64) -> RedisResult<usize> {
        usize::try_from(len).map_err(|_| RedisError::Protocol(format!("Invalid length: {len}")))
    }

    fn number(line: &[u8]) -> RedisResult<i64> {
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| {
                RedisError::Protocol(format!(
                    "Invalid number: {}",
                    String::from_utf8_lossy(line)
                ))
            })
    }
}
