//! RESP (REdis Serialization Protocol) codec.
//!
//! Streaming decoder over a `BytesMut` plus an encoder for outgoing
//! commands.  Commands always travel as arrays of bulk strings: booleans
//! become the strings `true`/`false`, integers base-10 bulk strings, and
//! nulls `$-1`.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::RedisError;

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// One RESP element.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// `+OK`
    Simple(String),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$n` bulk bytes
    Bulk(Bytes),
    /// `$-1` / `*-1`
    Null,
    /// `*n`
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespValue::Bulk(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RespValue::Simple(s) | RespValue::Error(s) => Some(s),
            RespValue::Bulk(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// Serialize a full value (used for relaying replies across processes).
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            RespValue::Simple(s) => {
                dst.put_u8(b'+');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                dst.put_u8(b'-');
                dst.put_slice(s.as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Integer(i) => {
                dst.put_u8(b':');
                dst.put_slice(i.to_string().as_bytes());
                dst.put_slice(b"\r\n");
            }
            RespValue::Bulk(bytes) => {
                dst.put_u8(b'$');
                dst.put_slice(bytes.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                dst.put_slice(bytes);
                dst.put_slice(b"\r\n");
            }
            RespValue::Null => dst.put_slice(b"$-1\r\n"),
            RespValue::Array(items) => {
                dst.put_u8(b'*');
                dst.put_slice(items.len().to_string().as_bytes());
                dst.put_slice(b"\r\n");
                for item in items {
                    item.encode(dst);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// Command arguments
// ---------------------------------------------------------------------------

/// An argument in an outgoing command array.
#[derive(Debug, Clone)]
pub enum RespArg {
    Str(Bytes),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<&str> for RespArg {
    fn from(s: &str) -> Self {
        RespArg::Str(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for RespArg {
    fn from(bytes: Bytes) -> Self {
        RespArg::Str(bytes)
    }
}

/// Encode a command as an array of bulk strings.
pub fn encode_command(args: &[RespArg]) -> Bytes {
    let mut dst = BytesMut::new();
    dst.put_u8(b'*');
    dst.put_slice(args.len().to_string().as_bytes());
    dst.put_slice(b"\r\n");
    for arg in args {
        match arg {
            RespArg::Str(bytes) => put_bulk(&mut dst, bytes),
            RespArg::Int(i) => put_bulk(&mut dst, i.to_string().as_bytes()),
            RespArg::Float(f) => put_bulk(&mut dst, f.to_string().as_bytes()),
            RespArg::Bool(true) => put_bulk(&mut dst, b"true"),
            RespArg::Bool(false) => put_bulk(&mut dst, b"false"),
            RespArg::Null => dst.put_slice(b"$-1\r\n"),
        }
    }
    dst.freeze()
}

fn put_bulk(dst: &mut BytesMut, payload: &[u8]) {
    dst.put_u8(b'$');
    dst.put_slice(payload.len().to_string().as_bytes());
    dst.put_slice(b"\r\n");
    dst.put_slice(payload);
    dst.put_slice(b"\r\n");
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

pub struct RespCodec;

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RespValue>, io::Error> {
        match parse_value(src, 0) {
            Ok(Some((value, consumed))) => {
                src.advance(consumed);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(io::Error::new(io::ErrorKind::InvalidData, err)),
        }
    }
}

impl Encoder<Bytes> for RespCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), io::Error> {
        dst.put_slice(&item);
        Ok(())
    }
}

/// Parse one value starting at `pos`.  `Ok(None)` means incomplete.
fn parse_value(src: &[u8], pos: usize) -> Result<Option<(RespValue, usize)>, RedisError> {
    let Some((line, after_line)) = take_crlf_line(src, pos) else {
        return Ok(None);
    };
    if line.is_empty() {
        return Err(RedisError::Protocol("empty element".to_owned()));
    }
    let (marker, rest) = (line[0], &line[1..]);
    match marker {
        b'+' => Ok(Some((
            RespValue::Simple(String::from_utf8_lossy(rest).into_owned()),
            after_line,
        ))),
        b'-' => Ok(Some((
            RespValue::Error(String::from_utf8_lossy(rest).into_owned()),
            after_line,
        ))),
        b':' => {
            let value = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RedisError::Protocol("bad integer".to_owned()))?;
            Ok(Some((RespValue::Integer(value), after_line)))
        }
        b'$' => {
            let len: i64 = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RedisError::Protocol("bad bulk length".to_owned()))?;
            if len < 0 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let len = usize::try_from(len)
                .map_err(|_| RedisError::Protocol("bulk length overflow".to_owned()))?;
            let end = after_line + len;
            if src.len() < end + 2 {
                return Ok(None);
            }
            if &src[end..end + 2] != b"\r\n" {
                return Err(RedisError::Protocol("bulk missing terminator".to_owned()));
            }
            let payload = Bytes::copy_from_slice(&src[after_line..end]);
            Ok(Some((RespValue::Bulk(payload), end + 2)))
        }
        b'*' => {
            let len: i64 = std::str::from_utf8(rest)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| RedisError::Protocol("bad array length".to_owned()))?;
            if len < 0 {
                return Ok(Some((RespValue::Null, after_line)));
            }
            let mut items = Vec::with_capacity(usize::try_from(len).unwrap_or(0));
            let mut cursor = after_line;
            for _ in 0..len {
                match parse_value(src, cursor)? {
                    Some((item, next)) => {
                        items.push(item);
                        cursor = next;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), cursor)))
        }
        other => Err(RedisError::Protocol(format!(
            "unknown type marker {:?}",
            char::from(other)
        ))),
    }
}

fn take_crlf_line(src: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let rest = &src[pos.min(src.len())..];
    let idx = rest.windows(2).position(|w| w == b"\r\n")?;
    Some((&rest[..idx], pos + idx + 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(input: &[u8]) -> Vec<RespValue> {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(value) = codec.decode(&mut buf).unwrap() {
            out.push(value);
        }
        out
    }

    #[test]
    fn scalar_types_decode() {
        assert_eq!(
            decode_all(b"+OK\r\n"),
            vec![RespValue::Simple("OK".to_owned())]
        );
        assert_eq!(
            decode_all(b"-ERR boom\r\n"),
            vec![RespValue::Error("ERR boom".to_owned())]
        );
        assert_eq!(decode_all(b":42\r\n"), vec![RespValue::Integer(42)]);
        assert_eq!(decode_all(b"$-1\r\n"), vec![RespValue::Null]);
        assert_eq!(
            decode_all(b"$5\r\nhello\r\n"),
            vec![RespValue::Bulk(Bytes::from_static(b"hello"))]
        );
    }

    #[test]
    fn nested_arrays_decode() {
        let input = b"*3\r\n$7\r\nmessage\r\n$4\r\nchan\r\n$7\r\npayload\r\n";
        let values = decode_all(input);
        assert_eq!(values.len(), 1);
        match &values[0] {
            RespValue::Array(items) => {
                assert_eq!(items.len(), 3);
                assert_eq!(items[0].as_str(), Some("message"));
                assert_eq!(items[1].as_str(), Some("chan"));
            }
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn incomplete_input_returns_none_without_consuming() {
        let mut codec = RespCodec;
        let mut buf = BytesMut::from(&b"$10\r\nhello"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 10);
        buf.extend_from_slice(b"world\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap(),
            RespValue::Bulk(Bytes::from_static(b"helloworld"))
        );
    }

    #[test]
    fn command_encoding_uses_bulk_strings() {
        let cmd = encode_command(&[
            "SET".into(),
            "key".into(),
            RespArg::Int(7),
            RespArg::Bool(true),
            RespArg::Null,
        ]);
        assert_eq!(
            &cmd[..],
            b"*5\r\n$3\r\nSET\r\n$3\r\nkey\r\n$1\r\n7\r\n$4\r\ntrue\r\n$-1\r\n".as_slice()
        );
    }

    #[test]
    fn value_encode_then_decode_is_identity() {
        let values = vec![
            RespValue::Simple("OK".to_owned()),
            RespValue::Error("ERR no".to_owned()),
            RespValue::Integer(-7),
            RespValue::Bulk(Bytes::from_static(b"binary\x00data")),
            RespValue::Null,
            RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::Array(vec![RespValue::Bulk(Bytes::from_static(b"nested"))]),
                RespValue::Null,
            ]),
        ];
        for value in values {
            let encoded = value.to_bytes();
            let mut buf = BytesMut::from(&encoded[..]);
            let decoded = RespCodec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, value, "roundtrip for {value:?}");
            assert!(buf.is_empty());
        }
    }
}
