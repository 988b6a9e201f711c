//! RFC 6455 frame codec.
//!
//! Decoding validates the masking rules (server peers must mask, client
//! peers must not) and the control-frame constraints; RSV bits are ignored
//! on read and never set on write.  Encoding masks outgoing frames with a
//! fresh random key in client mode and auto-fragments oversized messages at
//! the writer layer above.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::WsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    fn from_bits(bits: u8) -> Result<Self, WsError> {
        match bits {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(WsError::BadOpcode(other)),
        }
    }

    fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One parsed frame; the payload arrives unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    pub fn close() -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Close,
            payload: Bytes::new(),
        }
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Ping,
            payload: payload.into(),
        }
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Pong,
            payload: payload.into(),
        }
    }
}

/// Frame codec; `client_mode` flips both masking expectations.
#[derive(Debug)]
pub struct FrameCodec {
    pub client_mode: bool,
    /// Upper bound on a single frame's payload.
    pub max_frame: usize,
}

impl FrameCodec {
    pub fn server() -> Self {
        FrameCodec {
            client_mode: false,
            max_frame: 1 << 26,
        }
    }

    pub fn client() -> Self {
        FrameCodec {
            client_mode: true,
            max_frame: 1 << 26,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WsError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let b0 = src[0];
        let b1 = src[1];
        let fin = b0 & 0x80 != 0;
        // RSV bits are ignored: extensions are never negotiated.
        let opcode = OpCode::from_bits(b0 & 0x0f)?;
        let masked = b1 & 0x80 != 0;

        // A server must receive masked frames, a client must not; either
        // violation is fatal for the connection.
        if masked == self.client_mode {
            return Err(if masked {
                WsError::UnexpectedMask
            } else {
                WsError::MissingMask
            });
        }

        let mut header_len = 2usize;
        let len7 = (b1 & 0x7f) as usize;
        let payload_len = match len7 {
            126 => {
                header_len += 2;
                if src.len() < header_len {
                    return Ok(None);
                }
                usize::from(u16::from_be_bytes([src[2], src[3]]))
            }
            127 => {
                header_len += 8;
                if src.len() < header_len {
                    return Ok(None);
                }
                let len = u64::from_be_bytes(src[2..10].try_into().expect("8 bytes"));
                usize::try_from(len).map_err(|_| WsError::FrameTooLarge(len))?
            }
            n => n,
        };

        if opcode.is_control() && (payload_len > 125 || !fin) {
            return Err(WsError::BadControlFrame);
        }
        if payload_len > self.max_frame {
            return Err(WsError::FrameTooLarge(payload_len as u64));
        }

        let mask_len = if masked { 4 } else { 0 };
        let total = header_len + mask_len + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(header_len);
        let payload = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&src[..4]);
            src.advance(4);
            let mut payload = src.split_to(payload_len);
            for (i, byte) in payload.iter_mut().enumerate() {
                *byte ^= key[i % 4];
            }
            payload
        } else {
            src.split_to(payload_len)
        };

        Ok(Some(Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WsError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WsError> {
        let mask = if self.client_mode {
            Some(rand::random::<[u8; 4]>())
        } else {
            None
        };
        write_frame(dst, &frame.payload, frame.opcode, frame.fin, false, mask);
        Ok(())
    }
}

/// Serialize one frame.  `continuation` forces opcode 0 (used past the
/// first fragment of a message).
pub fn write_frame(
    dst: &mut BytesMut,
    payload: &[u8],
    opcode: OpCode,
    fin: bool,
    continuation: bool,
    mask: Option<[u8; 4]>,
) {
    let opbits = if continuation { 0 } else { opcode.bits() };
    let b0 = opbits | if fin { 0x80 } else { 0 };
    dst.reserve(payload.len() + 14);
    dst.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        len if len < 126 => {
            let b = u8::try_from(len).expect("small length");
            dst.put_u8(b | mask_bit);
        }
        len if len <= usize::from(u16::MAX) => {
            dst.put_u8(126 | mask_bit);
            dst.put_u16(u16::try_from(len).expect("checked"));
        }
        len => {
            dst.put_u8(127 | mask_bit);
            dst.put_u64(len as u64);
        }
    }

    match mask {
        Some(key) => {
            dst.put_slice(&key);
            for (i, &byte) in payload.iter().enumerate() {
                dst.put_u8(byte ^ key[i % 4]);
            }
        }
        None => dst.put_slice(payload),
    }
}

/// Outgoing messages larger than this are split into fragments.
pub const WRITE_FRAGMENT: usize = 32 * 1024 - 16;

/// Wrap a whole message, fragmenting transparently when it exceeds
/// [`WRITE_FRAGMENT`].  Server mode (no mask) shares the result across
/// recipients; client mode masks each fragment independently.
pub fn wrap_message(payload: &[u8], is_text: bool, client_mode: bool) -> Bytes {
    let opcode = if is_text { OpCode::Text } else { OpCode::Binary };
    let mut dst = BytesMut::with_capacity(payload.len() + 16);
    if payload.len() <= WRITE_FRAGMENT {
        let mask = client_mode.then(rand::random::<[u8; 4]>);
        write_frame(&mut dst, payload, opcode, true, false, mask);
        return dst.freeze();
    }

    let mut offset = 0usize;
    let mut first = true;
    while offset < payload.len() {
        let end = (offset + WRITE_FRAGMENT).min(payload.len());
        let fin = end == payload.len();
        let mask = client_mode.then(rand::random::<[u8; 4]>);
        write_frame(&mut dst, &payload[offset..end], opcode, fin, !first, mask);
        first = false;
        offset = end;
    }
    dst.freeze()
}

impl From<WsError> for io::Error {
    fn from(err: WsError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}
