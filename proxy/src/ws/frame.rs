use bytes::{Buf, BufMut, Bytes, BytesMut};
use rand::RngCore;

use crate::error::ProxyError;

pub const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u4(raw: u8) -> Result<Opcode, ProxyError> {
        match raw {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            _ => Err(ProxyError::InvalidOpcode),
        }
    }

    pub fn to_u4(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }

    pub fn is_control(self) -> bool {
        self.to_u4() & 0x8 != 0
    }
}

/// One RFC 6455 frame, unmasked payload. The masking key is kept so an
/// untouched frame can be re-emitted byte-identically when required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub rsv: u8,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(opcode: Opcode, fin: bool, payload: Bytes) -> Self {
        Frame {
            fin,
            rsv: 0,
            opcode,
            mask: None,
            payload,
        }
    }

    pub fn ping(payload: Bytes) -> Self {
        Frame::data(Opcode::Ping, true, payload)
    }

    pub fn pong(payload: Bytes) -> Self {
        Frame::data(Opcode::Pong, true, payload)
    }

    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Frame::data(Opcode::Close, true, payload.freeze())
    }

    /// Close payloads carry a big-endian code then a UTF-8 reason.
    pub fn parse_close(&self) -> (u16, String) {
        if self.payload.len() < 2 {
            return (1005, String::new());
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).to_string();
        (code, reason)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.rsv != 0 {
            // No extension negotiating RSV bits is implemented.
            return Err(ProxyError::InvalidFrame);
        }
        if self.opcode.is_control() && (!self.fin || self.payload.len() > MAX_CONTROL_PAYLOAD) {
            return Err(ProxyError::InvalidFrame);
        }
        Ok(())
    }
}

/// XOR the payload with the masking key. A zero-length payload is a no-op.
pub fn apply_mask(key: [u8; 4], payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Stateless-resumable frame codec for one direction. Decoding consumes
/// nothing until a whole frame is buffered, so it can be retried after every
/// socket read. Encoding re-masks when the destination expects masked
/// frames (the proxy acting as a client toward the upstream).
#[derive(Debug)]
pub struct FrameCodec {
    mask_outgoing: bool,
}

impl FrameCodec {
    pub fn new(mask_outgoing: bool) -> Self {
        FrameCodec { mask_outgoing }
    }

    /// Decode one frame if fully buffered. The payload is unmasked in the
    /// returned frame; the key is preserved on it.
    pub fn decode(&mut self, input: &mut BytesMut) -> Result<Option<Frame>, ProxyError> {
        if input.len() < 2 {
            return Ok(None);
        }
        let b0 = input[0];
        let b1 = input[1];
        let fin = b0 & 0x80 != 0;
        let rsv = (b0 >> 4) & 0x07;
        let opcode = Opcode::from_u4(b0 & 0x0F)?;
        let masked = b1 & 0x80 != 0;
        let len7 = (b1 & 0x7F) as usize;

        let mut header_len = 2usize;
        let payload_len = match len7 {
            126 => {
                if input.len() < header_len + 2 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([input[2], input[3]]) as usize;
                header_len += 2;
                len
            }
            127 => {
                if input.len() < header_len + 8 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&input[2..10]);
                let len = u64::from_be_bytes(raw);
                header_len += 8;
                usize::try_from(len).map_err(|_| ProxyError::InvalidFrame)?
            }
            n => n,
        };

        let mask = if masked {
            if input.len() < header_len + 4 {
                return Ok(None);
            }
            let mut key = [0u8; 4];
            key.copy_from_slice(&input[header_len..header_len + 4]);
            header_len += 4;
            Some(key)
        } else {
            None
        };

        if input.len() < header_len + payload_len {
            return Ok(None);
        }

        input.advance(header_len);
        let mut payload = input.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(key, &mut payload);
        }

        let frame = Frame {
            fin,
            rsv,
            opcode,
            mask,
            payload: payload.freeze(),
        };
        frame.validate()?;
        Ok(Some(frame))
    }

    /// Decode every fully buffered frame.
    pub fn decode_all(&mut self, input: &mut BytesMut) -> Result<Vec<Frame>, ProxyError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(input)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    pub fn encode(&self, frame: &Frame, out: &mut BytesMut) -> Result<(), ProxyError> {
        frame.validate().map_err(|_| ProxyError::SerializationError)?;

        let mut b0 = frame.opcode.to_u4();
        if frame.fin {
            b0 |= 0x80;
        }
        out.put_u8(b0);

        let len = frame.payload.len();
        let mask_bit = if self.mask_outgoing { 0x80 } else { 0x00 };
        if len <= 125 {
            out.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.put_u8(mask_bit | 126);
            out.put_u16(len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(len as u64);
        }

        if self.mask_outgoing {
            let mut key = [0u8; 4];
            rand::rng().fill_bytes(&mut key);
            out.put_slice(&key);
            let mut masked = frame.payload.to_vec();
            apply_mask(key, &mut masked);
            out.put_slice(&masked);
        } else {
            out.put_slice(&frame.payload);
        }
        Ok(())
    }
}

/// Reassembles messages from a text/binary frame followed by continuation
/// frames. Control frames may interleave and never participate.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    opcode: Option<Opcode>,
    content: BytesMut,
}

impl MessageAssembler {
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Feed one data frame; returns the assembled (opcode, content) when a
    /// fin frame completes the message.
    pub fn push(&mut self, frame: &Frame) -> Result<Option<(Opcode, Bytes)>, ProxyError> {
        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.opcode.is_some() {
                    return Err(ProxyError::UnexpectedOpcode);
                }
                self.opcode = Some(frame.opcode);
            }
            Opcode::Continuation => {
                if self.opcode.is_none() {
                    return Err(ProxyError::UnexpectedOpcode);
                }
            }
            _ => return Err(ProxyError::UnexpectedOpcode),
        }
        self.content.extend_from_slice(&frame.payload);

        if frame.fin {
            let opcode = self.opcode.take().unwrap_or(Opcode::Binary);
            let content = self.content.split().freeze();
            return Ok(Some((opcode, content)));
        }
        Ok(None)
    }

    pub fn reset(&mut self) {
        self.opcode = None;
        self.content.clear();
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_text_frame_round_trip() {
        // "Hello" masked with 0x37fa213d, from RFC 6455 §5.7.
        let raw: &[u8] = &[
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let mut codec = FrameCodec::new(false);
        let mut input = BytesMut::from(raw);
        let frame = codec.decode(&mut input).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert_eq!(frame.mask, Some([0x37, 0xfa, 0x21, 0x3d]));
    }

    #[test]
    fn unmasked_encode_matches_wire() {
        let frame = Frame::data(Opcode::Text, true, Bytes::from_static(b"Hello"));
        let codec = FrameCodec::new(false);
        let mut out = BytesMut::new();
        codec.encode(&frame, &mut out).unwrap();
        assert_eq!(out.as_ref(), &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn decode_encode_identity_for_unmasked_frames() {
        let wire = [0x82u8, 0x03, 1, 2, 3];
        let mut codec = FrameCodec::new(false);
        let mut input = BytesMut::from(&wire[..]);
        let frame = codec.decode(&mut input).unwrap().unwrap();

        let mut out = BytesMut::new();
        codec.encode(&frame, &mut out).unwrap();
        assert_eq!(out.as_ref(), &wire[..]);
    }

    #[test]
    fn masked_encode_survives_decode() {
        let frame = Frame::data(Opcode::Binary, true, Bytes::from_static(b"payload"));
        let codec = FrameCodec::new(true);
        let mut out = BytesMut::new();
        codec.encode(&frame, &mut out).unwrap();

        let mut decoder = FrameCodec::new(false);
        let decoded = decoder.decode(&mut out).unwrap().unwrap();
        assert!(decoded.mask.is_some());
        assert_eq!(decoded.payload.as_ref(), b"payload");
    }

    #[test]
    fn extended_16_bit_length() {
        let payload = vec![0xAB; 300];
        let frame = Frame::data(Opcode::Binary, true, Bytes::from(payload.clone()));
        let codec = FrameCodec::new(false);
        let mut out = BytesMut::new();
        codec.encode(&frame, &mut out).unwrap();
        assert_eq!(out[1], 126);

        let mut decoder = FrameCodec::new(false);
        let decoded = decoder.decode(&mut out).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), &payload[..]);
    }

    #[test]
    fn extended_64_bit_length() {
        let payload = vec![0x42; 70_000];
        let frame = Frame::data(Opcode::Binary, true, Bytes::from(payload.clone()));
        let codec = FrameCodec::new(false);
        let mut out = BytesMut::new();
        codec.encode(&frame, &mut out).unwrap();
        assert_eq!(out[1], 127);

        let mut decoder = FrameCodec::new(false);
        let decoded = decoder.decode(&mut out).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 70_000);
    }

    #[test]
    fn partial_frames_wait_for_more_data() {
        let raw = [0x81u8, 0x85, 0x37, 0xfa];
        let mut codec = FrameCodec::new(false);
        let mut input = BytesMut::from(&raw[..]);
        assert!(codec.decode(&mut input).unwrap().is_none());
        assert_eq!(input.len(), 4);
    }

    #[test]
    fn control_frame_constraints() {
        // Fragmented ping.
        let raw = [0x09u8, 0x00];
        let mut codec = FrameCodec::new(false);
        let mut input = BytesMut::from(&raw[..]);
        assert_eq!(
            codec.decode(&mut input).unwrap_err(),
            ProxyError::InvalidFrame
        );

        // Oversized close payload.
        let big = Frame {
            fin: true,
            rsv: 0,
            opcode: Opcode::Close,
            mask: None,
            payload: Bytes::from(vec![0u8; 126]),
        };
        let codec = FrameCodec::new(false);
        let mut out = BytesMut::new();
        assert_eq!(
            codec.encode(&big, &mut out).unwrap_err(),
            ProxyError::SerializationError
        );
    }

    #[test]
    fn reserved_opcode_is_rejected() {
        let raw = [0x83u8, 0x00];
        let mut codec = FrameCodec::new(false);
        let mut input = BytesMut::from(&raw[..]);
        assert_eq!(
            codec.decode(&mut input).unwrap_err(),
            ProxyError::InvalidOpcode
        );
    }

    #[test]
    fn zero_length_masked_payload_is_noop() {
        let mut empty: [u8; 0] = [];
        apply_mask([1, 2, 3, 4], &mut empty);

        let raw = [0x81u8, 0x80, 0x37, 0xfa, 0x21, 0x3d];
        let mut codec = FrameCodec::new(false);
        let mut input = BytesMut::from(&raw[..]);
        let frame = codec.decode(&mut input).unwrap().unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn close_frame_payload_round_trip() {
        let frame = Frame::close(1000, "bye");
        let (code, reason) = frame.parse_close();
        assert_eq!(code, 1000);
        assert_eq!(reason, "bye");
    }

    #[test]
    fn message_reassembly_with_interleaved_control() {
        let mut assembler = MessageAssembler::default();
        let first = Frame::data(Opcode::Text, false, Bytes::from_static(b"he"));
        assert!(assembler.push(&first).unwrap().is_none());
        assert!(assembler.in_progress());

        // A ping may interleave; it simply never reaches the assembler.
        let cont = Frame::data(Opcode::Continuation, true, Bytes::from_static(b"llo"));
        let (opcode, content) = assembler.push(&cont).unwrap().unwrap();
        assert_eq!(opcode, Opcode::Text);
        assert_eq!(content.as_ref(), b"hello");
        assert!(!assembler.in_progress());
    }

    #[test]
    fn continuation_without_start_is_unexpected() {
        let mut assembler = MessageAssembler::default();
        let cont = Frame::data(Opcode::Continuation, true, Bytes::from_static(b"x"));
        assert_eq!(
            assembler.push(&cont).unwrap_err(),
            ProxyError::UnexpectedOpcode
        );
    }
}
