//! WebSocket data frame codec.
//!
//! [RFC 6455 §5](https://datatracker.ietf.org/doc/html/rfc6455#section-5)
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::WsStatus;
use crate::server::wire::{WireError, WireStream};

/// Frame codec errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The declared payload length exceeds the configured limit.
    #[error("frame payload of {len} bytes exceeds limit of {max} bytes")]
    PayloadTooBig { len: u64, max: u64 },

    /// The transport failed mid-frame.
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Write-side transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Frame opcode (low 4 bits of the first header byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Continuation of a fragmented message, 0x0.
    Continuation,
    /// Text frame, 0x1.
    Text,
    /// Binary frame, 0x2.
    Binary,
    /// Connection close, 0x8.
    Close,
    /// Ping, 0x9.
    Ping,
    /// Pong, 0xA.
    Pong,
    /// A reserved opcode; such frames are consumed and ignored.
    Reserved(u8),
}

impl Opcode {
    /// Maps the low 4 bits of the first header byte.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0f {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xa => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Returns the 4-bit wire value.
    pub fn bits(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xa,
            Self::Reserved(bits) => bits & 0x0f,
        }
    }

    /// Control frames are Close, Ping, and Pong.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Frames a handler is expected to see: Text, Binary, Continuation.
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::Continuation)
    }
}

/// A single WebSocket frame.
///
/// The serialized payload length always equals `payload().len()`. The server
/// sends frames unmasked; a mask key may be attached with
/// [`masked`](Self::masked) for loopback self-tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Extension bit, always 0 here.
    pub rsv1: bool,
    /// Extension bit, always 0 here.
    pub rsv2: bool,
    /// Extension bit, always 0 here.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// XOR mask key, applied at serialization time when present.
    pub mask: Option<[u8; 4]>,
    payload: Bytes,
}

impl Frame {
    /// Creates an unmasked final frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into())
    }

    /// Creates a binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Creates a close frame carrying the status code as a big-endian pair.
    pub fn close(status: WsStatus) -> Self {
        Self::new(Opcode::Close, status.as_u16().to_be_bytes().to_vec())
    }

    /// Attaches a mask key, for self-test round trips.
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Returns the (decoded) payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Returns the payload as UTF-8 text, if it is valid.
    pub fn payload_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Reads one frame off the wire, enforcing `max_payload` before the
    /// payload itself is read. A masked payload is decoded in place.
    pub(crate) async fn read_from<S>(
        wire: &mut WireStream<S>,
        max_payload: u64,
    ) -> Result<Self, FrameError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let head = wire.read_exact(2).await?;
        let fin = head[0] & 0x80 != 0;
        let rsv1 = head[0] & 0x40 != 0;
        let rsv2 = head[0] & 0x20 != 0;
        let rsv3 = head[0] & 0x10 != 0;
        let opcode = Opcode::from_bits(head[0]);
        let masked = head[1] & 0x80 != 0;
        let len7 = head[1] & 0x7f;

        let payload_len: u64 = match len7 {
            126 => {
                let ext = wire.read_exact(2).await?;
                u64::from(u16::from_be_bytes([ext[0], ext[1]]))
            }
            127 => {
                let ext = wire.read_exact(8).await?;
                u64::from_be_bytes([
                    ext[0], ext[1], ext[2], ext[3], ext[4], ext[5], ext[6], ext[7],
                ])
            }
            n => u64::from(n),
        };

        if payload_len > max_payload {
            return Err(FrameError::PayloadTooBig {
                len: payload_len,
                max: max_payload,
            });
        }

        let mask = if masked {
            let key = wire.read_exact(4).await?;
            Some([key[0], key[1], key[2], key[3]])
        } else {
            None
        };

        let mut payload = wire.read_exact(payload_len as usize).await?;
        if let Some(key) = mask {
            apply_mask(key, &mut payload);
        }

        Ok(Self {
            fin,
            rsv1,
            rsv2,
            rsv3,
            opcode,
            mask,
            payload: payload.freeze(),
        })
    }

    /// Serializes the frame to the writer.
    ///
    /// The payload-length field is derived from the payload itself. When a
    /// mask key is present the payload is encoded on the way out; the stored
    /// payload is left untouched.
    pub(crate) async fn write_to<W>(&self, writer: &mut W) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        let len = self.payload.len() as u64;
        let mut buf = BytesMut::with_capacity(14 + self.payload.len());

        let mut b0 = self.opcode.bits();
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        if len < 126 {
            buf.put_slice(&[b0, mask_bit | len as u8]);
        } else if len < 65536 {
            buf.put_slice(&[b0, mask_bit | 126]);
            buf.put_u16(len as u16);
        } else {
            buf.put_slice(&[b0, mask_bit | 127]);
            buf.put_u64(len);
        }

        match self.mask {
            Some(key) => {
                buf.put_slice(&key);
                let mut encoded = self.payload.to_vec();
                apply_mask(key, &mut encoded);
                buf.put_slice(&encoded);
            }
            None => buf.put_slice(&self.payload),
        }

        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    }
}

/// XORs the buffer with the 4-byte key, per RFC 6455 §5.3.
pub(crate) fn apply_mask(key: [u8; 4], buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn round_trip(frame: Frame) -> Frame {
        let (mut client, server) = duplex(512 * 1024);
        frame.write_to(&mut client).await.unwrap();
        drop(client);
        let mut wire = WireStream::new(server, 1024);
        Frame::read_from(&mut wire, u64::MAX).await.unwrap()
    }

    #[test]
    fn mask_is_an_involution() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let original: Vec<u8> = (0..=255u8).collect();
        let mut buf = original.clone();
        apply_mask(key, &mut buf);
        assert_ne!(buf, original);
        apply_mask(key, &mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn opcode_bits_round_trip() {
        for bits in 0x0..=0xf {
            assert_eq!(Opcode::from_bits(bits).bits(), bits);
        }
        assert_eq!(Opcode::from_bits(0x3), Opcode::Reserved(0x3));
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Text.is_data());
    }

    #[tokio::test]
    async fn round_trips_across_length_encodings() {
        // Cover the 7-bit, 16-bit, and 64-bit length forms, masked and not.
        for len in [0usize, 125, 126, 65535, 65536] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            for mask in [None, Some([0x11, 0x22, 0x33, 0x44])] {
                let mut frame = Frame::binary(payload.clone());
                if let Some(key) = mask {
                    frame = frame.masked(key);
                }
                let parsed = round_trip(frame.clone()).await;
                assert_eq!(parsed.opcode, Opcode::Binary);
                assert_eq!(parsed.fin, true);
                assert_eq!(parsed.mask, mask, "len={len}");
                assert_eq!(parsed.payload(), frame.payload(), "len={len} mask={mask:?}");
            }
        }
    }

    #[tokio::test]
    async fn text_payload_decodes() {
        let parsed = round_trip(Frame::text("Hello").masked([9, 8, 7, 6])).await;
        assert_eq!(parsed.payload_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn close_frame_carries_status() {
        let parsed = round_trip(Frame::close(WsStatus::PayloadTooBig)).await;
        assert_eq!(parsed.opcode, Opcode::Close);
        assert_eq!(&parsed.payload()[..], &1009u16.to_be_bytes());
    }

    #[tokio::test]
    async fn payload_limit_enforced_before_payload_read() {
        let (mut client, server) = duplex(1024);
        // Header declaring a 200-byte payload; send no payload at all. The
        // limit must trip from the length field alone.
        Frame::binary(vec![0u8; 200])
            .write_to(&mut client)
            .await
            .unwrap();
        let mut wire = WireStream::new(server, 64);
        let err = Frame::read_from(&mut wire, 100).await.unwrap_err();
        assert!(matches!(
            err,
            FrameError::PayloadTooBig { len: 200, max: 100 }
        ));
    }

    #[tokio::test]
    async fn fragmented_frame_flags_survive() {
        let mut frame = Frame::text("part");
        frame.fin = false;
        frame.opcode = Opcode::Continuation;
        let parsed = round_trip(frame).await;
        assert!(!parsed.fin);
        assert_eq!(parsed.opcode, Opcode::Continuation);
    }
}
