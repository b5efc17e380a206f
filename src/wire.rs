//! The handshake and steady-state message framing.
//!
//! Two codecs are used in sequence on the same TCP stream: a
//! [`HandshakeCodec`] for the fixed 32-byte handshake, then, once that's
//! settled, a [`PeerMessageCodec`] for the length-prefixed message stream.
//! `tokio_util::codec::Framed` is reused for both by handing its
//! [`FramedParts`](tokio_util::codec::FramedParts) — and any bytes the
//! first codec over-read — to the second, so nothing in the buffered
//! stream is lost across the switch.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};
use crate::PeerId;

/// The fixed protocol identifier every handshake begins with.
pub const PROTOCOL_HEADER: &[u8; 18] = b"P2PFILESHARINGPROJ";
const ZERO_PADDING_LEN: usize = 10;
pub const HANDSHAKE_LEN: usize = 18 + ZERO_PADDING_LEN + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(peer_id: PeerId) -> Self {
        Self { peer_id }
    }
}

#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>> {
        if src.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let buf = src.split_to(HANDSHAKE_LEN);
        if &buf[0..18] != PROTOCOL_HEADER.as_ref() {
            return Err(Error::BadHandshake);
        }
        if buf[18..18 + ZERO_PADDING_LEN].iter().any(|&b| b != 0) {
            return Err(Error::BadHandshake);
        }
        let mut id_bytes = [0u8; 4];
        id_bytes.copy_from_slice(&buf[28..32]);
        Ok(Some(Handshake {
            peer_id: u32::from_be_bytes(id_bytes),
        }))
    }
}

impl Encoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(HANDSHAKE_LEN);
        dst.put_slice(PROTOCOL_HEADER.as_ref());
        dst.put_slice(&[0u8; ZERO_PADDING_LEN]);
        dst.put_u32(item.peer_id);
        Ok(())
    }
}

/// A single steady-state message. `Have`/`Request` carry a piece index,
/// `Bitfield` carries the wire-format bitfield payload, `Piece` carries an
/// index plus the piece's raw bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Vec<u8>),
    Request(usize),
    Piece(usize, Vec<u8>),
}

impl Message {
    fn type_id(&self) -> u8 {
        match self {
            Message::Choke => 0,
            Message::Unchoke => 1,
            Message::Interested => 2,
            Message::NotInterested => 3,
            Message::Have(_) => 4,
            Message::Bitfield(_) => 5,
            Message::Request(_) => 6,
            Message::Piece(..) => 7,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerMessageCodec;

impl Decoder for PeerMessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[0..4]);
        let length = u32::from_be_bytes(len_bytes) as usize;
        if length == 0 {
            return Err(Error::Protocol("zero-length message frame".into()));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(length);
        let type_id = frame.get_u8();
        let message = match type_id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => {
                if frame.len() != 4 {
                    return Err(Error::Protocol("malformed have payload".into()));
                }
                Message::Have(frame.get_u32() as usize)
            }
            5 => Message::Bitfield(frame.to_vec()),
            6 => {
                if frame.len() != 4 {
                    return Err(Error::Protocol("malformed request payload".into()));
                }
                Message::Request(frame.get_u32() as usize)
            }
            7 => {
                if frame.len() < 4 {
                    return Err(Error::Protocol("malformed piece payload".into()));
                }
                let index = frame.get_u32() as usize;
                Message::Piece(index, frame.to_vec())
            }
            other => {
                return Err(Error::Protocol(format!("unknown message type {}", other)));
            }
        };
        Ok(Some(message))
    }
}

impl Encoder for PeerMessageCodec {
    type Item = Message;
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        let payload_len = match &item {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => 0,
            Message::Have(_) | Message::Request(_) => 4,
            Message::Bitfield(bytes) => bytes.len(),
            Message::Piece(_, data) => 4 + data.len(),
        };
        let length = 1 + payload_len;
        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.type_id());
        match item {
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
            Message::Have(index) | Message::Request(index) => dst.put_u32(index as u32),
            Message::Bitfield(bytes) => dst.put_slice(&bytes),
            Message::Piece(index, data) => {
                dst.put_u32(index as u32);
                dst.put_slice(&data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_round_trip() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        codec.encode(Handshake::new(7), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.peer_id, 7);
    }

    #[test]
    fn test_handshake_rejects_bad_header() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8; HANDSHAKE_LEN]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_handshake_waits_for_more_bytes() {
        let mut codec = HandshakeCodec;
        let mut buf = BytesMut::new();
        buf.put_slice(&PROTOCOL_HEADER[..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_message_round_trip_each_variant() {
        let mut codec = PeerMessageCodec;
        let messages = vec![
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(3),
            Message::Bitfield(vec![0b1010_0000]),
            Message::Request(9),
            Message::Piece(2, vec![1, 2, 3, 4, 5]),
        ];
        for msg in messages {
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn test_message_decode_waits_for_full_frame() {
        let mut codec = PeerMessageCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Have(1), &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_message_rejects_zero_length() {
        let mut codec = PeerMessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_message_rejects_unknown_type() {
        let mut codec = PeerMessageCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(codec.decode(&mut buf).is_err());
    }
}
