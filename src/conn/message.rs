use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{Bitfield, InfoHash, PeerId};
use super::ConnError;

// Hard cap on a serialized message body. Piece payloads travel outside the
// framed body and are not bound by this.
pub const MAX_MESSAGE_BODY: usize = 32 * 1024;

// Upper bound on a single piece payload accepted off the wire.
pub const MAX_PIECE_PAYLOAD: usize = 16 * 1024 * 1024;

const TYPE_ERROR: u8 = 0;
const TYPE_ANNOUNCE_PIECE: u8 = 1;
const TYPE_PIECE_REQUEST: u8 = 2;
const TYPE_PIECE_PAYLOAD: u8 = 3;
const TYPE_CANCEL_PIECE: u8 = 4;
const TYPE_BITFIELD: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PieceRequestFailed,
}

#[cfg_attr(test, derive(Clone, PartialEq, Eq))]
#[derive(Debug)]
pub enum Message {

    // Tells the requesting peer a piece request cannot be served.
    Error {
        index: u32,
        code: ErrorCode,
        error: String,
    },

    // Advertises a newly completed piece.
    AnnouncePiece { index: u32 },

    // Asks for a whole piece. Offset and length are carried so a receiver
    // can reject anything that is not a full-piece request.
    PieceRequest {
        index: u32,
        offset: u64,
        length: u64,
    },

    // Header for a piece transfer. Exactly `length` raw payload bytes follow
    // the frame on the wire; they are never part of the serialized body.
    PiecePayload {
        index: u32,
        offset: u64,
        length: u64,
        payload: Bytes,
    },

    // Accepted for compatibility, never acted on.
    CancelPiece {
        index: u32,
        offset: u64,
        length: u64,
    },

    // First frame in each direction of a new connection.
    Bitfield {
        peer_id: PeerId,
        name: String,
        info_hash: InfoHash,
        bitfield: Bitfield,
    },

}

// Frames are a 4-byte big-endian body length followed by the body. The codec
// is stateful: after decoding a PiecePayload header it stays in payload mode
// until the raw payload bytes have arrived.
#[derive(Default)]
pub struct MessageCodec {

    pending_payload: Option<PayloadHeader>,

}

struct PayloadHeader {
    index: u32,
    offset: u64,
    length: u64,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = ConnError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {

        let mut body = BytesMut::new();
        let mut payload = None;

        match msg {

            Message::Error { index, code, error } => {
                body.put_u8(TYPE_ERROR);
                body.put_u32(index);
                body.put_u8(match code {
                    ErrorCode::PieceRequestFailed => 0,
                });
                body.extend_from_slice(error.as_bytes());
            },

            Message::AnnouncePiece { index } => {
                body.put_u8(TYPE_ANNOUNCE_PIECE);
                body.put_u32(index);
            },

            Message::PieceRequest { index, offset, length } => {
                body.put_u8(TYPE_PIECE_REQUEST);
                body.put_u32(index);
                body.put_u64(offset);
                body.put_u64(length);
            },

            Message::PiecePayload { index, offset, length, payload: data } => {
                if data.len() as u64 != length {
                    return Err(ConnError::PayloadLengthMismatch {
                        header: length,
                        actual: data.len() as u64,
                    });
                }
                body.put_u8(TYPE_PIECE_PAYLOAD);
                body.put_u32(index);
                body.put_u64(offset);
                body.put_u64(length);
                payload = Some(data);
            },

            Message::CancelPiece { index, offset, length } => {
                body.put_u8(TYPE_CANCEL_PIECE);
                body.put_u32(index);
                body.put_u64(offset);
                body.put_u64(length);
            },

            Message::Bitfield { peer_id, name, info_hash, bitfield } => {
                body.put_u8(TYPE_BITFIELD);
                body.extend_from_slice(peer_id.as_bytes());
                body.put_u16(name.len() as u16);
                body.extend_from_slice(name.as_bytes());
                body.extend_from_slice(info_hash.as_bytes());
                body.put_u32(bitfield.len() as u32);
                body.extend_from_slice(&bitfield.to_raw());
            },
        }

        if body.len() > MAX_MESSAGE_BODY {
            return Err(ConnError::MessageTooLarge(body.len()));
        }

        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        // Raw payload bytes go on the wire directly after the frame.
        if let Some(data) = payload {
            dst.extend_from_slice(&data);
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Finish an in-progress payload before looking at the next frame.
        if let Some(header) = &self.pending_payload {
            let length = header.length as usize;
            if src.remaining() < length {
                src.reserve(length - src.remaining());
                return Ok(None);
            }
            let payload = src.copy_to_bytes(length);
            let header = self.pending_payload.take().unwrap();
            return Ok(Some(Message::PiecePayload {
                index: header.index,
                offset: header.offset,
                length: header.length,
                payload,
            }));
        }

        if src.remaining() < 4 {
            return Ok(None);
        }

        let mut peeker = std::io::Cursor::new(&src[..]);
        let body_len = peeker.get_u32() as usize;
        if body_len > MAX_MESSAGE_BODY {
            return Err(ConnError::MessageTooLarge(body_len));
        }
        if body_len == 0 {
            return Err(ConnError::InvalidMessage("empty body".into()));
        }
        if src.remaining() < 4 + body_len {
            return Ok(None);
        }
        src.advance(4);
        let mut body = src.split_to(body_len);

        let truncated = |what: &str| ConnError::InvalidMessage(format!("truncated {}", what));

        let msg = match body.get_u8() {

            TYPE_ERROR => {
                if body.remaining() < 5 {
                    return Err(truncated("error"));
                }
                let index = body.get_u32();
                let code = match body.get_u8() {
                    0 => ErrorCode::PieceRequestFailed,
                    code => {
                        return Err(ConnError::InvalidMessage(format!("error code {}", code)));
                    },
                };
                let error = String::from_utf8_lossy(&body).into_owned();
                Message::Error { index, code, error }
            },

            TYPE_ANNOUNCE_PIECE => {
                if body.remaining() < 4 {
                    return Err(truncated("announce piece"));
                }
                Message::AnnouncePiece { index: body.get_u32() }
            },

            TYPE_PIECE_REQUEST => {
                if body.remaining() < 20 {
                    return Err(truncated("piece request"));
                }
                Message::PieceRequest {
                    index: body.get_u32(),
                    offset: body.get_u64(),
                    length: body.get_u64(),
                }
            },

            TYPE_PIECE_PAYLOAD => {
                if body.remaining() < 20 {
                    return Err(truncated("piece payload"));
                }
                let index = body.get_u32();
                let offset = body.get_u64();
                let length = body.get_u64();
                if length as usize > MAX_PIECE_PAYLOAD {
                    return Err(ConnError::PayloadTooLarge(length));
                }
                self.pending_payload = Some(PayloadHeader { index, offset, length });
                // Recurse once in case the payload is already buffered.
                return self.decode(src);
            },

            TYPE_CANCEL_PIECE => {
                if body.remaining() < 20 {
                    return Err(truncated("cancel piece"));
                }
                Message::CancelPiece {
                    index: body.get_u32(),
                    offset: body.get_u64(),
                    length: body.get_u64(),
                }
            },

            TYPE_BITFIELD => {
                if body.remaining() < 22 {
                    return Err(truncated("bitfield"));
                }
                let mut peer_id = [0; 20];
                body.copy_to_slice(&mut peer_id);
                let name_len = body.get_u16() as usize;
                if body.remaining() < name_len + 24 {
                    return Err(truncated("bitfield"));
                }
                let name_raw = body.split_to(name_len);
                let name = String::from_utf8_lossy(&name_raw).into_owned();
                let mut info_hash = [0; 20];
                body.copy_to_slice(&mut info_hash);
                let num_pieces = body.get_u32() as usize;
                if num_pieces > body.remaining() * 8 {
                    return Err(ConnError::InvalidMessage("bitfield length mismatch".into()));
                }
                Message::Bitfield {
                    peer_id: PeerId(peer_id),
                    name,
                    info_hash: InfoHash(info_hash),
                    bitfield: Bitfield::from_raw(&body, num_pieces),
                }
            },

            id => {
                tracing::warn!("invalid message type: {}", id);
                return Err(ConnError::InvalidMessageType(id));
            },
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::Error { index, code, error } => {
                write!(f, "error {{ piece: {}, code: {:?}, {} }}", index, code, error)
            },
            Message::AnnouncePiece { index } => write!(f, "announce piece {}", index),
            Message::PieceRequest { index, offset, length } => write!(
                f,
                "piece request {{ piece: {}, offset: {}, length: {} }}",
                index, offset, length,
            ),
            Message::PiecePayload { index, length, .. } => {
                write!(f, "piece payload {{ piece: {}, length: {} }}", index, length)
            },
            Message::CancelPiece { index, .. } => write!(f, "cancel piece {}", index),
            Message::Bitfield { peer_id, name, bitfield, .. } => write!(
                f,
                "bitfield {{ peer: {}, name: {}, pieces: {}/{} }}",
                peer_id,
                name,
                bitfield.num_complete(),
                bitfield.len(),
            ),
        }
    }
}
