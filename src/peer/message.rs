use crate::error::{DownpourError, Result};
use bytes::{Buf, BufMut, BytesMut};

/// Information about a block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Piece index
    pub piece_index: u32,
    /// Byte offset within the piece
    pub offset: u32,
    /// Length of the block
    pub length: u32,
}

impl BlockInfo {
    pub fn new(piece_index: u32, offset: u32, length: u32) -> Self {
        Self {
            piece_index,
            offset,
            length,
        }
    }
}

/// Messages exchanged between peers, including the BEP 6 fast extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Keep-alive message (no payload)
    KeepAlive,
    /// Choke the peer
    Choke,
    /// Unchoke the peer
    Unchoke,
    /// Indicate interest
    Interested,
    /// Indicate lack of interest
    NotInterested,
    /// Indicate possession of a piece
    Have { piece_index: u32 },
    /// Bitfield of available pieces, MSB of byte 0 = piece 0
    Bitfield { bitfield: Vec<u8> },
    /// Request a block
    Request { block: BlockInfo },
    /// Send a block
    Piece {
        piece_index: u32,
        offset: u32,
        data: Vec<u8>,
    },
    /// Cancel a block request
    Cancel { block: BlockInfo },
    /// Hint that a piece is worth requesting
    SuggestPiece { piece_index: u32 },
    /// Peer has every piece (replaces a full bitfield)
    HaveAll,
    /// Peer has no pieces (replaces an empty bitfield)
    HaveNone,
    /// Peer refuses a request
    RejectRequest { block: BlockInfo },
    /// Piece may be requested even while choked
    AllowedFast { piece_index: u32 },
    /// Extension protocol message, carried opaquely
    Extended { id: u8, payload: Vec<u8> },
}

impl PeerMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;
    const CANCEL: u8 = 8;
    const SUGGEST_PIECE: u8 = 13;
    const HAVE_ALL: u8 = 14;
    const HAVE_NONE: u8 = 15;
    const REJECT_REQUEST: u8 = 16;
    const ALLOWED_FAST: u8 = 17;
    const EXTENDED: u8 = 20;

    /// Serialize to a framed message
    /// Format: <length prefix><message ID><payload>
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // length = 0
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(Self::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(Self::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(Self::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // length = 1 + 4
                buf.put_u8(Self::HAVE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32((1 + bitfield.len()) as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(bitfield);
            }
            PeerMessage::Request { block } => {
                buf.put_u32(13); // length = 1 + 4 + 4 + 4
                buf.put_u8(Self::REQUEST);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32((9 + data.len()) as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*piece_index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            PeerMessage::Cancel { block } => {
                buf.put_u32(13);
                buf.put_u8(Self::CANCEL);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::SuggestPiece { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(Self::SUGGEST_PIECE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::HaveAll => {
                buf.put_u32(1);
                buf.put_u8(Self::HAVE_ALL);
            }
            PeerMessage::HaveNone => {
                buf.put_u32(1);
                buf.put_u8(Self::HAVE_NONE);
            }
            PeerMessage::RejectRequest { block } => {
                buf.put_u32(13);
                buf.put_u8(Self::REJECT_REQUEST);
                buf.put_u32(block.piece_index);
                buf.put_u32(block.offset);
                buf.put_u32(block.length);
            }
            PeerMessage::AllowedFast { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(Self::ALLOWED_FAST);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Extended { id, payload } => {
                buf.put_u32((2 + payload.len()) as u32);
                buf.put_u8(Self::EXTENDED);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a message payload (the bytes after the length prefix).
    /// An empty payload is a keep-alive.
    pub fn from_payload(mut data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(PeerMessage::KeepAlive);
        }

        let message_id = data.get_u8();

        match message_id {
            Self::CHOKE => Ok(PeerMessage::Choke),
            Self::UNCHOKE => Ok(PeerMessage::Unchoke),
            Self::INTERESTED => Ok(PeerMessage::Interested),
            Self::NOT_INTERESTED => Ok(PeerMessage::NotInterested),
            Self::HAVE => {
                if data.len() < 4 {
                    return Err(DownpourError::ProtocolError(
                        "Invalid Have message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                Ok(PeerMessage::Have { piece_index })
            }
            Self::BITFIELD => {
                let bitfield = data.to_vec();
                Ok(PeerMessage::Bitfield { bitfield })
            }
            Self::REQUEST => {
                let block = Self::read_block(&mut data, "Request")?;
                Ok(PeerMessage::Request { block })
            }
            Self::PIECE => {
                if data.len() < 8 {
                    return Err(DownpourError::ProtocolError(
                        "Invalid Piece message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                let offset = data.get_u32();
                let piece_data = data.to_vec();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: piece_data,
                })
            }
            Self::CANCEL => {
                let block = Self::read_block(&mut data, "Cancel")?;
                Ok(PeerMessage::Cancel { block })
            }
            Self::SUGGEST_PIECE => {
                if data.len() < 4 {
                    return Err(DownpourError::ProtocolError(
                        "Invalid SuggestPiece message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                Ok(PeerMessage::SuggestPiece { piece_index })
            }
            Self::HAVE_ALL => Ok(PeerMessage::HaveAll),
            Self::HAVE_NONE => Ok(PeerMessage::HaveNone),
            Self::REJECT_REQUEST => {
                let block = Self::read_block(&mut data, "RejectRequest")?;
                Ok(PeerMessage::RejectRequest { block })
            }
            Self::ALLOWED_FAST => {
                if data.len() < 4 {
                    return Err(DownpourError::ProtocolError(
                        "Invalid AllowedFast message".to_string(),
                    ));
                }
                let piece_index = data.get_u32();
                Ok(PeerMessage::AllowedFast { piece_index })
            }
            Self::EXTENDED => {
                if data.is_empty() {
                    return Err(DownpourError::ProtocolError(
                        "Invalid Extended message".to_string(),
                    ));
                }
                let id = data.get_u8();
                Ok(PeerMessage::Extended {
                    id,
                    payload: data.to_vec(),
                })
            }
            _ => Err(DownpourError::ProtocolError(format!(
                "Unknown message ID: {}",
                message_id
            ))),
        }
    }

    fn read_block(data: &mut &[u8], kind: &str) -> Result<BlockInfo> {
        if data.len() < 12 {
            return Err(DownpourError::ProtocolError(format!(
                "Invalid {} message",
                kind
            )));
        }
        let piece_index = data.get_u32();
        let offset = data.get_u32();
        let length = data.get_u32();
        Ok(BlockInfo::new(piece_index, offset, length))
    }
}
