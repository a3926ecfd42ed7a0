//! The peer wire protocol: every length-prefixed message exchanged after a
//! successful handshake, and the codec that frames them over TCP.

mod handshake;

pub use handshake::{Handshake, HandshakeCodec, PSTR};

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{bitfield::Bitfield, error::Error};

/// Blocks are transferred in chunks of this size, the last block of a piece
/// possibly excepted. Nearly every client in the wild rejects other sizes.
pub const BLOCK_LEN: u32 = 16384;

/// Ceiling on a single message's declared length, against hostile peers.
pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;

/// Metadata of a block, the payload of `request` and `cancel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// The index of the piece the block belongs to.
    pub index: u32,
    /// Byte offset of the block within its piece.
    pub begin: u32,
    /// Length of the block in bytes.
    pub len: u32,
}

impl BlockInfo {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}

/// A block of actual data, the payload of `piece`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub block: Vec<u8>,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            index: self.index,
            begin: self.begin,
            len: self.block.len() as u32,
        }
    }
}

/// Messages of the vanilla protocol plus the extension envelope (id 20).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// Extension id as negotiated in the extension handshake, then the raw
    /// (usually bencoded) payload.
    Extended(u8, Vec<u8>),
}

/// The ids of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        Ok(match value {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Piece,
            8 => Cancel,
            20 => Extended,
            id => return Err(Error::UnknownMessageId(id)),
        })
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                buf.put_u32(piece_index);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let v = bitfield.into_vec();
                buf.put_u32(1 + v.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&v);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(Block { index, begin, block }) => {
                buf.put_u32(1 + 4 + 4 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put(&block[..]);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block.encode(buf);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Message::Extended(ext_id, payload) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the length header must be present at the minimum
        if buf.len() < 4 {
            return Ok(None);
        }

        // peek at the length prefix without consuming
        let size =
            u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if size == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if size > MAX_MESSAGE_SIZE {
            return Err(Error::MessageResponse);
        }

        // a message larger than the MTU arrives in several reads; wait
        // without advancing the cursor until the frame is complete
        if buf.len() < 4 + size {
            if buf.capacity() < size {
                buf.reserve((size + 4) - buf.capacity());
            }
            return Ok(None);
        }

        buf.advance(4);
        let msg_id = MessageId::try_from(buf.get_u8())?;

        // declared lengths below the fixed part of each message would make
        // the payload math underflow
        let min_size = match msg_id {
            MessageId::Have => 5,
            MessageId::Piece => 9,
            MessageId::Request | MessageId::Cancel => 13,
            MessageId::Extended => 2,
            _ => 1,
        };
        if size < min_size {
            return Err(Error::MessageResponse);
        }

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(buf.get_u32()),
            MessageId::Bitfield => {
                let bitfield = buf.copy_to_bytes(size - 1).to_vec();
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                // size minus msg_id, index and begin
                let block = buf.copy_to_bytes(size - 9).to_vec();
                Message::Piece(Block { index, begin, block })
            }
            MessageId::Cancel => {
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
            MessageId::Extended => {
                let ext_id = buf.get_u8();
                let payload = buf.copy_to_bytes(size - 2).to_vec();
                Message::Extended(ext_id, payload)
            }
        };

        Ok(Some(msg))
    }
}
