//! The extension protocol (ext id 0) and the metadata extension riding on
//! it, which lets a peer download the info dictionary itself so that magnet
//! links can bootstrap without a .torrent file.

use std::collections::BTreeMap;

use crate::{bencode::Value, error::Error};

/// Metadata is exchanged in pieces of this fixed size; only the final piece
/// may be smaller.
pub const METADATA_PIECE_LEN: usize = 16384;

/// The extension message id we advertise for ut_metadata in our handshake.
pub const UT_METADATA_ID: u8 = 3;

/// The extension handshake, sent bencoded on ext id 0 right after the main
/// handshake. `m` maps extension names to the ids the sender listens on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionHandshake {
    /// The id the remote peer expects ut_metadata messages on, when the
    /// peer supports the extension at all.
    pub metadata_id: Option<u8>,
    /// Total size of the info dictionary in bytes.
    pub metadata_size: Option<u32>,
}

impl ExtensionHandshake {
    /// Our own handshake advertising ut_metadata, with the metadata size
    /// included once known (a seeder answering a magnet-only peer).
    pub fn ours(metadata_size: Option<u32>) -> Self {
        Self { metadata_id: Some(UT_METADATA_ID), metadata_size }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut m = BTreeMap::new();
        if let Some(id) = self.metadata_id {
            m.insert(b"ut_metadata".to_vec(), Value::Integer(id as i64));
        }

        let mut d = BTreeMap::new();
        d.insert(b"m".to_vec(), Value::Dictionary(m));
        if let Some(size) = self.metadata_size {
            d.insert(
                b"metadata_size".to_vec(),
                Value::Integer(size as i64),
            );
        }
        Value::Dictionary(d).encode()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let (v, _) = Value::decode(buf)?;

        let metadata_id = v
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(Value::as_int)
            .map(|id| id as u8);

        let metadata_size = v
            .get(b"metadata_size")
            .and_then(Value::as_int)
            .filter(|&n| n > 0)
            .map(|n| n as u32);

        Ok(Self { metadata_id, metadata_size })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

/// A ut_metadata message: a bencoded header, then for [`Data`] messages the
/// raw piece bytes appended right after the dictionary.
///
/// [`Data`]: MetadataMsgType::Data
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataMessage {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    /// Only present on data messages.
    pub total_size: Option<u32>,
    /// Raw metadata bytes of data messages, empty otherwise.
    pub payload: Vec<u8>,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Request,
            piece,
            total_size: None,
            payload: Vec::new(),
        }
    }

    pub fn data(piece: u32, total_size: u32, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MetadataMsgType::Data,
            piece,
            total_size: Some(total_size),
            payload,
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Reject,
            piece,
            total_size: None,
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut d = BTreeMap::new();
        d.insert(
            b"msg_type".to_vec(),
            Value::Integer(self.msg_type as u8 as i64),
        );
        d.insert(b"piece".to_vec(), Value::Integer(self.piece as i64));
        if let Some(size) = self.total_size {
            d.insert(b"total_size".to_vec(), Value::Integer(size as i64));
        }

        let mut out = Value::Dictionary(d).encode();
        out.extend_from_slice(&self.payload);
        out
    }

    /// The consumed byte count of the bencode decoder marks where the
    /// dictionary ends and the piece payload begins.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let (v, consumed) = Value::decode(buf)?;

        let msg_type = match v.get(b"msg_type").and_then(Value::as_int) {
            Some(0) => MetadataMsgType::Request,
            Some(1) => MetadataMsgType::Data,
            Some(2) => MetadataMsgType::Reject,
            _ => return Err(Error::MetadataInvalid),
        };

        let piece = v
            .get(b"piece")
            .and_then(Value::as_int)
            .filter(|&n| n >= 0)
            .ok_or(Error::MetadataInvalid)? as u32;

        let total_size = v
            .get(b"total_size")
            .and_then(Value::as_int)
            .map(|n| n as u32);

        let payload = buf[consumed..].to_vec();
        if msg_type != MetadataMsgType::Data && !payload.is_empty() {
            return Err(Error::MetadataInvalid);
        }

        Ok(Self { msg_type, piece, total_size, payload })
    }
}

/// How many metadata pieces a dictionary of `total_size` bytes spans.
pub fn metadata_piece_count(total_size: u32) -> u32 {
    (total_size as usize).div_ceil(METADATA_PIECE_LEN) as u32
}
