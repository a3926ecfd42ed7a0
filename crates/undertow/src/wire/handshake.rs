//! Codec for encoding and decoding handshakes.
//!
//! The handshake has a different structure than every later message and is
//! only exchanged once per connection, so it gets its own codec. After both
//! sides have shaken hands the codec is switched to
//! [`MessageCodec`](super::MessageCodec), keeping the underlying buffers.

use std::{io, io::Cursor};

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::{
    bitfield::Reserved,
    error::Error,
    metainfo::{InfoHash, PeerId},
};

/// The protocol string, preceded on the wire by its length (19).
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// The 68-byte message opening every connection. A peer whose protocol
/// string or info-hash differs from ours is disconnected on the spot.
#[derive(Clone, Debug, Writable, Readable)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub const LEN: usize = 68;

    pub fn new(info_hash: &InfoHash, peer_id: &PeerId) -> Self {
        Self {
            pstr_len: 19,
            pstr: PSTR,
            reserved: Reserved::supported().0,
            info_hash: info_hash.0,
            peer_id: peer_id.0,
        }
    }

    pub fn serialize(&self) -> Result<[u8; Self::LEN], Error> {
        let mut buf = [0u8; Self::LEN];
        let raw = self.write_to_vec_with_ctx(BigEndian {})?;
        buf.copy_from_slice(&raw);
        Ok(buf)
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, buf)?)
    }

    /// Whether `target` is a well-formed handshake for the same torrent.
    pub fn validate(&self, target: &Self) -> bool {
        if target.pstr_len != 19 || target.pstr != PSTR {
            warn!("handshake with wrong pstr, dropping connection");
            return false;
        }
        if self.info_hash != target.info_hash {
            warn!("handshake info_hash does not match ours");
            return false;
        }
        true
    }

    pub fn reserved(&self) -> Reserved {
        Reserved(self.reserved)
    }
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        let Handshake { pstr, reserved, info_hash, peer_id, .. } = handshake;

        buf.put_u8(pstr.len() as u8);
        buf.extend_from_slice(&pstr);
        buf.extend_from_slice(&reserved);
        buf.extend_from_slice(&info_hash);
        buf.extend_from_slice(&peer_id);

        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek at the length prefix without consuming, the rest of the
        // message may not have arrived yet
        let mut tmp_buf = Cursor::new(&buf);
        let prot_len = tmp_buf.get_u8() as usize;
        if prot_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "handshake must open with \"BitTorrent protocol\"",
            ));
        }

        let payload_len = prot_len + 8 + 20 + 20;
        if buf.remaining() > payload_len {
            buf.advance(1);
        } else {
            return Ok(None);
        }

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: prot_len as u8,
            pstr,
            reserved,
            info_hash,
            peer_id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_68_bytes() {
        let info_hash = InfoHash([5u8; 20]);
        let peer_id = PeerId([7u8; 20]);
        let hs = Handshake::new(&info_hash, &peer_id);

        assert_eq!(hs.pstr_len, 19);
        assert_eq!(hs.pstr, PSTR);

        let raw = hs.serialize().unwrap();
        assert_eq!(
            raw,
            [
                19, 66, 105, 116, 84, 111, 114, 114, 101, 110, 116, 32, 112,
                114, 111, 116, 111, 99, 111, 108, 0, 0, 0, 0, 0, 16, 0, 0, 5,
                5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 5, 7, 7,
                7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7, 7
            ]
        );

        let back = Handshake::deserialize(&raw).unwrap();
        assert!(hs.validate(&back));
        assert!(back.reserved().supports_extended());
    }

    #[test]
    fn rejects_wrong_pstr() {
        let mut buf = BytesMut::new();
        buf.put_u8(10);
        buf.extend_from_slice(&[0u8; 80]);
        assert!(HandshakeCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_foreign_info_hash() {
        let ours = Handshake::new(&InfoHash([1; 20]), &PeerId([2; 20]));
        let theirs = Handshake::new(&InfoHash([9; 20]), &PeerId([3; 20]));
        assert!(!ours.validate(&theirs));
    }

    #[test]
    fn partial_handshake_waits_for_more() {
        let hs = Handshake::new(&InfoHash([1; 20]), &PeerId([2; 20]));
        let raw = hs.serialize().unwrap();

        let mut buf = BytesMut::from(&raw[..40]);
        assert!(HandshakeCodec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&raw[40..]);
        let decoded = HandshakeCodec.decode(&mut buf).unwrap().unwrap();
        assert!(hs.validate(&decoded));
    }
}
