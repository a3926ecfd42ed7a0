use speedy::{BigEndian, Readable, Writable};

use super::{action::Action, event::Event};
use crate::{
    error::Error,
    metainfo::{InfoHash, PeerId},
};

/// The 98-byte announce request of BEP 15.
#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Request {
    pub connection_id: u64,
    pub action: Action,
    pub transaction_id: u32,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub downloaded: u64,
    pub left: u64,
    pub uploaded: u64,
    pub event: Event,
    /// 0 means "use the address you see this packet from".
    pub ip_address: u32,
    pub key: u32,
    /// -1 leaves the peer count to the tracker's default.
    pub num_want: i32,
    pub port: u16,
}

impl Request {
    pub(crate) const LENGTH: usize = 98;

    pub fn new(
        connection_id: u64,
        info_hash: &InfoHash,
        peer_id: &PeerId,
        left: u64,
        port: u16,
        event: Event,
    ) -> Self {
        Self {
            connection_id,
            action: Action::Announce,
            transaction_id: rand::random::<u32>(),
            info_hash: info_hash.0,
            peer_id: peer_id.0,
            downloaded: 0,
            left,
            uploaded: 0,
            event,
            ip_address: 0,
            key: rand::random::<u32>(),
            num_want: -1,
            port,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let buf = self.write_to_vec_with_ctx(BigEndian {})?;
        debug_assert_eq!(buf.len(), Self::LENGTH);
        Ok(buf)
    }
}

/// The fixed 20-byte header of the announce response; the compact peer list
/// follows it in the same datagram.
#[derive(Debug, PartialEq, Writable, Readable)]
pub struct Response {
    pub action: Action,
    pub transaction_id: u32,
    pub interval: u32,
    pub leechers: u32,
    pub seeders: u32,
}

impl Response {
    pub(crate) const LENGTH: usize = 20;

    /// Split the datagram into the header and the trailing peer list.
    pub fn deserialize(buf: &[u8]) -> Result<(Self, &[u8]), Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerResponseLength);
        }

        let res =
            Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])?;

        Ok((res, &buf[Self::LENGTH..]))
    }
}
