use speedy::{BigEndian, Readable, Writable};

use super::action::Action;
use crate::error::Error;

/// The 16-byte packet opening every tracker conversation.
#[derive(Debug, PartialEq, Clone, Readable, Writable)]
pub struct Request {
    pub protocol_id: u64,
    pub action: Action,
    pub transaction_id: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self::new()
    }
}

impl Request {
    pub(crate) const LENGTH: usize = 16;
    const MAGIC: u64 = 0x41727101980;

    pub fn new() -> Self {
        Self {
            protocol_id: Self::MAGIC,
            action: Action::Connect,
            transaction_id: rand::random::<u32>(),
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let buf = self.write_to_vec_with_ctx(BigEndian {})?;
        debug_assert_eq!(buf.len(), Self::LENGTH);
        Ok(buf)
    }
}

#[derive(Debug, PartialEq, Readable, Writable)]
pub struct Response {
    pub action: Action,
    pub transaction_id: u32,
    pub connection_id: u64,
}

impl Response {
    pub(crate) const LENGTH: usize = 16;

    pub fn deserialize(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < Self::LENGTH {
            return Err(Error::TrackerResponseLength);
        }
        Ok(Self::read_from_buffer_with_ctx(BigEndian {}, &buf[..Self::LENGTH])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let req = Request {
            protocol_id: 0x41727101980,
            action: Action::Connect,
            transaction_id: 0xdeadbeef,
        };
        let raw = req.serialize().unwrap();
        assert_eq!(raw.len(), Request::LENGTH);
        assert_eq!(&raw[..8], &0x41727101980u64.to_be_bytes());
        assert_eq!(&raw[8..12], &[0, 0, 0, 0]);
        assert_eq!(&raw[12..], &0xdeadbeefu32.to_be_bytes());
    }

    #[test]
    fn response_roundtrip() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&0u32.to_be_bytes());
        raw.extend_from_slice(&0xdeadbeefu32.to_be_bytes());
        raw.extend_from_slice(&77u64.to_be_bytes());

        let res = Response::deserialize(&raw).unwrap();
        assert_eq!(res.action, Action::Connect);
        assert_eq!(res.transaction_id, 0xdeadbeef);
        assert_eq!(res.connection_id, 77);

        assert!(Response::deserialize(&raw[..10]).is_err());
    }
}
