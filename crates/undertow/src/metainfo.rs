//! Torrent metainfo (.torrent) parsing and the identity newtypes used all
//! over the protocol.

use std::fmt;

use rand::{distributions::Alphanumeric, Rng};
use sha1_smol::Sha1;

use crate::{
    bencode::Value,
    error::Error,
};

/// SHA-1 of the bencoded info dictionary, the identity of a torrent.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 20] =
            value.try_into().map_err(|_| Error::MagnetNoInfoHash)?;
        Ok(Self(arr))
    }
}

/// The 20-byte identity this client presents to peers and trackers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Azureus-style id: a fixed client prefix and 12 random
    /// alphanumeric bytes.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-UW0001-");
        for (dst, c) in
            id[8..].iter_mut().zip(rand::thread_rng().sample_iter(Alphanumeric))
        {
            *dst = c;
        }
        Self(id)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", String::from_utf8_lossy(&self.0))
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// One file of a multi-file torrent. `path` components are joined below the
/// torrent's root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub path: Vec<String>,
}

/// The info dictionary, the part of the metainfo covered by the info-hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    /// Nominal piece size. Every piece but possibly the last has this length.
    pub piece_length: u32,
    /// Concatenated 20-byte SHA-1 digests, one per piece.
    pub pieces: Vec<u8>,
    /// Single-file torrents carry `length`, multi-file carry `files`.
    pub files: Vec<FileEntry>,
}

impl Info {
    /// Parse the info dictionary out of a bencoded [`Value`].
    pub fn from_value(v: &Value) -> Result<Self, Error> {
        let dict = v.as_dict().ok_or_else(|| {
            Error::InvalidMetainfo("info is not a dictionary".into())
        })?;

        let name = v
            .get(b"name")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMetainfo("missing name".into()))?
            .to_owned();

        let piece_length = v
            .get(b"piece length")
            .and_then(Value::as_int)
            .filter(|&n| n > 0)
            .ok_or_else(|| {
                Error::InvalidMetainfo("missing piece length".into())
            })? as u32;

        let pieces = v
            .get(b"pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| Error::InvalidMetainfo("missing pieces".into()))?
            .to_vec();

        if pieces.is_empty() || pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo(format!(
                "pieces length {} is not a multiple of 20",
                pieces.len()
            )));
        }

        let files = match (dict.get(&b"length"[..]), dict.get(&b"files"[..]))
        {
            (Some(len), None) => {
                let length = len.as_int().filter(|&n| n >= 0).ok_or_else(
                    || Error::InvalidMetainfo("invalid length".into()),
                )? as u64;
                vec![FileEntry { length, path: vec![name.clone()] }]
            }
            (None, Some(files)) => {
                let list = files.as_list().ok_or_else(|| {
                    Error::InvalidMetainfo("files is not a list".into())
                })?;
                let mut entries = Vec::with_capacity(list.len());
                for f in list {
                    entries.push(FileEntry::from_value(f)?);
                }
                if entries.is_empty() {
                    return Err(Error::InvalidMetainfo(
                        "empty files list".into(),
                    ));
                }
                entries
            }
            _ => {
                return Err(Error::InvalidMetainfo(
                    "info must have exactly one of length or files".into(),
                ))
            }
        };

        Ok(Self { name, piece_length, pieces, files })
    }

    /// Parse and validate raw info-dictionary bytes (as fetched over the
    /// metadata extension), checking them against the expected info-hash.
    pub fn from_bytes(
        buf: &[u8],
        expected: &InfoHash,
    ) -> Result<Self, Error> {
        let hash = Sha1::from(buf).digest().bytes();
        if hash != expected.0 {
            return Err(Error::MetadataInvalid);
        }
        let (v, _) = Value::decode(buf)?;
        Self::from_value(&v)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn pieces_len(&self) -> u32 {
        (self.pieces.len() / 20) as u32
    }

    /// Actual length of piece `index`. Only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        let total = self.total_size();
        let begin = index as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(total);
        (end - begin) as u32
    }

    pub fn piece_hash(&self, index: u32) -> Option<&[u8]> {
        let start = index as usize * 20;
        self.pieces.get(start..start + 20)
    }

    /// SHA-1 of piece data matches the digest recorded in the metainfo.
    pub fn verify_piece(&self, index: u32, data: &[u8]) -> bool {
        let Some(expected) = self.piece_hash(index) else { return false };
        Sha1::from(data).digest().bytes() == expected
    }

    pub fn is_single_file(&self) -> bool {
        self.files.len() == 1 && self.files[0].path == [self.name.clone()]
    }

    /// Re-encode the canonical bencoded form of this dictionary.
    pub fn to_value(&self) -> Value {
        let mut d = std::collections::BTreeMap::new();
        d.insert(b"name".to_vec(), Value::from(self.name.as_str()));
        d.insert(
            b"piece length".to_vec(),
            Value::Integer(self.piece_length as i64),
        );
        d.insert(b"pieces".to_vec(), Value::from(self.pieces.clone()));
        if self.is_single_file() {
            d.insert(
                b"length".to_vec(),
                Value::Integer(self.files[0].length as i64),
            );
        } else {
            let files = self
                .files
                .iter()
                .map(|f| {
                    let mut fd = std::collections::BTreeMap::new();
                    fd.insert(
                        b"length".to_vec(),
                        Value::Integer(f.length as i64),
                    );
                    fd.insert(
                        b"path".to_vec(),
                        Value::List(
                            f.path
                                .iter()
                                .map(|p| Value::from(p.as_str()))
                                .collect(),
                        ),
                    );
                    Value::Dictionary(fd)
                })
                .collect();
            d.insert(b"files".to_vec(), Value::List(files));
        }
        Value::Dictionary(d)
    }

    pub fn info_hash(&self) -> InfoHash {
        InfoHash(Sha1::from(self.to_value().encode()).digest().bytes())
    }
}

impl FileEntry {
    fn from_value(v: &Value) -> Result<Self, Error> {
        let length = v
            .get(b"length")
            .and_then(Value::as_int)
            .filter(|&n| n >= 0)
            .ok_or_else(|| {
                Error::InvalidMetainfo("file missing length".into())
            })? as u64;

        let path = v
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or_else(|| {
                Error::InvalidMetainfo("file missing path".into())
            })?
            .iter()
            .map(|p| {
                p.as_str().map(str::to_owned).ok_or_else(|| {
                    Error::InvalidMetainfo("non-utf8 path component".into())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if path.is_empty() {
            return Err(Error::InvalidMetainfo("empty file path".into()));
        }

        Ok(Self { length, path })
    }
}

/// A parsed .torrent file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub announce: String,
    pub announce_list: Vec<String>,
    pub info: Info,
    pub info_hash: InfoHash,
}

impl Metainfo {
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let (v, _) = Value::decode(buf)?;

        let announce = v
            .get(b"announce")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMetainfo("missing announce".into()))?
            .to_owned();

        // announce-list is tiered (a list of lists), flattened here since
        // trackers are tried in order anyway
        let mut announce_list = Vec::new();
        if let Some(tiers) = v.get(b"announce-list").and_then(Value::as_list)
        {
            for tier in tiers {
                for url in tier.as_list().unwrap_or_default() {
                    if let Some(s) = url.as_str() {
                        announce_list.push(s.to_owned());
                    }
                }
            }
        }
        if announce_list.is_empty() {
            announce_list.push(announce.clone());
        }

        let info_value = v
            .get(b"info")
            .ok_or_else(|| Error::InvalidMetainfo("missing info".into()))?;
        let info = Info::from_value(info_value)?;

        // hash the canonical re-encoding; valid torrents are already in
        // canonical form so the bytes are identical to the source
        let info_hash =
            InfoHash(Sha1::from(info_value.encode()).digest().bytes());

        Ok(Self { announce, announce_list, info, info_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent() -> Vec<u8> {
        let mut info = std::collections::BTreeMap::new();
        info.insert(b"name".to_vec(), Value::from("debian.iso"));
        info.insert(b"piece length".to_vec(), Value::Integer(32768));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0xab; 60]));
        info.insert(b"length".to_vec(), Value::Integer(81920));

        let mut top = std::collections::BTreeMap::new();
        top.insert(
            b"announce".to_vec(),
            Value::from("udp://tracker.example.org:6969"),
        );
        top.insert(b"info".to_vec(), Value::Dictionary(info));
        Value::Dictionary(top).encode()
    }

    #[test]
    fn parse_single_file() {
        let m = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(m.announce, "udp://tracker.example.org:6969");
        assert_eq!(m.info.name, "debian.iso");
        assert_eq!(m.info.piece_length, 32768);
        assert_eq!(m.info.pieces_len(), 3);
        assert_eq!(m.info.total_size(), 81920);
        assert!(m.info.is_single_file());
        assert_eq!(m.info.files[0].path, vec!["debian.iso".to_string()]);
    }

    #[test]
    fn last_piece_is_short() {
        let m = Metainfo::from_bytes(&single_file_torrent()).unwrap();
        assert_eq!(m.info.piece_size(0), 32768);
        assert_eq!(m.info.piece_size(1), 32768);
        // 81920 - 2 * 32768
        assert_eq!(m.info.piece_size(2), 16384);
    }

    #[test]
    fn info_hash_matches_source_bytes() {
        let buf = single_file_torrent();
        let m = Metainfo::from_bytes(&buf).unwrap();

        let (v, _) = Value::decode(&buf).unwrap();
        let info_bytes = v.get(b"info").unwrap().encode();
        let expected = Sha1::from(&info_bytes).digest().bytes();

        assert_eq!(m.info_hash.0, expected);
        assert_eq!(m.info.info_hash(), m.info_hash);
    }

    #[test]
    fn multi_file_sizes() {
        let mut f1 = std::collections::BTreeMap::new();
        f1.insert(b"length".to_vec(), Value::Integer(100));
        f1.insert(
            b"path".to_vec(),
            Value::List(vec![Value::from("a"), Value::from("b.txt")]),
        );
        let mut f2 = std::collections::BTreeMap::new();
        f2.insert(b"length".to_vec(), Value::Integer(50));
        f2.insert(b"path".to_vec(), Value::List(vec![Value::from("c.txt")]));

        let mut info = std::collections::BTreeMap::new();
        info.insert(b"name".to_vec(), Value::from("pack"));
        info.insert(b"piece length".to_vec(), Value::Integer(64));
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0; 60]));
        info.insert(
            b"files".to_vec(),
            Value::List(vec![
                Value::Dictionary(f1),
                Value::Dictionary(f2),
            ]),
        );

        let info = Info::from_value(&Value::Dictionary(info)).unwrap();
        assert_eq!(info.total_size(), 150);
        assert!(!info.is_single_file());
        assert_eq!(info.files[0].path, vec!["a", "b.txt"]);
        // 150 bytes in 64-byte pieces: 64, 64, 22
        assert_eq!(info.piece_size(2), 22);
    }

    #[test]
    fn rejects_malformed_info() {
        let mut info = std::collections::BTreeMap::new();
        info.insert(b"name".to_vec(), Value::from("x"));
        info.insert(b"piece length".to_vec(), Value::Integer(64));
        // 30 bytes is not a whole number of SHA-1 digests
        info.insert(b"pieces".to_vec(), Value::ByteString(vec![0; 30]));
        info.insert(b"length".to_vec(), Value::Integer(10));
        assert!(Info::from_value(&Value::Dictionary(info)).is_err());
    }

    #[test]
    fn metadata_bytes_must_match_hash() {
        let buf = single_file_torrent();
        let (v, _) = Value::decode(&buf).unwrap();
        let info_bytes = v.get(b"info").unwrap().encode();
        let hash =
            InfoHash(Sha1::from(&info_bytes).digest().bytes());

        assert!(Info::from_bytes(&info_bytes, &hash).is_ok());
        assert!(matches!(
            Info::from_bytes(&info_bytes, &InfoHash([0; 20])),
            Err(Error::MetadataInvalid)
        ));
    }

    #[test]
    fn peer_id_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.0[..8], b"-UW0001-");
        assert!(id.0[8..].iter().all(|b| b.is_ascii_alphanumeric()));
    }
}
