//! A BitTorrent peer-wire library: bencode, metainfo, UDP trackers, the
//! peer protocol with the metadata extension, and a piece-based download
//! engine on top of them.
//!
//! [`torrent::Torrent`] is the highest level entry point. It can be built
//! from a parsed [`metainfo::Metainfo`] or a [`magnet::Magnet`] link and
//! then driven with `download` and `seed`.

pub mod bencode;
pub mod bitfield;
pub mod cache;
pub mod config;
pub mod disk;
pub mod error;
pub mod extension;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod torrent;
pub mod tracker;
pub mod utils;
pub mod wire;
