use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    Io(#[from] io::Error),

    #[error("Failed to decode bencode: {0}")]
    BencodeDecode(String),

    #[error("Invalid metainfo: {0}")]
    InvalidMetainfo(String),

    #[error("Error when reading magnet link")]
    MagnetLinkInvalid,

    #[error(
        "Your magnet does not have an info_hash, are you sure you copied \
         the entire magnet link?"
    )]
    MagnetNoInfoHash,

    #[error(
        "Your magnet does not have a UDP tracker, and this client does not \
         support DHT."
    )]
    MagnetNoTracker,

    #[error("The handshake received is not valid")]
    HandshakeInvalid,

    #[error("The peer took too long to send the handshake")]
    HandshakeTimeout,

    #[error("The peer closed the socket")]
    PeerClosedSocket,

    #[error("The peer choked us in the middle of a download")]
    PeerChoked,

    #[error("The message took too long to arrive")]
    MessageTimeout,

    #[error("Received a message id this client does not know about: {0}")]
    UnknownMessageId(u8),

    #[error("The response received from the peer is wrong")]
    MessageResponse,

    #[error("The peer took too long to respond")]
    Timeout,

    #[error("The peer does not support the metadata extension")]
    MetadataUnsupported,

    #[error("The metadata message could not be parsed")]
    MetadataInvalid,

    #[error("The piece downloaded does not have a valid hash")]
    PieceInvalid,

    #[error("Block range out of bounds for piece {0}")]
    BlockOutOfBounds(u32),

    #[error("Tracker resolved to no usable addresses")]
    TrackerNoHosts,

    #[error("The response received from the connect handshake was wrong")]
    TrackerResponse,

    #[error(
        "The response length received from the tracker was less than the \
         minimum, when it should be larger"
    )]
    TrackerResponseLength,

    #[error("The peer list returned by the announce request is not valid")]
    TrackerCompactPeerList,

    #[error("Error when serializing/deserializing")]
    Speedy(#[from] speedy::Error),

    #[error("Error while trying to load configuration: {0}")]
    Config(String),

    #[error("No peers in the torrent")]
    NoPeers,
}
