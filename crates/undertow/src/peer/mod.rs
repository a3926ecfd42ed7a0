//! A connection to one remote peer: handshake, choke/interest state, block
//! transfer and the metadata extension.

pub mod piece;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, BitfieldExt, SharedBitfield},
    cache::PieceCache,
    error::Error,
    extension::{
        metadata_piece_count, ExtensionHandshake, MetadataMessage,
        MetadataMsgType, METADATA_PIECE_LEN, UT_METADATA_ID,
    },
    metainfo::{InfoHash, PeerId},
    wire::{Block, Handshake, HandshakeCodec, Message, MessageCodec},
};

use piece::PieceInFlight;

/// Dial timeout for outbound connections. Unresponsive peers are plentiful,
/// there is no point waiting on any single one.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout per read while draining queued messages; hitting it just means
/// the peer has nothing more to say right now.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout per read while an answer is owed; hitting it is an error.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle gap after which a keep-alive is sent on serving connections.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Choke and interest flags of both sides of the connection. Connections
/// start out choked and uninterested in both directions.
#[derive(Debug, Clone)]
pub struct State {
    /// We do not let the peer download from us.
    pub am_choking: bool,
    /// The peer has pieces we want.
    pub am_interested: bool,
    /// The peer does not let us download from them.
    pub peer_choking: bool,
    /// The peer wants pieces we have.
    pub peer_interested: bool,
}

impl Default for State {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Torrent-side resources a session serves uploads from. For a magnet
/// session that is still fetching metadata, only the bitfield exists.
#[derive(Debug, Clone)]
pub struct SessionShared {
    pub bitfield: Arc<SharedBitfield>,
    /// The piece store, absent until storage is provisioned.
    pub cache: Option<Arc<PieceCache>>,
    /// Raw info-dictionary bytes, served to metadata requests.
    pub metadata: Option<Arc<Vec<u8>>>,
}

impl SessionShared {
    pub fn metadata_size(&self) -> Option<u32> {
        self.metadata.as_ref().map(|m| m.len() as u32)
    }
}

/// An established, handshaked connection to one peer.
#[derive(Debug)]
pub struct Session {
    socket: Framed<TcpStream, MessageCodec>,
    pub addr: SocketAddr,
    pub direction: Direction,
    pub remote_id: PeerId,
    pub state: State,
    /// What the peer advertised having, from `bitfield` and `have`.
    pub peer_bitfield: Bitfield,
    /// The peer's extension handshake, once received.
    pub peer_ext: ExtensionHandshake,
    peer_supports_extended: bool,
    shared: SessionShared,
    /// The piece currently being downloaded from this peer, if any.
    in_flight: Option<PieceInFlight>,
}

impl Session {
    /// Dial `addr` and run the handshake as the connecting side.
    pub async fn connect(
        addr: SocketAddr,
        info_hash: &InfoHash,
        peer_id: &PeerId,
        shared: SessionShared,
    ) -> Result<Self, Error> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;

        Self::handshake(stream, Direction::Outbound, info_hash, peer_id, shared)
            .await
    }

    /// Run the handshake over an already accepted connection.
    pub async fn accept(
        stream: TcpStream,
        info_hash: &InfoHash,
        peer_id: &PeerId,
        shared: SessionShared,
    ) -> Result<Self, Error> {
        Self::handshake(stream, Direction::Inbound, info_hash, peer_id, shared)
            .await
    }

    async fn handshake(
        stream: TcpStream,
        direction: Direction,
        info_hash: &InfoHash,
        peer_id: &PeerId,
        shared: SessionShared,
    ) -> Result<Self, Error> {
        let addr = stream.peer_addr()?;
        let mut socket = Framed::new(stream, HandshakeCodec);

        let our_handshake = Handshake::new(info_hash, peer_id);

        // the connecting side speaks first
        if direction == Direction::Outbound {
            debug!(%addr, "sending the first handshake");
            socket.send(our_handshake.clone()).await?;
        }

        let their_handshake =
            match timeout(HANDSHAKE_TIMEOUT, socket.next()).await {
                Err(_) => return Err(Error::HandshakeTimeout),
                Ok(None) => return Err(Error::PeerClosedSocket),
                Ok(Some(hs)) => hs?,
            };

        if !our_handshake.validate(&their_handshake) {
            return Err(Error::HandshakeInvalid);
        }

        if direction == Direction::Inbound {
            debug!(%addr, "sending the second handshake");
            socket.send(our_handshake).await?;
        }

        // swap to the message codec, keeping whatever the peer already sent
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);

        let peer_supports_extended =
            their_handshake.reserved().supports_extended();

        let mut session = Self {
            socket,
            addr,
            direction,
            remote_id: PeerId(their_handshake.peer_id),
            state: State::default(),
            peer_bitfield: Bitfield::new(),
            peer_ext: ExtensionHandshake::default(),
            peer_supports_extended,
            shared,
            in_flight: None,
        };

        if peer_supports_extended {
            debug!(%addr, "sending extension handshake");
            let hs =
                ExtensionHandshake::ours(session.shared.metadata_size());
            session.send(Message::Extended(0, hs.to_bytes())).await?;
        }

        Ok(session)
    }

    pub fn supports_extended(&self) -> bool {
        self.peer_supports_extended
    }

    pub fn peer_has_piece(&self, index: u32) -> bool {
        self.peer_bitfield.has_piece(index as usize)
    }

    pub async fn send(&mut self, msg: Message) -> Result<(), Error> {
        self.socket.send(msg).await
    }

    /// Advertise our completion bitfield, sent as the first message after
    /// the handshake when we have anything at all.
    pub async fn advertise_bitfield(&mut self) -> Result<(), Error> {
        if !self.shared.bitfield.is_empty() {
            let bf = Bitfield::from_vec(self.shared.bitfield.to_bytes());
            self.send(Message::Bitfield(bf)).await?;
        }
        Ok(())
    }

    /// One read with a timeout. `Ok(None)` means the timer fired, which is
    /// only an error when a response is owed.
    async fn recv(
        &mut self,
        dur: Duration,
    ) -> Result<Option<Message>, Error> {
        match timeout(dur, self.socket.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(Error::PeerClosedSocket),
            Ok(Some(msg)) => Ok(Some(msg?)),
        }
    }

    /// Handle everything the peer has queued up, returning once the line
    /// goes quiet.
    pub async fn drain(&mut self) -> Result<(), Error> {
        while let Some(msg) = self.recv(DRAIN_TIMEOUT).await? {
            self.handle_message(msg).await?;
        }
        Ok(())
    }

    /// Declare interest and unchoke the peer, the prelude to downloading.
    pub async fn interest(&mut self) -> Result<(), Error> {
        self.state.am_interested = true;
        self.state.am_choking = false;
        self.send(Message::Interested).await?;
        self.send(Message::Unchoke).await?;
        Ok(())
    }

    /// Block until the peer unchokes us.
    pub async fn wait_unchoke(&mut self) -> Result<(), Error> {
        while self.state.peer_choking {
            match self.recv(RESPONSE_TIMEOUT).await? {
                None => return Err(Error::MessageTimeout),
                Some(msg) => self.handle_message(msg).await?,
            }
        }
        Ok(())
    }

    /// Download one whole piece with a pipeline of block requests, keeping
    /// [`piece::MAX_PIPELINED_REQUESTS`] outstanding.
    pub async fn download_piece(
        &mut self,
        index: u32,
        size: u32,
    ) -> Result<Vec<u8>, Error> {
        debug!(addr = %self.addr, index, size, "downloading piece");
        self.in_flight = Some(PieceInFlight::new(index, size));
        let result = self.download_piece_inner().await;
        let piece = self.in_flight.take();

        match result {
            Ok(()) => {
                let piece = piece.ok_or(Error::MessageResponse)?;
                Ok(piece.into_bytes())
            }
            Err(e) => Err(e),
        }
    }

    async fn download_piece_inner(&mut self) -> Result<(), Error> {
        self.fill_pipeline().await?;

        loop {
            match &self.in_flight {
                Some(p) if !p.is_complete() => {}
                _ => return Ok(()),
            }

            match self.recv(RESPONSE_TIMEOUT).await? {
                None => return Err(Error::MessageTimeout),
                Some(msg) => self.handle_message(msg).await?,
            }

            if self.state.peer_choking {
                warn!(addr = %self.addr, "choked mid-piece");
                return Err(Error::PeerChoked);
            }

            self.fill_pipeline().await?;
        }
    }

    async fn fill_pipeline(&mut self) -> Result<(), Error> {
        loop {
            let Some(piece) = self.in_flight.as_mut() else { break };
            let Some(info) = piece.next_request() else { break };
            self.socket.send(Message::Request(info)).await?;
        }
        Ok(())
    }

    /// Fetch the whole info dictionary over the metadata extension,
    /// requesting its pieces strictly in order.
    pub async fn fetch_metadata(&mut self) -> Result<Vec<u8>, Error> {
        if !self.peer_supports_extended {
            return Err(Error::MetadataUnsupported);
        }

        // their extension handshake carries the id and total size we need
        while self.peer_ext.metadata_id.is_none() {
            match self.recv(RESPONSE_TIMEOUT).await? {
                None => return Err(Error::MetadataUnsupported),
                Some(msg) => self.handle_message(msg).await?,
            }
        }

        let their_id =
            self.peer_ext.metadata_id.ok_or(Error::MetadataUnsupported)?;
        let total = self
            .peer_ext
            .metadata_size
            .ok_or(Error::MetadataUnsupported)?;
        let count = metadata_piece_count(total);
        debug!(addr = %self.addr, total, count, "fetching metadata");

        let mut metadata = Vec::with_capacity(total as usize);

        for piece in 0..count {
            let req = MetadataMessage::request(piece);
            self.send(Message::Extended(their_id, req.to_bytes())).await?;

            loop {
                let msg = match self.recv(RESPONSE_TIMEOUT).await? {
                    None => return Err(Error::MessageTimeout),
                    Some(msg) => msg,
                };

                // data messages come back addressed to the id we advertised
                let payload = match msg {
                    Message::Extended(UT_METADATA_ID, payload) => payload,
                    other => {
                        self.handle_message(other).await?;
                        continue;
                    }
                };

                let res = MetadataMessage::from_bytes(&payload)?;
                match res.msg_type {
                    MetadataMsgType::Data if res.piece == piece => {
                        let expected_len = if piece + 1 == count {
                            total as usize
                                - piece as usize * METADATA_PIECE_LEN
                        } else {
                            METADATA_PIECE_LEN
                        };
                        if res.payload.len() != expected_len {
                            return Err(Error::MetadataInvalid);
                        }
                        metadata.extend_from_slice(&res.payload);
                        break;
                    }
                    MetadataMsgType::Reject => {
                        return Err(Error::MetadataUnsupported);
                    }
                    _ => return Err(Error::MetadataInvalid),
                }
            }
        }

        if metadata.len() != total as usize {
            return Err(Error::MetadataInvalid);
        }

        Ok(metadata)
    }

    /// Serve the peer until they hang up, answering requests and sending
    /// keep-alives through idle stretches.
    pub async fn serve(&mut self) -> Result<(), Error> {
        loop {
            match self.recv(KEEPALIVE_INTERVAL).await? {
                None => self.send(Message::KeepAlive).await?,
                Some(msg) => self.handle_message(msg).await?,
            }
        }
    }

    async fn handle_message(&mut self, msg: Message) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                debug!(addr = %self.addr, "< keepalive");
            }
            Message::Choke => {
                debug!(addr = %self.addr, "< choke");
                self.state.peer_choking = true;
            }
            Message::Unchoke => {
                debug!(addr = %self.addr, "< unchoke");
                self.state.peer_choking = false;
            }
            Message::Interested => {
                debug!(addr = %self.addr, "< interested");
                self.state.peer_interested = true;
                // every interested peer is unchoked, no admission control
                if self.state.am_choking {
                    self.state.am_choking = false;
                    self.send(Message::Unchoke).await?;
                }
            }
            Message::NotInterested => {
                debug!(addr = %self.addr, "< not_interested");
                self.state.peer_interested = false;
            }
            Message::Have(index) => {
                debug!(addr = %self.addr, index, "< have");
                if self.peer_bitfield.len() <= index as usize {
                    self.peer_bitfield.resize(index as usize + 1, false);
                }
                self.peer_bitfield.set_piece(index as usize);
            }
            Message::Bitfield(bitfield) => {
                debug!(
                    addr = %self.addr,
                    len = bitfield.len(),
                    ones = bitfield.count_ones(),
                    "< bitfield"
                );
                self.peer_bitfield = bitfield;
            }
            Message::Request(info) => {
                self.handle_request(info).await?;
            }
            Message::Piece(block) => {
                debug!(
                    addr = %self.addr,
                    index = block.index,
                    begin = block.begin,
                    len = block.block.len(),
                    "< piece"
                );
                match self.in_flight.as_mut() {
                    Some(piece) => piece.record(&block)?,
                    None => {
                        debug!(addr = %self.addr, "unsolicited block, dropping")
                    }
                }
            }
            Message::Cancel(info) => {
                // requests are answered synchronously, nothing to cancel
                debug!(addr = %self.addr, ?info, "< cancel");
            }
            Message::Extended(0, payload) => {
                self.peer_ext = ExtensionHandshake::from_bytes(&payload)?;
                debug!(addr = %self.addr, ext = ?self.peer_ext, "< extension handshake");
            }
            Message::Extended(UT_METADATA_ID, payload) => {
                let msg = MetadataMessage::from_bytes(&payload)?;
                self.handle_metadata_request(msg).await?;
            }
            Message::Extended(id, _) => {
                debug!(addr = %self.addr, id, "< unknown extension, ignoring");
            }
        }
        Ok(())
    }

    /// Answer a block request out of the piece store.
    async fn handle_request(
        &mut self,
        info: crate::wire::BlockInfo,
    ) -> Result<(), Error> {
        debug!(addr = %self.addr, ?info, "< request");

        if self.state.am_choking {
            return Ok(());
        }
        let Some(cache) = self.shared.cache.clone() else {
            return Ok(());
        };
        if !self.shared.bitfield.has_piece(info.index as usize) {
            debug!(addr = %self.addr, index = info.index, "requested piece we lack");
            return Ok(());
        }

        let block = cache.block(info.index, info.begin, info.len).await?;

        self.send(Message::Piece(Block {
            index: info.index,
            begin: info.begin,
            block: block.to_vec(),
        }))
        .await
    }

    /// Serve metadata pieces to a peer bootstrapping from a magnet link.
    async fn handle_metadata_request(
        &mut self,
        msg: MetadataMessage,
    ) -> Result<(), Error> {
        if msg.msg_type != MetadataMsgType::Request {
            debug!(addr = %self.addr, msg_type = ?msg.msg_type, "unsolicited metadata message");
            return Ok(());
        }

        // responses go out on the id the peer advertised
        let Some(their_id) = self.peer_ext.metadata_id else {
            return Ok(());
        };

        let reply = match &self.shared.metadata {
            Some(meta) => {
                let start = msg.piece as usize * METADATA_PIECE_LEN;
                if start >= meta.len() {
                    MetadataMessage::reject(msg.piece)
                } else {
                    let end = (start + METADATA_PIECE_LEN).min(meta.len());
                    MetadataMessage::data(
                        msg.piece,
                        meta.len() as u32,
                        meta[start..end].to_vec(),
                    )
                }
            }
            None => MetadataMessage::reject(msg.piece),
        };

        self.send(Message::Extended(their_id, reply.to_bytes())).await
    }
}
