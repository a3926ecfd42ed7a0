//! Coordination of one torrent: the piece work queues, the peer tasks that
//! drain them, tracker announces and seeding.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bitfield::SharedBitfield,
    cache::PieceCache,
    config::Config,
    disk::Storage,
    error::Error,
    magnet::Magnet,
    metainfo::{Info, InfoHash, Metainfo, PeerId},
    peer::{Session, SessionShared},
    tracker::{event::Event, Tracker},
    utils::to_human_readable,
    wire::Message,
};

/// How often failed pieces are put back at the head of the work queue.
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(5);
/// Backoff between accept attempts while at the peer ceiling.
const ACCEPT_THROTTLE: Duration = Duration::from_secs(5);
/// How long an idle peer task waits before checking the queue again.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Piece indices waiting to be downloaded, shared by every peer task.
#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<VecDeque<u32>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_back(&self, index: u32) {
        self.inner.lock().unwrap().push_back(index);
    }

    pub fn push_front(&self, index: u32) {
        self.inner.lock().unwrap().push_front(index);
    }

    pub fn pop(&self) -> Option<u32> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Move everything out, oldest first.
    pub fn drain(&self) -> Vec<u32> {
        self.inner.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

/// Everything a peer task needs, shared behind one Arc.
struct TorrentCtx {
    info_hash: InfoHash,
    peer_id: PeerId,
    info: Info,
    /// Raw bencoded info dictionary, served over the metadata extension.
    metadata: Arc<Vec<u8>>,
    storage: Arc<Storage>,
    bitfield: Arc<SharedBitfield>,
    cache: Arc<PieceCache>,
    work: WorkQueue,
    /// Pieces that a peer failed to deliver, periodically put back at the
    /// head of `work` so they are retried before fresh pieces.
    failed: WorkQueue,
    cancel: CancellationToken,
}

impl TorrentCtx {
    fn shared(&self) -> SessionShared {
        SessionShared {
            bitfield: self.bitfield.clone(),
            cache: Some(self.cache.clone()),
            metadata: Some(self.metadata.clone()),
        }
    }
}

/// One torrent being downloaded or seeded.
pub struct Torrent {
    ctx: Arc<TorrentCtx>,
    config: Config,
    trackers: Vec<String>,
    pub name: String,
}

impl Torrent {
    /// Open storage, rehash what is already on disk and queue the missing
    /// pieces.
    pub async fn new(
        info: Info,
        info_hash: InfoHash,
        trackers: Vec<String>,
        peer_id: PeerId,
        config: Config,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let storage =
            Arc::new(Storage::open(&config.download_dir, &info).await?);

        let bitfield = Arc::new(SharedBitfield::with_capacity(0));
        storage.rehash_into(&bitfield).await?;

        let work = WorkQueue::new();
        for index in 0..info.pieces_len() {
            if !bitfield.has_piece(index as usize) {
                work.push_back(index);
            }
        }

        info!(
            name = %info.name,
            size = %to_human_readable(info.total_size()),
            have = bitfield.count_ones(),
            missing = work.len(),
            "torrent ready"
        );

        let metadata = Arc::new(info.to_value().encode());
        let cache =
            Arc::new(PieceCache::new(storage.clone(), config.cache_pieces));
        let name = info.name.clone();

        Ok(Self {
            ctx: Arc::new(TorrentCtx {
                info_hash,
                peer_id,
                info,
                metadata,
                storage,
                bitfield,
                cache,
                work,
                failed: WorkQueue::new(),
                cancel,
            }),
            config,
            trackers,
            name,
        })
    }

    pub async fn from_metainfo(
        metainfo: Metainfo,
        config: Config,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        Self::new(
            metainfo.info,
            metainfo.info_hash,
            metainfo.announce_list,
            PeerId::generate(),
            config,
            cancel,
        )
        .await
    }

    /// Bootstrap from a magnet link: announce, fetch the info dictionary
    /// from a peer over the metadata extension, then proceed as usual.
    pub async fn from_magnet(
        magnet: &Magnet,
        config: Config,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let peer_id = PeerId::generate();
        let info =
            fetch_info(magnet, &peer_id, config.listen_port, &cancel).await?;

        Self::new(
            info,
            magnet.info_hash.clone(),
            magnet.trackers.clone(),
            peer_id,
            config,
            cancel,
        )
        .await
    }

    pub fn is_complete(&self) -> bool {
        self.ctx.bitfield.is_complete()
    }

    /// Bytes still missing, announced to the tracker.
    pub fn left(&self) -> u64 {
        (0..self.ctx.info.pieces_len())
            .filter(|&i| !self.ctx.bitfield.has_piece(i as usize))
            .map(|i| self.ctx.info.piece_size(i) as u64)
            .sum()
    }

    /// Announce to the first reachable tracker and download from the peers
    /// it hands out.
    pub async fn download(&self) -> Result<(), Error> {
        if self.is_complete() {
            info!(name = %self.name, "already complete");
            return Ok(());
        }

        let hosts = tracker_hosts(&self.trackers);
        let tracker = Tracker::connect(
            self.ctx.peer_id.clone(),
            hosts.iter().map(String::as_str),
        )
        .await?;

        let (_, peers) = tracker
            .announce(
                &self.ctx.info_hash,
                self.left(),
                self.config.listen_port,
                Event::Started,
            )
            .await?;
        info!(name = %self.name, peers = peers.len(), "starting download");

        let result = self.download_from(peers).await;

        if self.is_complete() {
            info!(name = %self.name, "download complete");
            let _ = tracker
                .announce(
                    &self.ctx.info_hash,
                    0,
                    self.config.listen_port,
                    Event::Completed,
                )
                .await;
        } else {
            let _ = tracker
                .announce(
                    &self.ctx.info_hash,
                    self.left(),
                    self.config.listen_port,
                    Event::Stopped,
                )
                .await;
        }

        result
    }

    /// Run peer tasks against the given addresses until the torrent is
    /// complete, cancelled, or out of peers.
    pub async fn download_from(
        &self,
        peers: Vec<SocketAddr>,
    ) -> Result<(), Error> {
        if self.is_complete() {
            return Ok(());
        }

        let mut tasks = JoinSet::new();
        for addr in peers.into_iter().take(self.config.max_peers) {
            let ctx = self.ctx.clone();
            tasks.spawn(async move {
                if let Err(e) = peer_task(ctx, addr).await {
                    debug!(%addr, "peer task ended: {e}");
                }
            });
        }
        if tasks.is_empty() {
            return Err(Error::NoPeers);
        }

        loop {
            if self.ctx.cancel.is_cancelled() || self.is_complete() {
                break;
            }
            tokio::select! {
                _ = sleep(SCHEDULER_INTERVAL) => self.requeue_failed(),
                joined = tasks.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
            }
        }

        // let the surviving tasks notice completion or cancellation
        self.requeue_failed();
        while tasks.join_next().await.is_some() {}

        if self.is_complete() || self.ctx.cancel.is_cancelled() {
            Ok(())
        } else {
            warn!(name = %self.name, missing = self.left(), "ran out of peers");
            Err(Error::NoPeers)
        }
    }

    /// Put failed pieces back at the head of the work queue, before any
    /// piece that has not been attempted yet.
    pub fn requeue_failed(&self) {
        let failed = self.ctx.failed.drain();
        for index in failed.into_iter().rev() {
            self.ctx.work.push_front(index);
        }
    }

    /// Accept inbound peers and serve them until cancelled.
    pub async fn seed(&self) -> Result<(), Error> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.config.listen_port)).await?;
        self.seed_on(listener).await
    }

    pub async fn seed_on(&self, listener: TcpListener) -> Result<(), Error> {
        info!(
            name = %self.name,
            addr = ?listener.local_addr().ok(),
            "seeding"
        );
        let mut tasks = JoinSet::new();

        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }

            if tasks.len() >= self.config.max_peers {
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => break,
                    _ = tasks.join_next() => {}
                    _ = sleep(ACCEPT_THROTTLE) => {}
                }
                continue;
            }

            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(%addr, "inbound peer");
                    let ctx = self.ctx.clone();
                    tasks.spawn(async move {
                        if let Err(e) = seed_task(ctx, stream).await {
                            debug!(%addr, "seed task ended: {e}");
                        }
                    });
                }
            }
        }

        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

/// Strip the scheme and any trailing path off udp tracker URLs, leaving the
/// `host:port` form the resolver takes.
fn tracker_hosts(urls: &[String]) -> Vec<String> {
    urls.iter()
        .filter_map(|u| u.strip_prefix("udp://"))
        .map(|u| match u.find('/') {
            Some(i) => u[..i].to_owned(),
            None => u.to_owned(),
        })
        .collect()
}

/// Fetch the info dictionary for a magnet link from the first peer that
/// supports the metadata extension.
async fn fetch_info(
    magnet: &Magnet,
    peer_id: &PeerId,
    port: u16,
    cancel: &CancellationToken,
) -> Result<Info, Error> {
    let addrs = magnet.tracker_addrs();
    let tracker = Tracker::connect(
        peer_id.clone(),
        addrs.iter().map(String::as_str),
    )
    .await?;

    // we know nothing about the torrent size yet
    let (_, peers) = tracker
        .announce(&magnet.info_hash, u64::MAX, port, Event::Started)
        .await?;
    info!(peers = peers.len(), "looking for metadata");

    for addr in peers {
        if cancel.is_cancelled() {
            return Err(Error::NoPeers);
        }

        let shared = SessionShared {
            bitfield: Arc::new(SharedBitfield::with_capacity(0)),
            cache: None,
            metadata: None,
        };

        let mut session =
            match Session::connect(addr, &magnet.info_hash, peer_id, shared)
                .await
            {
                Ok(s) => s,
                Err(e) => {
                    debug!(%addr, "could not connect: {e}");
                    continue;
                }
            };

        match session.fetch_metadata().await {
            Ok(bytes) => {
                // hashing the raw bytes proves they are the real dictionary
                let info = Info::from_bytes(&bytes, &magnet.info_hash)?;
                info!(name = %info.name, "got metadata from {addr}");
                return Ok(info);
            }
            Err(e) => {
                debug!(%addr, "metadata fetch failed: {e}");
            }
        }
    }

    Err(Error::NoPeers)
}

/// One outbound connection working the piece queue until it runs dry, the
/// peer misbehaves, or the peer turns out not to have what we need.
async fn peer_task(
    ctx: Arc<TorrentCtx>,
    addr: SocketAddr,
) -> Result<(), Error> {
    let mut session =
        Session::connect(addr, &ctx.info_hash, &ctx.peer_id, ctx.shared())
            .await?;
    session.advertise_bitfield().await?;

    loop {
        if ctx.cancel.is_cancelled() {
            return Ok(());
        }

        session.drain().await?;

        if session.state.peer_choking {
            session.interest().await?;
            session.wait_unchoke().await?;
        }

        let Some(index) = ctx.work.pop() else {
            if ctx.failed.is_empty() && ctx.bitfield.is_complete() {
                return Ok(());
            }
            // other tasks still own pieces, or failures wait for requeue
            sleep(IDLE_WAIT).await;
            continue;
        };

        if !session.peer_has_piece(index) {
            debug!(%addr, index, "peer lacks piece, requeueing");
            ctx.failed.push_back(index);
            return Ok(());
        }

        match fetch_piece(&ctx, &mut session, index).await {
            Ok(()) => {}
            // a bad hash costs the piece, not the session
            Err(Error::PieceInvalid) => ctx.failed.push_back(index),
            Err(e) => {
                ctx.failed.push_back(index);
                return Err(e);
            }
        }
    }
}

async fn fetch_piece(
    ctx: &TorrentCtx,
    session: &mut Session,
    index: u32,
) -> Result<(), Error> {
    let size = ctx.info.piece_size(index);
    let data = session.download_piece(index, size).await?;

    if !ctx.info.verify_piece(index, &data) {
        warn!(addr = %session.addr, index, "piece failed hash check");
        return Err(Error::PieceInvalid);
    }

    ctx.storage.write_piece(index, &data).await?;
    ctx.bitfield.set_piece(index as usize);
    ctx.cache.put(index, Bytes::from(data));
    session.send(Message::Have(index)).await?;

    debug!(
        index,
        have = ctx.bitfield.count_ones(),
        total = ctx.info.pieces_len(),
        "piece verified"
    );
    Ok(())
}

async fn seed_task(
    ctx: Arc<TorrentCtx>,
    stream: TcpStream,
) -> Result<(), Error> {
    let mut session =
        Session::accept(stream, &ctx.info_hash, &ctx.peer_id, ctx.shared())
            .await?;
    session.advertise_bitfield().await?;

    tokio::select! {
        _ = ctx.cancel.cancelled() => Ok(()),
        res = session.serve() => res,
    }
}
