//! UDP tracker protocol of BEP 15: a connect handshake followed by
//! announce exchanges over the same socket.

pub mod action;
pub mod announce;
pub mod connect;
pub mod event;

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use tokio::{net::UdpSocket, time::timeout};
use tracing::{debug, warn};

use crate::{
    error::Error,
    metainfo::{InfoHash, PeerId},
};

use action::Action;
use event::Event;

/// A connected UDP tracker. The connection id obtained during [`connect`]
/// authenticates every later announce on this socket.
///
/// [`connect`]: Tracker::connect
#[derive(Debug)]
pub struct Tracker {
    socket: UdpSocket,
    pub tracker_addr: SocketAddr,
    pub peer_id: PeerId,
    connection_id: u64,
}

impl Tracker {
    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(10);
    const ANNOUNCE_RES_BUF_LEN: usize = 8192;

    /// Try each `host:port` in order and return a tracker for the first
    /// address that completes the connect handshake.
    pub async fn connect<'a, I>(
        peer_id: PeerId,
        addrs: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = &'a str>,
    {
        for addr in addrs {
            let resolved = match tokio::net::lookup_host(addr).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(addr, "tracker did not resolve: {e}");
                    continue;
                }
            };

            for tracker_addr in resolved {
                match Self::connect_exchange(tracker_addr).await {
                    Ok((socket, connection_id)) => {
                        debug!(%tracker_addr, "connected to tracker");
                        return Ok(Self {
                            socket,
                            tracker_addr,
                            peer_id: peer_id.clone(),
                            connection_id,
                        });
                    }
                    Err(e) => {
                        warn!(%tracker_addr, "tracker handshake failed: {e}");
                    }
                }
            }
        }

        Err(Error::TrackerNoHosts)
    }

    async fn connect_exchange(
        tracker_addr: SocketAddr,
    ) -> Result<(UdpSocket, u64), Error> {
        let bind_addr: SocketAddr = match tracker_addr {
            SocketAddr::V4(_) => {
                (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into()
            }
            SocketAddr::V6(_) => {
                (IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0).into()
            }
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(tracker_addr).await?;

        let req = connect::Request::new();
        socket.send(&req.serialize()?).await?;

        let mut buf = [0u8; connect::Response::LENGTH];
        let n = timeout(Self::CONNECT_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;

        let res = connect::Response::deserialize(&buf[..n])?;
        if res.action != Action::Connect
            || res.transaction_id != req.transaction_id
        {
            return Err(Error::TrackerResponse);
        }

        Ok((socket, res.connection_id))
    }

    /// Announce our state and return the response header plus the peer
    /// addresses the tracker handed out.
    pub async fn announce(
        &self,
        info_hash: &InfoHash,
        left: u64,
        port: u16,
        event: Event,
    ) -> Result<(announce::Response, Vec<SocketAddr>), Error> {
        let req = announce::Request::new(
            self.connection_id,
            info_hash,
            &self.peer_id,
            left,
            port,
            event,
        );
        debug!(tracker = %self.tracker_addr, ?event, "announcing");
        self.socket.send(&req.serialize()?).await?;

        let mut buf = [0u8; Self::ANNOUNCE_RES_BUF_LEN];
        let n = timeout(Self::ANNOUNCE_TIMEOUT, self.socket.recv(&mut buf))
            .await
            .map_err(|_| Error::Timeout)??;

        let (res, payload) = announce::Response::deserialize(&buf[..n])?;
        if res.action != Action::Announce
            || res.transaction_id != req.transaction_id
        {
            return Err(Error::TrackerResponse);
        }

        let peers = Self::parse_compact_peer_list(payload)?;
        debug!(
            peers = peers.len(),
            seeders = res.seeders,
            leechers = res.leechers,
            "announce response"
        );

        Ok((res, peers))
    }

    /// Decode the compact peer list: 6 bytes per peer, a big-endian IPv4
    /// address followed by the port.
    pub fn parse_compact_peer_list(
        buf: &[u8],
    ) -> Result<Vec<SocketAddr>, Error> {
        if buf.len() % 6 != 0 {
            return Err(Error::TrackerCompactPeerList);
        }

        Ok(buf
            .chunks_exact(6)
            .map(|c| {
                let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
                let port = u16::from_be_bytes([c[4], c[5]]);
                SocketAddr::new(IpAddr::V4(ip), port)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_peer_list() {
        let buf = [
            192, 168, 1, 10, 0x1a, 0xe1, // 192.168.1.10:6881
            10, 0, 0, 2, 0x00, 0x50, // 10.0.0.2:80
        ];
        let peers = Tracker::parse_compact_peer_list(&buf).unwrap();
        assert_eq!(
            peers,
            vec![
                "192.168.1.10:6881".parse::<SocketAddr>().unwrap(),
                "10.0.0.2:80".parse().unwrap(),
            ]
        );

        assert!(Tracker::parse_compact_peer_list(&buf[..5]).is_err());
        assert!(Tracker::parse_compact_peer_list(&[]).unwrap().is_empty());
    }

    // a minimal tracker on localhost answering one connect and one announce
    async fn fake_tracker(socket: UdpSocket) {
        let mut buf = [0u8; 1024];

        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, connect::Request::LENGTH);
        let tx = &buf[12..16];
        let mut res = Vec::new();
        res.extend_from_slice(&0u32.to_be_bytes());
        res.extend_from_slice(tx);
        res.extend_from_slice(&0x0102030405060708u64.to_be_bytes());
        socket.send_to(&res, from).await.unwrap();

        let (n, from) = socket.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, announce::Request::LENGTH);
        // connection id must be echoed back by the client
        assert_eq!(&buf[..8], &0x0102030405060708u64.to_be_bytes());
        let tx = buf[12..16].to_vec();
        let mut res = Vec::new();
        res.extend_from_slice(&1u32.to_be_bytes());
        res.extend_from_slice(&tx);
        res.extend_from_slice(&1800u32.to_be_bytes());
        res.extend_from_slice(&1u32.to_be_bytes());
        res.extend_from_slice(&2u32.to_be_bytes());
        res.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        socket.send_to(&res, from).await.unwrap();
    }

    #[tokio::test]
    async fn connect_and_announce() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let server_task = tokio::spawn(fake_tracker(server));

        let addr_str = addr.to_string();
        let tracker =
            Tracker::connect(PeerId::generate(), [addr_str.as_str()])
                .await
                .unwrap();

        let (res, peers) = tracker
            .announce(&InfoHash([7u8; 20]), 1000, 6881, Event::Started)
            .await
            .unwrap();

        assert_eq!(res.interval, 1800);
        assert_eq!(res.seeders, 2);
        assert_eq!(peers, vec!["127.0.0.1:6881".parse().unwrap()]);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_trackers_error_out() {
        let res =
            Tracker::connect(PeerId::generate(), ["does.not.resolve.invalid:1"])
                .await;
        assert!(matches!(res, Err(Error::TrackerNoHosts)));
    }
}
