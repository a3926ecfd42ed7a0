//! Magnet link parsing on top of the `magnet-url` crate.

use crate::{error::Error, metainfo::InfoHash};

/// A validated magnet link: the info-hash plus at least one UDP tracker.
#[derive(Debug, Clone)]
pub struct Magnet {
    pub info_hash: InfoHash,
    /// Display name, when the link carries one.
    pub name: Option<String>,
    /// UDP tracker URLs, percent-decoded. Other schemes are dropped at
    /// parse time since this client only talks to UDP trackers.
    pub trackers: Vec<String>,
}

impl Magnet {
    pub fn parse(uri: &str) -> Result<Self, Error> {
        let m = magnet_url::Magnet::new(uri)
            .map_err(|_| Error::MagnetLinkInvalid)?;

        let xt = m.xt.ok_or(Error::MagnetNoInfoHash)?;
        let raw = hex::decode(&xt).map_err(|_| Error::MagnetNoInfoHash)?;
        let info_hash = InfoHash::try_from(&raw[..])?;

        let trackers: Vec<String> = m
            .tr
            .iter()
            .filter_map(|t| urlencoding::decode(t).ok())
            .map(|t| t.into_owned())
            .filter(|t| t.starts_with("udp://"))
            .collect();

        if trackers.is_empty() {
            return Err(Error::MagnetNoTracker);
        }

        let name = m
            .dn
            .and_then(|dn| urlencoding::decode(&dn).ok().map(|s| s.into_owned()));

        Ok(Self { info_hash, name, trackers })
    }

    /// Tracker host:port pairs with the scheme and any path stripped, the
    /// form `ToSocketAddrs` resolves.
    pub fn tracker_addrs(&self) -> Vec<String> {
        self.trackers
            .iter()
            .map(|t| {
                let t = t.trim_start_matches("udp://");
                match t.find('/') {
                    Some(i) => t[..i].to_owned(),
                    None => t.to_owned(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGNET: &str = "magnet:?xt=urn:btih:9f9165d9a281a9b8e782cd5176bbcc8256fd1871&dn=some%20name&tr=udp%3A%2F%2Ftracker.opentrackr.org%3A1337%2Fannounce&tr=http%3A%2F%2Ftracker.example.org%3A80%2Fannounce";

    #[test]
    fn parses_hash_name_and_trackers() {
        let m = Magnet::parse(MAGNET).unwrap();
        assert_eq!(
            m.info_hash.to_string(),
            "9f9165d9a281a9b8e782cd5176bbcc8256fd1871"
        );
        assert_eq!(m.name.as_deref(), Some("some name"));
        // the http tracker is dropped
        assert_eq!(
            m.trackers,
            vec!["udp://tracker.opentrackr.org:1337/announce"]
        );
        assert_eq!(m.tracker_addrs(), vec!["tracker.opentrackr.org:1337"]);
    }

    #[test]
    fn missing_info_hash() {
        let uri = "magnet:?dn=x&tr=udp%3A%2F%2Ft.example%3A1337";
        assert!(matches!(
            Magnet::parse(uri),
            Err(Error::MagnetNoInfoHash) | Err(Error::MagnetLinkInvalid)
        ));
    }

    #[test]
    fn no_udp_tracker() {
        let uri = "magnet:?xt=urn:btih:9f9165d9a281a9b8e782cd5176bbcc8256fd1871&tr=http%3A%2F%2Ft.example%3A80";
        assert!(matches!(Magnet::parse(uri), Err(Error::MagnetNoTracker)));
    }
}
