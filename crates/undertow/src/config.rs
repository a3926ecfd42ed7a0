//! Client configuration, loaded from `config.toml` under the user's config
//! directory and passed explicitly into the pieces that need it.

use std::path::PathBuf;

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Where downloaded torrents land.
    pub download_dir: PathBuf,
    /// Port to listen on for inbound peers while seeding.
    pub listen_port: u16,
    /// Ceiling on simultaneously connected peers per torrent.
    pub max_peers: usize,
    /// Verified pieces kept in memory for serving uploads.
    pub cache_pieces: usize,
}

impl Default for Config {
    fn default() -> Self {
        let download_dir = UserDirs::new()
            .and_then(|u| u.download_dir().map(|d| d.to_path_buf()))
            .unwrap_or_else(|| PathBuf::from("."));

        Self { download_dir, listen_port: 6881, max_peers: 50, cache_pieces: 5 }
    }
}

impl Config {
    /// Open (creating if needed) the configuration file and return it with
    /// its path. A missing or unparseable file is rewritten with defaults.
    pub async fn config_file() -> Result<(File, PathBuf), Error> {
        let dirs = ProjectDirs::from("", "", "undertow").ok_or_else(|| {
            Error::Config("could not resolve a home directory".into())
        })?;
        let mut path = dirs.config_dir().to_path_buf();

        if !path.exists() {
            create_dir_all(&path).await.map_err(|e| {
                Error::Config(format!(
                    "could not create {}: {e}",
                    path.display()
                ))
            })?;
        }

        path.push("config.toml");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        let mut raw = String::new();
        file.read_to_string(&mut raw).await?;

        if toml::from_str::<Config>(&raw).is_err() {
            let default = toml::to_string(&Config::default())
                .map_err(|e| Error::Config(e.to_string()))?;
            file.write_all(default.as_bytes()).await?;
        }

        let file = OpenOptions::new().read(true).open(&path).await?;

        Ok((file, path))
    }

    /// Load the configuration, writing a default file on first run.
    pub async fn load() -> Result<Self, Error> {
        let (mut file, path) = Self::config_file().await?;

        let mut raw = String::new();
        file.read_to_string(&mut raw).await?;

        toml::from_str::<Config>(&raw).map_err(|e| {
            Error::Config(format!("{}: {e}", path.display()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_fills_defaults() {
        let c: Config =
            toml::from_str("listen_port = 9000\n").unwrap();
        assert_eq!(c.listen_port, 9000);
        assert_eq!(c.max_peers, 50);
        assert_eq!(c.cache_pieces, 5);
    }

    #[test]
    fn round_trips_through_toml() {
        let c = Config {
            download_dir: PathBuf::from("/tmp/dl"),
            listen_port: 7000,
            max_peers: 10,
            cache_pieces: 2,
        };
        let s = toml::to_string(&c).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.download_dir, c.download_dir);
        assert_eq!(back.listen_port, 7000);
        assert_eq!(back.max_peers, 10);
    }
}
