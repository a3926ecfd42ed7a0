//! Command line front end: download a torrent from a .torrent file or a
//! magnet link, optionally staying around to seed it.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use undertow::{
    config::Config,
    error::Error,
    magnet::Magnet,
    metainfo::Metainfo,
    torrent::Torrent,
};

#[derive(Parser, Debug)]
#[command(name = "utow", version, about = "A small BitTorrent client")]
#[clap(group(
    clap::ArgGroup::new("source").required(true).args(["torrent", "magnet"])
))]
struct Args {
    /// Path of a .torrent file.
    #[clap(short, long)]
    torrent: Option<PathBuf>,

    /// A magnet link, wrapped in quotes.
    #[clap(short, long)]
    magnet: Option<String>,

    /// Download directory, taking precedence over the config file.
    #[clap(short, long)]
    download_dir: Option<PathBuf>,

    /// Keep seeding after the download completes.
    #[clap(short, long)]
    seed: bool,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::load().await?;
    if let Some(dir) = args.download_dir {
        config.download_dir = dir;
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let torrent = match (&args.torrent, &args.magnet) {
        (Some(path), _) => {
            let buf = tokio::fs::read(path).await?;
            let metainfo = Metainfo::from_bytes(&buf)?;
            Torrent::from_metainfo(metainfo, config, cancel.clone()).await?
        }
        (None, Some(uri)) => {
            let magnet = Magnet::parse(uri)?;
            Torrent::from_magnet(&magnet, config, cancel.clone()).await?
        }
        // clap's arg group guarantees one of the two is present
        (None, None) => unreachable!(),
    };

    torrent.download().await?;

    if args.seed && !cancel.is_cancelled() {
        info!(name = %torrent.name, "download finished, seeding");
        torrent.seed().await?;
    }

    Ok(())
}
