use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, info};

use torrentz::{
    Config, KeepAlive, Torrent, Tracker, connect_to_peers, download_to_file, generate_peer_id,
    seed,
};

/// Download a single-file torrent, then seed it until interrupted.
#[derive(Debug, Parser)]
#[command(name = "torrentz", version)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Where to write the content (must not exist)
    output: PathBuf,

    /// Port announced to the tracker
    #[arg(short, long, default_value_t = torrentz::config::PORT)]
    port: u16,

    /// Seconds between keep-alive messages
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    keep_alive_secs: u64,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Config {
        port: args.port,
        keep_alive: Duration::from_secs(args.keep_alive_secs),
        ..Config::default()
    };

    // Load torrent file and fetch the peers
    let torrent = Torrent::from_file(&args.torrent)
        .with_context(|| format!("failed to load {}", args.torrent.display()))?;
    let torrent = Arc::new(torrent.to_info(generate_peer_id())?);
    torrent.log_info();

    let peers = Tracker
        .announce(&torrent, config.port)
        .await
        .context("tracker announce failed")?;

    let keep_alive = KeepAlive::new(config.keep_alive);
    let connections = connect_to_peers(&torrent, peers, &keep_alive, &config).await?;
    let _timer = keep_alive.spawn();

    let connections = download_to_file(&args.output, torrent.clone(), connections, &config)
        .await
        .with_context(|| format!("download to {} failed", args.output.display()))?;

    info!("download complete, seeding until interrupted");
    tokio::select! {
        res = seed(connections, &torrent, &args.output) => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }
    info!("exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_alive_period_must_be_positive() {
        assert!(Args::try_parse_from(["torrentz", "a.torrent", "out", "--keep-alive-secs", "0"]).is_err());

        let args = Args::try_parse_from(["torrentz", "a.torrent", "out", "--keep-alive-secs", "15"]).unwrap();
        assert_eq!(args.keep_alive_secs, 15);
        assert_eq!(args.port, torrentz::config::PORT);
    }
}
