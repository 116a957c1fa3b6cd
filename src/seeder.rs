use std::{path::Path, sync::Arc};

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{
    error::ApplicationError, peer::PeerConnection, storage::SeedSource, torrent::TorrentInfo,
};

/// Serves the completed file at `path` over every connection.
///
/// Each connection runs in its own task until the peer goes away; this only
/// returns once all of them have, which in practice means never.
pub async fn seed(
    connections: Vec<PeerConnection>,
    torrent:     &TorrentInfo,
    path:        &Path,
) -> Result<(), ApplicationError> {
    let source = Arc::new(SeedSource::open(path, torrent).await?);
    info!(peers = connections.len(), path = %path.display(), "starting to seed");

    let mut tasks = JoinSet::new();
    for mut conn in connections {
        if conn.is_closed() {
            continue;
        }
        let source = source.clone();
        tasks.spawn(async move {
            let peer = conn.peer().clone();
            if let Err(e) = conn.serve_requests(&source).await {
                info!(%peer, error = %e, uploaded = conn.uploaded(), "stopped seeding to peer");
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "seeding task failed");
        }
    }
    info!("no peers left to seed to");
    Ok(())
}
