use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    sync::Arc,
};

use tokio::{
    sync::{Mutex, Notify, mpsc},
    task::JoinSet,
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    error::{ApplicationError, DownloadError},
    peer::PeerConnection,
    piece::{BufferPool, PieceResult, PieceWork, verify},
    storage::{FileWriter, PieceSink},
    torrent::TorrentInfo,
};

/// Outcome of asking the scheduler for work on behalf of one peer.
#[derive(Debug, PartialEq, Eq)]
pub enum Claim {
    /// A piece the peer has, now in flight for this worker.
    Work(PieceWork),
    /// Nothing claimable now, but pieces in flight elsewhere may come back.
    Wait,
    /// Every piece is completed.
    Done,
    /// The peer has none of the pending pieces and nothing is in flight.
    Unavailable,
}

#[derive(Debug)]
struct Pieces {
    pending:   VecDeque<PieceWork>,
    in_flight: HashSet<usize>,
    completed: Vec<bool>,
    done:      usize,
}

/// Owns the partition of piece indices into pending, in-flight and completed.
///
/// Every index is in exactly one of the three sets from construction until
/// the download ends.
#[derive(Debug)]
pub struct PieceManager {
    pieces:  Mutex<Pieces>,
    changed: Notify,
    total:   usize,
}

impl PieceManager {
    pub fn new(torrent: &TorrentInfo) -> Self {
        let work = PieceWork::all(torrent);
        let total = work.len();
        Self {
            pieces: Mutex::new(Pieces {
                pending:   work.into(),
                in_flight: HashSet::new(),
                completed: vec![false; total],
                done:      0,
            }),
            changed: Notify::new(),
            total,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Takes the lowest pending piece that `has_piece` accepts.
    pub async fn claim(&self, has_piece: impl Fn(usize) -> bool) -> Claim {
        let mut pieces = self.pieces.lock().await;
        if let Some(pos) = pieces.pending.iter().position(|w| has_piece(w.index)) {
            if let Some(work) = pieces.pending.remove(pos) {
                pieces.in_flight.insert(work.index);
                return Claim::Work(work);
            }
        }

        if pieces.pending.is_empty() && pieces.in_flight.is_empty() {
            Claim::Done
        } else if pieces.in_flight.is_empty() {
            Claim::Unavailable
        } else {
            Claim::Wait
        }
    }

    /// Puts a failed piece back at the head of the queue, unchanged.
    pub async fn requeue(&self, work: PieceWork) {
        let mut pieces = self.pieces.lock().await;
        if pieces.in_flight.remove(&work.index) {
            pieces.pending.push_front(work);
        } else {
            warn!(index = work.index, "requeue of a piece that was not in flight");
        }
        drop(pieces);
        self.changed.notify_waiters();
    }

    /// Moves an in-flight piece to completed.
    ///
    /// Returns `false` if the piece was not in flight, so a second result for
    /// the same index is never written.
    pub async fn complete(&self, index: usize) -> bool {
        let mut pieces = self.pieces.lock().await;
        let accepted = pieces.in_flight.remove(&index) && !pieces.completed[index];
        if accepted {
            pieces.completed[index] = true;
            pieces.done += 1;
        }
        drop(pieces);
        self.changed.notify_waiters();
        accepted
    }

    pub async fn is_done(&self) -> bool {
        self.pieces.lock().await.done == self.total
    }

    /// Pieces not yet completed (pending or in flight).
    pub async fn remaining(&self) -> usize {
        self.total - self.pieces.lock().await.done
    }

    /// Pending pieces, in queue order.
    pub async fn pending(&self) -> Vec<usize> {
        self.pieces.lock().await.pending.iter().map(|w| w.index).collect()
    }

    /// Sleeps until some piece changes set, or `limit` elapses.
    async fn wait_for_change(&self, limit: std::time::Duration) {
        let _ = tokio::time::timeout(limit, self.changed.notified()).await;
    }
}

/// State shared by every worker task.
struct Shared {
    manager: PieceManager,
    pool:    BufferPool,
    config:  Config,
}

/// Downloads every piece over `connections` into a new file at `path`.
///
/// Returns the connections that are still alive, ready for seeding.
pub async fn download_to_file(
    path:        &Path,
    torrent:     Arc<TorrentInfo>,
    connections: Vec<PeerConnection>,
    config:      &Config,
) -> Result<Vec<PeerConnection>, ApplicationError> {
    let mut writer = FileWriter::create(path, torrent.length as u64).await?;
    let survivors = download_with(&mut writer, torrent, connections, config).await?;
    info!(path = %path.display(), "download completed");
    Ok(survivors)
}

/// Runs the worker pool, handing verified pieces to `sink`.
///
/// Fails with `InsufficientPeers` when every worker has stopped while
/// pieces are still missing.
pub async fn download_with<S: PieceSink>(
    sink:        &mut S,
    torrent:     Arc<TorrentInfo>,
    connections: Vec<PeerConnection>,
    config:      &Config,
) -> Result<Vec<PeerConnection>, ApplicationError> {
    let (tx, mut rx) = mpsc::channel(connections.len().max(1));
    let shared = Arc::new(Shared {
        manager: PieceManager::new(&torrent),
        pool:    BufferPool::new(torrent.piece_length),
        config:  *config,
    });

    let mut workers = JoinSet::new();
    for conn in connections {
        workers.spawn(worker(conn, shared.clone(), tx.clone()));
    }
    // the channel closes once the last worker is gone
    drop(tx);

    // Single consumer: the only place that writes to the sink
    let total = shared.manager.total();
    while let Some(result) = rx.recv().await {
        if let Err(e) = consume(sink, &torrent, &shared, result, total).await {
            workers.abort_all();
            return Err(e);
        }
        if shared.manager.is_done().await {
            break;
        }
    }

    let mut survivors = Vec::new();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Some(conn)) => survivors.push(conn),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "worker task failed"),
        }
    }

    let remaining = shared.manager.remaining().await;
    if remaining > 0 {
        warn!(remaining, "every connection is gone before completion");
        return Err(ApplicationError::InsufficientPeers { remaining });
    }
    sink.finish().await?;
    Ok(survivors)
}

async fn consume<S: PieceSink>(
    sink:    &mut S,
    torrent: &TorrentInfo,
    shared:  &Shared,
    result:  PieceResult,
    total:   usize,
) -> Result<(), ApplicationError> {
    let PieceResult { index, data } = result;
    let (begin, _) = torrent.piece_bounds(index);
    let outcome = if shared.manager.complete(index).await {
        sink.write_at(begin as u64, &data).await.map(|_| true)
    } else {
        Ok(false)
    };
    shared.pool.release(data).await;

    if outcome? {
        let remaining = shared.manager.remaining().await;
        let done = total - remaining;
        info!(
            index,
            progress = %format!("{}/{}", done, total),
            percent = %format!("{:.2}", done as f64 / total as f64 * 100.0),
            "downloaded piece"
        );
    } else {
        warn!(index, "dropping duplicate result");
    }
    Ok(())
}

/// Pulls pieces for one connection until there is nothing left it can do.
///
/// Returns the connection if it is still usable.
async fn worker(
    mut conn: PeerConnection,
    shared:   Arc<Shared>,
    results:  mpsc::Sender<PieceResult>,
) -> Option<PeerConnection> {
    let peer = conn.peer().clone();
    loop {
        let claim = shared.manager.claim(|i| conn.has_piece(i)).await;
        let work = match claim {
            Claim::Work(work) => work,
            Claim::Wait => {
                shared.manager.wait_for_change(shared.config.claim_retry).await;
                continue;
            }
            Claim::Done => {
                debug!(%peer, "no more pieces");
                return (!conn.is_closed()).then_some(conn);
            }
            Claim::Unavailable => {
                debug!(%peer, "peer has none of the remaining pieces");
                return (!conn.is_closed()).then_some(conn);
            }
        };

        let mut buf = shared.pool.acquire(work.length).await;
        match conn.download_piece(&work, &mut buf).await {
            Ok(()) => {}
            Err(e) => {
                shared.pool.release(buf).await;
                debug!(%peer, index = work.index, error = %e, "piece failed, requeueing");
                shared.manager.requeue(work).await;
                if e == DownloadError::ConnectionLost {
                    warn!(%peer, "connection lost, worker stopping");
                    return None;
                }
                stand_back(&shared).await;
                continue;
            }
        }

        if let Err(e) = verify(work.index, &buf, &work.hash) {
            warn!(%peer, index = work.index, error = %e, "discarding corrupt piece");
            shared.pool.release(buf).await;
            shared.manager.requeue(work).await;
            stand_back(&shared).await;
            continue;
        }

        let announced = conn.send_have(work.index).await;

        let result = PieceResult {
            index: work.index,
            data:  buf,
        };
        if results.send(result).await.is_err() {
            // consumer is gone; the download ended
            return (!conn.is_closed()).then_some(conn);
        }

        // the piece itself is fine, but a failed write closed the connection
        if let Err(e) = announced {
            warn!(%peer, index = work.index, error = %e, "could not announce piece, worker stopping");
            return None;
        }
    }
}

/// Pauses a worker whose piece just failed, so a waiting worker gets the
/// first chance at the requeued piece. The pause ends early on any change.
async fn stand_back(shared: &Shared) {
    shared.manager.wait_for_change(shared.config.claim_retry).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn torrent(pieces: usize) -> TorrentInfo {
        TorrentInfo::new(
            String::new(),
            [0; 20],
            (0..pieces).map(|i| [i as u8; 20]).collect(),
            4,
            pieces * 4,
            "test".into(),
            [0; 20],
        )
        .unwrap()
    }

    fn claimed(claim: Claim) -> PieceWork {
        match claim {
            Claim::Work(work) => work,
            other => panic!("expected work, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn claims_in_ascending_order_filtered_by_availability() {
        let manager = PieceManager::new(&torrent(4));
        assert_eq!(claimed(manager.claim(|_| true).await).index, 0);
        assert_eq!(claimed(manager.claim(|i| i >= 2).await).index, 2);
        assert_eq!(manager.pending().await, vec![1, 3]);
    }

    #[tokio::test]
    async fn failed_piece_reappears_exactly_once() {
        let manager = PieceManager::new(&torrent(3));
        let work = claimed(manager.claim(|_| true).await);
        assert_eq!(manager.pending().await, vec![1, 2]);

        manager.requeue(work.clone()).await;
        assert_eq!(manager.pending().await, vec![0, 1, 2]);

        // a stray second requeue must not duplicate it
        manager.requeue(work).await;
        assert_eq!(manager.pending().await, vec![0, 1, 2]);
        assert_eq!(manager.remaining().await, 3);
    }

    #[tokio::test]
    async fn completion_is_write_once() {
        let manager = PieceManager::new(&torrent(1));
        let work = claimed(manager.claim(|_| true).await);
        assert!(manager.complete(work.index).await);
        assert!(!manager.complete(work.index).await);
        assert!(manager.is_done().await);
        assert_eq!(manager.claim(|_| true).await, Claim::Done);
    }

    #[tokio::test]
    async fn peer_without_pieces_waits_then_gives_up() {
        let manager = PieceManager::new(&torrent(2));
        let work = claimed(manager.claim(|i| i == 0).await);
        assert_eq!(manager.claim(|i| i == 0).await, Claim::Wait);

        manager.complete(work.index).await;
        assert_eq!(manager.claim(|i| i == 0).await, Claim::Unavailable);
        assert_eq!(manager.remaining().await, 1);
    }
}
