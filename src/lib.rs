//! Peer wire engine of a small BitTorrent client: connect to peers,
//! download and verify every piece, then seed over the same connections.

pub mod config;
pub mod error;
pub mod keepalive;
pub mod manager;
pub mod peer;
pub mod piece;
pub mod protocol;
pub mod seeder;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use config::Config;
pub use error::{ApplicationError, DownloadError};
pub use keepalive::KeepAlive;
pub use manager::{PieceManager, download_to_file, download_with};
pub use peer::{ConnectionState, Peer, PeerConnection, PeerHandle, connect_to_peers};
pub use piece::{PieceResult, PieceWork, verify};
pub use seeder::seed;
pub use storage::{FileWriter, PieceSink, SeedSource};
pub use torrent::{Torrent, TorrentInfo, generate_peer_id};
pub use tracker::Tracker;
