use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::ApplicationError;

/// Client prefix of every peer id we generate.
const PEER_ID_PREFIX: &[u8; 8] = b"-TZ0001-";

/// Represents a parsed .torrent file
#[derive(Debug, Serialize, Deserialize)]
pub struct Torrent {
    pub announce: String,
    pub info:     Info,
    #[serde(skip)]
    pub info_raw_bytes: Vec<u8>,
}

/// Fields inside the 'info' dictionary of a .torrent file
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    pub pieces: ByteBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
}

/// Everything the peer wire engine needs to know about one transfer.
///
/// Built once at startup and shared read-only by every task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub announce:     String,
    pub info_hash:    [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
    pub piece_length: usize,
    pub length:       usize,
    pub name:         String,
    /// Identifies this client for the whole session
    pub peer_id:      [u8; 20],
}

impl Torrent {
    /// Reads a `.torrent` file from disk and parses it into a [`Torrent`] struct
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ApplicationError> {
        let data = fs::read(path.as_ref()).map_err(|e| {
            ApplicationError::ParserError(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ApplicationError> {
        let bencoded_map: BTreeMap<String, serde_bencode::value::Value> =
            serde_bencode::from_bytes(data)
                .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let info_value = bencoded_map
            .get("info")
            .ok_or_else(|| ApplicationError::ParserError("missing info".into()))?;

        // Re-encoding the dictionary yields the exact bytes the info hash covers
        let info_raw_bytes = serde_bencode::to_bytes(info_value)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        let torrent: Torrent = serde_bencode::from_bytes(data)
            .map_err(|e| ApplicationError::ParserError(format!("{}", e)))?;

        Ok(Torrent {
            info_raw_bytes,
            ..torrent
        })
    }

    /// Computes the SHA1 hash of the bencoded `info` dictionary
    pub fn info_hash(&self) -> [u8; 20] {
        let digest = Sha1::digest(&self.info_raw_bytes);
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&digest);
        arr
    }

    /// Splits the `pieces` string into 20-byte SHA1 hashes.
    pub fn piece_hashes(&self) -> Result<Vec<[u8; 20]>, ApplicationError> {
        let buf = &self.info.pieces;
        if buf.len() % 20 != 0 {
            return Err(ApplicationError::ParserError(format!(
                "received malformed pieces of length {}",
                buf.len()
            )));
        }
        Ok(buf
            .chunks_exact(20)
            .map(|chunk| {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(chunk);
                arr
            })
            .collect())
    }

    /// Validates the metadata and attaches the session peer id.
    pub fn to_info(&self, peer_id: [u8; 20]) -> Result<TorrentInfo, ApplicationError> {
        let length = self.info.length.ok_or_else(|| {
            ApplicationError::ParserError("multi-file torrents are not supported".into())
        })?;
        if length <= 0 || self.info.piece_length <= 0 {
            return Err(ApplicationError::ParserError(format!(
                "invalid sizes: length {}, piece length {}",
                length, self.info.piece_length
            )));
        }

        TorrentInfo::new(
            self.announce.clone(),
            self.info_hash(),
            self.piece_hashes()?,
            self.info.piece_length as usize,
            length as usize,
            self.info.name.clone(),
            peer_id,
        )
    }
}

impl TorrentInfo {
    /// Fails unless there is exactly one hash per `piece_length` chunk of `length`.
    pub fn new(
        announce:     String,
        info_hash:    [u8; 20],
        piece_hashes: Vec<[u8; 20]>,
        piece_length: usize,
        length:       usize,
        name:         String,
        peer_id:      [u8; 20],
    ) -> Result<Self, ApplicationError> {
        if piece_length == 0 {
            return Err(ApplicationError::ParserError("piece length is zero".into()));
        }
        let expected = length.div_ceil(piece_length);
        if piece_hashes.len() != expected {
            return Err(ApplicationError::ParserError(format!(
                "{} piece hashes for {} bytes in pieces of {}",
                piece_hashes.len(),
                length,
                piece_length
            )));
        }

        Ok(Self {
            announce,
            info_hash,
            piece_hashes,
            piece_length,
            length,
            name,
            peer_id,
        })
    }

    pub fn pieces_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte range `[begin, end)` of a piece within the content.
    pub fn piece_bounds(&self, index: usize) -> (usize, usize) {
        let begin = index * self.piece_length;
        let end = std::cmp::min(begin + self.piece_length, self.length);
        (begin, end)
    }

    /// Length of a piece; the last one may be shorter.
    pub fn piece_size(&self, index: usize) -> usize {
        let (begin, end) = self.piece_bounds(index);
        end - begin
    }

    pub fn log_info(&self) {
        info!(
            name = %self.name,
            announce = %self.announce,
            info_hash = %hex::encode(self.info_hash),
            piece_length = self.piece_length,
            pieces = self.pieces_count(),
            length = self.length,
            "torrent loaded"
        );
    }
}

/// Session peer id: the client prefix followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
    peer_id
}
