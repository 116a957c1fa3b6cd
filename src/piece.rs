use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use crate::error::ApplicationError;
use crate::torrent::TorrentInfo;

/// A piece waiting to be downloaded. Immutable; a failed attempt hands the
/// same value back to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    /// Index of the piece (0-based)
    pub index: usize,
    /// Expected SHA1 of the piece content
    pub hash: [u8; 20],
    /// Length of the piece in bytes (the last one may be short)
    pub length: usize,
}

/// A verified piece on its way to the output file.
#[derive(Debug)]
pub struct PieceResult {
    pub index: usize,
    pub data: Vec<u8>,
}

/// A contiguous block of data within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Offset (in bytes) from the start of the piece
    pub offset: usize,
    /// Length of the block in bytes
    pub length: usize,
}

impl PieceWork {
    /// One work item per piece, in ascending index order.
    pub fn all(torrent: &TorrentInfo) -> Vec<PieceWork> {
        torrent
            .piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| PieceWork {
                index,
                hash: *hash,
                length: torrent.piece_size(index),
            })
            .collect()
    }

    /// Splits the piece into blocks of at most `block_size` bytes.
    pub fn blocks(&self, block_size: usize) -> Vec<Block> {
        (0..self.length)
            .step_by(block_size)
            .map(|offset| Block {
                offset,
                length: std::cmp::min(block_size, self.length - offset),
            })
            .collect()
    }
}

/// Checks a fully assembled piece against its published hash.
pub fn verify(index: usize, buf: &[u8], expected: &[u8; 20]) -> Result<(), ApplicationError> {
    let digest = Sha1::digest(buf);
    if digest.as_slice() == expected {
        Ok(())
    } else {
        Err(ApplicationError::HashMismatch(index))
    }
}

/// Recycles piece buffers between download attempts.
///
/// A buffer is taken for each in-flight piece and given back once the piece
/// has been written or the attempt failed.
#[derive(Debug)]
pub struct BufferPool {
    capacity: usize,
    free:     Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// `capacity` is the nominal piece length; every buffer holds at least that.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Returns a zeroed buffer of exactly `len` bytes.
    pub async fn acquire(&self, len: usize) -> Vec<u8> {
        let mut buf = self
            .free
            .lock()
            .await
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity.max(len)));
        buf.clear();
        buf.resize(len, 0);
        buf
    }

    pub async fn release(&self, buf: Vec<u8>) {
        self.free.lock().await.push(buf);
    }

    #[cfg(test)]
    async fn idle(&self) -> usize {
        self.free.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha1(data: &[u8]) -> [u8; 20] {
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&Sha1::digest(data));
        arr
    }

    #[test]
    fn verify_accepts_matching_hash() {
        let data = b"hello world";
        assert!(verify(0, data, &sha1(data)).is_ok());
    }

    #[test]
    fn verify_rejects_corrupt_piece() {
        let expected = sha1(b"hello world");
        match verify(4, b"hello w0rld", &expected) {
            Err(ApplicationError::HashMismatch(4)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn blocks_cover_the_piece_with_a_short_tail() {
        let work = PieceWork {
            index: 0,
            hash: [0; 20],
            length: 40_000,
        };
        let blocks = work.blocks(16_384);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[2], Block { offset: 32_768, length: 7_232 });
        assert_eq!(blocks.iter().map(|b| b.length).sum::<usize>(), 40_000);
    }

    #[tokio::test]
    async fn pool_reuses_released_buffers() {
        let pool = BufferPool::new(8);
        let mut buf = pool.acquire(8).await;
        buf.copy_from_slice(b"abcdefgh");
        pool.release(buf).await;
        assert_eq!(pool.idle().await, 1);

        let buf = pool.acquire(4).await;
        assert_eq!(buf, vec![0; 4]);
        assert!(buf.capacity() >= 8);
        assert_eq!(pool.idle().await, 0);
    }
}
