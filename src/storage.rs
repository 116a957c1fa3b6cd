use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::ApplicationError;
use crate::torrent::TorrentInfo;

/// Destination of verified pieces. Owned by the single result consumer.
#[allow(async_fn_in_trait)]
pub trait PieceSink {
    /// Writes `data` at byte `offset` of the content.
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ApplicationError>;

    /// Flushes everything written so far.
    async fn finish(&mut self) -> Result<(), ApplicationError>;
}

/// Output file opened for out-of-order writes.
pub struct FileWriter {
    file: File,
}

impl FileWriter {
    /// Creates a new file at `path` sized to the full content length.
    ///
    /// Fails if the file already exists.
    pub async fn create(path: &Path, length: u64) -> Result<Self, ApplicationError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .await?;
        file.set_len(length).await?;
        Ok(Self { file })
    }
}

impl PieceSink for FileWriter {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ApplicationError> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), ApplicationError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }
}

/// Read-only random access to the completed content, shared by every
/// seeding connection.
pub struct SeedSource {
    file:         Mutex<File>,
    length:       u64,
    piece_length: u64,
}

impl SeedSource {
    pub async fn open(path: &Path, torrent: &TorrentInfo) -> Result<Self, ApplicationError> {
        let file = File::open(path).await?;
        let length = file.metadata().await?.len();
        if length != torrent.length as u64 {
            return Err(ApplicationError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    length,
                    torrent.length
                ),
            )));
        }

        Ok(Self {
            file: Mutex::new(file),
            length,
            piece_length: torrent.piece_length as u64,
        })
    }

    /// Reads `length` bytes at `begin` within piece `index`.
    ///
    /// Returns `None` when the range is not inside that piece.
    pub async fn read_block(
        &self,
        index: u32,
        begin: u32,
        length: u32,
    ) -> Result<Option<Vec<u8>>, ApplicationError> {
        let piece_start = index as u64 * self.piece_length;
        let piece_end = std::cmp::min(piece_start + self.piece_length, self.length);
        let start = piece_start + begin as u64;
        let end = start + length as u64;
        if piece_start >= self.length || length == 0 || end > piece_end {
            return Ok(None);
        }

        let mut block = vec![0u8; length as usize];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(&mut block).await?;
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "torrentz-storage-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn torrent(length: usize, piece_length: usize) -> TorrentInfo {
        TorrentInfo::new(
            String::new(),
            [0; 20],
            vec![[0; 20]; length.div_ceil(piece_length)],
            piece_length,
            length,
            "test".into(),
            [0; 20],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn writer_accepts_out_of_order_pieces() {
        let path = temp_path("out-of-order");
        let mut writer = FileWriter::create(&path, 8).await.unwrap();
        writer.write_at(4, b"5678").await.unwrap();
        writer.write_at(0, b"1234").await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"12345678");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn writer_refuses_existing_file() {
        let path = temp_path("existing");
        std::fs::write(&path, b"x").unwrap();
        assert!(FileWriter::create(&path, 1).await.is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn seed_source_serves_ranges_inside_pieces_only() {
        let path = temp_path("seed");
        std::fs::write(&path, b"abcdefghij").unwrap();
        let source = SeedSource::open(&path, &torrent(10, 4)).await.unwrap();

        assert_eq!(source.read_block(0, 0, 4).await.unwrap(), Some(b"abcd".to_vec()));
        assert_eq!(source.read_block(2, 0, 2).await.unwrap(), Some(b"ij".to_vec()));
        assert_eq!(source.read_block(1, 2, 4).await.unwrap(), None);
        assert_eq!(source.read_block(3, 0, 1).await.unwrap(), None);
        assert_eq!(source.read_block(2, 0, 3).await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn seed_source_rejects_wrong_size() {
        let path = temp_path("short");
        std::fs::write(&path, b"abc").unwrap();
        assert!(SeedSource::open(&path, &torrent(10, 4)).await.is_err());
        let _ = std::fs::remove_file(&path);
    }
}
