//! Disk persistence: the files of a torrent viewed as one contiguous byte
//! range, addressed by piece.

use std::path::{Path, PathBuf};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom},
    sync::Mutex,
};
use tracing::{debug, info};

use crate::{
    bitfield::SharedBitfield,
    error::Error,
    metainfo::Info,
};

/// One file of the torrent with its position in the global byte range.
#[derive(Debug)]
struct FileSpan {
    /// Absolute offset of the file's first byte within the torrent.
    offset: u64,
    length: u64,
    path: PathBuf,
}

/// Open file handles plus the span table mapping torrent offsets to them.
///
/// All reads and writes seek, so the handles live behind one async mutex;
/// piece IO is serialized, which also keeps rehashing simple.
#[derive(Debug)]
pub struct Storage {
    info: Info,
    spans: Vec<FileSpan>,
    files: Mutex<Vec<File>>,
    /// True when every file was already present at full length, in which
    /// case rehashing may find completed pieces.
    preexisting: bool,
}

impl Storage {
    /// Open or create every file of the torrent under `download_dir`,
    /// preallocated to its final length.
    pub async fn open(download_dir: &Path, info: &Info) -> Result<Self, Error> {
        let root = if info.is_single_file() {
            download_dir.to_path_buf()
        } else {
            download_dir.join(&info.name)
        };

        let mut spans = Vec::with_capacity(info.files.len());
        let mut files = Vec::with_capacity(info.files.len());
        let mut offset = 0u64;
        let mut preexisting = true;

        for entry in &info.files {
            let mut path = root.clone();
            for part in &entry.path {
                path.push(part);
            }
            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }

            let existed = tokio::fs::metadata(&path)
                .await
                .map(|m| m.len() == entry.length)
                .unwrap_or(false);
            preexisting &= existed;

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .await?;
            file.set_len(entry.length).await?;

            spans.push(FileSpan {
                offset,
                length: entry.length,
                path,
            });
            files.push(file);
            offset += entry.length;
        }

        info!(name = %info.name, files = spans.len(), total = offset, "opened storage");

        Ok(Self {
            info: info.clone(),
            spans,
            files: Mutex::new(files),
            preexisting,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.info.total_size()
    }

    /// Write `data` at absolute torrent offset `offset`, splitting across
    /// file boundaries as needed.
    async fn write_range(&self, offset: u64, data: &[u8]) -> Result<(), Error> {
        let end = offset + data.len() as u64;
        if end > self.total_size() {
            return Err(Error::BlockOutOfBounds(
                (offset / self.info.piece_length as u64) as u32,
            ));
        }

        let mut files = self.files.lock().await;
        let mut cursor = offset;
        let mut remaining = data;

        for (span, file) in self.spans.iter().zip(files.iter_mut()) {
            if remaining.is_empty() {
                break;
            }
            let span_end = span.offset + span.length;
            if cursor >= span_end {
                continue;
            }
            let within = cursor - span.offset;
            let take =
                ((span_end - cursor) as usize).min(remaining.len());

            file.seek(SeekFrom::Start(within)).await?;
            file.write_all(&remaining[..take]).await?;

            cursor += take as u64;
            remaining = &remaining[take..];
        }

        Ok(())
    }

    /// Read `len` bytes starting at absolute torrent offset `offset`.
    async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>, Error> {
        let end = offset + len as u64;
        if end > self.total_size() {
            return Err(Error::BlockOutOfBounds(
                (offset / self.info.piece_length as u64) as u32,
            ));
        }

        let mut files = self.files.lock().await;
        let mut out = vec![0u8; len];
        let mut cursor = offset;
        let mut filled = 0usize;

        for (span, file) in self.spans.iter().zip(files.iter_mut()) {
            if filled == len {
                break;
            }
            let span_end = span.offset + span.length;
            if cursor >= span_end {
                continue;
            }
            let within = cursor - span.offset;
            let take = ((span_end - cursor) as usize).min(len - filled);

            file.seek(SeekFrom::Start(within)).await?;
            file.read_exact(&mut out[filled..filled + take]).await?;

            cursor += take as u64;
            filled += take;
        }

        Ok(out)
    }

    /// Persist a whole verified piece.
    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), Error> {
        if index >= self.info.pieces_len()
            || data.len() != self.info.piece_size(index) as usize
        {
            return Err(Error::BlockOutOfBounds(index));
        }
        let offset = index as u64 * self.info.piece_length as u64;
        self.write_range(offset, data).await
    }

    /// Read back a whole piece, short last piece included.
    pub async fn read_piece(&self, index: u32) -> Result<Vec<u8>, Error> {
        if index >= self.info.pieces_len() {
            return Err(Error::BlockOutOfBounds(index));
        }
        let offset = index as u64 * self.info.piece_length as u64;
        self.read_range(offset, self.info.piece_size(index) as usize).await
    }

    /// Hash every piece on disk against the metainfo and mark the matches
    /// in `bitfield`. This is the only resume mechanism: anything already
    /// downloaded is rediscovered here at startup.
    pub async fn rehash_into(&self, bitfield: &SharedBitfield) -> Result<usize, Error> {
        bitfield.extend_to_capacity(self.info.pieces_len() as usize);

        if !self.preexisting {
            debug!("files were missing or truncated, skipping rehash");
            return Ok(0);
        }

        let mut have = 0usize;
        for index in 0..self.info.pieces_len() {
            let data = self.read_piece(index).await?;
            if self.info.verify_piece(index, &data) {
                bitfield.set_piece(index as usize);
                have += 1;
            }
        }

        info!(have, total = self.info.pieces_len(), "rehashed local files");
        Ok(have)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use sha1_smol::Sha1;

    fn two_file_info() -> Info {
        // 100 bytes split 60/40, 64-byte pieces: piece 1 spans the boundary
        let mut data = vec![0u8; 100];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut pieces = Vec::new();
        pieces.extend_from_slice(&Sha1::from(&data[..64]).digest().bytes());
        pieces.extend_from_slice(&Sha1::from(&data[64..]).digest().bytes());

        Info {
            name: "pack".into(),
            piece_length: 64,
            pieces,
            files: vec![
                FileEntry { length: 60, path: vec!["a.bin".into()] },
                FileEntry { length: 40, path: vec!["b.bin".into()] },
            ],
        }
    }

    fn payload(range: std::ops::Range<usize>) -> Vec<u8> {
        range.map(|i| i as u8).collect()
    }

    #[tokio::test]
    async fn piece_spanning_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_file_info();
        let storage = Storage::open(dir.path(), &info).await.unwrap();

        storage.write_piece(0, &payload(0..64)).await.unwrap();
        storage.write_piece(1, &payload(64..100)).await.unwrap();

        assert_eq!(storage.read_piece(0).await.unwrap(), payload(0..64));
        assert_eq!(storage.read_piece(1).await.unwrap(), payload(64..100));

        // bytes landed in the right files
        let a = tokio::fs::read(dir.path().join("pack/a.bin")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("pack/b.bin")).await.unwrap();
        assert_eq!(a, payload(0..60));
        assert_eq!(b, payload(60..100));
    }

    #[tokio::test]
    async fn read_piece_checks_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_file_info();
        let storage = Storage::open(dir.path(), &info).await.unwrap();

        assert!(matches!(
            storage.read_piece(9).await,
            Err(Error::BlockOutOfBounds(9))
        ));
    }

    #[tokio::test]
    async fn write_piece_validates_length() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_file_info();
        let storage = Storage::open(dir.path(), &info).await.unwrap();

        // last piece is 36 bytes, a full-size buffer must be rejected
        assert!(storage.write_piece(1, &[0u8; 64]).await.is_err());
    }

    #[tokio::test]
    async fn rehash_recovers_completed_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_file_info();

        {
            let storage = Storage::open(dir.path(), &info).await.unwrap();
            storage.write_piece(1, &payload(64..100)).await.unwrap();
        }

        // reopen: files exist at full length, rehash finds piece 1 only
        let storage = Storage::open(dir.path(), &info).await.unwrap();
        let bf = SharedBitfield::with_capacity(0);
        let have = storage.rehash_into(&bf).await.unwrap();
        assert_eq!(have, 1);
        assert!(!bf.has_piece(0));
        assert!(bf.has_piece(1));
    }

    #[tokio::test]
    async fn fresh_files_skip_rehash() {
        let dir = tempfile::tempdir().unwrap();
        let info = two_file_info();
        let storage = Storage::open(dir.path(), &info).await.unwrap();

        let bf = SharedBitfield::with_capacity(0);
        assert_eq!(storage.rehash_into(&bf).await.unwrap(), 0);
        assert!(bf.is_empty());
        // capacity still extended to the piece count
        assert!(!bf.is_complete());
    }
}
