//! The piece store: a bounded LRU of verified pieces in front of disk, so
//! serving uploads does not cost a file read per request.

use std::{
    num::NonZeroUsize,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use lru::LruCache;

use crate::{disk::Storage, error::Error};

/// Read-through cache from piece index to its bytes. Hits refresh recency;
/// misses read the whole piece from [`Storage`] and insert it, evicting the
/// least recently touched piece when full.
///
/// The lock is only held for the map operation itself, never across awaits,
/// so a plain std Mutex is fine here.
#[derive(Debug)]
pub struct PieceCache {
    storage: Arc<Storage>,
    pieces: Mutex<LruCache<u32, Bytes>>,
}

impl PieceCache {
    /// Capacities below one are rounded up to one.
    pub fn new(storage: Arc<Storage>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::MIN);
        Self { storage, pieces: Mutex::new(LruCache::new(capacity)) }
    }

    /// A whole piece; `Bytes` is reference counted, callers get a cheap
    /// read-only view.
    pub async fn piece(&self, index: u32) -> Result<Bytes, Error> {
        if let Some(data) = self.pieces.lock().unwrap().get(&index).cloned()
        {
            return Ok(data);
        }

        let data = Bytes::from(self.storage.read_piece(index).await?);
        self.pieces.lock().unwrap().put(index, data.clone());
        Ok(data)
    }

    /// A block is a thin slice of its piece.
    pub async fn block(
        &self,
        index: u32,
        begin: u32,
        len: u32,
    ) -> Result<Bytes, Error> {
        let piece = self.piece(index).await?;

        let begin = begin as usize;
        let end = begin
            .checked_add(len as usize)
            .filter(|&end| end <= piece.len())
            .ok_or(Error::BlockOutOfBounds(index))?;

        Ok(piece.slice(begin..end))
    }

    /// Insert a piece that was just verified and written out, so immediate
    /// requests for it skip the disk.
    pub fn put(&self, index: u32, data: Bytes) {
        self.pieces.lock().unwrap().put(index, data);
    }

    pub fn contains(&self, index: u32) -> bool {
        // peek does not refresh recency, a membership test is not a use
        self.pieces.lock().unwrap().peek(&index).is_some()
    }

    pub fn len(&self) -> usize {
        self.pieces.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pieces.lock().unwrap().is_empty()
    }
}
