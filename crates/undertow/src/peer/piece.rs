//! Bookkeeping for a piece in transit: which blocks have been requested,
//! which have arrived, and when the piece is whole.

use crate::{
    error::Error,
    wire::{Block, BlockInfo, BLOCK_LEN},
};

/// Outstanding block requests allowed per peer at any moment. Keeping the
/// pipeline full hides the round trip latency of each request.
pub const MAX_PIPELINED_REQUESTS: usize = 10;

/// Where one block of the piece stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockState {
    NotRequested,
    Requested,
    Have,
}

/// A piece being assembled from 16 KiB blocks. Requests are handed out in
/// order; the final block is shorter whenever the piece size is not a
/// multiple of [`BLOCK_LEN`].
#[derive(Debug)]
pub struct PieceInFlight {
    pub index: u32,
    size: u32,
    buf: Vec<u8>,
    /// One entry per block, in piece order.
    blocks: Vec<BlockState>,
    /// Count of entries currently in `Requested`.
    in_flight: usize,
}

impl PieceInFlight {
    pub fn new(index: u32, size: u32) -> Self {
        let count = (size as usize).div_ceil(BLOCK_LEN as usize);
        Self {
            index,
            size,
            buf: vec![0u8; size as usize],
            blocks: vec![BlockState::NotRequested; count],
            in_flight: 0,
        }
    }

    fn block_len(&self, block: usize) -> u32 {
        BLOCK_LEN.min(self.size - block as u32 * BLOCK_LEN)
    }

    /// The next block to request, or None when the pipeline is full or the
    /// whole piece has been requested already.
    pub fn next_request(&mut self) -> Option<BlockInfo> {
        if self.in_flight >= MAX_PIPELINED_REQUESTS {
            return None;
        }
        let block = self
            .blocks
            .iter()
            .position(|s| *s == BlockState::NotRequested)?;

        self.blocks[block] = BlockState::Requested;
        self.in_flight += 1;

        Some(BlockInfo {
            index: self.index,
            begin: block as u32 * BLOCK_LEN,
            len: self.block_len(block),
        })
    }

    /// Copy an arrived block into place and mark it held. A duplicate of a
    /// block already held changes nothing: it neither frees a pipeline slot
    /// nor advances completion.
    pub fn record(&mut self, block: &Block) -> Result<(), Error> {
        if block.index != self.index {
            return Err(Error::MessageResponse);
        }

        let n = (block.begin / BLOCK_LEN) as usize;
        if block.begin % BLOCK_LEN != 0
            || n >= self.blocks.len()
            || block.block.len() != self.block_len(n) as usize
        {
            return Err(Error::BlockOutOfBounds(self.index));
        }

        let begin = block.begin as usize;
        self.buf[begin..begin + block.block.len()]
            .copy_from_slice(&block.block);

        if self.blocks[n] == BlockState::Requested {
            self.in_flight -= 1;
        }
        self.blocks[n] = BlockState::Have;

        Ok(())
    }

    /// Whole once every block has arrived. Any block still requested or
    /// never requested means more reads are needed.
    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|s| *s == BlockState::Have)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_is_capped() {
        // 20 full blocks, only 10 may be outstanding
        let mut piece = PieceInFlight::new(0, BLOCK_LEN * 20);

        let mut requested = Vec::new();
        while let Some(info) = piece.next_request() {
            requested.push(info);
        }
        assert_eq!(requested.len(), MAX_PIPELINED_REQUESTS);
        assert_eq!(requested[0].begin, 0);
        assert_eq!(requested[9].begin, 9 * BLOCK_LEN);

        // one arrival frees one slot
        piece
            .record(&Block {
                index: 0,
                begin: 0,
                block: vec![0; BLOCK_LEN as usize],
            })
            .unwrap();
        let next = piece.next_request().unwrap();
        assert_eq!(next.begin, 10 * BLOCK_LEN);
        assert!(piece.next_request().is_none());
    }

    #[test]
    fn short_final_block() {
        let mut piece = PieceInFlight::new(3, BLOCK_LEN + 100);

        let first = piece.next_request().unwrap();
        assert_eq!(first.len, BLOCK_LEN);
        let last = piece.next_request().unwrap();
        assert_eq!(last.begin, BLOCK_LEN);
        assert_eq!(last.len, 100);
        assert!(piece.next_request().is_none());
    }

    #[test]
    fn assembles_out_of_order() {
        let mut piece = PieceInFlight::new(1, BLOCK_LEN + 4);
        piece.next_request();
        piece.next_request();

        piece
            .record(&Block {
                index: 1,
                begin: BLOCK_LEN,
                block: vec![0xbb; 4],
            })
            .unwrap();
        assert!(!piece.is_complete());

        piece
            .record(&Block {
                index: 1,
                begin: 0,
                block: vec![0xaa; BLOCK_LEN as usize],
            })
            .unwrap();
        assert!(piece.is_complete());

        let buf = piece.into_bytes();
        assert_eq!(&buf[..BLOCK_LEN as usize], &vec![0xaa; BLOCK_LEN as usize][..]);
        assert_eq!(&buf[BLOCK_LEN as usize..], &[0xbb; 4]);
    }

    #[test]
    fn duplicate_delivery_does_not_complete_the_piece() {
        let mut piece = PieceInFlight::new(4, BLOCK_LEN * 2);
        piece.next_request();
        piece.next_request();

        let first = Block {
            index: 4,
            begin: 0,
            block: vec![0xcd; BLOCK_LEN as usize],
        };
        piece.record(&first).unwrap();
        piece.record(&first).unwrap();
        // the second block is still outstanding
        assert!(!piece.is_complete());

        piece
            .record(&Block {
                index: 4,
                begin: BLOCK_LEN,
                block: vec![0xef; BLOCK_LEN as usize],
            })
            .unwrap();
        assert!(piece.is_complete());
    }

    #[test]
    fn duplicate_delivery_does_not_free_pipeline_slots() {
        let mut piece = PieceInFlight::new(0, BLOCK_LEN * 12);
        while piece.next_request().is_some() {}

        let first = Block {
            index: 0,
            begin: 0,
            block: vec![0; BLOCK_LEN as usize],
        };
        piece.record(&first).unwrap();
        piece.record(&first).unwrap();

        // one arrival opened exactly one slot, the duplicate none
        assert!(piece.next_request().is_some());
        assert!(piece.next_request().is_none());
    }

    #[test]
    fn rejects_stray_blocks() {
        let mut piece = PieceInFlight::new(2, 100);
        piece.next_request();

        // wrong piece
        assert!(piece
            .record(&Block { index: 9, begin: 0, block: vec![0; 10] })
            .is_err());
        // unaligned offset
        assert!(matches!(
            piece.record(&Block { index: 2, begin: 96, block: vec![0; 10] }),
            Err(Error::BlockOutOfBounds(2))
        ));
        // right offset, wrong length (the only block is 100 bytes)
        assert!(matches!(
            piece.record(&Block { index: 2, begin: 0, block: vec![0; 10] }),
            Err(Error::BlockOutOfBounds(2))
        ));
    }
}
