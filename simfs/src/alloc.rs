use crate::fs::FsError;
use zerocopy::AsBytes;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum State {
    Free,
    Used,
}

/// Tracks one bit per logical block of the volume. A set bit marks the block as
/// used, a clear bit as free.
#[derive(Clone)]
pub struct Bitmap {
    bitmap: Vec<u64>,
    /// Number of meaningful bits. Trailing bits of the last word are never touched.
    len: usize,
}

impl Bitmap {
    pub fn new(len: usize) -> Self {
        Self {
            bitmap: vec![0; (len + 63) / 64],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Raw view of the bitmap words in native byte order.
    pub fn serialize(&self) -> &[u8] {
        self.bitmap.as_slice().as_bytes()
    }

    pub fn get(&self, blocknr: usize) -> State {
        assert!(blocknr < self.len, "block {} out of range", blocknr);
        // Grab the u64 containing the significant bit.
        let outer_offset = self.bitmap[blocknr / 64];

        let inner_offset = blocknr % 64;
        let mask = 0b01_u64 << inner_offset;
        match (outer_offset & mask) >> inner_offset {
            0 => State::Free,
            1 => State::Used,
            _ => unreachable!("Block state was neither 0 nor 1, bitmasking is broken."),
        }
    }

    pub fn set_reserved(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} out of range", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[blocknr / 64] |= mask;
    }

    pub fn set_free(&mut self, blocknr: usize) {
        assert!(blocknr < self.len, "block {} out of range", blocknr);
        let mask = 0b01_u64 << (blocknr % 64);
        self.bitmap[blocknr / 64] &= !mask;
    }

    pub fn free_runs(&self) -> FreeRuns<'_> {
        FreeRuns {
            marker: 0,
            bitmap: self,
        }
    }
}

/// Walks the bitmap front to back yielding every maximal run of free blocks as
/// `(start, length)`.
pub struct FreeRuns<'a> {
    /// Keeps track of the next starting place for looking for available blocks.
    marker: usize,
    bitmap: &'a Bitmap,
}

impl<'a> Iterator for FreeRuns<'a> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let len = self.bitmap.len();
        while self.marker < len && self.bitmap.get(self.marker) == State::Used {
            self.marker += 1;
        }
        if self.marker >= len {
            return None;
        }

        let start = self.marker;
        while self.marker < len && self.bitmap.get(self.marker) == State::Free {
            self.marker += 1;
        }
        Some((start, self.marker - start))
    }
}

/// Describes the volume geometry and owns the free space map. Block 0 is
/// reserved when the volume is formatted and is never handed out.
///
/// Allocation is strictly contiguous first-fit: a request succeeds only if a
/// single run of free blocks is long enough, even when the total number of free
/// blocks would cover it.
pub struct VolumeControlBlock {
    total_blocks: usize,
    block_size: usize,
    /// Always equal to the number of free bits in `bitmap`.
    free_blocks: usize,
    bitmap: Bitmap,
}

impl VolumeControlBlock {
    pub fn new(total_blocks: usize, block_size: usize) -> Self {
        let mut bitmap = Bitmap::new(total_blocks);
        bitmap.set_reserved(0);
        Self {
            total_blocks,
            block_size,
            free_blocks: total_blocks - 1,
            bitmap,
        }
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Number of blocks backing a file of `bytes` bytes. Empty files still own a
    /// single block.
    pub fn blocks_needed(&self, bytes: usize) -> usize {
        let partial = (bytes % self.block_size != 0) as usize;
        std::cmp::max(1, bytes / self.block_size + partial)
    }

    pub fn largest_free_run(&self) -> usize {
        self.bitmap
            .free_runs()
            .map(|(_, len)| len)
            .max()
            .unwrap_or(0)
    }

    /// Reserves `nblocks` contiguous blocks and returns the first block number.
    ///
    /// # Errors
    ///
    /// Returns `OutOfSpace` if no free run is long enough. Nothing is reserved
    /// in that case.
    pub fn allocate(&mut self, nblocks: usize) -> Result<usize, FsError> {
        debug_assert!(nblocks > 0);
        let out_of_space = FsError::OutOfSpace {
            needed: nblocks,
            free: self.free_blocks,
        };
        if nblocks > self.free_blocks {
            return Err(out_of_space);
        }
        let start = self
            .bitmap
            .free_runs()
            .find(|&(_, len)| len >= nblocks)
            .map(|(start, _)| start)
            .ok_or(out_of_space)?;

        for blocknr in start..start + nblocks {
            self.bitmap.set_reserved(blocknr);
        }
        self.free_blocks -= nblocks;
        debug!("allocated blocks {}..{}", start, start + nblocks);
        Ok(start)
    }

    /// Returns a range handed out by `allocate` to the free pool. The range is
    /// trusted; releasing blocks that are already free is a caller bug.
    pub fn free(&mut self, start: usize, nblocks: usize) {
        debug_assert!(start > 0, "block 0 is reserved");
        for blocknr in start..start + nblocks {
            debug_assert_eq!(
                self.bitmap.get(blocknr),
                State::Used,
                "double free of block {}",
                blocknr
            );
            self.bitmap.set_free(blocknr);
        }
        self.free_blocks += nblocks;
        debug!("freed blocks {}..{}", start, start + nblocks);
    }
}
