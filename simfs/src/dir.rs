use crate::alloc::VolumeControlBlock;
use crate::fs::FsError;

/// A named file in the flat directory together with its contents.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub name: String,
    /// First block of the contiguous extent, also the slot of this entry.
    pub start_block: usize,
    pub size_in_blocks: usize,
    /// Size requested at creation plus every byte appended since.
    pub size_in_bytes: usize,
    pub data: Vec<u8>,
}

impl DirectoryEntry {
    /// Appends to the end of the file. Writes past the allocated extent are
    /// accepted; only the recorded byte size grows.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the byte size would overflow. The file is unchanged.
    pub fn append(&mut self, data: &[u8]) -> Result<(), FsError> {
        let size_in_bytes = self
            .size_in_bytes
            .checked_add(data.len())
            .ok_or_else(|| {
                FsError::InvalidArgument(format!("write would overflow size of '{}'", self.name))
            })?;
        self.data.extend_from_slice(data);
        self.size_in_bytes = size_in_bytes;
        Ok(())
    }

    /// Block range `[start, end)` owned by the file.
    pub fn extent(&self) -> std::ops::Range<usize> {
        self.start_block..self.start_block + self.size_in_blocks
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileControlBlock {
    pub size_in_blocks: usize,
    pub first_block: usize,
}

/// Directory and file control blocks share one slot per volume block. A live
/// file occupies the slot at its start block, so the slot number doubles as
/// the FCB pointer handed to the system-wide open table.
pub struct Directory {
    entries: Vec<Option<DirectoryEntry>>,
    fcbs: Vec<Option<FileControlBlock>>,
}

impl Directory {
    pub fn new(total_blocks: usize) -> Self {
        Self {
            entries: vec![None; total_blocks],
            fcbs: vec![None; total_blocks],
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| matches!(entry, Some(e) if e.name == name))
    }

    pub fn get(&self, slot: usize) -> Option<&DirectoryEntry> {
        self.entries.get(slot).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut DirectoryEntry> {
        self.entries.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn fcb(&self, slot: usize) -> Option<&FileControlBlock> {
        self.fcbs.get(slot).and_then(Option::as_ref)
    }

    /// Live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter().filter_map(Option::as_ref)
    }

    /// Allocates an extent for `size_in_bytes` and records the new file. Returns
    /// the slot (start block) of the entry.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` if the name is taken, `OutOfSpace` if the allocator
    /// cannot find a long enough run. Neither case changes any state.
    pub fn create(
        &mut self,
        vcb: &mut VolumeControlBlock,
        name: &str,
        size_in_bytes: usize,
    ) -> Result<usize, FsError> {
        if self.find(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let size_in_blocks = vcb.blocks_needed(size_in_bytes);
        let start = vcb.allocate(size_in_blocks)?;
        debug_assert!(self.entries[start].is_none() && self.fcbs[start].is_none());

        self.fcbs[start] = Some(FileControlBlock {
            size_in_blocks,
            first_block: start,
        });
        self.entries[start] = Some(DirectoryEntry {
            name: name.to_string(),
            start_block: start,
            size_in_blocks,
            size_in_bytes,
            data: Vec::new(),
        });
        Ok(start)
    }

    /// Removes the file and returns its extent to the allocator.
    pub fn delete(
        &mut self,
        vcb: &mut VolumeControlBlock,
        name: &str,
    ) -> Result<DirectoryEntry, FsError> {
        let slot = self
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        let fcb = self.fcbs[slot].take();
        let entry = self.entries[slot]
            .take()
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        debug_assert_eq!(fcb.map(|f| f.size_in_blocks), Some(entry.size_in_blocks));

        vcb.free(entry.start_block, entry.size_in_blocks);
        debug!("removed '{}' from blocks {:?}", name, entry.extent());
        Ok(entry)
    }
}
