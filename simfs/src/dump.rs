use std::fmt;
use std::io::Write;

use crate::alloc::State;
use crate::fs::{FileInfo, FileSystemInner};
use crate::table::{PerProcessEntry, ProcessId, SystemWideEntry};

/// Blocks per line when rendering the free block bitmap.
const BITMAP_ROW: usize = 50;

/// Point-in-time copy of the volume's control structures, for debugging and
/// tests. Holds no reference into the live file system.
#[derive(Debug, Clone)]
pub struct VolumeDump {
    pub total_blocks: usize,
    pub block_size: usize,
    pub free_blocks: usize,
    pub largest_free_run: usize,
    /// `true` for every free block.
    pub free_map: Vec<bool>,
    /// The bitmap words exactly as stored, one set bit per used block.
    pub raw_bitmap: Vec<u8>,
    pub files: Vec<FileInfo>,
    /// `(slot, entry)` for each occupied system-wide slot.
    pub system_table: Vec<(usize, SystemWideEntry)>,
    pub process_table: Vec<(ProcessId, PerProcessEntry)>,
}

impl VolumeDump {
    pub(crate) fn capture(inner: &FileSystemInner) -> Self {
        let bitmap = inner.vcb.bitmap();
        Self {
            total_blocks: inner.vcb.total_blocks(),
            block_size: inner.vcb.block_size(),
            free_blocks: inner.vcb.free_blocks(),
            largest_free_run: inner.vcb.largest_free_run(),
            free_map: (0..bitmap.len())
                .map(|blocknr| bitmap.get(blocknr) == State::Free)
                .collect(),
            raw_bitmap: bitmap.serialize().to_vec(),
            files: inner.directory.iter().map(FileInfo::from).collect(),
            system_table: inner
                .system_table
                .entries()
                .map(|(slot, e)| (slot, e.clone()))
                .collect(),
            process_table: inner
                .process_table
                .entries()
                .map(|(pid, e)| (pid, e.clone()))
                .collect(),
        }
    }

    /// Writes the rendered dump to any sink, e.g. a log file.
    pub fn write_to<W: Write>(&self, mut out: W) -> std::io::Result<()> {
        write!(out, "{}", self)?;
        out.flush()
    }
}

impl fmt::Display for VolumeDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Volume: {} blocks x {} bytes, {} free (largest run {})",
            self.total_blocks, self.block_size, self.free_blocks, self.largest_free_run
        )?;
        writeln!(f, "Free block bitmap:")?;
        for row in self.free_map.chunks(BITMAP_ROW) {
            let line: String = row.iter().map(|&free| if free { '1' } else { '0' }).collect();
            writeln!(f, "{}", line)?;
        }

        writeln!(f, "Directory:")?;
        for file in &self.files {
            writeln!(
                f,
                "  {} start={} blocks={} bytes={}",
                file.name, file.start_block, file.size_in_blocks, file.size_in_bytes
            )?;
        }

        writeln!(f, "System-wide open file table:")?;
        for (slot, entry) in &self.system_table {
            writeln!(
                f,
                "  [{}] {} fcb={} openers={}",
                slot, entry.name, entry.fcb, entry.open_count
            )?;
        }

        writeln!(f, "Per-process open file table:")?;
        for (pid, entry) in &self.process_table {
            writeln!(f, "  pid={} handle={} {}", pid, entry.handle, entry.name)?;
        }
        Ok(())
    }
}
