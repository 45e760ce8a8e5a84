//! An in-memory model of a simple disk file system: a volume control block with
//! a free block bitmap, a flat directory with one file control block per file,
//! and system-wide plus per-process open file tables shared by concurrent
//! callers.
#[macro_use]
extern crate log;

mod alloc;
mod dir;
mod dump;
mod fs;
mod table;

pub use crate::dump::VolumeDump;
pub use crate::fs::{
    FileInfo, FileSystem, FileSystemBuilder, FsError, DEFAULT_BLOCK_SIZE, DEFAULT_TOTAL_BLOCKS,
};
pub use crate::table::{Handle, PerProcessEntry, ProcessId, SystemWideEntry};
