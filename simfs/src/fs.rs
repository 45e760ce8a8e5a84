use spin::Mutex;
use thiserror::Error;

use crate::alloc::VolumeControlBlock;
use crate::dir::{Directory, DirectoryEntry};
use crate::dump::VolumeDump;
use crate::table::{Handle, PerProcessTable, ProcessId, SystemWideTable};

/// 512 blocks of 2K make a 1 MiB volume.
pub const DEFAULT_TOTAL_BLOCKS: usize = 512;
pub const DEFAULT_BLOCK_SIZE: usize = 2048;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum FsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("process id {0} is outside the configured process range")]
    InvalidProcess(ProcessId),
    #[error("file '{0}' already exists")]
    AlreadyExists(String),
    #[error("found no file named '{0}'")]
    NotFound(String),
    #[error("not enough contiguous free blocks: needed {needed}, {free} free")]
    OutOfSpace { needed: usize, free: usize },
    #[error("system-wide open file table is full")]
    SystemTableFull,
    #[error("open file table for process {0} is full")]
    ProcessTableFull(ProcessId),
    #[error("file '{0}' is not open")]
    NotOpen(String),
    #[error("file '{name}' is not open by process {pid}")]
    NotOpenByCaller { name: String, pid: ProcessId },
    #[error("file '{0}' is still open by another process")]
    StillOpen(String),
    #[error("file '{0}' is empty")]
    Empty(String),
}

/// Listing row for one live file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub start_block: usize,
    pub size_in_blocks: usize,
    pub size_in_bytes: usize,
}

impl From<&DirectoryEntry> for FileInfo {
    fn from(entry: &DirectoryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            start_block: entry.start_block,
            size_in_blocks: entry.size_in_blocks,
            size_in_bytes: entry.size_in_bytes,
        }
    }
}

pub struct FileSystemBuilder {
    max_open_files: u32,
    max_processes: u32,
    total_blocks: usize,
    block_size: usize,
}

impl FileSystemBuilder {
    pub fn new(max_open_files: u32, max_processes: u32) -> Self {
        Self {
            max_open_files,
            max_processes,
            total_blocks: DEFAULT_TOTAL_BLOCKS,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Sets the number of blocks on the volume, including the reserved block 0.
    pub fn with_total_blocks(mut self, blocks: usize) -> Self {
        self.total_blocks = blocks;
        self
    }

    pub fn with_block_size(mut self, bytes: usize) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn build(self) -> Result<FileSystem, FsError> {
        if self.total_blocks < 2 {
            return Err(FsError::InvalidArgument(
                "volume needs at least two blocks".to_string(),
            ));
        }
        if self.block_size == 0 {
            return Err(FsError::InvalidArgument(
                "block size must be non-zero".to_string(),
            ));
        }

        Ok(FileSystem::format(
            self.max_open_files,
            self.max_processes,
            self.total_blocks,
            self.block_size,
        ))
    }
}

/// An in-memory volume with a flat directory and two-level open file tables,
/// shared between any number of callers.
///
/// Every operation runs under one lock, so each call is atomic with respect to
/// every other call and a failed call leaves the volume untouched. The lock is a
/// spin lock: contended callers busy-wait until the holder finishes its short
/// in-memory operation.
pub struct FileSystem {
    max_open_files: u32,
    max_processes: u32,
    total_blocks: usize,
    block_size: usize,
    inner: Mutex<FileSystemInner>,
}

pub(crate) struct FileSystemInner {
    pub(crate) vcb: VolumeControlBlock,
    pub(crate) directory: Directory,
    pub(crate) system_table: SystemWideTable,
    pub(crate) process_table: PerProcessTable,
}

impl FileSystem {
    /// Formats a default 512 x 2K volume.
    pub fn new(max_open_files: u32, max_processes: u32) -> Self {
        Self::format(
            max_open_files,
            max_processes,
            DEFAULT_TOTAL_BLOCKS,
            DEFAULT_BLOCK_SIZE,
        )
    }

    fn format(
        max_open_files: u32,
        max_processes: u32,
        total_blocks: usize,
        block_size: usize,
    ) -> Self {
        Self {
            max_open_files,
            max_processes,
            total_blocks,
            block_size,
            inner: Mutex::new(FileSystemInner {
                vcb: VolumeControlBlock::new(total_blocks, block_size),
                directory: Directory::new(total_blocks),
                system_table: SystemWideTable::new(max_open_files as usize),
                process_table: PerProcessTable::new(max_open_files as usize, max_processes),
            }),
        }
    }

    pub fn max_open_files(&self) -> u32 {
        self.max_open_files
    }

    pub fn max_processes(&self) -> u32 {
        self.max_processes
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn free_blocks(&self) -> usize {
        self.inner.lock().vcb.free_blocks()
    }

    /// Creates a file large enough for `size_in_bytes` and opens it for `pid`.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` for a taken name, `OutOfSpace` if no contiguous run is
    /// long enough, and the table errors of `open_file` if the implicit open
    /// could not succeed. In every case the volume is left unchanged.
    pub fn create_file(
        &self,
        name: &str,
        size_in_bytes: usize,
        pid: ProcessId,
    ) -> Result<Handle, FsError> {
        let result = self.inner.lock().create(name, size_in_bytes, pid);
        match &result {
            Ok(handle) => info!(
                "process {} created '{}' ({} bytes) as handle {}",
                pid, name, size_in_bytes, handle
            ),
            Err(e) => warn!("process {} failed to create '{}': {}", pid, name, e),
        }
        result
    }

    /// Opens `name` for `pid` and returns the caller's handle. Opening a file the
    /// caller already holds returns the same handle.
    pub fn open_file(&self, name: &str, pid: ProcessId) -> Result<Handle, FsError> {
        let result = self.inner.lock().open(name, pid);
        match &result {
            Ok(handle) => info!("process {} opened '{}' as handle {}", pid, name, handle),
            Err(e) => warn!("process {} failed to open '{}': {}", pid, name, e),
        }
        result
    }

    /// Releases the caller's handle. Both the system-wide and the per-process
    /// entry must exist, otherwise neither is touched.
    pub fn close_file(&self, name: &str, pid: ProcessId) -> Result<(), FsError> {
        let result = self.inner.lock().close(name, pid);
        match &result {
            Ok(()) => info!("process {} closed '{}'", pid, name),
            Err(e) => warn!("process {} failed to close '{}': {}", pid, name, e),
        }
        result
    }

    /// Returns a copy of the file contents. The caller must hold the file open.
    pub fn read_file(&self, name: &str, pid: ProcessId) -> Result<Vec<u8>, FsError> {
        let result = self.inner.lock().read(name, pid);
        match &result {
            Ok(data) => info!("process {} read {} bytes from '{}'", pid, data.len(), name),
            Err(e) => warn!("process {} failed to read '{}': {}", pid, name, e),
        }
        result
    }

    /// Appends `data` to the end of the file. The caller must hold the file open.
    pub fn write_file(&self, name: &str, pid: ProcessId, data: &[u8]) -> Result<(), FsError> {
        let result = self.inner.lock().write(name, pid, data);
        match &result {
            Ok(()) => info!("process {} wrote {} bytes to '{}'", pid, data.len(), name),
            Err(e) => warn!("process {} failed to write '{}': {}", pid, name, e),
        }
        result
    }

    /// Closes the caller's handle if it holds one, then removes the file and
    /// frees its blocks. Fails with `StillOpen`, changing nothing, while any
    /// other process holds the file.
    pub fn delete_file(&self, name: &str, pid: ProcessId) -> Result<(), FsError> {
        let result = self.inner.lock().delete(name, pid);
        match &result {
            Ok(()) => info!("process {} deleted '{}'", pid, name),
            Err(e) => warn!("process {} failed to delete '{}': {}", pid, name, e),
        }
        result
    }

    /// Snapshot of every live file ordered by start block.
    pub fn list_files(&self) -> Vec<FileInfo> {
        self.inner
            .lock()
            .directory
            .iter()
            .map(FileInfo::from)
            .collect()
    }

    pub fn stat(&self, name: &str) -> Result<FileInfo, FsError> {
        let inner = self.inner.lock();
        inner
            .directory
            .find(name)
            .and_then(|slot| inner.directory.get(slot))
            .map(FileInfo::from)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// The handle `pid` holds for `name`, if any.
    pub fn handle_of(&self, name: &str, pid: ProcessId) -> Option<Handle> {
        self.inner.lock().process_table.find(pid, name)
    }

    /// Diagnostic copy of the bitmap and tables, taken atomically.
    pub fn dump(&self) -> VolumeDump {
        VolumeDump::capture(&self.inner.lock())
    }
}

impl FileSystemInner {
    fn create(
        &mut self,
        name: &str,
        size_in_bytes: usize,
        pid: ProcessId,
    ) -> Result<Handle, FsError> {
        if name.is_empty() {
            return Err(FsError::InvalidArgument(
                "file name must not be empty".to_string(),
            ));
        }
        self.process_table.partition(pid)?;
        if self.directory.find(name).is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        // The implicit open must not fail once blocks are taken.
        self.check_open_capacity(name, pid)?;

        self.directory.create(&mut self.vcb, name, size_in_bytes)?;
        self.open(name, pid)
    }

    fn check_open_capacity(&self, name: &str, pid: ProcessId) -> Result<(), FsError> {
        if !self.process_table.has_room(pid) {
            return Err(FsError::ProcessTableFull(pid));
        }
        if !self.system_table.can_register(name) {
            return Err(FsError::SystemTableFull);
        }
        Ok(())
    }

    fn open(&mut self, name: &str, pid: ProcessId) -> Result<Handle, FsError> {
        self.process_table.partition(pid)?;
        let slot = self
            .directory
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if let Some(handle) = self.process_table.find(pid, name) {
            return Ok(handle);
        }
        self.check_open_capacity(name, pid)?;

        let fcb = self
            .directory
            .fcb(slot)
            .map(|fcb| fcb.first_block)
            .unwrap_or(slot);
        self.system_table.register(name, fcb)?;
        self.process_table.register(pid, name)
    }

    fn close(&mut self, name: &str, pid: ProcessId) -> Result<(), FsError> {
        self.process_table.partition(pid)?;
        if !self.system_table.is_open(name) {
            return Err(FsError::NotOpen(name.to_string()));
        }
        if self.process_table.find(pid, name).is_none() {
            return Err(FsError::NotOpenByCaller {
                name: name.to_string(),
                pid,
            });
        }

        self.process_table.unregister(pid, name)?;
        self.system_table.unregister(name)
    }

    fn read(&self, name: &str, pid: ProcessId) -> Result<Vec<u8>, FsError> {
        self.process_table.partition(pid)?;
        let entry = self
            .directory
            .find(name)
            .and_then(|slot| self.directory.get(slot))
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if !self.system_table.is_open(name) {
            return Err(FsError::NotOpen(name.to_string()));
        }
        if self.process_table.find(pid, name).is_none() {
            return Err(FsError::NotOpenByCaller {
                name: name.to_string(),
                pid,
            });
        }
        if entry.data.is_empty() {
            return Err(FsError::Empty(name.to_string()));
        }
        Ok(entry.data.clone())
    }

    fn write(&mut self, name: &str, pid: ProcessId, data: &[u8]) -> Result<(), FsError> {
        self.process_table.partition(pid)?;
        let slot = self
            .directory
            .find(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        if self.process_table.find(pid, name).is_none() {
            return Err(FsError::NotOpenByCaller {
                name: name.to_string(),
                pid,
            });
        }

        let entry = self
            .directory
            .get_mut(slot)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;
        entry.append(data)
    }

    fn delete(&mut self, name: &str, pid: ProcessId) -> Result<(), FsError> {
        self.process_table.partition(pid)?;
        if self.directory.find(name).is_none() {
            return Err(FsError::NotFound(name.to_string()));
        }
        let held_by_caller = self.process_table.find(pid, name).is_some();
        let others = self.process_table.holders(name) - held_by_caller as usize;
        if others > 0 {
            return Err(FsError::StillOpen(name.to_string()));
        }

        if held_by_caller {
            self.close(name, pid)?;
        }
        debug_assert!(!self.system_table.is_open(name));
        self.directory.delete(&mut self.vcb, name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_fs() -> FileSystem {
        FileSystemBuilder::new(4, 2)
            .with_total_blocks(16)
            .with_block_size(64)
            .build()
            .expect("Could not build file system.")
    }

    #[test]
    fn default_volume_is_one_mebibyte() {
        let fs = FileSystem::new(4, 2);

        assert_eq!(fs.total_blocks() * fs.block_size(), 1 << 20);
        assert_eq!(fs.free_blocks(), 511);
        assert_eq!(fs.max_open_files(), 4);
        assert_eq!(fs.max_processes(), 2);
    }

    #[test]
    fn builder_rejects_degenerate_geometry() {
        assert!(matches!(
            FileSystemBuilder::new(1, 1).with_total_blocks(1).build(),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            FileSystemBuilder::new(1, 1).with_block_size(0).build(),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn create_opens_file_for_creator() {
        let fs = small_fs();

        let handle = fs.create_file("a.txt", 100, 1).unwrap();

        assert_eq!(handle, 0);
        assert_eq!(fs.handle_of("a.txt", 1), Some(0));
        assert_eq!(fs.handle_of("a.txt", 2), None);
        assert_eq!(
            fs.stat("a.txt").unwrap(),
            FileInfo {
                name: "a.txt".to_string(),
                start_block: 1,
                size_in_blocks: 2,
                size_in_bytes: 100,
            }
        );
    }

    #[test]
    fn create_with_empty_name_returns_error() {
        let fs = small_fs();

        assert!(matches!(
            fs.create_file("", 10, 1),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn create_without_table_room_allocates_nothing() {
        let fs = FileSystemBuilder::new(1, 2)
            .with_total_blocks(16)
            .with_block_size(64)
            .build()
            .unwrap();
        fs.create_file("a", 10, 1).unwrap();

        assert_eq!(fs.create_file("b", 10, 1), Err(FsError::ProcessTableFull(1)));
        assert_eq!(fs.create_file("b", 10, 2), Err(FsError::SystemTableFull));
        assert_eq!(fs.free_blocks(), 14);
        assert_eq!(fs.stat("b"), Err(FsError::NotFound("b".to_string())));
    }

    #[test]
    fn create_for_unknown_process_returns_error() {
        let fs = small_fs();

        assert_eq!(fs.create_file("a", 10, 3), Err(FsError::InvalidProcess(3)));
        assert_eq!(fs.free_blocks(), 15);
    }

    #[test]
    fn every_operation_rejects_unknown_process() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();
        fs.write_file("a", 1, b"data").unwrap();
        let before = fs.dump();

        for &pid in &[0, 3] {
            let invalid = Err(FsError::InvalidProcess(pid));
            assert_eq!(fs.open_file("a", pid), invalid.clone().map(|()| 0));
            assert_eq!(fs.read_file("a", pid), invalid.clone().map(|()| Vec::new()));
            assert_eq!(fs.write_file("a", pid, b"x"), invalid);
            assert_eq!(fs.close_file("a", pid), invalid);
            assert_eq!(fs.delete_file("a", pid), invalid);
        }

        let after = fs.dump();
        assert_eq!(after.files, before.files);
        assert_eq!(after.system_table, before.system_table);
        assert_eq!(after.process_table, before.process_table);
        assert_eq!(fs.read_file("a", 1).unwrap(), b"data".to_vec());
    }

    #[test]
    fn volume_without_processes_rejects_every_caller() {
        let fs = FileSystem::new(0, 0);

        assert_eq!(fs.create_file("a", 10, 1), Err(FsError::InvalidProcess(1)));
        assert_eq!(fs.open_file("a", 1), Err(FsError::InvalidProcess(1)));
        assert_eq!(fs.free_blocks(), 511);
        assert!(fs.list_files().is_empty());
    }

    #[test]
    fn volume_without_open_slots_cannot_create_files() {
        let fs = FileSystemBuilder::new(0, 2)
            .with_total_blocks(16)
            .with_block_size(64)
            .build()
            .unwrap();

        assert_eq!(fs.create_file("a", 10, 1), Err(FsError::ProcessTableFull(1)));
        assert_eq!(fs.create_file("a", 10, 2), Err(FsError::ProcessTableFull(2)));
        assert_eq!(
            fs.open_file("a", 1),
            Err(FsError::NotFound("a".to_string()))
        );
        assert_eq!(fs.free_blocks(), 15);
        assert!(fs.dump().system_table.is_empty());
    }

    #[test]
    fn create_with_huge_size_returns_out_of_space() {
        let fs = FileSystem::new(4, 2);
        fs.create_file("a", 100, 1).unwrap();
        let before = fs.dump();

        assert_eq!(
            fs.create_file("big", usize::MAX, 1),
            Err(FsError::OutOfSpace {
                needed: usize::MAX / DEFAULT_BLOCK_SIZE + 1,
                free: 510
            })
        );

        let after = fs.dump();
        assert_eq!(fs.free_blocks(), 510);
        assert_eq!(after.files, before.files);
        assert_eq!(after.free_map, before.free_map);
        assert_eq!(fs.stat("big"), Err(FsError::NotFound("big".to_string())));
    }

    #[test]
    fn failed_allocation_leaves_open_tables_unchanged() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();
        fs.open_file("a", 2).unwrap();
        let before = fs.dump();

        // 14 blocks are free; ask for 15.
        assert_eq!(
            fs.create_file("b", 15 * 64, 2),
            Err(FsError::OutOfSpace {
                needed: 15,
                free: 14
            })
        );

        let after = fs.dump();
        assert_eq!(after.system_table, before.system_table);
        assert_eq!(after.process_table, before.process_table);
        assert_eq!(fs.handle_of("b", 2), None);
    }

    #[test]
    fn builder_geometry_is_reported_without_locking() {
        let fs = small_fs();

        assert_eq!(fs.total_blocks(), 16);
        assert_eq!(fs.block_size(), 64);
        let dump = fs.dump();
        assert_eq!(dump.total_blocks, fs.total_blocks());
        assert_eq!(dump.block_size, fs.block_size());
    }

    #[test]
    fn reopen_by_same_process_returns_same_handle() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();

        assert_eq!(fs.open_file("a", 1).unwrap(), 0);
        fs.close_file("a", 1).unwrap();
        assert_eq!(
            fs.close_file("a", 1),
            Err(FsError::NotOpen("a".to_string()))
        );
    }

    #[test]
    fn opening_missing_file_returns_error() {
        let fs = small_fs();

        assert_eq!(
            fs.open_file("missing", 1),
            Err(FsError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn close_by_non_holder_leaves_tables_alone() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();

        assert_eq!(
            fs.close_file("a", 2),
            Err(FsError::NotOpenByCaller {
                name: "a".to_string(),
                pid: 2
            })
        );
        assert_eq!(fs.handle_of("a", 1), Some(0));
        assert_eq!(fs.read_file("a", 1), Err(FsError::Empty("a".to_string())));
    }

    #[test]
    fn read_requires_caller_handle() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();
        fs.write_file("a", 1, b"secret").unwrap();

        assert_eq!(
            fs.read_file("a", 2),
            Err(FsError::NotOpenByCaller {
                name: "a".to_string(),
                pid: 2
            })
        );
        fs.open_file("a", 2).unwrap();
        assert_eq!(fs.read_file("a", 2).unwrap(), b"secret".to_vec());
    }

    #[test]
    fn write_requires_caller_handle() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();

        assert_eq!(
            fs.write_file("a", 2, b"x"),
            Err(FsError::NotOpenByCaller {
                name: "a".to_string(),
                pid: 2
            })
        );
        assert_eq!(
            fs.write_file("b", 1, b"x"),
            Err(FsError::NotFound("b".to_string()))
        );
    }

    #[test]
    fn delete_fails_while_other_process_holds_file() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();
        fs.open_file("a", 2).unwrap();

        assert_eq!(fs.delete_file("a", 1), Err(FsError::StillOpen("a".to_string())));
        // The caller's own handle survives the failed delete.
        assert_eq!(fs.handle_of("a", 1), Some(0));

        fs.close_file("a", 2).unwrap();
        fs.delete_file("a", 1).unwrap();
        assert_eq!(fs.free_blocks(), 15);
        assert!(fs.list_files().is_empty());
    }

    #[test]
    fn delete_of_closed_file_succeeds() {
        let fs = small_fs();
        fs.create_file("a", 10, 1).unwrap();
        fs.close_file("a", 1).unwrap();

        fs.delete_file("a", 2).unwrap();
        assert_eq!(
            fs.delete_file("a", 2),
            Err(FsError::NotFound("a".to_string()))
        );
    }
}
