use std::ops::Range;

use crate::fs::FsError;

/// Positive caller id, `1..=max_processes`. Only used to pick a partition of the
/// per-process table.
pub type ProcessId = u32;

/// Offset of an open file inside the owning process' partition. Meaningless
/// without the process id that obtained it.
pub type Handle = u32;

/// Fixed-capacity table of optional entries. New entries take the first free
/// slot; the table never grows.
pub struct SlotTable<T> {
    entries: Vec<Option<T>>,
}

impl<T> SlotTable<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn first_free_in(&self, range: Range<usize>) -> Option<usize> {
        let start = range.start;
        self.entries[range]
            .iter()
            .position(Option::is_none)
            .map(|pos| start + pos)
    }

    pub fn position_in<P>(&self, range: Range<usize>, mut pred: P) -> Option<usize>
    where
        P: FnMut(&T) -> bool,
    {
        let start = range.start;
        self.entries[range]
            .iter()
            .position(|x| x.as_ref().map_or(false, &mut pred))
            .map(|pos| start + pos)
    }

    pub fn insert(&mut self, id: usize, item: T) {
        debug_assert!(self.entries[id].is_none(), "slot {} already in use", id);
        self.entries[id] = Some(item);
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.entries.get_mut(id).and_then(Option::as_mut)
    }

    pub fn dealloc(&mut self, id: usize) -> Option<T> {
        self.entries.get_mut(id).and_then(Option::take)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(id, entry)| entry.as_ref().map(|e| (id, e)))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemWideEntry {
    pub name: String,
    /// Start block of the file, the key of its file control block.
    pub fcb: usize,
    /// Number of processes currently holding a handle to the file.
    pub open_count: u32,
}

/// Files open by at least one process. Each open file holds exactly one slot no
/// matter how many processes share it.
pub struct SystemWideTable {
    slots: SlotTable<SystemWideEntry>,
}

impl SystemWideTable {
    pub fn new(max_open_files: usize) -> Self {
        Self {
            slots: SlotTable::new(max_open_files),
        }
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.slots
            .position_in(0..self.slots.capacity(), |e| e.name == name)
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Whether `register(name, ..)` would succeed.
    pub fn can_register(&self, name: &str) -> bool {
        self.is_open(name) || self.slots.first_free_in(0..self.slots.capacity()).is_some()
    }

    /// Records one more opener of `name`, claiming a slot for the first one.
    pub fn register(&mut self, name: &str, fcb: usize) -> Result<usize, FsError> {
        if let Some(slot) = self.find(name) {
            if let Some(entry) = self.slots.get_mut(slot) {
                entry.open_count += 1;
            }
            return Ok(slot);
        }

        let slot = self
            .slots
            .first_free_in(0..self.slots.capacity())
            .ok_or(FsError::SystemTableFull)?;
        self.slots.insert(
            slot,
            SystemWideEntry {
                name: name.to_string(),
                fcb,
                open_count: 1,
            },
        );
        debug!("system-wide slot {} now holds '{}'", slot, name);
        Ok(slot)
    }

    /// Drops one opener of `name`; the slot is released with the last one.
    pub fn unregister(&mut self, name: &str) -> Result<(), FsError> {
        let slot = self
            .find(name)
            .ok_or_else(|| FsError::NotOpen(name.to_string()))?;
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| FsError::NotOpen(name.to_string()))?;
        debug_assert!(entry.open_count > 0, "open slot {} has no openers", slot);
        entry.open_count -= 1;
        if entry.open_count == 0 {
            self.slots.dealloc(slot);
            debug!("system-wide slot {} released by '{}'", slot, name);
        }
        Ok(())
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, &SystemWideEntry)> {
        self.slots.iter()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerProcessEntry {
    pub name: String,
    pub handle: Handle,
}

/// One flat array split into `max_processes` partitions of `max_open_files`
/// slots. Process `p` owns `[(p - 1) * max_open_files, p * max_open_files)`.
pub struct PerProcessTable {
    max_open_files: usize,
    max_processes: u32,
    slots: SlotTable<PerProcessEntry>,
}

impl PerProcessTable {
    pub fn new(max_open_files: usize, max_processes: u32) -> Self {
        Self {
            max_open_files,
            max_processes,
            slots: SlotTable::new(max_open_files * max_processes as usize),
        }
    }

    pub fn partition(&self, pid: ProcessId) -> Result<Range<usize>, FsError> {
        if pid == 0 || pid > self.max_processes {
            return Err(FsError::InvalidProcess(pid));
        }
        let start = (pid as usize - 1) * self.max_open_files;
        Ok(start..start + self.max_open_files)
    }

    pub fn find(&self, pid: ProcessId, name: &str) -> Option<Handle> {
        let range = self.partition(pid).ok()?;
        let start = range.start;
        self.slots
            .position_in(range, |e| e.name == name)
            .map(|slot| (slot - start) as Handle)
    }

    pub fn has_room(&self, pid: ProcessId) -> bool {
        self.partition(pid)
            .map(|range| self.slots.first_free_in(range).is_some())
            .unwrap_or(false)
    }

    /// Number of processes holding `name`.
    pub fn holders(&self, name: &str) -> usize {
        self.slots.iter().filter(|(_, e)| e.name == name).count()
    }

    pub fn register(&mut self, pid: ProcessId, name: &str) -> Result<Handle, FsError> {
        let range = self.partition(pid)?;
        let start = range.start;
        let slot = self
            .slots
            .first_free_in(range)
            .ok_or(FsError::ProcessTableFull(pid))?;
        let handle = (slot - start) as Handle;
        self.slots.insert(
            slot,
            PerProcessEntry {
                name: name.to_string(),
                handle,
            },
        );
        debug!("process {} holds '{}' as handle {}", pid, name, handle);
        Ok(handle)
    }

    pub fn unregister(&mut self, pid: ProcessId, name: &str) -> Result<Handle, FsError> {
        let range = self.partition(pid)?;
        let slot = self
            .slots
            .position_in(range, |e| e.name == name)
            .ok_or_else(|| FsError::NotOpenByCaller {
                name: name.to_string(),
                pid,
            })?;
        let entry = self.slots.dealloc(slot).ok_or_else(|| FsError::NotOpenByCaller {
            name: name.to_string(),
            pid,
        })?;
        debug!("process {} released handle {} of '{}'", pid, entry.handle, name);
        Ok(entry.handle)
    }

    /// Live entries paired with their owning process, in table order.
    pub fn entries(&self) -> impl Iterator<Item = (ProcessId, &PerProcessEntry)> {
        let per_process = self.max_open_files;
        self.slots
            .iter()
            .map(move |(slot, e)| ((slot / per_process) as ProcessId + 1, e))
    }
}
