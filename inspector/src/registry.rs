//! The module containing the managed-process table and its walk cursors.

use crate::config::MAX_PIDS;
use hybmem_common::Tier;

/// One managed process: its PID and the attached address-space handle.
#[derive(Debug)]
pub struct Managed<S> {
    /// The OS process identifier.
    pub pid: i32,
    /// The host's handle to the process address space.
    pub space: S,
}

/// Resume position of a tier's walk: the process index the previous walk
/// stopped in and the address to continue from. Advance and repair are pure
/// local rewrites; nothing points back at the process entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    /// Index into the process table.
    pub index: usize,
    /// Virtual address the next walk resumes at.
    pub addr: u64,
}

/// Reasons a table mutation is refused.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    /// The managed set already holds [`MAX_PIDS`] entries.
    #[error("managed set is at capacity")]
    Capacity,
    /// The PID is already in the managed set.
    #[error("pid {0} is already managed")]
    AlreadyManaged(i32),
    /// The PID is not in the managed set.
    #[error("pid {0} is not managed")]
    NotManaged(i32),
}

/// The managed-process set, bounded by [`MAX_PIDS`], with one walk cursor per
/// tier. Entries keep their insertion order; cursors index into that order.
#[derive(Debug, Default)]
pub struct ProcessTable<S> {
    entries: Vec<Managed<S>>,
    dram: Cursor,
    nvram: Cursor,
}

impl<S> ProcessTable<S> {
    /// An empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_PIDS),
            dram: Cursor::default(),
            nvram: Cursor::default(),
        }
    }

    /// The number of managed processes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no process is managed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The managed PIDs in table order.
    pub fn pids(&self) -> impl Iterator<Item = i32> + '_ {
        self.entries.iter().map(|entry| entry.pid)
    }

    /// Whether `pid` is managed.
    #[must_use]
    pub fn contains(&self, pid: i32) -> bool {
        self.entries.iter().any(|entry| entry.pid == pid)
    }

    /// The entry at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn entry_mut(&mut self, index: usize) -> &mut Managed<S> {
        &mut self.entries[index]
    }

    /// Inserts a process, refusing duplicates and overflow.
    pub fn insert(&mut self, pid: i32, space: S) -> Result<(), TableError> {
        if self.entries.len() >= MAX_PIDS {
            return Err(TableError::Capacity);
        }
        if self.contains(pid) {
            return Err(TableError::AlreadyManaged(pid));
        }
        self.entries.push(Managed { pid, space });
        Ok(())
    }

    /// Removes `pid` and repairs both cursors.
    pub fn remove(&mut self, pid: i32) -> Result<(), TableError> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.pid == pid)
            .ok_or(TableError::NotManaged(pid))?;
        self.remove_at(index);
        Ok(())
    }

    /// Drops every entry whose PID no longer passes `alive`, repairing the
    /// cursors for each removal.
    pub fn prune(&mut self, mut alive: impl FnMut(i32) -> bool) {
        let mut index = 0;
        while index < self.entries.len() {
            if alive(self.entries[index].pid) {
                index += 1;
            } else {
                self.remove_at(index);
            }
        }
    }

    /// The walk cursor of `tier`.
    #[must_use]
    pub fn cursor(&self, tier: Tier) -> Cursor {
        match tier {
            Tier::Dram => self.dram,
            Tier::Nvram => self.nvram,
        }
    }

    /// Stores the walk cursor of `tier`.
    pub fn set_cursor(&mut self, tier: Tier, cursor: Cursor) {
        match tier {
            Tier::Dram => self.dram = cursor,
            Tier::Nvram => self.nvram = cursor,
        }
    }

    // Removes the entry at `index`, shifting later entries left. Cursors past
    // the removed slot move with their process; a cursor on the slot restarts
    // that index from address zero, wrapping to the first process when the
    // removed entry was the last.
    fn remove_at(&mut self, index: usize) {
        let last = self.entries.len() - 1;
        for cursor in [&mut self.dram, &mut self.nvram] {
            if cursor.index > index {
                cursor.index -= 1;
            } else if cursor.index == index {
                cursor.addr = 0;
                if index == last {
                    cursor.index = 0;
                }
            }
        }
        let _ = self.entries.remove(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(pids: &[i32]) -> ProcessTable<()> {
        let mut table = ProcessTable::new();
        for &pid in pids {
            table.insert(pid, ()).unwrap();
        }
        table
    }

    #[test]
    fn insert_refuses_overflow_and_duplicates() {
        let mut table = table_of(&[100, 200, 300, 400, 500]);
        assert!(matches!(table.insert(9999, ()), Err(TableError::Capacity)));
        assert_eq!(table.len(), 5);

        let mut table = table_of(&[100, 200]);
        assert!(matches!(
            table.insert(100, ()),
            Err(TableError::AlreadyManaged(100))
        ));
    }

    #[test]
    fn remove_refuses_non_member() {
        let mut table = table_of(&[100, 200]);
        assert!(matches!(table.remove(300), Err(TableError::NotManaged(300))));
        assert_eq!(table.pids().collect::<Vec<_>>(), vec![100, 200]);
    }

    #[test]
    fn cursor_shifts_left_when_an_earlier_entry_goes() {
        let mut table = table_of(&[100, 200, 300]);
        table.set_cursor(Tier::Dram, Cursor { index: 1, addr: 0x4000 });
        table.remove(100).unwrap();
        assert_eq!(table.pids().collect::<Vec<_>>(), vec![200, 300]);
        assert_eq!(table.cursor(Tier::Dram), Cursor { index: 0, addr: 0x4000 });
    }

    #[test]
    fn cursor_on_removed_entry_restarts_at_zero() {
        let mut table = table_of(&[100, 200, 300]);
        table.set_cursor(Tier::Nvram, Cursor { index: 1, addr: 0x4000 });
        table.remove(200).unwrap();
        assert_eq!(table.cursor(Tier::Nvram), Cursor { index: 1, addr: 0 });
    }

    #[test]
    fn cursor_on_removed_last_entry_wraps() {
        let mut table = table_of(&[100, 200, 300]);
        table.set_cursor(Tier::Dram, Cursor { index: 2, addr: 0x8000 });
        table.remove(300).unwrap();
        assert_eq!(table.cursor(Tier::Dram), Cursor { index: 0, addr: 0 });
    }

    #[test]
    fn prune_drops_dead_entries_and_repairs() {
        let mut table = table_of(&[100, 200, 300]);
        table.set_cursor(Tier::Dram, Cursor { index: 2, addr: 0x8000 });
        table.prune(|pid| pid == 300);
        assert_eq!(table.pids().collect::<Vec<_>>(), vec![300]);
        assert_eq!(table.cursor(Tier::Dram), Cursor { index: 0, addr: 0x8000 });
    }
}
