//! Per-task file-descriptor table.
//!
//! Small non-negative integers map to [`File`] handles, each with a
//! close-on-exec bit. A descriptor owns one reference on its file; `dup`
//! and `dup2` share the file and bump the refcount. Slots hand out the
//! lowest free index, POSIX style.

use alloc::sync::Arc;

use spin::Mutex;

use super::file::File;
use crate::error::Errno;

/// Descriptors per task.
pub const MAX_FDS: usize = 128;

#[derive(Clone)]
struct FdEntry {
    file: Arc<File>,
    cloexec: bool,
}

/// The per-task descriptor table. Internally locked; tasks share it only
/// through their own syscalls.
pub struct FdTable {
    slots: Mutex<[Option<FdEntry>; MAX_FDS]>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new([const { None }; MAX_FDS]),
        }
    }

    /// Install a file at the lowest free descriptor.
    pub fn install(&self, file: Arc<File>, cloexec: bool) -> Result<usize, Errno> {
        let mut slots = self.slots.lock();
        let fd = slots.iter().position(|s| s.is_none()).ok_or(Errno::Emfile)?;
        slots[fd] = Some(FdEntry { file, cloexec });
        Ok(fd)
    }

    /// Resolve a descriptor to its file.
    pub fn get(&self, fd: usize) -> Result<Arc<File>, Errno> {
        self.slots
            .lock()
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|e| e.file.clone())
            .ok_or(Errno::Ebadf)
    }

    /// Close a descriptor. The file's close hook runs when the last
    /// reference drops.
    pub fn close(&self, fd: usize) -> Result<(), Errno> {
        let entry = {
            let mut slots = self.slots.lock();
            slots
                .get_mut(fd)
                .and_then(|s| s.take())
                .ok_or(Errno::Ebadf)?
        };
        // Dropped outside the lock: the close hook may take other locks.
        drop(entry);
        Ok(())
    }

    /// Duplicate onto the lowest free descriptor. The new descriptor does
    /// not inherit close-on-exec.
    pub fn dup(&self, fd: usize) -> Result<usize, Errno> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get(fd)
            .and_then(|s| s.as_ref())
            .cloned()
            .ok_or(Errno::Ebadf)?;
        let new_fd = slots.iter().position(|s| s.is_none()).ok_or(Errno::Emfile)?;
        slots[new_fd] = Some(FdEntry {
            file: entry.file,
            cloexec: false,
        });
        Ok(new_fd)
    }

    /// Duplicate onto a specific descriptor, closing whatever was there.
    pub fn dup2(&self, fd: usize, new_fd: usize) -> Result<usize, Errno> {
        if new_fd >= MAX_FDS {
            return Err(Errno::Ebadf);
        }
        let displaced;
        {
            let mut slots = self.slots.lock();
            let entry = slots
                .get(fd)
                .and_then(|s| s.as_ref())
                .cloned()
                .ok_or(Errno::Ebadf)?;
            if fd == new_fd {
                return Ok(new_fd);
            }
            displaced = slots[new_fd].take();
            slots[new_fd] = Some(FdEntry {
                file: entry.file,
                cloexec: false,
            });
        }
        drop(displaced);
        Ok(new_fd)
    }

    pub fn set_cloexec(&self, fd: usize, value: bool) -> Result<(), Errno> {
        let mut slots = self.slots.lock();
        let entry = slots
            .get_mut(fd)
            .and_then(|s| s.as_mut())
            .ok_or(Errno::Ebadf)?;
        entry.cloexec = value;
        Ok(())
    }

    pub fn cloexec(&self, fd: usize) -> Result<bool, Errno> {
        self.slots
            .lock()
            .get(fd)
            .and_then(|s| s.as_ref())
            .map(|e| e.cloexec)
            .ok_or(Errno::Ebadf)
    }

    /// Drop every descriptor marked close-on-exec.
    pub fn close_cloexec(&self) {
        let mut dropped = alloc::vec::Vec::new();
        {
            let mut slots = self.slots.lock();
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|e| e.cloexec) {
                    dropped.push(slot.take());
                }
            }
        }
        drop(dropped);
    }

    /// Number of live descriptors.
    pub fn count(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::file::{FileOps, OpenFlags, Private};
    use super::*;

    static OPS: FileOps = FileOps::none();

    fn file() -> Arc<File> {
        File::new(&OPS, OpenFlags::read_write(), Private::None)
    }

    #[test]
    fn descriptors_hand_out_lowest_free_slot() {
        let t = FdTable::new();
        assert_eq!(t.install(file(), false).unwrap(), 0);
        assert_eq!(t.install(file(), false).unwrap(), 1);
        t.close(0).unwrap();
        assert_eq!(t.install(file(), false).unwrap(), 0);
    }

    #[test]
    fn close_invalidates_and_double_close_fails() {
        let t = FdTable::new();
        let fd = t.install(file(), false).unwrap();
        assert!(t.get(fd).is_ok());
        t.close(fd).unwrap();
        assert_eq!(t.get(fd).unwrap_err(), Errno::Ebadf);
        assert_eq!(t.close(fd).unwrap_err(), Errno::Ebadf);
    }

    #[test]
    fn dup_shares_the_underlying_file() {
        let t = FdTable::new();
        let f = file();
        let fd = t.install(f.clone(), false).unwrap();
        let dup_fd = t.dup(fd).unwrap();
        assert_ne!(fd, dup_fd);
        assert!(Arc::ptr_eq(&t.get(fd).unwrap(), &t.get(dup_fd).unwrap()));
        // Both descriptors + our handle + the two just fetched.
        assert!(Arc::strong_count(&f) >= 3);
    }

    #[test]
    fn dup2_replaces_the_target_descriptor() {
        let t = FdTable::new();
        let a = t.install(file(), false).unwrap();
        let b = t.install(file(), false).unwrap();
        assert!(!Arc::ptr_eq(&t.get(a).unwrap(), &t.get(b).unwrap()));
        t.dup2(a, b).unwrap();
        assert!(Arc::ptr_eq(&t.get(a).unwrap(), &t.get(b).unwrap()));
        // dup2 onto itself is a no-op.
        assert_eq!(t.dup2(a, a).unwrap(), a);
    }

    #[test]
    fn cloexec_descriptors_drop_on_exec() {
        let t = FdTable::new();
        let keep = t.install(file(), false).unwrap();
        let lose = t.install(file(), true).unwrap();
        assert!(t.cloexec(lose).unwrap());
        t.close_cloexec();
        assert!(t.get(keep).is_ok());
        assert_eq!(t.get(lose).unwrap_err(), Errno::Ebadf);
    }

    #[test]
    fn table_exhaustion_reports_emfile() {
        let t = FdTable::new();
        for _ in 0..MAX_FDS {
            t.install(file(), false).unwrap();
        }
        assert_eq!(t.install(file(), false).unwrap_err(), Errno::Emfile);
    }
}
