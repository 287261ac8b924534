//! Open files and the filesystem-operations table.
//!
//! A [`File`] is one open resource: position, flags, a pointer to its
//! driver's [`FileOps`] table, and driver-private state. Reference counting
//! rides on `Arc`; when the last handle drops, the driver's `close` hook
//! runs. Hooks a driver does not provide report `ENOSYS`.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::devfs::DevKind;
use super::epoll::EpollInstance;
use super::pipe::PipeEndpoint;
use super::ramfs::RamHandle;
use crate::error::Errno;

bitflags! {
    /// Open flags.
    ///
    /// Bit values follow the kernel ABI contract user-space wrappers are
    /// compiled against.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0x0001;
        const WRITE = 0x0002;
        const CREATE = 0x0100;
        const TRUNCATE = 0x0200;
        const APPEND = 0x0400;
        const EXCL = 0x0800;
    }
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::READ
    }

    pub fn read_write() -> Self {
        Self::READ | Self::WRITE
    }

    pub fn readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub fn writable(self) -> bool {
        self.contains(Self::WRITE)
    }
}

/// Seek origin.
#[derive(Debug, Clone, Copy)]
pub enum SeekFrom {
    Start(u64),
    Current(i64),
    End(i64),
}

/// One directory entry reported by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Driver-private state carried by a [`File`].
#[derive(Debug)]
pub enum Private {
    None,
    Ram(RamHandle),
    Dev(DevKind),
    Pipe(PipeEndpoint),
    Epoll(Mutex<EpollInstance>),
}

/// Table of optional filesystem operations.
///
/// The VFS calls these through `File::ops`; a missing hook means the
/// operation is unsupported for this object.
#[derive(Debug)]
pub struct FileOps {
    pub read: Option<fn(&File, &mut [u8]) -> Result<usize, Errno>>,
    pub write: Option<fn(&File, &[u8]) -> Result<usize, Errno>>,
    pub lseek: Option<fn(&File, SeekFrom) -> Result<u64, Errno>>,
    pub ioctl: Option<fn(&File, u64, u64) -> Result<u64, Errno>>,
    pub isatty: Option<fn(&File) -> bool>,
    pub readdir: Option<fn(&File, usize) -> Result<Option<DirEntry>, Errno>>,
    pub readlink: Option<fn(&File) -> Result<String, Errno>>,
    pub truncate: Option<fn(&File, u64) -> Result<(), Errno>>,
    /// Non-blocking readiness probe; takes the requested event mask and
    /// returns the ready subset (epoll bit semantics).
    pub poll_check: Option<fn(&File, u32) -> u32>,
    pub close: Option<fn(&File)>,
}

impl FileOps {
    /// A table with every hook absent.
    pub const fn none() -> Self {
        Self {
            read: None,
            write: None,
            lseek: None,
            ioctl: None,
            isatty: None,
            readdir: None,
            readlink: None,
            truncate: None,
            poll_check: None,
            close: None,
        }
    }
}

/// An open file.
#[derive(Debug)]
pub struct File {
    pub ops: &'static FileOps,
    /// Current byte position.
    pub pos: AtomicU64,
    pub flags: OpenFlags,
    pub private: Private,
}

impl File {
    pub fn new(ops: &'static FileOps, flags: OpenFlags, private: Private) -> Arc<Self> {
        Arc::new(Self {
            ops,
            pos: AtomicU64::new(0),
            flags,
            private,
        })
    }

    pub fn position(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn set_position(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, Errno> {
        if !self.flags.readable() {
            return Err(Errno::Ebadf);
        }
        (self.ops.read.ok_or(Errno::Enosys)?)(self, buf)
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, Errno> {
        if !self.flags.writable() {
            return Err(Errno::Ebadf);
        }
        (self.ops.write.ok_or(Errno::Enosys)?)(self, buf)
    }

    pub fn lseek(&self, pos: SeekFrom) -> Result<u64, Errno> {
        (self.ops.lseek.ok_or(Errno::Espipe)?)(self, pos)
    }

    pub fn ioctl(&self, cmd: u64, arg: u64) -> Result<u64, Errno> {
        (self.ops.ioctl.ok_or(Errno::Enosys)?)(self, cmd, arg)
    }

    pub fn isatty(&self) -> bool {
        self.ops.isatty.map(|f| f(self)).unwrap_or(false)
    }

    pub fn readdir(&self, index: usize) -> Result<Option<DirEntry>, Errno> {
        (self.ops.readdir.ok_or(Errno::Enosys)?)(self, index)
    }

    pub fn readlink(&self) -> Result<String, Errno> {
        (self.ops.readlink.ok_or(Errno::Enosys)?)(self)
    }

    pub fn truncate(&self, len: u64) -> Result<(), Errno> {
        (self.ops.truncate.ok_or(Errno::Enosys)?)(self, len)
    }

    /// Readiness probe. Objects without a `poll_check` hook count as always
    /// ready for plain I/O.
    pub fn poll_check(&self, events: u32) -> u32 {
        match self.ops.poll_check {
            Some(f) => f(self, events),
            None => events & (super::epoll::EPOLLIN | super::epoll::EPOLLOUT),
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        // Last reference gone: run the driver's close hook.
        if let Some(close) = self.ops.close {
            close(self);
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    static NO_OPS: FileOps = FileOps::none();

    #[test]
    fn absent_hooks_report_unsupported() {
        let f = File::new(&NO_OPS, OpenFlags::read_write(), Private::None);
        let mut buf = [0u8; 4];
        assert_eq!(f.read(&mut buf), Err(Errno::Enosys));
        assert_eq!(f.write(&buf), Err(Errno::Enosys));
        assert_eq!(f.lseek(SeekFrom::Start(0)), Err(Errno::Espipe));
        assert!(!f.isatty());
    }

    #[test]
    fn access_mode_is_enforced_before_dispatch() {
        let f = File::new(&NO_OPS, OpenFlags::read_only(), Private::None);
        assert_eq!(f.write(b"x"), Err(Errno::Ebadf));
    }

    #[test]
    fn objects_without_poll_hook_are_always_ready() {
        let f = File::new(&NO_OPS, OpenFlags::read_write(), Private::None);
        let mask = super::super::epoll::EPOLLIN | super::super::epoll::EPOLLOUT;
        assert_eq!(f.poll_check(mask | 0x8000_0000), mask);
    }
}
