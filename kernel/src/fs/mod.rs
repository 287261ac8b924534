//! Virtual filesystem.
//!
//! The VFS is a thin multiplexer: it owns the per-task descriptor tables
//! and a mount table; path resolution past the mount point belongs to the
//! filesystem driver. Drivers plug in through the [`Filesystem`] trait for
//! `open` and a [`file::FileOps`] table for everything after.

pub mod devfs;
pub mod epoll;
pub mod fd_table;
pub mod file;
pub mod pipe;
pub mod ramfs;

use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::RwLock;

use crate::error::Errno;
pub use fd_table::FdTable;
pub use file::{DirEntry, File, OpenFlags, SeekFrom};

/// A mounted filesystem driver.
pub trait Filesystem: Send + Sync {
    /// Resolve `path` (relative to the mount point) and produce an open
    /// file.
    fn open(&'static self, path: &str, flags: OpenFlags) -> Result<Arc<File>, Errno>;
}

struct Mount {
    prefix: &'static str,
    fs: &'static dyn Filesystem,
}

/// The root in-memory filesystem.
static ROOT_FS: ramfs::RamFs = ramfs::RamFs::new();

/// The device filesystem.
static DEV_FS: devfs::DevFs = devfs::DevFs;

lazy_static! {
    /// Mount table: longest-prefix match decides the owning driver.
    static ref MOUNTS: RwLock<Vec<Mount>> = RwLock::new({
        let _ = ROOT_FS.mkdir("/");
        let _ = ROOT_FS.mkdir("/tmp");
        alloc::vec![
            Mount { prefix: "/dev", fs: &DEV_FS },
            Mount { prefix: "/", fs: &ROOT_FS },
        ]
    });
}

/// Mount an additional driver. Boot-time only.
pub fn mount(prefix: &'static str, fs: &'static dyn Filesystem) {
    let mut mounts = MOUNTS.write();
    mounts.push(Mount { prefix, fs });
    // Keep longest prefixes first so resolution stays a linear scan.
    mounts.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
}

/// Resolve a path through the mount table and open it.
pub fn open_path(path: &str, flags: OpenFlags) -> Result<Arc<File>, Errno> {
    if !path.starts_with('/') {
        return Err(Errno::Einval);
    }
    let mounts = MOUNTS.read();
    let mount = mounts
        .iter()
        .filter(|m| {
            path.starts_with(m.prefix)
                && (m.prefix == "/"
                    || path.len() == m.prefix.len()
                    || path.as_bytes()[m.prefix.len()] == b'/')
        })
        .max_by_key(|m| m.prefix.len())
        .ok_or(Errno::Enoent)?;
    let rest = &path[mount.prefix.len()..];
    mount.fs.open(rest, flags)
}

/// The root ramfs, for boot-time population (initramfs unpacking lives
/// outside the core).
pub fn root_fs() -> &'static ramfs::RamFs {
    &ROOT_FS
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn paths_route_to_the_longest_matching_mount() {
        // /dev/null goes to devfs, /devices.txt to the root ramfs.
        let null = open_path("/dev/null", OpenFlags::read_write()).unwrap();
        assert_eq!(null.write(b"x").unwrap(), 1);

        let f = open_path(
            "/devices.txt",
            OpenFlags::read_write() | OpenFlags::CREATE,
        )
        .unwrap();
        f.write(b"root file").unwrap();
        let back = open_path("/devices.txt", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 16];
        let n = back.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"root file");
    }

    #[test]
    fn relative_paths_are_rejected() {
        assert_eq!(
            open_path("no/leading/slash", OpenFlags::read_only()).unwrap_err(),
            Errno::Einval
        );
    }

    #[test]
    fn missing_device_nodes_surface_enoent() {
        assert_eq!(
            open_path("/dev/missing", OpenFlags::read_only()).unwrap_err(),
            Errno::Enoent
        );
    }
}
