//! In-memory filesystem used as the root mount.
//!
//! A flat map of absolute paths to nodes; directories exist as explicit
//! entries so `readdir` can enumerate children. Contents live in kernel
//! heap memory and vanish on reboot, which is the whole of this kernel's
//! persistence story.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use spin::RwLock;

use super::file::{DirEntry, File, FileOps, OpenFlags, Private, SeekFrom};
use super::Filesystem;
use crate::error::Errno;

#[derive(Debug)]
enum RamNode {
    File(Vec<u8>),
    Dir,
}

/// The in-memory filesystem.
#[derive(Debug)]
pub struct RamFs {
    nodes: RwLock<alloc::collections::BTreeMap<String, RamNode>>,
}

/// Per-open handle: which filesystem instance and which path.
#[derive(Debug)]
pub struct RamHandle {
    fs: &'static RamFs,
    path: String,
}

impl RamFs {
    pub const fn new() -> Self {
        Self {
            nodes: RwLock::new(alloc::collections::BTreeMap::new()),
        }
    }

    /// Normalize: strip the trailing slash, ensure a leading one.
    fn normalize(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return String::from("/");
        }
        if trimmed.starts_with('/') {
            trimmed.to_owned()
        } else {
            alloc::format!("/{trimmed}")
        }
    }

    pub fn mkdir(&self, path: &str) -> Result<(), Errno> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&path) {
            return Err(Errno::Eexist);
        }
        nodes.insert(path, RamNode::Dir);
        Ok(())
    }

    fn with_file<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut Vec<u8>) -> R,
    ) -> Result<R, Errno> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(path) {
            Some(RamNode::File(data)) => Ok(f(data)),
            Some(RamNode::Dir) => Err(Errno::Einval),
            None => Err(Errno::Enoent),
        }
    }

    fn handle_of(file: &File) -> &RamHandle {
        match &file.private {
            Private::Ram(h) => h,
            _ => unreachable!("ramfs op on a foreign file"),
        }
    }

    /// `index`-th child of a directory.
    fn child_at(&self, dir: &str, index: usize) -> Option<DirEntry> {
        let prefix = if dir == "/" {
            String::from("/")
        } else {
            alloc::format!("{dir}/")
        };
        let nodes = self.nodes.read();
        nodes
            .iter()
            .filter(|(path, _)| {
                path.starts_with(prefix.as_str())
                    && !path[prefix.len()..].is_empty()
                    && !path[prefix.len()..].contains('/')
            })
            .nth(index)
            .map(|(path, node)| DirEntry {
                name: path[prefix.len()..].to_owned(),
                is_dir: matches!(node, RamNode::Dir),
                size: match node {
                    RamNode::File(d) => d.len() as u64,
                    RamNode::Dir => 0,
                },
            })
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

static RAMFS_OPS: FileOps = FileOps {
    read: Some(ram_read),
    write: Some(ram_write),
    lseek: Some(ram_lseek),
    ioctl: None,
    isatty: None,
    readdir: Some(ram_readdir),
    readlink: None,
    truncate: Some(ram_truncate),
    poll_check: None,
    close: None,
};

fn ram_read(file: &File, buf: &mut [u8]) -> Result<usize, Errno> {
    let h = RamFs::handle_of(file);
    let pos = file.position() as usize;
    h.fs.with_file(&h.path, |data| {
        if pos >= data.len() {
            return 0;
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        file.pos.store((pos + n) as u64, Ordering::Release);
        n
    })
}

fn ram_write(file: &File, buf: &[u8]) -> Result<usize, Errno> {
    let h = RamFs::handle_of(file);
    let append = file.flags.contains(OpenFlags::APPEND);
    h.fs.with_file(&h.path, |data| {
        let pos = if append {
            data.len()
        } else {
            file.position() as usize
        };
        let end = pos.checked_add(buf.len()).ok_or(Errno::Einval)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(buf);
        file.pos.store(end as u64, Ordering::Release);
        Ok(buf.len())
    })?
}

fn ram_lseek(file: &File, whence: SeekFrom) -> Result<u64, Errno> {
    let h = RamFs::handle_of(file);
    let len = h.fs.with_file(&h.path, |data| data.len() as i64)?;
    let current = file.position() as i64;
    let new = match whence {
        SeekFrom::Start(p) => i64::try_from(p).map_err(|_| Errno::Einval)?,
        SeekFrom::Current(d) => current.checked_add(d).ok_or(Errno::Einval)?,
        SeekFrom::End(d) => len.checked_add(d).ok_or(Errno::Einval)?,
    };
    if new < 0 {
        return Err(Errno::Einval);
    }
    file.set_position(new as u64);
    Ok(new as u64)
}

fn ram_truncate(file: &File, len: u64) -> Result<(), Errno> {
    let h = RamFs::handle_of(file);
    h.fs.with_file(&h.path, |data| data.resize(len as usize, 0))
}

fn ram_readdir(file: &File, index: usize) -> Result<Option<DirEntry>, Errno> {
    let h = RamFs::handle_of(file);
    {
        let nodes = h.fs.nodes.read();
        match nodes.get(&h.path) {
            Some(RamNode::Dir) => {}
            Some(RamNode::File(_)) => return Err(Errno::Einval),
            None => return Err(Errno::Enoent),
        }
    }
    Ok(h.fs.child_at(&h.path, index))
}

impl Filesystem for RamFs {
    fn open(&'static self, path: &str, flags: OpenFlags) -> Result<Arc<File>, Errno> {
        let path = Self::normalize(path);
        {
            let mut nodes = self.nodes.write();
            match nodes.get_mut(&path) {
                Some(RamNode::File(data)) => {
                    if flags.contains(OpenFlags::EXCL) && flags.contains(OpenFlags::CREATE) {
                        return Err(Errno::Eexist);
                    }
                    if flags.contains(OpenFlags::TRUNCATE) {
                        data.clear();
                    }
                }
                Some(RamNode::Dir) => {
                    if flags.writable() {
                        return Err(Errno::Einval);
                    }
                }
                None => {
                    if !flags.contains(OpenFlags::CREATE) {
                        return Err(Errno::Enoent);
                    }
                    nodes.insert(path.clone(), RamNode::File(Vec::new()));
                }
            }
        }
        Ok(File::new(
            &RAMFS_OPS,
            flags,
            Private::Ram(RamHandle { fs: self, path }),
        ))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn fs() -> &'static RamFs {
        let fs = alloc::boxed::Box::leak(alloc::boxed::Box::new(RamFs::new()));
        fs.mkdir("/").unwrap();
        fs
    }

    fn create(fs: &'static RamFs, path: &str) -> Arc<File> {
        fs.open(
            path,
            OpenFlags::read_write() | OpenFlags::CREATE,
        )
        .unwrap()
    }

    #[test]
    fn write_then_read_roundtrips() {
        let fs = fs();
        let f = create(fs, "/notes.txt");
        assert_eq!(f.write(b"one two three").unwrap(), 13);

        let g = fs.open("/notes.txt", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 32];
        let n = g.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one two three");
        // Reads past the end report zero.
        assert_eq!(g.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_files_need_the_create_flag() {
        let fs = fs();
        assert_eq!(
            fs.open("/absent", OpenFlags::read_only()).unwrap_err(),
            Errno::Enoent
        );
        create(fs, "/absent");
        assert!(fs.open("/absent", OpenFlags::read_only()).is_ok());
    }

    #[test]
    fn excl_create_refuses_existing_paths() {
        let fs = fs();
        create(fs, "/once");
        assert_eq!(
            fs.open(
                "/once",
                OpenFlags::read_write() | OpenFlags::CREATE | OpenFlags::EXCL
            )
            .unwrap_err(),
            Errno::Eexist
        );
    }

    #[test]
    fn lseek_and_truncate_move_the_window() {
        let fs = fs();
        let f = create(fs, "/win");
        f.write(b"0123456789").unwrap();
        assert_eq!(f.lseek(SeekFrom::Start(4)).unwrap(), 4);
        let mut buf = [0u8; 2];
        f.read(&mut buf).unwrap();
        assert_eq!(&buf, b"45");
        assert_eq!(f.lseek(SeekFrom::End(-1)).unwrap(), 9);
        assert_eq!(f.lseek(SeekFrom::Current(-9)).unwrap(), 0);
        assert_eq!(f.lseek(SeekFrom::Current(-1)), Err(Errno::Einval));

        f.truncate(3).unwrap();
        f.set_position(0);
        let mut rest = [0u8; 8];
        assert_eq!(f.read(&mut rest).unwrap(), 3);
    }

    #[test]
    fn readdir_lists_direct_children_only() {
        let fs = fs();
        fs.mkdir("/sub").unwrap();
        create(fs, "/a");
        create(fs, "/sub/nested");

        let root = fs.open("/", OpenFlags::read_only()).unwrap();
        let mut names = alloc::vec::Vec::new();
        let mut i = 0;
        while let Some(e) = root.readdir(i).unwrap() {
            names.push((e.name, e.is_dir));
            i += 1;
        }
        assert!(names.contains(&(String::from("a"), false)));
        assert!(names.contains(&(String::from("sub"), true)));
        assert!(!names.iter().any(|(n, _)| n == "nested"));
    }

    #[test]
    fn append_mode_writes_at_the_end() {
        let fs = fs();
        let f = create(fs, "/log");
        f.write(b"first").unwrap();
        let a = fs
            .open("/log", OpenFlags::WRITE | OpenFlags::APPEND)
            .unwrap();
        a.write(b"+more").unwrap();

        let r = fs.open("/log", OpenFlags::read_only()).unwrap();
        let mut buf = [0u8; 32];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first+more");
    }
}
