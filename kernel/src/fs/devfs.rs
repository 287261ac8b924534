//! Device filesystem: `/dev/null`, `/dev/zero`, `/dev/serial`.

use alloc::sync::Arc;

use super::file::{File, FileOps, OpenFlags, Private};
use super::Filesystem;
use crate::error::Errno;

/// Which device node an open file stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevKind {
    Null,
    Zero,
    /// The kernel console; writes land on the serial log sink.
    Serial,
}

/// The device filesystem.
pub struct DevFs;

static DEVFS_OPS: FileOps = FileOps {
    read: Some(dev_read),
    write: Some(dev_write),
    lseek: None,
    ioctl: None,
    isatty: Some(dev_isatty),
    readdir: None,
    readlink: None,
    truncate: None,
    poll_check: None,
    close: None,
};

fn kind_of(file: &File) -> DevKind {
    match &file.private {
        Private::Dev(k) => *k,
        _ => unreachable!("devfs op on a foreign file"),
    }
}

fn dev_read(file: &File, buf: &mut [u8]) -> Result<usize, Errno> {
    match kind_of(file) {
        DevKind::Null => Ok(0),
        DevKind::Zero => {
            buf.fill(0);
            Ok(buf.len())
        }
        DevKind::Serial => Ok(0),
    }
}

fn dev_write(file: &File, buf: &[u8]) -> Result<usize, Errno> {
    match kind_of(file) {
        DevKind::Null | DevKind::Zero => Ok(buf.len()),
        DevKind::Serial => {
            crate::serial::write_bytes(buf);
            Ok(buf.len())
        }
    }
}

fn dev_isatty(file: &File) -> bool {
    kind_of(file) == DevKind::Serial
}

impl Filesystem for DevFs {
    fn open(&'static self, path: &str, flags: OpenFlags) -> Result<Arc<File>, Errno> {
        let kind = match path.trim_start_matches('/') {
            "null" => DevKind::Null,
            "zero" => DevKind::Zero,
            "serial" | "console" => DevKind::Serial,
            _ => return Err(Errno::Enoent),
        };
        Ok(File::new(&DEVFS_OPS, flags, Private::Dev(kind)))
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    static DEVFS: DevFs = DevFs;

    #[test]
    fn null_swallows_writes_and_reads_empty() {
        let f = DEVFS.open("/null", OpenFlags::read_write()).unwrap();
        assert_eq!(f.write(b"gone").unwrap(), 4);
        let mut buf = [7u8; 4];
        assert_eq!(f.read(&mut buf).unwrap(), 0);
        assert!(!f.isatty());
    }

    #[test]
    fn zero_fills_buffers() {
        let f = DEVFS.open("/zero", OpenFlags::read_only()).unwrap();
        let mut buf = [9u8; 8];
        assert_eq!(f.read(&mut buf).unwrap(), 8);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn serial_is_a_tty_and_unknown_nodes_do_not_exist() {
        let f = DEVFS.open("serial", OpenFlags::read_write()).unwrap();
        assert!(f.isatty());
        assert_eq!(
            DEVFS.open("/tape0", OpenFlags::read_only()).unwrap_err(),
            Errno::Enoent
        );
    }
}
