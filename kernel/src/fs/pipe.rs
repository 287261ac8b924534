//! Anonymous pipes.
//!
//! A bounded ring buffer shared by a read end and a write end. Reads and
//! writes never block in the kernel: an empty pipe with a live writer
//! reports `EAGAIN` and readiness is delivered through `poll_check`, which
//! is what epoll drives.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::Mutex;

use super::epoll::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT};
use super::file::{File, FileOps, OpenFlags, Private};
use crate::error::Errno;

/// Ring capacity per pipe.
pub const PIPE_CAPACITY: usize = 4096;

#[derive(Debug)]
struct PipeBuf {
    data: VecDeque<u8>,
    read_closed: bool,
    write_closed: bool,
}

/// State shared by both ends.
#[derive(Debug)]
pub struct PipeShared {
    buf: Mutex<PipeBuf>,
}

/// Which end a file stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

/// Per-open pipe endpoint.
#[derive(Debug)]
pub struct PipeEndpoint {
    shared: Arc<PipeShared>,
    end: PipeEnd,
}

static PIPE_OPS: FileOps = FileOps {
    read: Some(pipe_read),
    write: Some(pipe_write),
    lseek: None,
    ioctl: None,
    isatty: None,
    readdir: None,
    readlink: None,
    truncate: None,
    poll_check: Some(pipe_poll),
    close: Some(pipe_close),
};

fn endpoint_of(file: &File) -> &PipeEndpoint {
    match &file.private {
        Private::Pipe(p) => p,
        _ => unreachable!("pipe op on a foreign file"),
    }
}

/// Create a connected pipe pair: `(read_end, write_end)`.
pub fn create_pair() -> (Arc<File>, Arc<File>) {
    let shared = Arc::new(PipeShared {
        buf: Mutex::new(PipeBuf {
            data: VecDeque::new(),
            read_closed: false,
            write_closed: false,
        }),
    });
    let read = File::new(
        &PIPE_OPS,
        OpenFlags::READ,
        Private::Pipe(PipeEndpoint {
            shared: shared.clone(),
            end: PipeEnd::Read,
        }),
    );
    let write = File::new(
        &PIPE_OPS,
        OpenFlags::WRITE,
        Private::Pipe(PipeEndpoint {
            shared,
            end: PipeEnd::Write,
        }),
    );
    (read, write)
}

fn pipe_read(file: &File, buf: &mut [u8]) -> Result<usize, Errno> {
    let ep = endpoint_of(file);
    if ep.end != PipeEnd::Read {
        return Err(Errno::Ebadf);
    }
    let mut inner = ep.shared.buf.lock();
    if inner.data.is_empty() {
        return if inner.write_closed {
            Ok(0)
        } else {
            Err(Errno::Eagain)
        };
    }
    let n = buf.len().min(inner.data.len());
    for slot in buf[..n].iter_mut() {
        *slot = inner.data.pop_front().unwrap();
    }
    Ok(n)
}

fn pipe_write(file: &File, buf: &[u8]) -> Result<usize, Errno> {
    let ep = endpoint_of(file);
    if ep.end != PipeEnd::Write {
        return Err(Errno::Ebadf);
    }
    let mut inner = ep.shared.buf.lock();
    if inner.read_closed {
        return Err(Errno::Epipe);
    }
    let space = PIPE_CAPACITY - inner.data.len();
    if space == 0 {
        return Err(Errno::Eagain);
    }
    let n = buf.len().min(space);
    inner.data.extend(buf[..n].iter().copied());
    Ok(n)
}

fn pipe_poll(file: &File, events: u32) -> u32 {
    let ep = endpoint_of(file);
    let inner = ep.shared.buf.lock();
    let mut ready = 0;
    match ep.end {
        PipeEnd::Read => {
            if !inner.data.is_empty() {
                ready |= EPOLLIN;
            }
            if inner.write_closed {
                ready |= EPOLLHUP;
                if inner.data.is_empty() {
                    // EOF is readable.
                    ready |= EPOLLIN;
                }
            }
        }
        PipeEnd::Write => {
            if inner.data.len() < PIPE_CAPACITY {
                ready |= EPOLLOUT;
            }
            if inner.read_closed {
                ready |= EPOLLERR;
            }
        }
    }
    ready & (events | EPOLLHUP | EPOLLERR)
}

fn pipe_close(file: &File) {
    let ep = endpoint_of(file);
    let mut inner = ep.shared.buf.lock();
    match ep.end {
        PipeEnd::Read => inner.read_closed = true,
        PipeEnd::Write => inner.write_closed = true,
    }
}
