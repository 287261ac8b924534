//! VFS syscalls: descriptor I/O plus the epoll surface.

use alloc::vec;

use crate::error::{Errno, SysResult};
use crate::fs::epoll::{self, EpollEvent};
use crate::fs::file::{OpenFlags, SeekFrom};
use crate::fs::pipe;
use crate::mm::user;

const OP_OPEN: u64 = 0;
const OP_READ: u64 = 1;
const OP_WRITE: u64 = 2;
const OP_CLOSE: u64 = 3;
const OP_LSEEK: u64 = 4;
const OP_IOCTL: u64 = 5;
const OP_ISATTY: u64 = 6;
const OP_DUP: u64 = 7;
const OP_DUP2: u64 = 8;
const OP_PIPE: u64 = 9;
const OP_EPOLL_CREATE: u64 = 10;
const OP_EPOLL_CTL: u64 = 11;
const OP_EPOLL_PWAIT: u64 = 12;

/// Close-on-exec request bit in `open`/`epoll_create` flags.
const FLAG_CLOEXEC: u32 = 0x8_0000;

/// Largest single read/write the kernel will buffer.
const IO_MAX: usize = 1 << 20;

/// `args`: op, then per-op arguments.
pub fn sys_vfs(args: &[u64; 6]) -> SysResult {
    let task = super::current()?;
    let files = task.files();

    match args[0] {
        OP_OPEN => {
            let space = super::current_space(&task)?;
            let path = user::read_user_cstr(space, args[1])?;
            let raw_flags = args[2] as u32;
            let flags = OpenFlags::from_bits_truncate(raw_flags);
            let file = crate::fs::open_path(&path, flags)?;
            let fd = files.install(file, raw_flags & FLAG_CLOEXEC != 0)?;
            Ok(fd as u64)
        }
        OP_READ => {
            let (fd, buf_ptr, len) = (args[1] as usize, args[2], args[3] as usize);
            if len > IO_MAX {
                return Err(Errno::Einval);
            }
            let space = super::current_space(&task)?;
            user::check_user_range(space, buf_ptr, len, true)?;
            let file = files.get(fd)?;
            let mut buf = vec![0u8; len];
            let n = file.read(&mut buf)?;
            user::copy_to_user(space, buf_ptr, &buf[..n])?;
            Ok(n as u64)
        }
        OP_WRITE => {
            let (fd, buf_ptr, len) = (args[1] as usize, args[2], args[3] as usize);
            if len > IO_MAX {
                return Err(Errno::Einval);
            }
            let space = super::current_space(&task)?;
            let file = files.get(fd)?;
            let mut buf = vec![0u8; len];
            user::copy_from_user(space, buf_ptr, &mut buf)?;
            let n = file.write(&buf)?;
            Ok(n as u64)
        }
        OP_CLOSE => {
            files.close(args[1] as usize)?;
            Ok(0)
        }
        OP_LSEEK => {
            let (fd, offset, whence) = (args[1] as usize, args[2] as i64, args[3]);
            let file = files.get(fd)?;
            let pos = match whence {
                0 => SeekFrom::Start(offset as u64),
                1 => SeekFrom::Current(offset),
                2 => SeekFrom::End(offset),
                _ => return Err(Errno::Einval),
            };
            Ok(file.lseek(pos)?)
        }
        OP_IOCTL => {
            let file = files.get(args[1] as usize)?;
            file.ioctl(args[2], args[3])
        }
        OP_ISATTY => {
            let file = files.get(args[1] as usize)?;
            Ok(file.isatty() as u64)
        }
        OP_DUP => Ok(files.dup(args[1] as usize)? as u64),
        OP_DUP2 => Ok(files.dup2(args[1] as usize, args[2] as usize)? as u64),
        OP_PIPE => {
            let fds_ptr = args[1];
            let space = super::current_space(&task)?;
            user::check_user_range(space, fds_ptr, 2 * core::mem::size_of::<i32>(), true)?;
            let (read_end, write_end) = pipe::create_pair();
            let rfd = files.install(read_end, false)?;
            let wfd = match files.install(write_end, false) {
                Ok(fd) => fd,
                Err(e) => {
                    let _ = files.close(rfd);
                    return Err(e);
                }
            };
            user::write_user(space, fds_ptr, [rfd as i32, wfd as i32])?;
            Ok(0)
        }
        OP_EPOLL_CREATE => {
            let flags = args[1] as u32;
            Ok(epoll::epoll_create(files, flags & FLAG_CLOEXEC != 0)? as u64)
        }
        OP_EPOLL_CTL => {
            let (epfd, op, fd, event_ptr) =
                (args[1] as usize, args[2] as u32, args[3] as usize, args[4]);
            let event = if event_ptr != 0 {
                let space = super::current_space(&task)?;
                Some(user::read_user::<EpollEvent>(space, event_ptr)?)
            } else {
                None
            };
            epoll::epoll_ctl(files, epfd, op, fd, event)?;
            Ok(0)
        }
        OP_EPOLL_PWAIT => {
            let (epfd, events_ptr, max, timeout_ms) =
                (args[1] as usize, args[2], args[3] as i64, args[4] as i64);
            if max <= 0 || events_ptr == 0 {
                return Err(Errno::Einval);
            }
            let space = super::current_space(&task)?;
            user::check_user_range(
                space,
                events_ptr,
                max as usize * core::mem::size_of::<EpollEvent>(),
                true,
            )?;
            let ready = epoll::epoll_pwait(files, epfd, max as usize, timeout_ms)?;
            for (i, event) in ready.iter().enumerate() {
                user::write_user(
                    space,
                    events_ptr + (i * core::mem::size_of::<EpollEvent>()) as u64,
                    *event,
                )?;
            }
            Ok(ready.len() as u64)
        }
        _ => Err(Errno::Enosys),
    }
}
