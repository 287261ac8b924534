//! Logging syscall: write a byte range to a named log sink.

use alloc::vec;

use crate::error::{Errno, SysResult};
use crate::mm::user;

const OP_LOG: u64 = 0;
const OP_LOG_LINE: u64 = 1;

const DEVICE_SERIAL: u64 = 0;
const DEVICE_CONSOLE: u64 = 1;

/// Longest single log write accepted from user space.
const LOG_MAX: usize = 4096;

/// `args`: op, string pointer, length, device.
pub fn sys_log(args: &[u64; 6]) -> SysResult {
    let (op, ptr, len, device) = (args[0], args[1], args[2] as usize, args[3]);
    if len > LOG_MAX {
        return Err(Errno::Einval);
    }

    let task = super::current()?;
    let space = super::current_space(&task)?;
    let mut buf = vec![0u8; len];
    user::copy_from_user(space, ptr, &mut buf)?;

    let newline = match op {
        OP_LOG => false,
        OP_LOG_LINE => true,
        _ => return Err(Errno::Einval),
    };

    match device {
        DEVICE_SERIAL => {
            crate::serial::write_bytes(&buf);
            if newline {
                crate::serial::write_bytes(b"\n");
            }
        }
        DEVICE_CONSOLE => {
            let text = core::str::from_utf8(&buf).map_err(|_| Errno::Einval)?;
            if newline {
                crate::println!("{text}");
            } else {
                crate::print!("{text}");
            }
        }
        _ => return Err(Errno::Einval),
    }
    Ok(0)
}
