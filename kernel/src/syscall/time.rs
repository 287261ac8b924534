//! Time syscalls: wall-clock queries and sleeping.

use crate::error::{Errno, SysResult};
use crate::mm::user;
use crate::sched::wait;
use crate::timer;

const OP_GETTIMEOFDAY: u64 = 0;
const OP_CLOCK_GETTIME: u64 = 1;
const OP_NANOSLEEP: u64 = 2;

/// `struct timeval` as user space lays it out.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TimeVal {
    tv_sec: i64,
    tv_usec: i64,
}

/// `struct timespec` as user space lays it out.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct TimeSpec {
    tv_sec: i64,
    tv_nsec: i64,
}

/// `args`: op, then per-op pointers.
pub fn sys_time(args: &[u64; 6]) -> SysResult {
    let task = super::current()?;
    let space = super::current_space(&task)?;

    let us = timer::now_us();
    let sec = (us / 1_000_000) as i64;
    let usec = (us % 1_000_000) as i64;

    match args[0] {
        OP_GETTIMEOFDAY => {
            if args[1] == 0 {
                return Err(Errno::Einval);
            }
            user::write_user(
                space,
                args[1],
                TimeVal {
                    tv_sec: sec,
                    tv_usec: usec,
                },
            )?;
            Ok(0)
        }
        OP_CLOCK_GETTIME => {
            if args[1] == 0 {
                return Err(Errno::Einval);
            }
            user::write_user(
                space,
                args[1],
                TimeSpec {
                    tv_sec: sec,
                    tv_nsec: usec * 1_000,
                },
            )?;
            Ok(0)
        }
        OP_NANOSLEEP => sys_nanosleep(space, args[1], args[2]),
        _ => Err(Errno::Einval),
    }
}

/// Park until the requested interval elapses. The remaining-time out
/// parameter is always zeroed: expiry is the only wake source.
fn sys_nanosleep(
    space: &crate::mm::AddressSpace,
    req_ptr: u64,
    rem_ptr: u64,
) -> SysResult {
    if req_ptr == 0 {
        return Err(Errno::Einval);
    }
    let req = user::read_user::<TimeSpec>(space, req_ptr)?;
    if req.tv_sec < 0 || !(0..1_000_000_000).contains(&req.tv_nsec) {
        return Err(Errno::Einval);
    }
    if rem_ptr != 0 {
        user::write_user(
            space,
            rem_ptr,
            TimeSpec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        )?;
    }

    let sleep_us = (req.tv_sec as u64)
        .saturating_mul(1_000_000)
        .saturating_add(req.tv_nsec as u64 / 1_000);
    if sleep_us == 0 {
        return Ok(0);
    }
    wait::sleep_current_until(timer::now_us().saturating_add(sleep_us));
    Ok(0)
}
