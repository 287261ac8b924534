//! Futex syscalls.
//!
//! The wait key is the *physical* address of the 32-bit futex word, so two
//! virtual mappings of the same page share one wait queue. The value check
//! and the enqueue happen under the bucket lock; the actual suspension is a
//! deferred switch on the syscall return path.

use crate::error::{Errno, SysResult};
use crate::mm::{user, VirtAddr};
use crate::sched::{smp, wait};

const OP_WAIT: u64 = 0;
const OP_WAKE: u64 = 1;

/// `args`: op, address, value/count, relative timeout in microseconds
/// (0 = no timeout).
pub fn sys_futex(args: &[u64; 6]) -> SysResult {
    let (op, uaddr, value, timeout_us) = (args[0], args[1], args[2], args[3]);

    if uaddr == 0 || uaddr & 0x3 != 0 {
        return Err(Errno::Einval);
    }

    let task = super::current()?;
    let space = super::current_space(&task)?;
    user::check_user_range(space, uaddr, core::mem::size_of::<u32>(), false)?;
    let key = space
        .translate(VirtAddr::new(uaddr))
        .ok_or(Errno::Efault)?
        .as_u64();

    match op {
        OP_WAIT => {
            let expected = value as u32;
            let current_value = user::read_user::<u32>(space, uaddr)?;
            if current_value != expected {
                return Err(Errno::Eagain);
            }
            let deadline = (timeout_us != 0)
                .then(|| crate::timer::now_us().saturating_add(timeout_us));
            wait::futex_park_current(smp::current_cpu_id(), key, deadline);
            // The parked task resumes with this 0 unless expiry rewrites
            // the saved frame to -ETIMEDOUT.
            Ok(0)
        }
        OP_WAKE => {
            let n = wait::futex_wake(key, value as usize);
            Ok(n as u64)
        }
        _ => Err(Errno::Einval),
    }
}
