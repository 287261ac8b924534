//! Process syscalls: identity, exit, and wait-for-PID.

use crate::error::{Errno, SysResult};
use crate::mm::{user, PhysAddr, VirtAddr};
use crate::sched::{self, scheduler, smp, task, BlockedOn};

const OP_GETPID: u64 = 0;
const OP_GETPPID: u64 = 1;
const OP_WAITPID: u64 = 2;
const OP_EXIT: u64 = 3;

/// `waitpid` failure result: by convention `-1`, not a negated errno.
const WAIT_FAILED: u64 = u64::MAX;

/// `args`: op, then per-op arguments.
pub fn sys_process(args: &[u64; 6]) -> SysResult {
    match args[0] {
        OP_GETPID => Ok(super::current()?.pid()),
        OP_GETPPID => Ok(super::current()?.parent()),
        OP_WAITPID => sys_waitpid(args[1], args[2]),
        OP_EXIT => {
            sched::exit_current(smp::current_cpu_id(), args[1] as i32);
            Ok(0)
        }
        _ => Err(Errno::Einval),
    }
}

/// Wait for `pid` to exit and collect its status.
///
/// The status destination is translated to a physical address up front:
/// the child exits under its own page tables and delivers through the
/// direct map. An already-exited target completes without blocking;
/// unknown, already-reaped, or over-subscribed targets fail with `-1`.
fn sys_waitpid(pid: u64, status_ptr: u64) -> SysResult {
    let current = super::current()?;

    let Some(target) = task::lookup(pid) else {
        return Ok(WAIT_FAILED);
    };
    if target == current {
        return Ok(WAIT_FAILED);
    }

    if target.has_exited() {
        if target.waited_on() {
            // Someone already consumed the status.
            return Ok(WAIT_FAILED);
        }
        if status_ptr != 0 {
            let space = super::current_space(&current)?;
            user::write_user::<i32>(space, status_ptr, target.exit_status())?;
        }
        scheduler::retire_zombie(target);
        return Ok(pid);
    }

    // A bad status pointer is a real fault; a full awaitee list is the
    // flat -1 failure.
    let status_phys = if status_ptr != 0 {
        let space = super::current_space(&current)?;
        user::check_user_range(space, status_ptr, core::mem::size_of::<i32>(), true)?;
        space
            .translate(VirtAddr::new(status_ptr))
            .ok_or(Errno::Efault)?
    } else {
        PhysAddr::zero()
    };
    if target.add_awaiter(current.pid()).is_err() {
        return Ok(WAIT_FAILED);
    }
    current.set_waiting_for(Some(target.pid()));
    current.set_wait_status_phys(status_phys);

    sched::scheduler::sleep_current_on_wait_list(
        smp::current_cpu_id(),
        BlockedOn::Child(pid),
        None,
    );
    // Overwritten with the child PID (and the status store) when the child
    // exits; this 0 is never observed by a successful waiter.
    Ok(0)
}
