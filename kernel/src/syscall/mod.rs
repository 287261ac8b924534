//! System-call surface.
//!
//! A closed table of numbered subsystems, each with its own operation
//! enum. Handlers validate arguments, translate user pointers through the
//! calling task's address space, and return `Result<u64, Errno>`; the
//! dispatcher encodes errors as negated POSIX integers in the return
//! register.

pub mod futex;
pub mod net;
pub mod process;
pub mod sys_log;
pub mod thread_info;
pub mod time;
pub mod vfs;
pub mod vmem;

use crate::error::Errno;
use crate::mm::AddressSpace;
use crate::sched::{self, TaskRef};

/// Syscall numbers (the closed core set).
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallClass {
    Log = 0,
    Futex = 1,
    ThreadInfo = 2,
    Process = 3,
    Time = 4,
    Vfs = 5,
    Vmem = 6,
    Net = 7,
}

impl CallClass {
    fn from_raw(raw: u64) -> Option<Self> {
        Some(match raw {
            0 => Self::Log,
            1 => Self::Futex,
            2 => Self::ThreadInfo,
            3 => Self::Process,
            4 => Self::Time,
            5 => Self::Vfs,
            6 => Self::Vmem,
            7 => Self::Net,
            _ => return None,
        })
    }
}

/// Dispatch one syscall. `args[0]` is the per-subsystem operation for every
/// class that has one.
pub fn dispatch(callnum: u64, args: &[u64; 6]) -> u64 {
    let result = match CallClass::from_raw(callnum) {
        Some(CallClass::Log) => sys_log::sys_log(args),
        Some(CallClass::Futex) => futex::sys_futex(args),
        Some(CallClass::ThreadInfo) => thread_info::sys_thread_info(args),
        Some(CallClass::Process) => process::sys_process(args),
        Some(CallClass::Time) => time::sys_time(args),
        Some(CallClass::Vfs) => vfs::sys_vfs(args),
        Some(CallClass::Vmem) => vmem::sys_vmem(args),
        Some(CallClass::Net) => net::sys_net(args),
        None => Err(Errno::Enosys),
    };
    match result {
        Ok(value) => value,
        Err(errno) => errno.as_ret(),
    }
}

/// The calling task, or `ESRCH` when no task is current (early boot).
pub(crate) fn current() -> Result<TaskRef, Errno> {
    sched::current_task().ok_or(Errno::Esrch)
}

/// The calling task's address space; tasks without one cannot pass user
/// pointers.
pub(crate) fn current_space(task: &TaskRef) -> Result<&AddressSpace, Errno> {
    task.addr_space().ok_or(Errno::Efault)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn unknown_call_numbers_are_enosys() {
        assert_eq!(dispatch(999, &[0; 6]) as i64, -(Errno::Enosys as i64));
    }

    #[test]
    fn net_is_a_placeholder() {
        assert_eq!(
            dispatch(CallClass::Net as u64, &[0; 6]) as i64,
            -(Errno::Enosys as i64)
        );
    }
}
