//! Thread-information queries.

use crate::error::{Errno, SysResult};
use crate::sched::smp;

const OP_CURRENT_THREAD_ID: u64 = 0;
const OP_NATIVE_THREAD_COUNT: u64 = 1;

/// `args`: op.
pub fn sys_thread_info(args: &[u64; 6]) -> SysResult {
    match args[0] {
        OP_CURRENT_THREAD_ID => Ok(super::current()?.pid()),
        OP_NATIVE_THREAD_COUNT => Ok(smp::cpu_count() as u64),
        _ => Err(Errno::Einval),
    }
}
