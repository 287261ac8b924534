//! Network syscalls. The socket surface belongs to the network stack;
//! the core only reserves the call number.

use crate::error::{Errno, SysResult};

pub fn sys_net(_args: &[u64; 6]) -> SysResult {
    Err(Errno::Enosys)
}
