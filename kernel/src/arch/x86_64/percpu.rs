//! Per-CPU slots.
//!
//! Each CPU's area holds its kernel stack pointer (read by the syscall
//! entry stub through GS) and its CPU id. GS_BASE points at the area while
//! the kernel runs; `swapgs` flips to it on entry from user mode.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::sched::smp::MAX_CPUS;

/// Layout is load-bearing: the syscall stub addresses `kernel_rsp` as
/// `gs:[0]` and `scratch` as `gs:[8]`.
#[repr(C)]
pub struct PerCpuArea {
    pub kernel_rsp: AtomicU64,
    pub scratch: AtomicU64,
    pub cpu_id: AtomicU32,
    _pad: AtomicU32,
}

static AREAS: [PerCpuArea; MAX_CPUS] = [const {
    PerCpuArea {
        kernel_rsp: AtomicU64::new(0),
        scratch: AtomicU64::new(0),
        cpu_id: AtomicU32::new(0),
        _pad: AtomicU32::new(0),
    }
}; MAX_CPUS];

/// Install this CPU's area: records the id and points GS_BASE at it.
#[cfg(target_os = "none")]
pub fn init_this_cpu(cpu: u32, kernel_rsp: u64) {
    use x86_64::registers::model_specific::GsBase;
    use x86_64::VirtAddr;

    let area = &AREAS[cpu as usize];
    area.cpu_id.store(cpu, Ordering::Release);
    area.kernel_rsp.store(kernel_rsp, Ordering::Release);
    GsBase::write(VirtAddr::from_ptr(area));
}

/// The executing CPU's id, read through GS.
#[cfg(target_os = "none")]
pub fn cpu_id() -> u32 {
    let id: u32;
    // SAFETY: GS_BASE was pointed at this CPU's PerCpuArea during bring-up;
    // offset 16 is the cpu_id field.
    unsafe {
        core::arch::asm!(
            "mov {0:e}, gs:[16]",
            out(reg) id,
            options(nostack, preserves_flags, readonly)
        );
    }
    id
}

/// Update the saved kernel stack top for the executing CPU.
pub fn set_kernel_rsp(top: u64) {
    let cpu = crate::sched::smp::current_cpu_id();
    AREAS[cpu as usize].kernel_rsp.store(top, Ordering::Release);
}

/// This CPU's area pointer (IPI and debugging paths).
pub fn area(cpu: u32) -> &'static PerCpuArea {
    &AREAS[cpu as usize]
}
