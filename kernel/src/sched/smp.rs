//! SMP bookkeeping: CPU identity, counts, and cross-CPU wakeups.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Compile-time CPU limit.
pub const MAX_CPUS: usize = 16;

static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Pending lightweight-wake flags, one per CPU. Set by [`wake_cpu`]; the
/// target's idle loop (or the IPI handler on hardware) consumes it.
static WAKE_PENDING: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Record the number of online CPUs from the boot handoff.
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count.clamp(1, MAX_CPUS as u32), Ordering::Release);
}

pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Identify the executing CPU.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn current_cpu_id() -> u32 {
    crate::arch::x86_64::percpu::cpu_id()
}

/// Hosted builds model a single CPU; scheduler tests address peer CPUs
/// explicitly by index.
#[cfg(not(target_os = "none"))]
pub fn current_cpu_id() -> u32 {
    0
}

/// Kick `cpu` out of `hlt`: mark the wake pending and, on hardware, send
/// the wake IPI.
pub fn wake_cpu(cpu: u32) {
    if cpu as usize >= MAX_CPUS {
        return;
    }
    WAKE_PENDING[cpu as usize].store(true, Ordering::Release);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    crate::arch::x86_64::apic::send_wake_ipi(cpu);
}

/// Consume the pending-wake flag for `cpu`.
pub fn take_wake_pending(cpu: u32) -> bool {
    if cpu as usize >= MAX_CPUS {
        return false;
    }
    WAKE_PENDING[cpu as usize].swap(false, Ordering::AcqRel)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn wake_flag_is_consumed_once() {
        let cpu = (MAX_CPUS - 1) as u32;
        assert!(!take_wake_pending(cpu));
        wake_cpu(cpu);
        assert!(take_wake_pending(cpu));
        assert!(!take_wake_pending(cpu));
    }

    #[test]
    fn out_of_range_cpus_are_ignored() {
        wake_cpu(999);
        assert!(!take_wake_pending(999));
    }
}
