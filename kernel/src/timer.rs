//! Kernel time base.
//!
//! A monotonic tick counter advanced by the local-APIC oneshot timer at
//! [`TICK_HZ`]. The tick drives preemption accounting, futex/sleep timeout
//! expiry, and the periodic epoch advance + dead-task sweep. Hosted tests
//! advance the clock by hand.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::sched::{epoch, scheduler, wait};

/// Timer interrupt frequency.
pub const TICK_HZ: u64 = 1000;

/// Microseconds per tick.
pub const TICK_US: u64 = 1_000_000 / TICK_HZ;

/// Ticks between global epoch advances.
const EPOCH_ADVANCE_TICKS: u64 = 64;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonic microseconds since boot.
pub fn now_us() -> u64 {
    TICKS.load(Ordering::Acquire) * TICK_US
}

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// One timer interrupt on `cpu`.
///
/// The boot CPU owns the global time base: it advances the tick count,
/// expires timed waits, and periodically bumps the reclamation epoch.
/// Returns whether the scheduler wants a preemption on this CPU.
///
/// Dead-task collection does NOT run here: reclamation frees kernel heap
/// memory, and IRQ context must never allocate or free. The housekeeper
/// task drives [`scheduler::collect_dead`].
pub fn on_tick(cpu: u32) -> bool {
    if cpu == 0 {
        let tick = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
        let now = tick * TICK_US;
        wait::expire_timeouts(now);
        scheduler::expire_sleepers(now);
        if tick % EPOCH_ADVANCE_TICKS == 0 {
            epoch::advance();
        }
    }
    scheduler::on_tick(cpu, TICK_US)
}

/// Advance the clock without hardware. Hosted tests only.
#[cfg(all(test, not(target_os = "none")))]
pub fn advance_for_tests(us: u64) {
    TICKS.fetch_add(us / TICK_US, Ordering::AcqRel);
    let now = now_us();
    wait::expire_timeouts(now);
    scheduler::expire_sleepers(now);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn time_is_monotonic_in_tick_units() {
        let _env = crate::test_env_lock();
        let before = now_us();
        advance_for_tests(5_000);
        assert!(now_us() >= before + 5_000);
    }
}
