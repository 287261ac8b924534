//! Epoch-based reclamation for task storage.
//!
//! Scheduler structures hand out raw task pointers; freeing a dead task's
//! storage is only safe once no CPU can still be holding one. Each CPU
//! publishes the global epoch it observed when it entered a read-side
//! critical section; a task that died at epoch `E` may be reclaimed only
//! when the global epoch has moved at least [`EPOCH_THRESHOLD`] past `E`
//! and no CPU is inside a critical section whose observed epoch is `<= E`.

use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use super::smp::MAX_CPUS;

/// Epochs that must pass before storage freed at an epoch is reclaimable.
pub const EPOCH_THRESHOLD: u64 = 2;

/// Per-CPU epoch slot, padded to a cache line.
#[repr(align(64))]
struct CpuEpoch {
    local: AtomicU64,
    in_critical: AtomicBool,
}

impl CpuEpoch {
    const fn new() -> Self {
        Self {
            local: AtomicU64::new(0),
            in_critical: AtomicBool::new(false),
        }
    }
}

static GLOBAL_EPOCH: AtomicU64 = AtomicU64::new(0);
static CPU_EPOCHS: [CpuEpoch; MAX_CPUS] = [const { CpuEpoch::new() }; MAX_CPUS];

/// Enter a read-side critical section on `cpu`.
///
/// While inside, the CPU may dereference task pointers obtained from
/// scheduler structures; the reclamation check refuses to free anything the
/// section could still observe.
pub fn enter_critical(cpu: u32) {
    let slot = &CPU_EPOCHS[cpu as usize];
    slot.in_critical.store(true, Ordering::Relaxed);
    let epoch = GLOBAL_EPOCH.load(Ordering::Acquire);
    slot.local.store(epoch, Ordering::Release);
    // Publish the slot before any task pointer is read.
    fence(Ordering::SeqCst);
}

/// Exit the read-side critical section on `cpu`.
pub fn exit_critical(cpu: u32) {
    // All task pointer accesses complete before the slot clears.
    fence(Ordering::SeqCst);
    CPU_EPOCHS[cpu as usize]
        .in_critical
        .store(false, Ordering::Release);
}

/// Current global epoch.
pub fn current() -> u64 {
    GLOBAL_EPOCH.load(Ordering::Acquire)
}

/// Advance the global epoch. Driven periodically from the timer path of one
/// CPU.
pub fn advance() {
    GLOBAL_EPOCH.fetch_add(1, Ordering::AcqRel);
}

/// May storage freed at `death_epoch` be reclaimed now?
pub fn is_safe_to_reclaim(death_epoch: u64) -> bool {
    let now = GLOBAL_EPOCH.load(Ordering::Acquire);
    if now.wrapping_sub(death_epoch) < EPOCH_THRESHOLD {
        return false;
    }
    for slot in CPU_EPOCHS.iter() {
        if slot.in_critical.load(Ordering::Acquire)
            && slot.local.load(Ordering::Acquire) <= death_epoch
        {
            return false;
        }
    }
    true
}

/// RAII read-side critical section for the current CPU.
pub struct EpochGuard {
    cpu: u32,
}

impl EpochGuard {
    pub fn new() -> Self {
        let cpu = super::smp::current_cpu_id();
        enter_critical(cpu);
        Self { cpu }
    }
}

impl Default for EpochGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochGuard {
    fn drop(&mut self) {
        exit_critical(self.cpu);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    // The epoch state is process-global, so every test touching it holds
    // the crate-wide serialization lock.

    #[test]
    fn reclamation_waits_for_the_threshold() {
        let _env = crate::test_env_lock();
        let death = current();
        assert!(!is_safe_to_reclaim(death));
        advance();
        assert!(!is_safe_to_reclaim(death));
        advance();
        assert!(is_safe_to_reclaim(death));
    }

    #[test]
    fn critical_section_blocks_reclamation() {
        let _env = crate::test_env_lock();
        // Simulate a peer CPU pinned at the death epoch.
        let peer = (MAX_CPUS - 1) as u32;
        let death = current();
        enter_critical(peer);
        advance();
        advance();
        assert!(
            !is_safe_to_reclaim(death),
            "peer still inside a section that observed the death epoch"
        );
        exit_critical(peer);
        assert!(is_safe_to_reclaim(death));
    }

    #[test]
    fn sections_entered_after_death_do_not_block() {
        let _env = crate::test_env_lock();
        let peer = (MAX_CPUS - 2) as u32;
        let death = current();
        advance();
        advance();
        enter_critical(peer);
        // The peer observed an epoch strictly newer than the death epoch.
        assert!(is_safe_to_reclaim(death));
        exit_critical(peer);
    }
}
