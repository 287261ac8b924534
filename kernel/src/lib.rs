//! HelixOS kernel library.
//!
//! The crate builds two ways: as the bare-metal kernel
//! (`x86_64-unknown-none`, via `src/main.rs`) and as a hosted library
//! whose unit and integration tests exercise every policy layer under the
//! standard test harness. Hardware access is confined to
//! `target_os = "none"` paths; on the host, the system allocator stands in
//! for the kernel heap and "physical" memory is a leaked arena.

#![no_std]
#![cfg_attr(all(target_arch = "x86_64", target_os = "none"), feature(abi_x86_interrupt))]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod error;
pub mod fs;
pub mod irq;
pub mod logger;
pub mod mm;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod timer;

#[cfg(test)]
mod integration_tests;

// Bare metal allocates through the kernel heap (early boot falls back to a
// static linked-list heap until the frame allocator has zones).
#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: mm::heap::HeapAllocator = mm::heap::HeapAllocator;

// Hosted builds use the system allocator so test code allocates normally.
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

/// Serialize tests that touch process-global kernel state (scheduler
/// per-CPU slots, the reclamation epoch, the tick counter).
#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn test_env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
