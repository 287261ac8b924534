//! x86-64 support: segmentation, traps, APICs, per-CPU state, and the
//! syscall entry path. Hardware access is gated on bare-metal builds;
//! hosted builds see only the type definitions and constants.

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod msr;
pub mod percpu;
pub mod syscall_entry;

/// Bring up the boot CPU's trap and interrupt plumbing.
#[cfg(target_os = "none")]
pub fn init_bsp(handoff: &crate::boot::Handoff) {
    gdt::init();
    idt::init();
    apic::init_bsp(handoff);
    syscall_entry::init();
}
