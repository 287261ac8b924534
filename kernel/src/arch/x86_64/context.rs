//! Saved execution state and the context-switch path.
//!
//! Two pieces of state travel with every task: the general-purpose register
//! file captured at trap/syscall entry, and the interrupt frame the CPU
//! pushed. A context switch overwrites both in place on the current stack
//! frame, swaps CR3 when the address space differs, and lets the normal
//! trap/syscall return path "return" into the next task.

/// General-purpose register file, in the order the entry stubs push it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GpRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
}

/// Hardware interrupt frame (what the CPU pushes on a ring transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// RFLAGS with IF set; everything else architecture-default.
pub const RFLAGS_USER_DEFAULT: u64 = 0x202;

impl Default for TrapFrame {
    fn default() -> Self {
        Self {
            rip: 0,
            cs: 0,
            rflags: RFLAGS_USER_DEFAULT,
            rsp: 0,
            ss: 0,
        }
    }
}

impl TrapFrame {
    /// Frame that enters `entry` on `stack_top` in kernel mode.
    pub fn kernel_entry(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: super::gdt::KERNEL_CS,
            rflags: RFLAGS_USER_DEFAULT,
            rsp: stack_top,
            ss: super::gdt::KERNEL_SS,
        }
    }

    /// Frame that enters `entry` on `stack_top` in user mode.
    pub fn user_entry(entry: u64, stack_top: u64) -> Self {
        Self {
            rip: entry,
            cs: super::gdt::USER_CS,
            rflags: RFLAGS_USER_DEFAULT,
            rsp: stack_top,
            ss: super::gdt::USER_SS,
        }
    }
}

/// Install the next task's saved state into the live trap frame and register
/// area, saving the outgoing task's state first.
///
/// Runs with the scheduler lock held and interrupts off. The actual transfer
/// of control happens when the caller's trap or syscall path restores
/// `regs`/`frame` and returns.
#[cfg(target_os = "none")]
pub fn switch_in_frame(
    regs: &mut GpRegs,
    frame: &mut TrapFrame,
    prev: Option<crate::sched::TaskRef>,
    next: crate::sched::TaskRef,
) {
    if let Some(prev) = prev {
        prev.save_context(*regs, *frame);
        prev.set_fs_gs(super::msr::read_fs_base(), super::msr::read_kernel_gs_base());
    }

    let (next_regs, next_frame) = next.saved_context();
    *regs = next_regs;
    *frame = next_frame;

    let (fs, gs) = next.fs_gs();
    super::msr::write_fs_base(fs);
    super::msr::write_kernel_gs_base(gs);

    // Writes to the next task's saved registers happen-before this CPU
    // dispatches it: the scheduler lock release below us is the fence.
    if let Some(root) = next.addr_space_root() {
        load_cr3(root);
    }
    if let Some(top) = next.kernel_stack_top() {
        super::gdt::set_kernel_stack(top);
        super::percpu::set_kernel_rsp(top);
    }
}

/// Load a new top-level table if it differs from the active one.
#[cfg(target_os = "none")]
fn load_cr3(root: crate::mm::PhysAddr) {
    use x86_64::registers::control::{Cr3, Cr3Flags};
    use x86_64::structures::paging::PhysFrame;

    let (current, _) = Cr3::read();
    if current.start_address().as_u64() != root.as_u64() {
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(root.as_u64()));
        // SAFETY: `root` is a live top-level table whose kernel half matches
        // the running kernel's mappings.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn register_file_layout_is_stable() {
        // The entry stubs push 15 registers; the frame is the 5-word
        // hardware layout.
        assert_eq!(core::mem::size_of::<GpRegs>(), 15 * 8);
        assert_eq!(core::mem::size_of::<TrapFrame>(), 5 * 8);
    }

    #[test]
    fn default_frame_has_interrupts_enabled() {
        let f = TrapFrame::default();
        assert_eq!(f.rflags & 0x200, 0x200);
    }
}
