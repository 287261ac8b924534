//! `syscall` instruction entry path.
//!
//! The stub lands on the per-CPU kernel stack, materializes a trap frame
//! and the full register file, and hands both to the dispatcher by
//! reference. That indirection is what makes blocking work: a syscall body
//! never switches, it arms the deferred-switch flag, and the return path
//! here performs the switch against the saved frame before `iretq`.
//!
//! Register convention: `rax` carries the call number, arguments ride in
//! `rdi rsi rdx r10 r8 r9`, the result returns in `rax`.

#[cfg(target_os = "none")]
mod hw {
    use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
    use x86_64::registers::rflags::RFlags;
    use x86_64::structures::gdt::SegmentSelector;
    use x86_64::{PrivilegeLevel, VirtAddr};

    use super::super::context::{GpRegs, TrapFrame};
    use super::super::gdt;
    use crate::sched::{scheduler, smp};

    extern "C" {
        fn helix_syscall_entry();
    }

    core::arch::global_asm!(
        r#"
        // Entry from the syscall instruction: rcx = user rip, r11 = user
        // rflags, user rsp still live. Build an iretq-shaped frame on the
        // per-CPU kernel stack so the dispatcher (and a deferred switch)
        // sees the same layout as any trap.
        .global helix_syscall_entry
        helix_syscall_entry:
            swapgs
            mov gs:[8], rsp          // stash user rsp in the per-CPU scratch
            mov rsp, gs:[0]          // per-CPU kernel stack top

            push {user_ss}
            push gs:[8]              // user rsp
            push r11                 // user rflags
            push {user_cs}
            push rcx                 // user rip

            push rax
            push rbx
            push rcx
            push rdx
            push rsi
            push rdi
            push rbp
            push r8
            push r9
            push r10
            push r11
            push r12
            push r13
            push r14
            push r15

            mov rdi, rsp             // &mut GpRegs
            lea rsi, [rsp + 15*8]    // &mut TrapFrame
            cld
            call {syscall_rust}

            pop r15
            pop r14
            pop r13
            pop r12
            pop r11
            pop r10
            pop r9
            pop r8
            pop rbp
            pop rdi
            pop rsi
            pop rdx
            pop rcx
            pop rbx
            pop rax

            swapgs
            iretq
        "#,
        user_ss = const gdt::USER_SS,
        user_cs = const gdt::USER_CS,
        syscall_rust = sym syscall_rust,
    );

    /// Rust side of the entry stub.
    extern "C" fn syscall_rust(regs: &mut GpRegs, frame: &mut TrapFrame) {
        let callnum = regs.rax;
        let args = [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9];

        regs.rax = crate::syscall::dispatch(callnum, &args);

        // The body may have parked or exited the task: switch now that the
        // frame is whole.
        scheduler::finish_syscall(smp::current_cpu_id(), regs, frame);
    }

    /// Enable the syscall instruction and point it at the entry stub.
    pub fn init() {
        let kernel_cs = SegmentSelector(gdt::KERNEL_CS as u16);
        let user_base = SegmentSelector::new((gdt::USER_SS as u16 >> 3) - 1, PrivilegeLevel::Ring3);

        // SAFETY: selectors satisfy the STAR layout checked above; the
        // entry symbol is the stub defined in this module.
        unsafe {
            Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
            Star::write_raw(user_base.0, kernel_cs.0);
            LStar::write(VirtAddr::new(helix_syscall_entry as usize as u64));
            SFMask::write(RFlags::INTERRUPT_FLAG | RFlags::TRAP_FLAG | RFlags::DIRECTION_FLAG);
        }
    }
}

#[cfg(target_os = "none")]
pub use hw::init;
