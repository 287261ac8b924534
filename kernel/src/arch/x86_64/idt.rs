//! Interrupt descriptor table and trap policy.
//!
//! Vectors 0–31 carry CPU exceptions. The ones with a recovery or kill
//! path (divide error, invalid opcode, general protection, page fault) go
//! through hand-written stubs that materialize the saved register file, so
//! the fault handler can kill a user task and switch away in place. Page
//! faults consult the address-space manager first; a refused fault in user
//! mode kills the task, in kernel mode it is a panic. Vectors 32–63 route
//! through the IRQ registry; the timer vector drives preemption with the
//! same frame-switching stub mechanism.

#[cfg(target_os = "none")]
mod hw {
    use lazy_static::lazy_static;
    use x86_64::registers::control::Cr2;
    use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame};
    use x86_64::VirtAddr;

    use super::super::apic::{self, SPURIOUS_VECTOR, TIMER_VECTOR, WAKE_VECTOR};
    use super::super::context::{switch_in_frame, GpRegs, TrapFrame};
    use super::super::gdt;
    use crate::mm::address_space::{FaultCode, FaultOutcome};
    use crate::sched::{scheduler, smp};

    /// Exit status delivered to a task killed by a CPU exception.
    const FAULT_EXIT_STATUS: i32 = -1;

    /// Frame layout the exception stubs hand to Rust: vector and error
    /// code pushed below the hardware frame.
    #[repr(C)]
    struct ExcFrame {
        vector: u64,
        error: u64,
        frame: TrapFrame,
    }

    extern "C" {
        fn helix_exc_entry_de();
        fn helix_exc_entry_ud();
        fn helix_exc_entry_gp();
        fn helix_exc_entry_pf();
        fn helix_timer_entry();
    }

    core::arch::global_asm!(
        r#"
        .macro SAVE_GP
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
        .endm

        .macro RESTORE_GP
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
        .endm

        // Exceptions without a hardware error code push a zero to keep the
        // common layout: [regs][vector][error][hw frame].
        .global helix_exc_entry_de
        helix_exc_entry_de:
            push 0
            push 0
            jmp helix_exc_common
        .global helix_exc_entry_ud
        helix_exc_entry_ud:
            push 0
            push 6
            jmp helix_exc_common
        .global helix_exc_entry_gp
        helix_exc_entry_gp:
            // Error code already pushed by the CPU.
            push 13
            jmp helix_exc_common
        .global helix_exc_entry_pf
        helix_exc_entry_pf:
            push 14
            jmp helix_exc_common

        helix_exc_common:
            SAVE_GP
            mov rdi, rsp
            lea rsi, [rsp + 15*8]
            cld
            call {exception_rust}
            RESTORE_GP
            add rsp, 16
            iretq

        .global helix_timer_entry
        helix_timer_entry:
            SAVE_GP
            mov rdi, rsp
            lea rsi, [rsp + 15*8]
            cld
            call {timer_rust}
            RESTORE_GP
            iretq
        "#,
        exception_rust = sym exception_rust,
        timer_rust = sym timer_rust,
    );

    /// Common exception policy behind the asm stubs.
    extern "C" fn exception_rust(regs: &mut GpRegs, exc: &mut ExcFrame) {
        let user_mode = exc.frame.cs & 3 == 3;

        if exc.vector == 14 {
            let addr = Cr2::read_raw();
            let code = FaultCode::from_bits_truncate(exc.error);
            let outcome = match scheduler::current_task() {
                Some(t) => match t.addr_space() {
                    Some(space) => space.handle_fault(crate::mm::VirtAddr::new(addr), code),
                    None => kernel_space_fault(addr, code),
                },
                None => kernel_space_fault(addr, code),
            };
            match outcome {
                FaultOutcome::Mapped => return,
                FaultOutcome::Fatal if user_mode => {
                    log::error!(
                        "page fault killed pid {:?}: addr={addr:#x} code={code:?} rip={:#x}",
                        scheduler::current_task().map(|t| t.pid()),
                        exc.frame.rip
                    );
                    kill_and_switch(regs, &mut exc.frame);
                    return;
                }
                FaultOutcome::Fatal => {
                    panic!(
                        "kernel page fault: addr={addr:#x} code={code:?} rip={:#x}",
                        exc.frame.rip
                    );
                }
            }
        }

        if user_mode {
            // Best-effort coredump would be recorded here; the side-channel
            // lives outside the core.
            log::error!(
                "exception {} (err={:#x}) killed pid {:?} at rip={:#x}",
                exc.vector,
                exc.error,
                scheduler::current_task().map(|t| t.pid()),
                exc.frame.rip
            );
            kill_and_switch(regs, &mut exc.frame);
        } else {
            panic!(
                "kernel exception {} err={:#x} rip={:#x}",
                exc.vector, exc.error, exc.frame.rip
            );
        }
    }

    /// Faults taken with no current task run against the kernel root.
    fn kernel_space_fault(addr: u64, code: FaultCode) -> FaultOutcome {
        match crate::mm::address_space::kernel_space() {
            Some(space) => space.handle_fault(crate::mm::VirtAddr::new(addr), code),
            None => FaultOutcome::Fatal,
        }
    }

    /// Terminate the faulting task and dispatch its successor on the live
    /// frame.
    fn kill_and_switch(regs: &mut GpRegs, frame: &mut TrapFrame) {
        let cpu = smp::current_cpu_id();
        scheduler::exit_current(cpu, FAULT_EXIT_STATUS);
        let Some(prev) = scheduler::take_deferred_switch(cpu) else {
            return;
        };
        if let Some(next) = scheduler::reschedule(cpu) {
            switch_in_frame(regs, frame, Some(prev), next);
        }
    }

    /// Timer interrupt body: account the tick, preempt if asked, rearm.
    extern "C" fn timer_rust(regs: &mut GpRegs, frame: &mut TrapFrame) {
        let cpu = smp::current_cpu_id();
        if crate::timer::on_tick(cpu) {
            let prev = scheduler::current_task_on(cpu);
            if let Some(next) = scheduler::reschedule(cpu) {
                if prev != Some(next) {
                    switch_in_frame(regs, frame, prev, next);
                }
            }
        }
        apic::eoi();
        apic::arm_timer();
    }

    extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
        log::warn!("breakpoint at {:#x}", stack_frame.instruction_pointer.as_u64());
    }

    // Exceptions user code cannot reasonably trigger get the blunt policy:
    // any occurrence is a kernel bug.
    macro_rules! fatal_exceptions {
        ($($name:ident: $what:expr),+ $(,)?) => {
            $(
                extern "x86-interrupt" fn $name(stack_frame: InterruptStackFrame) {
                    panic!("{} exception\n{:#?}", $what, stack_frame);
                }
            )+
        };
    }

    macro_rules! fatal_exceptions_with_code {
        ($($name:ident: $what:expr),+ $(,)?) => {
            $(
                extern "x86-interrupt" fn $name(
                    stack_frame: InterruptStackFrame,
                    error_code: u64,
                ) {
                    panic!("{} exception (err={error_code:#x})\n{:#?}", $what, stack_frame);
                }
            )+
        };
    }

    fatal_exceptions! {
        debug_exception: "debug",
        nmi_handler: "non-maskable interrupt",
        overflow_handler: "overflow",
        bound_range_handler: "bound range exceeded",
        device_not_available_handler: "device not available",
        x87_handler: "x87 floating point",
        simd_handler: "SIMD floating point",
        virtualization_handler: "virtualization",
    }

    fatal_exceptions_with_code! {
        invalid_tss_handler: "invalid TSS",
        segment_not_present_handler: "segment not present",
        stack_segment_handler: "stack segment fault",
        alignment_check_handler: "alignment check",
    }

    extern "x86-interrupt" fn machine_check_handler(stack_frame: InterruptStackFrame) -> ! {
        panic!("machine check\n{stack_frame:#?}");
    }

    extern "x86-interrupt" fn double_fault_handler(
        stack_frame: InterruptStackFrame,
        _error_code: u64,
    ) -> ! {
        panic!("double fault\n{stack_frame:#?}");
    }

    extern "x86-interrupt" fn spurious_handler(_stack_frame: InterruptStackFrame) {
        // No EOI for spurious interrupts.
    }

    extern "x86-interrupt" fn wake_handler(_stack_frame: InterruptStackFrame) {
        // The wake flag was set by the sender; the idle loop rechecks it
        // after hlt returns.
        apic::eoi();
    }

    extern "x86-interrupt" fn halt_handler(_stack_frame: InterruptStackFrame) {
        // A peer CPU panicked; park forever.
        crate::arch::halt_loop();
    }

    macro_rules! irq_handlers {
        ($($name:ident => $vector:expr),+ $(,)?) => {
            $(
                extern "x86-interrupt" fn $name(_stack_frame: InterruptStackFrame) {
                    if !crate::irq::dispatch($vector) {
                        log::debug!("unclaimed irq vector {}", $vector);
                    }
                    apic::eoi();
                }
            )+
        };
    }

    // The classical IRQ window (timer excluded) plus the first batch of
    // allocatable vectors.
    irq_handlers! {
        irq33 => 33, irq34 => 34, irq35 => 35, irq36 => 36, irq37 => 37,
        irq38 => 38, irq39 => 39, irq40 => 40, irq41 => 41, irq42 => 42,
        irq43 => 43, irq44 => 44, irq45 => 45, irq46 => 46, irq47 => 47,
        irq48 => 48, irq49 => 49, irq50 => 50, irq51 => 51, irq52 => 52,
        irq53 => 53, irq54 => 54, irq55 => 55, irq56 => 56, irq57 => 57,
        irq58 => 58, irq59 => 59, irq60 => 60, irq61 => 61, irq62 => 62,
        irq63 => 63,
    }

    lazy_static! {
        static ref IDT: InterruptDescriptorTable = {
            let mut idt = InterruptDescriptorTable::new();
            idt.breakpoint.set_handler_fn(breakpoint_handler);
            idt.debug.set_handler_fn(debug_exception);
            idt.non_maskable_interrupt.set_handler_fn(nmi_handler);
            idt.overflow.set_handler_fn(overflow_handler);
            idt.bound_range_exceeded.set_handler_fn(bound_range_handler);
            idt.device_not_available
                .set_handler_fn(device_not_available_handler);
            idt.x87_floating_point.set_handler_fn(x87_handler);
            idt.simd_floating_point.set_handler_fn(simd_handler);
            idt.virtualization.set_handler_fn(virtualization_handler);
            idt.invalid_tss.set_handler_fn(invalid_tss_handler);
            idt.segment_not_present
                .set_handler_fn(segment_not_present_handler);
            idt.stack_segment_fault.set_handler_fn(stack_segment_handler);
            idt.alignment_check.set_handler_fn(alignment_check_handler);
            idt.machine_check.set_handler_fn(machine_check_handler);
            // SAFETY: the stubs end in iretq with the layout the CPU
            // pushed; the double-fault handler runs on its own IST stack.
            unsafe {
                idt.divide_error
                    .set_handler_addr(VirtAddr::new(helix_exc_entry_de as usize as u64));
                idt.invalid_opcode
                    .set_handler_addr(VirtAddr::new(helix_exc_entry_ud as usize as u64));
                idt.general_protection_fault
                    .set_handler_addr(VirtAddr::new(helix_exc_entry_gp as usize as u64));
                idt.page_fault
                    .set_handler_addr(VirtAddr::new(helix_exc_entry_pf as usize as u64));
                idt.double_fault
                    .set_handler_fn(double_fault_handler)
                    .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
                idt[TIMER_VECTOR]
                    .set_handler_addr(VirtAddr::new(helix_timer_entry as usize as u64));
            }
            idt[SPURIOUS_VECTOR].set_handler_fn(spurious_handler);
            idt[WAKE_VECTOR].set_handler_fn(wake_handler);
            idt[apic::HALT_VECTOR].set_handler_fn(halt_handler);

            let handlers: [(u8, extern "x86-interrupt" fn(InterruptStackFrame)); 31] = [
                (33, irq33), (34, irq34), (35, irq35), (36, irq36), (37, irq37),
                (38, irq38), (39, irq39), (40, irq40), (41, irq41), (42, irq42),
                (43, irq43), (44, irq44), (45, irq45), (46, irq46), (47, irq47),
                (48, irq48), (49, irq49), (50, irq50), (51, irq51), (52, irq52),
                (53, irq53), (54, irq54), (55, irq55), (56, irq56), (57, irq57),
                (58, irq58), (59, irq59), (60, irq60), (61, irq61), (62, irq62),
                (63, irq63),
            ];
            for (vector, handler) in handlers {
                idt[vector].set_handler_fn(handler);
            }
            idt
        };
    }

    pub fn init() {
        IDT.load();
    }
}

#[cfg(target_os = "none")]
pub use hw::init;
