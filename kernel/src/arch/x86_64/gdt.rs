//! Global descriptor table and TSS.
//!
//! Layout:
//! - 0x00 null
//! - 0x08 kernel code, 0x10 kernel data
//! - 0x18 TSS (two slots)
//! - 0x28 user data (0x2B with RPL 3), 0x30 user code (0x33 with RPL 3)
//!
//! User data sits below user code because SYSRET derives SS from
//! `STAR[63:48] + 8` and CS from `+ 16`.

/// Selector constants shared with the context-switch and syscall paths.
pub const KERNEL_CS: u64 = 0x08;
pub const KERNEL_SS: u64 = 0x10;
pub const USER_SS: u64 = 0x2B;
pub const USER_CS: u64 = 0x33;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

#[cfg(target_os = "none")]
mod hw {
    use lazy_static::lazy_static;
    use spin::Mutex;
    use x86_64::instructions::segmentation::{Segment, CS, SS};
    use x86_64::instructions::tables::load_tss;
    use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
    use x86_64::structures::tss::TaskStateSegment;
    use x86_64::VirtAddr;

    use super::DOUBLE_FAULT_IST_INDEX;

    /// The TSS must stay at a stable address once the TSS descriptor is
    /// built, so it lives in a static and is mutated through a raw pointer
    /// with the lock held.
    static mut TSS: TaskStateSegment = TaskStateSegment::new();
    static TSS_LOCK: Mutex<()> = Mutex::new(());

    const DF_STACK_SIZE: usize = 4096 * 4;

    #[repr(align(16))]
    struct AlignedStack([u8; DF_STACK_SIZE]);
    static mut DOUBLE_FAULT_STACK: AlignedStack = AlignedStack([0; DF_STACK_SIZE]);

    lazy_static! {
        static ref GDT: (GlobalDescriptorTable, Selectors) = {
            // SAFETY: runs once, before interrupts are enabled; nothing
            // else touches the TSS yet.
            unsafe {
                let tss = &mut *core::ptr::addr_of_mut!(TSS);
                let stack = core::ptr::addr_of!(DOUBLE_FAULT_STACK);
                tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
                    VirtAddr::from_ptr(stack) + DF_STACK_SIZE as u64;
            }

            let mut gdt = GlobalDescriptorTable::new();
            let kernel_code = gdt.append(Descriptor::kernel_code_segment());
            let kernel_data = gdt.append(Descriptor::kernel_data_segment());
            // SAFETY: the TSS static never moves.
            let tss = gdt.append(unsafe { Descriptor::tss_segment_unchecked(core::ptr::addr_of!(TSS)) });
            let user_data = gdt.append(Descriptor::user_data_segment());
            let user_code = gdt.append(Descriptor::user_code_segment());
            (
                gdt,
                Selectors {
                    kernel_code,
                    kernel_data,
                    tss,
                    user_data,
                    user_code,
                },
            )
        };
    }

    struct Selectors {
        kernel_code: SegmentSelector,
        kernel_data: SegmentSelector,
        tss: SegmentSelector,
        #[allow(dead_code)]
        user_data: SegmentSelector,
        #[allow(dead_code)]
        user_code: SegmentSelector,
    }

    pub fn init() {
        GDT.0.load();
        // SAFETY: the selectors come from the GDT just loaded.
        unsafe {
            CS::set_reg(GDT.1.kernel_code);
            SS::set_reg(GDT.1.kernel_data);
            load_tss(GDT.1.tss);
        }
        debug_assert_eq!(GDT.1.kernel_code.0 as u64, super::KERNEL_CS);
        debug_assert_eq!(GDT.1.user_code.0 as u64 | 3, super::USER_CS);
    }

    /// Point RSP0 at the incoming task's kernel stack top; used on every
    /// context switch into a user task.
    pub fn set_kernel_stack(top: u64) {
        let _guard = TSS_LOCK.lock();
        // SAFETY: guarded by TSS_LOCK; the CPU reads the field only on a
        // later privilege transition.
        unsafe {
            (*core::ptr::addr_of_mut!(TSS)).privilege_stack_table[0] = VirtAddr::new(top);
        }
    }
}

#[cfg(target_os = "none")]
pub use hw::{init, set_kernel_stack};

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn sysret_selector_arithmetic_holds() {
        // SYSRET: SS = base + 8, CS = base + 16, with base = USER_SS - 8.
        let star_base = (USER_SS & !3) - 8;
        assert_eq!(star_base + 8, USER_SS & !3);
        assert_eq!(star_base + 16, USER_CS & !3);
        assert_eq!(KERNEL_CS + 8, KERNEL_SS);
    }
}
