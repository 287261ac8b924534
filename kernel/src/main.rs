//! HelixOS kernel binary: bare-metal entry and CPU 0 bring-up.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel {
    extern crate alloc;

    use alloc::boxed::Box;
    use bootloader_api::config::{BootloaderConfig, Mapping};
    use bootloader_api::BootInfo;
    use helix_kernel::arch::context::TrapFrame;
    use helix_kernel::sched::task::{KernelStack, Task};
    use helix_kernel::sched::{scheduler, smp, TaskRef};
    use helix_kernel::{arch, boot, logger, mm, println, sched, serial};

    pub static BOOTLOADER_CONFIG: BootloaderConfig = {
        let mut config = BootloaderConfig::new_default();
        config.mappings.physical_memory = Some(Mapping::Dynamic);
        config
    };

    bootloader_api::entry_point!(kernel_main, config = &BOOTLOADER_CONFIG);

    fn kernel_main(boot_info: &'static mut BootInfo) -> ! {
        let kernel_phys = boot_info.kernel_addr;
        let kernel_len = boot_info.kernel_len;
        let kernel_virt = boot_info.kernel_image_offset;

        mm::heap::init_early();
        serial::init();
        logger::init(log::LevelFilter::Info);
        println!("helix {} booting", env!("CARGO_PKG_VERSION"));

        let handoff = boot::digest(boot_info);
        mm::init(
            &handoff,
            mm::PhysAddr::new(kernel_phys),
            kernel_len,
            kernel_virt,
        )
        .expect("memory bring-up failed");
        log::info!(
            "mm: {} frames free after bring-up",
            mm::FRAME_ALLOCATOR.free_frame_count()
        );

        scheduler::init(handoff.cpu_count());
        arch::x86_64::init_bsp(&handoff);

        // The bring-up context becomes CPU 0's boot task; a per-CPU stack
        // backs the syscall entry path.
        let syscall_stack = KernelStack::new().expect("boot cpu syscall stack");
        arch::x86_64::percpu::init_this_cpu(0, syscall_stack.top());
        core::mem::forget(syscall_stack);

        let boot_task = TaskRef::from_box(Task::new("boot", 0));
        sched::task::register(boot_task);
        scheduler::adopt_current(0, boot_task);
        scheduler::set_idle_task(0, idle_task("idle/0"));

        spawn_housekeeper();

        log::info!("helix up; entering idle");
        idle_loop(0)
    }

    /// A long-lived kernel worker: sweeps reclaimable tasks and logs a
    /// heartbeat. Stands where the userspace init would be loaded from the
    /// boot modules.
    extern "C" fn housekeeper_entry() -> ! {
        loop {
            sched::collect_dead(smp::current_cpu_id());
            x86_64::instructions::hlt();
        }
    }

    fn spawn_housekeeper() {
        let mut task = Task::new("housekeeper", 1);
        let stack = KernelStack::new().expect("housekeeper stack");
        task.frame = TrapFrame::kernel_entry(housekeeper_entry as usize as u64, stack.top());
        task.kernel_stack = Some(stack);
        scheduler::spawn(task);
    }

    extern "C" fn idle_entry() -> ! {
        helix_kernel::arch::halt_loop()
    }

    fn idle_task(name: &str) -> Box<Task> {
        let mut task = Task::new(name, 0);
        let stack = KernelStack::new().expect("idle stack");
        task.frame = TrapFrame::kernel_entry(idle_entry as usize as u64, stack.top());
        task.kernel_stack = Some(stack);
        task
    }

    fn idle_loop(cpu: u32) -> ! {
        loop {
            if smp::take_wake_pending(cpu) {
                // A peer queued work here; the next timer tick dispatches
                // it.
                continue;
            }
            x86_64::instructions::interrupts::enable_and_hlt();
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        x86_64::instructions::interrupts::disable();
        println!("[KERNEL PANIC] {info}");
        helix_kernel::arch::x86_64::apic::broadcast_halt();
        helix_kernel::arch::halt_loop();
    }
}

// The kernel image only makes sense for the bare-metal target; building
// the binary on a host is a no-op so `cargo test` links cleanly.
#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("helix-kernel must be built for x86_64-unknown-none");
}
