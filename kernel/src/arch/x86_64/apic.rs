//! Local APIC and IO-APIC programming.
//!
//! The local APIC supplies end-of-interrupt, the oneshot preemption timer,
//! and fixed IPIs for cross-CPU wakes. The IO-APIC routes global system
//! interrupts to vectors, honoring the ISA overrides the firmware walker
//! reported. The legacy 8259 pair is remapped out of the exception range
//! and masked before the IO-APIC takes over.

/// Vector the preemption timer fires on (first slot of the IRQ window).
pub const TIMER_VECTOR: u8 = 32;

/// Fixed IPI vector used by [`send_wake_ipi`].
pub const WAKE_VECTOR: u8 = 0xF0;

/// Stop-everything IPI broadcast by the panic path.
pub const HALT_VECTOR: u8 = 0xF1;

/// Spurious-interrupt vector.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

#[cfg(target_os = "none")]
mod hw {
    use core::sync::atomic::{AtomicU32, Ordering};

    use pic8259::ChainedPics;
    use spin::Mutex;

    use super::{SPURIOUS_VECTOR, TIMER_VECTOR, WAKE_VECTOR};
    use crate::boot::Handoff;
    use crate::mm::{phys_to_virt, PhysAddr};
    use crate::sched::smp::MAX_CPUS;

    const LAPIC_PHYS: u64 = 0xFEE0_0000;
    const IOAPIC_PHYS: u64 = 0xFEC0_0000;

    // Local-APIC register offsets.
    const LAPIC_ID: usize = 0x020;
    const LAPIC_EOI: usize = 0x0B0;
    const LAPIC_SPURIOUS: usize = 0x0F0;
    const LAPIC_ICR_LOW: usize = 0x300;
    const LAPIC_ICR_HIGH: usize = 0x310;
    const LAPIC_LVT_TIMER: usize = 0x320;
    const LAPIC_TIMER_INIT: usize = 0x380;
    const LAPIC_TIMER_DIVIDE: usize = 0x3E0;

    const SPURIOUS_ENABLE: u32 = 1 << 8;
    const ICR_DELIVERY_PENDING: u32 = 1 << 12;

    /// Oneshot initial count per tick; calibrated against the PIT on real
    /// hardware, a steady default under QEMU.
    const TIMER_INITIAL_COUNT: u32 = 1_000_000;

    /// Roster mapping cpu id to local-APIC id, filled from the handoff.
    static LAPIC_IDS: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(0) }; MAX_CPUS];

    /// Remapped-and-masked legacy PICs. Only the remap offsets matter; all
    /// lines stay masked in favor of the IO-APIC.
    static PICS: Mutex<ChainedPics> = Mutex::new(
        // SAFETY contract of ChainedPics::new: offsets 32/40 do not collide
        // with CPU exceptions.
        unsafe { ChainedPics::new(32, 40) },
    );

    fn lapic_reg(offset: usize) -> *mut u32 {
        (phys_to_virt(PhysAddr::new(LAPIC_PHYS)) as usize + offset) as *mut u32
    }

    fn lapic_read(offset: usize) -> u32 {
        // SAFETY: the LAPIC MMIO window is mapped through the direct map;
        // offsets come from the constant table above.
        unsafe { lapic_reg(offset).read_volatile() }
    }

    fn lapic_write(offset: usize, value: u32) {
        // SAFETY: as in `lapic_read`.
        unsafe { lapic_reg(offset).write_volatile(value) }
    }

    /// Bring up interrupt routing on the boot CPU.
    pub fn init_bsp(handoff: &Handoff) {
        for cpu in handoff.cpus.iter().flatten() {
            if (cpu.cpu_id as usize) < MAX_CPUS {
                LAPIC_IDS[cpu.cpu_id as usize].store(cpu.lapic_id, Ordering::Release);
            }
        }

        // Push the 8259s out of the exception range, then mask them.
        {
            let mut pics = PICS.lock();
            // SAFETY: standard PIC initialization sequence at the remapped
            // offsets.
            unsafe {
                pics.initialize();
                pics.write_masks(0xFF, 0xFF);
            }
        }

        lapic_write(LAPIC_SPURIOUS, SPURIOUS_ENABLE | SPURIOUS_VECTOR as u32);
        arm_timer();
    }

    /// Local-APIC id of the executing CPU.
    pub fn lapic_id() -> u32 {
        lapic_read(LAPIC_ID) >> 24
    }

    /// Signal end-of-interrupt.
    pub fn eoi() {
        lapic_write(LAPIC_EOI, 0);
    }

    /// Arm the oneshot preemption timer for the next tick.
    pub fn arm_timer() {
        lapic_write(LAPIC_TIMER_DIVIDE, 0b1011); // divide by 1
        lapic_write(LAPIC_LVT_TIMER, TIMER_VECTOR as u32); // oneshot
        lapic_write(LAPIC_TIMER_INIT, TIMER_INITIAL_COUNT);
    }

    fn send_ipi(lapic_id: u32, vector: u8) {
        while lapic_read(LAPIC_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
        lapic_write(LAPIC_ICR_HIGH, lapic_id << 24);
        lapic_write(LAPIC_ICR_LOW, vector as u32); // fixed delivery
    }

    /// Kick a halted CPU with the wake vector.
    pub fn send_wake_ipi(cpu: u32) {
        if (cpu as usize) < MAX_CPUS {
            send_ipi(LAPIC_IDS[cpu as usize].load(Ordering::Acquire), WAKE_VECTOR);
        }
    }

    /// Panic path: stop every other CPU. Destination shorthand
    /// all-excluding-self, fixed delivery.
    pub fn broadcast_halt() {
        lapic_write(LAPIC_ICR_LOW, (0b11 << 18) | super::HALT_VECTOR as u32);
    }

    // IO-APIC index/data access.
    fn ioapic_read(reg: u32) -> u32 {
        let base = phys_to_virt(PhysAddr::new(IOAPIC_PHYS)) as *mut u32;
        // SAFETY: IO-APIC MMIO through the direct map; the index register
        // sits at +0, the data window at +0x10.
        unsafe {
            base.write_volatile(reg);
            base.add(4).read_volatile()
        }
    }

    fn ioapic_write(reg: u32, value: u32) {
        let base = phys_to_virt(PhysAddr::new(IOAPIC_PHYS)) as *mut u32;
        // SAFETY: as in `ioapic_read`.
        unsafe {
            base.write_volatile(reg);
            base.add(4).write_volatile(value);
        }
    }

    /// Route an ISA IRQ to `vector` on the boot CPU, honoring firmware
    /// overrides for the GSI number, polarity, and trigger mode.
    pub fn route_isa_irq(handoff: &Handoff, isa_irq: u8, vector: u8) {
        let (gsi, active_low, level) = handoff
            .isa_overrides
            .iter()
            .flatten()
            .find(|o| o.isa_irq == isa_irq)
            .map(|o| (o.gsi, o.active_low, o.level_triggered))
            .unwrap_or((isa_irq as u32, false, false));

        let mut low = vector as u32;
        if active_low {
            low |= 1 << 13;
        }
        if level {
            low |= 1 << 15;
        }
        let bsp = LAPIC_IDS[0].load(Ordering::Acquire);

        let entry = 0x10 + gsi * 2;
        ioapic_write(entry + 1, bsp << 24);
        ioapic_write(entry, low);
        let _ = ioapic_read(entry);
    }
}

#[cfg(target_os = "none")]
pub use hw::{arm_timer, broadcast_halt, eoi, init_bsp, lapic_id, route_isa_irq, send_wake_ipi};
