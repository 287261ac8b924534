//! Boot handoff.
//!
//! The kernel copies what it needs out of the bootloader's structures
//! exactly once; nothing else ever touches bootloader memory again. The
//! digest carries the memory map, the higher-half direct-map offset, the
//! firmware root pointer, the SMP roster, and boot modules. Firmware-table
//! walking (ACPI/MADT) lives outside the core and feeds [`SmpInfo`] and
//! the ISA overrides in.

/// Memory-map region classes the kernel distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Usable,
    Reserved,
    Firmware,
    BootloaderReclaimable,
    Framebuffer,
    KernelAndModules,
}

/// One physical region from the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub base: u64,
    pub length: u64,
    pub kind: RegionKind,
}

/// A module the bootloader loaded for us (name + raw bytes).
#[derive(Debug, Clone, Copy)]
pub struct BootModule {
    pub name: &'static str,
    pub data: &'static [u8],
}

/// One CPU from the SMP roster.
#[derive(Debug, Clone, Copy)]
pub struct SmpCpu {
    pub cpu_id: u32,
    pub lapic_id: u32,
}

/// An ISA interrupt override from the firmware tables: source IRQ
/// rerouted to a global system interrupt with explicit polarity/trigger.
#[derive(Debug, Clone, Copy)]
pub struct IsaOverride {
    pub isa_irq: u8,
    pub gsi: u32,
    pub active_low: bool,
    pub level_triggered: bool,
}

pub const MAX_REGIONS: usize = 64;
pub const MAX_MODULES: usize = 8;
pub const MAX_OVERRIDES: usize = 16;

/// Everything the core keeps from boot.
pub struct Handoff {
    pub hhdm_offset: u64,
    pub rsdp_addr: Option<u64>,
    pub regions: [Option<MemRegion>; MAX_REGIONS],
    pub modules: [Option<BootModule>; MAX_MODULES],
    pub cpus: [Option<SmpCpu>; crate::sched::smp::MAX_CPUS],
    pub isa_overrides: [Option<IsaOverride>; MAX_OVERRIDES],
}

impl Handoff {
    pub const fn empty() -> Self {
        Self {
            hhdm_offset: 0,
            rsdp_addr: None,
            regions: [None; MAX_REGIONS],
            modules: [None; MAX_MODULES],
            cpus: [None; crate::sched::smp::MAX_CPUS],
            isa_overrides: [None; MAX_OVERRIDES],
        }
    }

    pub fn usable_regions(&self) -> impl Iterator<Item = MemRegion> + '_ {
        self.regions
            .iter()
            .flatten()
            .copied()
            .filter(|r| r.kind == RegionKind::Usable)
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpus.iter().flatten().count().max(1) as u32
    }
}

/// Digest a bootloader_api handoff. Only the boot path calls this.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn digest(info: &'static mut bootloader_api::BootInfo) -> Handoff {
    use bootloader_api::info::MemoryRegionKind;

    let mut handoff = Handoff::empty();
    handoff.hhdm_offset = info
        .physical_memory_offset
        .into_option()
        .unwrap_or_default();
    handoff.rsdp_addr = info.rsdp_addr.into_option();

    for (slot, region) in handoff.regions.iter_mut().zip(info.memory_regions.iter()) {
        let kind = match region.kind {
            MemoryRegionKind::Usable => RegionKind::Usable,
            MemoryRegionKind::Bootloader => RegionKind::BootloaderReclaimable,
            MemoryRegionKind::UnknownBios(_) | MemoryRegionKind::UnknownUefi(_) => {
                RegionKind::Firmware
            }
            _ => RegionKind::Reserved,
        };
        *slot = Some(MemRegion {
            base: region.start,
            length: region.end - region.start,
            kind,
        });
    }

    if let Some(ramdisk) = info.ramdisk_addr.into_option() {
        let len = info.ramdisk_len as usize;
        // SAFETY: the bootloader mapped the ramdisk at this address for the
        // kernel's lifetime.
        let data = unsafe { core::slice::from_raw_parts(ramdisk as *const u8, len) };
        handoff.modules[0] = Some(BootModule {
            name: "initramfs",
            data,
        });
    }

    // Single CPU until the firmware walker reports the roster.
    handoff.cpus[0] = Some(SmpCpu {
        cpu_id: 0,
        lapic_id: 0,
    });

    handoff
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn usable_region_filter_and_cpu_count() {
        let mut h = Handoff::empty();
        h.regions[0] = Some(MemRegion {
            base: 0x10_0000,
            length: 0x40_0000,
            kind: RegionKind::Usable,
        });
        h.regions[1] = Some(MemRegion {
            base: 0x50_0000,
            length: 0x1000,
            kind: RegionKind::Reserved,
        });
        assert_eq!(h.usable_regions().count(), 1);
        // An empty roster still means one boot CPU.
        assert_eq!(h.cpu_count(), 1);
        h.cpus[0] = Some(SmpCpu {
            cpu_id: 0,
            lapic_id: 0,
        });
        h.cpus[1] = Some(SmpCpu {
            cpu_id: 1,
            lapic_id: 2,
        });
        assert_eq!(h.cpu_count(), 2);
    }
}
