//! Memory management.
//!
//! Three layers, bottom up:
//! - [`frame_allocator`]: physical page runs from boot-discovered zones
//! - [`address_space`]: 4-level page tables and fault servicing
//! - [`heap`]: the slab/large-pool kernel heap
//!
//! All physical memory is reachable through the higher-half direct map
//! (HHDM) the bootloader sets up; [`phys_to_virt`] is the only way kernel
//! code turns a physical address into a pointer.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod user;

use core::sync::atomic::{AtomicU64, Ordering};

pub use address_space::AddressSpace;
pub use frame_allocator::{FrameAllocator, FRAME_ALLOCATOR};
pub use page_table::PageFlags;

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// First virtual address of the shared kernel upper half.
pub const KERNEL_SPACE_START: u64 = 0xFFFF_8000_0000_0000;

/// Physical memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn is_frame_aligned(self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn is_kernel_half(self) -> bool {
        self.0 >= KERNEL_SPACE_START
    }

    pub const fn page_offset(self) -> u64 {
        self.0 & (FRAME_SIZE as u64 - 1)
    }

    pub const fn align_down(self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u64 - 1))
    }

    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Offset of the higher-half direct map.
///
/// Zero until boot hands it over; hosted tests leave it at zero, where a
/// "physical" address is simply a host pointer.
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset from the boot handoff. Called once.
pub fn set_hhdm_offset(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Translate a physical address into a kernel-visible pointer via the HHDM.
pub fn phys_to_virt(addr: PhysAddr) -> *mut u8 {
    (addr.as_u64() + hhdm_offset()) as *mut u8
}

/// Inverse of [`phys_to_virt`] for pointers known to lie in the direct map.
pub fn virt_to_phys_hhdm(ptr: *const u8) -> PhysAddr {
    PhysAddr::new(ptr as u64 - hhdm_offset())
}

/// Bring up physical and virtual memory from the boot handoff: register
/// every usable region as an allocator zone, switch the global allocator
/// onto the slab heap, then build the kernel's own address space (direct
/// map + kernel image) and load it.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init(
    handoff: &crate::boot::Handoff,
    kernel_phys: PhysAddr,
    kernel_len: u64,
    kernel_virt: u64,
) -> crate::error::KernelResult<()> {
    use crate::boot::RegionKind;

    set_hhdm_offset(handoff.hhdm_offset);

    for region in handoff.usable_regions() {
        let base = align_up(region.base as usize, FRAME_SIZE);
        let end = align_down((region.base + region.length) as usize, FRAME_SIZE);
        if end > base {
            // SAFETY: the boot memory map marks the region usable and the
            // direct map covers it; each region is registered once.
            unsafe { FRAME_ALLOCATOR.add_zone(PhysAddr::new(base as u64), end - base) };
        }
    }
    heap::switch_to_slab();

    AddressSpace::init_kernel_root()?;
    let kspace = address_space::kernel_space()
        .ok_or(crate::error::KernelError::NotInitialized { subsystem: "mm" })?;

    // Direct-map every region the kernel may touch. Usable and
    // bootloader memory is writable data; everything else is mapped
    // read-only so stray writes fault.
    for region in handoff.regions.iter().flatten() {
        let start = PhysAddr::new(align_down(region.base as usize, FRAME_SIZE) as u64);
        let end = PhysAddr::new(align_up((region.base + region.length) as usize, FRAME_SIZE) as u64);
        if start >= end {
            continue;
        }
        let flags = match region.kind {
            RegionKind::Usable
            | RegionKind::BootloaderReclaimable
            | RegionKind::Framebuffer
            | RegionKind::KernelAndModules => PageFlags::kernel_data(),
            RegionKind::Reserved | RegionKind::Firmware => {
                PageFlags::PRESENT | PageFlags::NO_EXECUTE
            }
        };
        kspace.map_range(start, end, flags, hhdm_offset())?;
    }

    // MMIO windows the core itself touches (IO-APIC, local APIC) sit
    // outside the boot memory map.
    for mmio in [0xFEC0_0000u64, 0xFEE0_0000u64] {
        kspace.map(
            VirtAddr::new(mmio + handoff.hhdm_offset),
            PhysAddr::new(mmio),
            PageFlags::PRESENT
                | PageFlags::WRITABLE
                | PageFlags::NO_CACHE
                | PageFlags::NO_EXECUTE,
        )?;
    }

    // The kernel image at its runtime virtual base, executable.
    let image_start = PhysAddr::new(align_down(kernel_phys.as_u64() as usize, FRAME_SIZE) as u64);
    let image_end = PhysAddr::new(align_up(
        (kernel_phys.as_u64() + kernel_len) as usize,
        FRAME_SIZE,
    ) as u64);
    kspace.map_range(
        image_start,
        image_end,
        PageFlags::PRESENT | PageFlags::WRITABLE,
        kernel_virt - kernel_phys.as_u64(),
    )?;

    kspace.activate();
    Ok(())
}

/// Hosted-test physical memory pool.
///
/// Leaks a block of host memory once and registers it with the global frame
/// allocator; the HHDM offset stays zero so physical addresses are host
/// pointers. Every test that allocates frames funnels through this.
#[cfg(all(test, not(target_os = "none")))]
pub(crate) fn ensure_hosted_frame_pool() {
    use alloc::vec;

    static POOL: spin::Once<()> = spin::Once::new();
    POOL.call_once(|| {
        const POOL_BYTES: usize = 64 * 1024 * 1024;
        let backing = vec![0u8; POOL_BYTES + FRAME_SIZE].leak();
        let base = align_up(backing.as_mut_ptr() as usize, FRAME_SIZE);
        // SAFETY: the leaked allocation outlives the process and nothing else
        // touches it; base/len lie fully inside it and are frame-aligned.
        unsafe {
            FRAME_ALLOCATOR.add_zone(PhysAddr::new(base as u64), POOL_BYTES);
        }
    });
}
