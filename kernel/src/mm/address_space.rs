//! Address spaces: 4-level page-table trees and fault servicing.
//!
//! Every task owns exactly one [`AddressSpace`]. The kernel upper half
//! (entries 256..512 of the top-level table) is copied by reference from the
//! kernel root into every new space, so kernel code and data survive a
//! page-table switch. Dropping a space tears down the user half only.

use bitflags::bitflags;
use spin::{Mutex, Once};

use super::page_table::{table_index, PageFlags, PageTable, PageTableEntry, ENTRIES_PER_TABLE};
use super::{phys_to_virt, PhysAddr, VirtAddr, FRAME_ALLOCATOR, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

/// Top-level index where the kernel half begins.
const KERNEL_HALF_FIRST_INDEX: usize = ENTRIES_PER_TABLE / 2;

/// Root table of the kernel's own address space, set once during boot (or
/// by the first hosted test that needs one).
static KERNEL_ROOT: Once<PhysAddr> = Once::new();

/// Handle over the kernel root, for faults taken with no current task.
static KERNEL_SPACE: Once<AddressSpace> = Once::new();

/// The kernel's own address space, once [`AddressSpace::init_kernel_root`]
/// has run.
pub fn kernel_space() -> Option<&'static AddressSpace> {
    KERNEL_SPACE.get()
}

bitflags! {
    /// Hardware page-fault error-code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u64 {
        /// Set when the fault hit a present page: a protection violation
        /// rather than a missing mapping.
        const PROTECTION = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const RESERVED_BIT = 1 << 3;
        const INSTRUCTION_FETCH = 1 << 4;
    }
}

/// What the fault handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A fresh zeroed frame was installed; retry the access.
    Mapped,
    /// Policy violation; the trap layer kills the task or panics.
    Fatal,
}

/// Handle standing for one 4-level page-table tree.
pub struct AddressSpace {
    root: PhysAddr,
    /// All mutation of this tree happens under here; lock-free readers may
    /// race a concurrent walk and retry on failure.
    mutation: Mutex<()>,
}

// SAFETY: the tree is only mutated under `mutation` and table frames are
// private to this space (kernel-half tables are shared but never freed or
// restructured after boot).
unsafe impl Send for AddressSpace {}
// SAFETY: see Send rationale.
unsafe impl Sync for AddressSpace {}

fn table_at(addr: PhysAddr) -> *mut PageTable {
    phys_to_virt(addr) as *mut PageTable
}

impl AddressSpace {
    /// Allocate a fresh space, pre-populating the kernel upper half from the
    /// kernel root when one exists.
    pub fn new() -> KernelResult<Self> {
        let root = FRAME_ALLOCATOR
            .alloc(FRAME_SIZE)
            .ok_or(KernelError::OutOfMemory)?;

        if let Some(&kernel_root) = KERNEL_ROOT.get() {
            // SAFETY: both roots are live table frames; entries 256.. of the
            // kernel root are stable after boot, so copying the raw entries
            // shares the deeper kernel tables by reference.
            unsafe {
                let src = &(*table_at(kernel_root)).entries;
                let dst = &mut (*table_at(root)).entries;
                dst[KERNEL_HALF_FIRST_INDEX..].copy_from_slice(&src[KERNEL_HALF_FIRST_INDEX..]);
            }
        }

        Ok(Self {
            root,
            mutation: Mutex::new(()),
        })
    }

    /// Build the kernel's own root space and register it as the template for
    /// every later [`AddressSpace::new`]. Returns the existing root if boot
    /// already created one.
    pub fn init_kernel_root() -> KernelResult<PhysAddr> {
        if let Some(&root) = KERNEL_ROOT.get() {
            return Ok(root);
        }
        let root = FRAME_ALLOCATOR
            .alloc(FRAME_SIZE)
            .ok_or(KernelError::OutOfMemory)?;
        KERNEL_ROOT.call_once(|| root);
        let root = *KERNEL_ROOT.get().unwrap();
        // SAFETY: the kernel root frame lives forever; the Drop guard skips
        // it.
        KERNEL_SPACE.call_once(|| unsafe { AddressSpace::from_root(root) });
        Ok(root)
    }

    /// The physical address of the top-level table (CR3 payload).
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// Wrap an existing root frame (the kernel root during boot).
    ///
    /// # Safety
    ///
    /// `root` must be a live top-level table frame not owned by another
    /// `AddressSpace`; the returned handle must not be dropped while the
    /// hardware can still load it.
    pub unsafe fn from_root(root: PhysAddr) -> Self {
        Self {
            root,
            mutation: Mutex::new(()),
        }
    }

    /// Walk down to the leaf table for `vaddr`, allocating intermediate
    /// tables on demand and widening existing intermediate entries so they
    /// stay at least as permissive as the new leaf.
    fn leaf_table_for(&self, vaddr: VirtAddr, flags: PageFlags) -> KernelResult<*mut PageTable> {
        let mut table = table_at(self.root);
        for level in (2..=4).rev() {
            let idx = table_index(vaddr, level);
            // SAFETY: `table` points at a live table frame; idx < 512.
            let entry = unsafe { &mut (*table).entries[idx] };
            if entry.is_present() {
                // Intermediate levels are permissive, leaves restrictive:
                // propagate WRITABLE/USER upward when a new leaf needs them.
                let mut widened = entry.flags();
                if flags.contains(PageFlags::WRITABLE) {
                    widened |= PageFlags::WRITABLE;
                }
                if flags.contains(PageFlags::USER) {
                    widened |= PageFlags::USER;
                }
                if widened != entry.flags() {
                    entry.set_flags(widened);
                }
                table = table_at(entry.addr());
            } else {
                let fresh = FRAME_ALLOCATOR
                    .alloc(FRAME_SIZE)
                    .ok_or(KernelError::OutOfMemory)?;
                let mut inter = PageFlags::PRESENT | PageFlags::WRITABLE;
                if flags.contains(PageFlags::USER) {
                    inter |= PageFlags::USER;
                }
                *entry = PageTableEntry::new(fresh, inter);
                table = table_at(fresh);
            }
        }
        Ok(table)
    }

    /// Install a 4 KiB leaf mapping.
    pub fn map(&self, vaddr: VirtAddr, paddr: PhysAddr, flags: PageFlags) -> KernelResult<()> {
        if !vaddr.is_page_aligned() {
            return Err(KernelError::Misaligned {
                addr: vaddr.as_u64(),
            });
        }
        if vaddr.is_kernel_half() && flags.contains(PageFlags::USER) {
            return Err(KernelError::ForbiddenRange {
                addr: vaddr.as_u64(),
            });
        }

        let _guard = self.mutation.lock();
        let leaf = self.leaf_table_for(vaddr, flags)?;
        let idx = table_index(vaddr, 1);
        // SAFETY: `leaf` is a live leaf table for this space; idx < 512.
        unsafe {
            (*leaf).entries[idx] = PageTableEntry::new(paddr, flags | PageFlags::PRESENT);
        }
        flush_tlb(vaddr);
        Ok(())
    }

    /// Map the physical range `[start, end)` at `virt = phys + offset`.
    pub fn map_range(
        &self,
        start: PhysAddr,
        end: PhysAddr,
        flags: PageFlags,
        offset: u64,
    ) -> KernelResult<()> {
        if !start.is_frame_aligned() || !end.is_frame_aligned() || start >= end {
            return Err(KernelError::Misaligned {
                addr: start.as_u64(),
            });
        }
        let mut phys = start;
        while phys < end {
            self.map(VirtAddr::new(phys.as_u64() + offset), phys, flags)?;
            phys = phys.offset(FRAME_SIZE as u64);
        }
        Ok(())
    }

    /// Clear the leaf for `vaddr` and return the mapped frame to the frame
    /// allocator.
    pub fn unmap(&self, vaddr: VirtAddr) -> KernelResult<()> {
        let _guard = self.mutation.lock();

        let mut table = table_at(self.root);
        for level in (2..=4).rev() {
            let idx = table_index(vaddr, level);
            // SAFETY: live table frame, idx < 512.
            let entry = unsafe { (*table).entries[idx] };
            if !entry.is_present() {
                return Err(KernelError::Unmapped {
                    addr: vaddr.as_u64(),
                });
            }
            table = table_at(entry.addr());
        }

        let idx = table_index(vaddr, 1);
        // SAFETY: live leaf table, idx < 512.
        let leaf = unsafe { &mut (*table).entries[idx] };
        if !leaf.is_present() {
            return Err(KernelError::Unmapped {
                addr: vaddr.as_u64(),
            });
        }
        let frame = leaf.addr();
        leaf.clear();
        flush_tlb(vaddr);
        FRAME_ALLOCATOR.free(frame);
        Ok(())
    }

    /// Walk without mutation; returns the physical address `vaddr` resolves
    /// to, including the page offset.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let mut table = table_at(self.root);
        for level in (2..=4).rev() {
            let idx = table_index(vaddr, level);
            // SAFETY: live table frame, idx < 512.
            let entry = unsafe { (*table).entries[idx] };
            if !entry.is_present() {
                return None;
            }
            table = table_at(entry.addr());
        }
        let idx = table_index(vaddr, 1);
        // SAFETY: live leaf table, idx < 512.
        let entry = unsafe { (*table).entries[idx] };
        if !entry.is_present() {
            return None;
        }
        Some(entry.addr().offset(vaddr.page_offset()))
    }

    /// True when a leaf mapping exists for the page containing `vaddr`.
    pub fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        self.translate(vaddr.align_down()).is_some()
    }

    /// Leaf flags for the page containing `vaddr`, if mapped.
    pub fn leaf_flags(&self, vaddr: VirtAddr) -> Option<PageFlags> {
        let mut table = table_at(self.root);
        for level in (2..=4).rev() {
            let idx = table_index(vaddr, level);
            // SAFETY: live table frame, idx < 512.
            let entry = unsafe { (*table).entries[idx] };
            if !entry.is_present() {
                return None;
            }
            table = table_at(entry.addr());
        }
        // SAFETY: live leaf table, idx < 512.
        let entry = unsafe { (*table).entries[table_index(vaddr, 1)] };
        entry.is_present().then(|| entry.flags())
    }

    /// Service a page fault against this space.
    ///
    /// Protection violations (fault on a present page) are never repaired:
    /// in kernel mode they are fatal outright, in user mode they kill the
    /// task. A miss on a non-present page is a legitimate demand mapping and
    /// gets a fresh zeroed frame with the protection the error bits imply.
    pub fn handle_fault(&self, addr: VirtAddr, code: FaultCode) -> FaultOutcome {
        if code.contains(FaultCode::RESERVED_BIT) {
            return FaultOutcome::Fatal;
        }
        if code.contains(FaultCode::PROTECTION) {
            return FaultOutcome::Fatal;
        }
        // User-mode touches of the kernel half never demand-map.
        if code.contains(FaultCode::USER) && addr.is_kernel_half() {
            return FaultOutcome::Fatal;
        }

        let Some(frame) = FRAME_ALLOCATOR.alloc(FRAME_SIZE) else {
            return FaultOutcome::Fatal;
        };

        let mut flags = PageFlags::PRESENT;
        if code.contains(FaultCode::WRITE) {
            flags |= PageFlags::WRITABLE;
        }
        if code.contains(FaultCode::USER) {
            flags |= PageFlags::USER;
        }
        if !code.contains(FaultCode::INSTRUCTION_FETCH) {
            flags |= PageFlags::NO_EXECUTE;
        }

        match self.map(addr.align_down(), frame, flags) {
            Ok(()) => FaultOutcome::Mapped,
            Err(_) => {
                FRAME_ALLOCATOR.free(frame);
                FaultOutcome::Fatal
            }
        }
    }

    /// Free every user-half table and leaf frame. Kernel-half entries are
    /// shared with the kernel root and left alone.
    fn release_user_half(&self) {
        let root = table_at(self.root);
        for i in 0..KERNEL_HALF_FIRST_INDEX {
            // SAFETY: live root table; i < 256.
            let l4 = unsafe { (*root).entries[i] };
            if !l4.is_present() {
                continue;
            }
            let l3t = table_at(l4.addr());
            for j in 0..ENTRIES_PER_TABLE {
                // SAFETY: live level-3 table owned by this space.
                let l3 = unsafe { (*l3t).entries[j] };
                if !l3.is_present() {
                    continue;
                }
                let l2t = table_at(l3.addr());
                for k in 0..ENTRIES_PER_TABLE {
                    // SAFETY: live level-2 table owned by this space.
                    let l2 = unsafe { (*l2t).entries[k] };
                    if !l2.is_present() {
                        continue;
                    }
                    let l1t = table_at(l2.addr());
                    for m in 0..ENTRIES_PER_TABLE {
                        // SAFETY: live leaf table owned by this space.
                        let l1 = unsafe { (*l1t).entries[m] };
                        if l1.is_present() {
                            FRAME_ALLOCATOR.free(l1.addr());
                        }
                    }
                    FRAME_ALLOCATOR.free(l2.addr());
                }
                FRAME_ALLOCATOR.free(l3.addr());
            }
            FRAME_ALLOCATOR.free(l4.addr());
        }
    }

    /// Load this space's root into CR3.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn activate(&self) {
        use x86_64::registers::control::{Cr3, Cr3Flags};
        use x86_64::structures::paging::PhysFrame;
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(self.root.as_u64()));
        // SAFETY: the root is a valid top-level table whose kernel half maps
        // the currently executing kernel.
        unsafe { Cr3::write(frame, Cr3Flags::empty()) };
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if Some(&self.root) == KERNEL_ROOT.get() {
            // The kernel root is process-wide; never torn down.
            return;
        }
        self.release_user_half();
        FRAME_ALLOCATOR.free(self.root);
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn flush_tlb(vaddr: VirtAddr) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr.as_u64()));
}

#[cfg(not(target_os = "none"))]
fn flush_tlb(_vaddr: VirtAddr) {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn space() -> AddressSpace {
        super::super::ensure_hosted_frame_pool();
        AddressSpace::new().expect("address space")
    }

    #[test]
    fn map_translate_unmap_roundtrip() {
        let _env = crate::test_env_lock();
        let asp = space();
        let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
        let v = VirtAddr::new(0x0000_4000_0000);

        asp.map(v, frame, PageFlags::user_data()).unwrap();
        assert_eq!(asp.translate(v), Some(frame));
        assert_eq!(
            asp.translate(v.offset(0x123)),
            Some(frame.offset(0x123))
        );

        let free_before = FRAME_ALLOCATOR.free_frame_count();
        asp.unmap(v).unwrap();
        assert_eq!(asp.translate(v), None);
        // The leaf frame went back to the allocator.
        assert_eq!(FRAME_ALLOCATOR.free_frame_count(), free_before + 1);
    }

    #[test]
    fn unaligned_map_is_rejected() {
        let _env = crate::test_env_lock();
        let asp = space();
        let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
        let err = asp
            .map(VirtAddr::new(0x4000_0123), frame, PageFlags::user_data())
            .unwrap_err();
        assert!(matches!(err, KernelError::Misaligned { .. }));
        FRAME_ALLOCATOR.free(frame);
    }

    #[test]
    fn user_mapping_in_kernel_half_is_rejected() {
        let _env = crate::test_env_lock();
        let asp = space();
        let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
        let err = asp
            .map(
                VirtAddr::new(0xFFFF_8000_0000_0000),
                frame,
                PageFlags::user_data(),
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::ForbiddenRange { .. }));
        FRAME_ALLOCATOR.free(frame);
    }

    #[test]
    fn intermediate_entries_widen_for_new_leaves() {
        let _env = crate::test_env_lock();
        let asp = space();
        let ro = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
        let rw = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();

        // First a read-only kernel-style leaf: intermediates come up without
        // USER.
        let v1 = VirtAddr::new(0x0000_5000_0000);
        asp.map(v1, ro, PageFlags::PRESENT | PageFlags::NO_EXECUTE)
            .unwrap();

        // A user-writable leaf in the same subtree must widen the shared
        // intermediate path.
        let v2 = VirtAddr::new(0x0000_5000_1000);
        asp.map(v2, rw, PageFlags::user_data()).unwrap();

        let root = table_at(asp.root_phys());
        // SAFETY: test-owned live table.
        let l4 = unsafe { (*root).entries[table_index(v2, 4)] };
        assert!(l4.flags().contains(PageFlags::WRITABLE | PageFlags::USER));
        // The read-only leaf itself stays restrictive.
        assert!(!asp.leaf_flags(v1).unwrap().contains(PageFlags::WRITABLE));
    }

    #[test]
    fn new_space_shares_the_kernel_upper_half() {
        let _env = crate::test_env_lock();
        super::super::ensure_hosted_frame_pool();
        let kernel_root = AddressSpace::init_kernel_root().unwrap();

        // Plant a kernel-half entry in the kernel root.
        // SAFETY: test-owned live kernel root table.
        unsafe {
            (*table_at(kernel_root)).entries[300] =
                PageTableEntry::new(PhysAddr::new(0xCAFE_0000), PageFlags::kernel_data());
        }

        let asp = AddressSpace::new().unwrap();
        // SAFETY: freshly created root for this space.
        let copied = unsafe { (*table_at(asp.root_phys())).entries[300] };
        assert_eq!(copied.addr().as_u64(), 0xCAFE_0000);
    }

    #[test]
    fn demand_fault_maps_a_zeroed_frame() {
        let _env = crate::test_env_lock();
        let asp = space();
        let v = VirtAddr::new(0x0000_6000_0000);
        let outcome = asp.handle_fault(
            v.offset(0x80),
            FaultCode::USER | FaultCode::WRITE,
        );
        assert_eq!(outcome, FaultOutcome::Mapped);
        let flags = asp.leaf_flags(v).unwrap();
        assert!(flags.contains(PageFlags::USER | PageFlags::WRITABLE));
        let frame = asp.translate(v).unwrap();
        // SAFETY: frame is hosted-arena memory just mapped for this test.
        let bytes = unsafe { core::slice::from_raw_parts(frame.as_u64() as *const u8, FRAME_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn protection_violation_is_fatal() {
        let _env = crate::test_env_lock();
        let asp = space();
        let outcome = asp.handle_fault(
            VirtAddr::new(0x0000_7000_0000),
            FaultCode::PROTECTION | FaultCode::WRITE,
        );
        assert_eq!(outcome, FaultOutcome::Fatal);

        // User touch of the kernel half is fatal even when non-present.
        let outcome = asp.handle_fault(
            VirtAddr::new(0xFFFF_9000_0000_0000),
            FaultCode::USER,
        );
        assert_eq!(outcome, FaultOutcome::Fatal);
    }
}
