//! Anonymous virtual memory: `anon_allocate` / `anon_free`.
//!
//! Classical mmap/munmap restricted to anonymous private mappings. Fixed
//! requests honor the hint exactly; everything else searches upward from a
//! dedicated base kept away from ELF load addresses. Pages are backed one
//! frame at a time so `anon_free` can return them to the buddy
//! individually.

use crate::error::{Errno, SysResult};
use crate::mm::user::{USER_SPACE_END, USER_SPACE_START};
use crate::mm::{AddressSpace, PageFlags, VirtAddr, FRAME_ALLOCATOR, FRAME_SIZE};

const OP_ANON_ALLOCATE: u64 = 0;
const OP_ANON_FREE: u64 = 1;

// Protection flags (matching the conventional mmap values).
pub const PROT_READ: u64 = 0x1;
pub const PROT_WRITE: u64 = 0x2;
pub const PROT_EXEC: u64 = 0x4;

// Mapping flags.
pub const MAP_PRIVATE: u64 = 0x02;
pub const MAP_FIXED: u64 = 0x10;
pub const MAP_ANONYMOUS: u64 = 0x20;

/// Non-fixed requests search from here; clear of typical ELF segments and
/// debug-info windows.
pub const MMAP_BASE: u64 = 0x0000_1000_0000_0000;

/// `args`: op, then (hint, size, prot, flags) or (addr, size).
pub fn sys_vmem(args: &[u64; 6]) -> SysResult {
    match args[0] {
        OP_ANON_ALLOCATE => anon_allocate(args[1], args[2], args[3], args[4]),
        OP_ANON_FREE => anon_free(args[1], args[2]),
        _ => Err(Errno::Einval),
    }
}

fn prot_to_page_flags(prot: u64) -> PageFlags {
    let mut flags = PageFlags::PRESENT | PageFlags::USER;
    if prot & PROT_WRITE != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if prot & PROT_EXEC == 0 {
        flags |= PageFlags::NO_EXECUTE;
    }
    flags
}

/// Scan for `pages` unmapped pages, preferring the caller's hint.
fn find_free_range(space: &AddressSpace, pages: u64, hint: u64) -> Option<u64> {
    let bytes = pages * FRAME_SIZE as u64;

    if hint >= USER_SPACE_START
        && hint % FRAME_SIZE as u64 == 0
        && hint.checked_add(bytes).is_some_and(|end| end <= USER_SPACE_END)
    {
        let taken = (0..pages)
            .any(|i| space.is_mapped(VirtAddr::new(hint + i * FRAME_SIZE as u64)));
        if !taken {
            return Some(hint);
        }
    }

    let mut candidate = MMAP_BASE;
    'scan: while candidate + bytes <= USER_SPACE_END {
        for i in 0..pages {
            let probe = VirtAddr::new(candidate + i * FRAME_SIZE as u64);
            if space.is_mapped(probe) {
                // Skip past the collision and realign.
                candidate = probe.as_u64() + FRAME_SIZE as u64;
                continue 'scan;
            }
        }
        return Some(candidate);
    }
    None
}

fn anon_allocate(hint: u64, size: u64, prot: u64, flags: u64) -> SysResult {
    let task = super::current()?;
    let space = super::current_space(&task)?;

    if size == 0 {
        return Err(Errno::Einval);
    }
    if size > USER_SPACE_END - USER_SPACE_START {
        return Err(Errno::Enomem);
    }
    if flags & MAP_ANONYMOUS == 0 {
        // File-backed mappings belong to a VFS-integrated mmap.
        return Err(Errno::Enosys);
    }

    let size = crate::mm::align_up(size as usize, FRAME_SIZE) as u64;
    let pages = size / FRAME_SIZE as u64;

    let vaddr = if flags & MAP_FIXED != 0 && hint != 0 {
        let end = hint.checked_add(size).ok_or(Errno::Einval)?;
        if hint < USER_SPACE_START || end > USER_SPACE_END {
            return Err(Errno::Einval);
        }
        if hint % FRAME_SIZE as u64 != 0 {
            return Err(Errno::Einval);
        }
        hint
    } else {
        find_free_range(space, pages, hint).ok_or(Errno::Enomem)?
    };

    let page_flags = prot_to_page_flags(prot);
    for i in 0..pages {
        let va = VirtAddr::new(vaddr + i * FRAME_SIZE as u64);
        if space.is_mapped(va) {
            // MAP_FIXED over an existing page: replace it.
            space.unmap(va).map_err(Errno::from)?;
        }
        let Some(frame) = FRAME_ALLOCATOR.alloc(FRAME_SIZE) else {
            // Roll back what this call mapped so OOM is not a leak.
            for j in 0..i {
                let _ = space.unmap(VirtAddr::new(vaddr + j * FRAME_SIZE as u64));
            }
            return Err(Errno::Enomem);
        };
        if let Err(e) = space.map(va, frame, page_flags) {
            FRAME_ALLOCATOR.free(frame);
            for j in 0..i {
                let _ = space.unmap(VirtAddr::new(vaddr + j * FRAME_SIZE as u64));
            }
            return Err(e.into());
        }
    }
    Ok(vaddr)
}

fn anon_free(addr: u64, size: u64) -> SysResult {
    let task = super::current()?;
    let space = super::current_space(&task)?;

    if addr == 0 || size == 0 {
        return Err(Errno::Einval);
    }
    if addr < USER_SPACE_START || addr >= USER_SPACE_END {
        return Err(Errno::Einval);
    }
    if addr % FRAME_SIZE as u64 != 0 {
        return Err(Errno::Einval);
    }
    let size = crate::mm::align_up(size as usize, FRAME_SIZE) as u64;
    let end = addr.checked_add(size).ok_or(Errno::Einval)?;
    if end > USER_SPACE_END {
        return Err(Errno::Einval);
    }

    let mut va = addr;
    while va < end {
        let page = VirtAddr::new(va);
        if space.is_mapped(page) {
            // Unmapping returns the frame to the allocator.
            space.unmap(page).map_err(Errno::from)?;
        }
        va += FRAME_SIZE as u64;
    }
    Ok(0)
}
