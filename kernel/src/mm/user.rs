//! User-pointer validation and copy helpers.
//!
//! Every syscall argument that names user memory goes through here: the
//! range is page-walked against the caller's address space (readable for
//! inputs, writable for outputs) before a single byte moves. A failing walk
//! is `EFAULT`; a length that overflows the user range is `EINVAL`.

use alloc::string::String;
use alloc::vec;

use super::page_table::PageFlags;
use super::{phys_to_virt, AddressSpace, PhysAddr, VirtAddr, FRAME_SIZE};
use crate::error::Errno;

/// Lowest user-mappable address; the first pages stay unmapped so null
/// dereferences fault.
pub const USER_SPACE_START: u64 = 0x40_0000;

/// One past the last user-mappable byte (bottom of the canonical hole,
/// rounded down to a page).
pub const USER_SPACE_END: u64 = 0x7FFF_FFFF_F000;

/// Longest C string a syscall will pull out of user memory.
pub const USER_STR_MAX: usize = 4096;

/// Validate that `[addr, addr + len)` lies in the user range and is mapped
/// user-accessible; `write` additionally demands writable leaves.
pub fn check_user_range(
    asp: &AddressSpace,
    addr: u64,
    len: usize,
    write: bool,
) -> Result<(), Errno> {
    if len == 0 {
        return Ok(());
    }
    let end = addr.checked_add(len as u64).ok_or(Errno::Einval)?;
    if addr < USER_SPACE_START || end > USER_SPACE_END {
        return Err(Errno::Einval);
    }

    let mut page = VirtAddr::new(addr).align_down();
    while page.as_u64() < end {
        let flags = asp.leaf_flags(page).ok_or(Errno::Efault)?;
        if !flags.contains(PageFlags::USER) {
            return Err(Errno::Efault);
        }
        if write && !flags.contains(PageFlags::WRITABLE) {
            return Err(Errno::Efault);
        }
        page = page.offset(FRAME_SIZE as u64);
    }
    Ok(())
}

/// Translate one user page and return the kernel-visible pointer for
/// `vaddr`; the caller bounds accesses to the page.
fn user_page_ptr(asp: &AddressSpace, vaddr: u64) -> Result<*mut u8, Errno> {
    let phys: PhysAddr = asp.translate(VirtAddr::new(vaddr)).ok_or(Errno::Efault)?;
    Ok(phys_to_virt(phys))
}

/// Copy `buf.len()` bytes out of user memory.
pub fn copy_from_user(asp: &AddressSpace, addr: u64, buf: &mut [u8]) -> Result<(), Errno> {
    check_user_range(asp, addr, buf.len(), false)?;
    let mut copied = 0usize;
    while copied < buf.len() {
        let src = addr + copied as u64;
        let in_page = FRAME_SIZE - (src as usize % FRAME_SIZE);
        let chunk = in_page.min(buf.len() - copied);
        let ptr = user_page_ptr(asp, src)?;
        // SAFETY: the range was validated as mapped; `chunk` stays inside
        // the translated page.
        unsafe { core::ptr::copy_nonoverlapping(ptr, buf[copied..].as_mut_ptr(), chunk) };
        copied += chunk;
    }
    Ok(())
}

/// Copy `buf.len()` bytes into user memory.
pub fn copy_to_user(asp: &AddressSpace, addr: u64, buf: &[u8]) -> Result<(), Errno> {
    check_user_range(asp, addr, buf.len(), true)?;
    let mut copied = 0usize;
    while copied < buf.len() {
        let dst = addr + copied as u64;
        let in_page = FRAME_SIZE - (dst as usize % FRAME_SIZE);
        let chunk = in_page.min(buf.len() - copied);
        let ptr = user_page_ptr(asp, dst)?;
        // SAFETY: the range was validated as mapped and writable; `chunk`
        // stays inside the translated page.
        unsafe { core::ptr::copy_nonoverlapping(buf[copied..].as_ptr(), ptr, chunk) };
        copied += chunk;
    }
    Ok(())
}

/// Read one plain-data value from user memory.
pub fn read_user<T: Copy>(asp: &AddressSpace, addr: u64) -> Result<T, Errno> {
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    // SAFETY: MaybeUninit storage of size_of::<T>() bytes; filled completely
    // before assume_init.
    let buf = unsafe {
        core::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, core::mem::size_of::<T>())
    };
    copy_from_user(asp, addr, buf)?;
    // SAFETY: every byte was written by copy_from_user and T is Copy
    // plain data.
    Ok(unsafe { value.assume_init() })
}

/// Write one plain-data value into user memory.
pub fn write_user<T: Copy>(asp: &AddressSpace, addr: u64, value: T) -> Result<(), Errno> {
    // SAFETY: borrowing the value's bytes; T is plain data.
    let buf = unsafe {
        core::slice::from_raw_parts(&value as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to_user(asp, addr, buf)
}

/// Pull a NUL-terminated string out of user memory (at most
/// [`USER_STR_MAX`] bytes).
pub fn read_user_cstr(asp: &AddressSpace, addr: u64) -> Result<String, Errno> {
    let mut bytes = vec![];
    let mut cursor = addr;
    'outer: while bytes.len() < USER_STR_MAX {
        let in_page = FRAME_SIZE - (cursor as usize % FRAME_SIZE);
        let chunk = in_page.min(USER_STR_MAX - bytes.len());
        let mut page_buf = vec![0u8; chunk];
        copy_from_user(asp, cursor, &mut page_buf)?;
        for &b in &page_buf {
            if b == 0 {
                break 'outer;
            }
            bytes.push(b);
        }
        cursor += chunk as u64;
        if bytes.len() >= USER_STR_MAX {
            return Err(Errno::Einval);
        }
    }
    String::from_utf8(bytes).map_err(|_| Errno::Einval)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::FRAME_ALLOCATOR;

    fn space_with_page(vaddr: u64, flags: PageFlags) -> AddressSpace {
        crate::mm::ensure_hosted_frame_pool();
        let asp = AddressSpace::new().unwrap();
        let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
        asp.map(VirtAddr::new(vaddr), frame, flags).unwrap();
        asp
    }

    #[test]
    fn copy_roundtrip_through_user_pages() {
        let _env = crate::test_env_lock();
        let base = 0x0000_1234_5000;
        let asp = space_with_page(base, PageFlags::user_data());

        copy_to_user(&asp, base + 16, b"helix").unwrap();
        let mut back = [0u8; 5];
        copy_from_user(&asp, base + 16, &mut back).unwrap();
        assert_eq!(&back, b"helix");
    }

    #[test]
    fn unmapped_range_faults() {
        let _env = crate::test_env_lock();
        crate::mm::ensure_hosted_frame_pool();
        let asp = AddressSpace::new().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&asp, 0x0000_2000_0000, &mut buf),
            Err(Errno::Efault)
        );
    }

    #[test]
    fn read_only_page_rejects_writes() {
        let _env = crate::test_env_lock();
        let base = 0x0000_4444_0000;
        let asp = space_with_page(
            base,
            PageFlags::PRESENT | PageFlags::USER | PageFlags::NO_EXECUTE,
        );
        let mut buf = [0u8; 4];
        assert!(copy_from_user(&asp, base, &mut buf).is_ok());
        assert_eq!(copy_to_user(&asp, base, &buf), Err(Errno::Efault));
    }

    #[test]
    fn kernel_range_is_invalid_not_faulting() {
        let _env = crate::test_env_lock();
        crate::mm::ensure_hosted_frame_pool();
        let asp = AddressSpace::new().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            copy_from_user(&asp, 0xFFFF_8000_0000_0000, &mut buf),
            Err(Errno::Einval)
        );
        // Length overflowing the user range is EINVAL too.
        assert_eq!(
            check_user_range(&asp, USER_SPACE_END - 4, 64, false),
            Err(Errno::Einval)
        );
    }

    #[test]
    fn cstr_reads_stop_at_nul_and_cross_pages() {
        let _env = crate::test_env_lock();
        let base = 0x0000_5555_0000;
        let asp = space_with_page(base, PageFlags::user_data());
        let frame = FRAME_ALLOCATOR.alloc(FRAME_SIZE).unwrap();
        asp.map(
            VirtAddr::new(base + FRAME_SIZE as u64),
            frame,
            PageFlags::user_data(),
        )
        .unwrap();

        // Place "dev/null\0" straddling the page boundary.
        let start = base + FRAME_SIZE as u64 - 4;
        copy_to_user(&asp, start, b"dev/null\0").unwrap();
        assert_eq!(read_user_cstr(&asp, start).unwrap(), "dev/null");
    }

    #[test]
    fn typed_reads_and_writes() {
        let _env = crate::test_env_lock();
        let base = 0x0000_6666_0000;
        let asp = space_with_page(base, PageFlags::user_data());
        write_user::<u32>(&asp, base + 8, 0xDEAD_BEEF).unwrap();
        assert_eq!(read_user::<u32>(&asp, base + 8).unwrap(), 0xDEAD_BEEF);
    }
}
