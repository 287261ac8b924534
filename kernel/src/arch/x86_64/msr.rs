//! MSR accessors for the segment-base registers the context switch moves.

#[cfg(target_os = "none")]
mod hw {
    use x86_64::registers::model_specific::{FsBase, KernelGsBase};
    use x86_64::VirtAddr;

    pub fn read_fs_base() -> u64 {
        FsBase::read().as_u64()
    }

    pub fn write_fs_base(value: u64) {
        FsBase::write(VirtAddr::new(value));
    }

    /// The user-visible GS base lives in KERNEL_GS_BASE between `swapgs`
    /// pairs while the kernel runs.
    pub fn read_kernel_gs_base() -> u64 {
        KernelGsBase::read().as_u64()
    }

    pub fn write_kernel_gs_base(value: u64) {
        KernelGsBase::write(VirtAddr::new(value));
    }
}

#[cfg(target_os = "none")]
pub use hw::{read_fs_base, read_kernel_gs_base, write_fs_base, write_kernel_gs_base};
