//! Architecture support. x86-64 only.

pub mod x86_64;

pub use self::x86_64::context;

/// Halt the calling CPU forever.
pub fn halt_loop() -> ! {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        ::x86_64::instructions::hlt();
        #[cfg(not(target_os = "none"))]
        core::hint::spin_loop();
    }
}

/// Pause hint for spin loops.
#[inline]
pub fn cpu_relax() {
    core::hint::spin_loop();
}
