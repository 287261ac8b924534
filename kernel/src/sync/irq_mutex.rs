//! Interrupt-safe spinlock.
//!
//! A `spin::Mutex` wrapper that masks local interrupts for as long as the
//! guard lives. Structures touched from both task and IRQ context (scheduler
//! queues, wait lists, the IRQ registry) must use this instead of a bare
//! `spin::Mutex`: taking a plain spinlock in task context and then fielding
//! an interrupt that takes the same lock deadlocks the CPU.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

/// Spinlock whose guard keeps local interrupts masked.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Mask interrupts, then spin for the lock.
    ///
    /// Interrupt state is restored (not unconditionally re-enabled) when the
    /// guard drops, so nested acquisitions behave.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let was_enabled = interrupts_enabled();
        disable_interrupts();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            reenable: was_enabled,
        }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let was_enabled = interrupts_enabled();
        disable_interrupts();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqMutexGuard {
                guard: Some(guard),
                reenable: was_enabled,
            }),
            None => {
                if was_enabled {
                    enable_interrupts();
                }
                None
            }
        }
    }
}

/// Guard for [`IrqMutex`]; releases the lock and restores the interrupt flag.
pub struct IrqMutexGuard<'a, T> {
    guard: Option<MutexGuard<'a, T>>,
    reenable: bool,
}

impl<T> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the spinlock before unmasking.
        self.guard.take();
        if self.reenable {
            enable_interrupts();
        }
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn interrupts_enabled() -> bool {
    x86_64::instructions::interrupts::are_enabled()
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn disable_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn enable_interrupts() {
    x86_64::instructions::interrupts::enable();
}

// Hosted builds have no interrupt flag; the wrapper degenerates to a plain
// spinlock so the policy code under test is unchanged.
#[cfg(not(target_os = "none"))]
fn interrupts_enabled() -> bool {
    false
}

#[cfg(not(target_os = "none"))]
fn disable_interrupts() {}

#[cfg(not(target_os = "none"))]
fn enable_interrupts() {}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_provides_exclusive_access() {
        let m = IrqMutex::new(0u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = IrqMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }
}
