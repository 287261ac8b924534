//! Synchronization primitives.
//!
//! The kernel leans on `spin` for plain mutual exclusion. [`IrqMutex`] adds
//! the rule every interrupt-visible structure needs: the lock is only ever
//! held with local interrupts masked.

mod irq_mutex;

pub use irq_mutex::{IrqMutex, IrqMutexGuard};
