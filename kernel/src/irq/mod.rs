//! IRQ routing: the vector registry.
//!
//! Vectors 0–31 belong to CPU exceptions, 32–47 to the classical IRQ
//! window, and everything from 48 up is free for drivers to claim via
//! [`allocate_vector`]. A registration maps a vector to a handler
//! function, an opaque data word, and a name for diagnostics. Dispatch
//! copies the registration out under the lock and invokes the handler
//! after releasing it, so handlers may re-enter the registry.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernelError, KernelResult};
use crate::sync::IrqMutex;

/// First vector of the classical IRQ window.
pub const IRQ_BASE: u8 = 32;

/// First driver-allocatable vector.
pub const FREE_VECTOR_BASE: u8 = 48;

/// An IRQ handler: receives the vector and the registration's data word.
pub type IrqHandler = fn(vector: u8, data: usize);

#[derive(Clone, Copy)]
struct Registration {
    handler: IrqHandler,
    data: usize,
    name: &'static str,
}

static TABLE: IrqMutex<[Option<Registration>; 256]> = IrqMutex::new([None; 256]);

/// Per-vector dispatch counters.
static DISPATCH_COUNTS: [AtomicU64; 256] = [const { AtomicU64::new(0) }; 256];

/// Register a handler for a vector.
pub fn register(vector: u8, handler: IrqHandler, data: usize, name: &'static str) -> KernelResult<()> {
    let mut table = TABLE.lock();
    let slot = &mut table[vector as usize];
    if slot.is_some() {
        return Err(KernelError::AlreadyExists {
            what: "irq vector",
            id: vector as u64,
        });
    }
    *slot = Some(Registration {
        handler,
        data,
        name,
    });
    Ok(())
}

/// Remove a vector's handler.
pub fn unregister(vector: u8) -> KernelResult<()> {
    let mut table = TABLE.lock();
    match table[vector as usize].take() {
        Some(_) => Ok(()),
        None => Err(KernelError::NotFound {
            what: "irq vector",
            id: vector as u64,
        }),
    }
}

/// Claim the lowest free vector at or above [`FREE_VECTOR_BASE`].
pub fn allocate_vector() -> Option<u8> {
    let table = TABLE.lock();
    (FREE_VECTOR_BASE..=255).find(|&v| table[v as usize].is_none())
}

/// Route a fired vector to its handler. Returns false for an unclaimed
/// vector (which the trap layer logs and EOIs).
pub fn dispatch(vector: u8) -> bool {
    DISPATCH_COUNTS[vector as usize].fetch_add(1, Ordering::Relaxed);
    let registration = { TABLE.lock()[vector as usize] };
    match registration {
        Some(r) => {
            (r.handler)(vector, r.data);
            true
        }
        None => false,
    }
}

/// Name registered for a vector, if any.
pub fn handler_name(vector: u8) -> Option<&'static str> {
    TABLE.lock()[vector as usize].map(|r| r.name)
}

/// Times a vector has fired.
pub fn dispatch_count(vector: u8) -> u64 {
    DISPATCH_COUNTS[vector as usize].load(Ordering::Relaxed)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static FIRED: AtomicUsize = AtomicUsize::new(0);

    fn test_handler(_vector: u8, data: usize) {
        FIRED.fetch_add(data, Ordering::SeqCst);
    }

    #[test]
    fn registered_handlers_receive_their_data() {
        let vector = 200;
        register(vector, test_handler, 5, "test-dev").unwrap();
        assert_eq!(handler_name(vector), Some("test-dev"));

        let before = FIRED.load(Ordering::SeqCst);
        assert!(dispatch(vector));
        assert!(dispatch(vector));
        assert_eq!(FIRED.load(Ordering::SeqCst), before + 10);
        assert!(dispatch_count(vector) >= 2);

        unregister(vector).unwrap();
        assert!(!dispatch(vector));
    }

    #[test]
    fn double_registration_is_refused() {
        let vector = 201;
        register(vector, test_handler, 0, "first").unwrap();
        assert!(matches!(
            register(vector, test_handler, 0, "second"),
            Err(KernelError::AlreadyExists { .. })
        ));
        unregister(vector).unwrap();
        assert!(matches!(
            unregister(vector),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn vector_allocation_starts_at_the_free_window() {
        let v = allocate_vector().unwrap();
        assert!(v >= FREE_VECTOR_BASE);
        register(v, test_handler, 0, "alloc").unwrap();
        let w = allocate_vector().unwrap();
        assert_ne!(v, w);
        unregister(v).unwrap();
    }
}
