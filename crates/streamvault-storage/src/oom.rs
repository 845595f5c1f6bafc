//! Out-Of-Memory Hook Registry
//!
//! The only process-wide state in the storage layer: a registry of handlers
//! the allocator side calls when buffer memory runs out. The storage service
//! registers a handler that evicts committed log cache blocks.
//!
//! Registration hands back an [`OomHandlerId`] so each owner tears down
//! exactly its own handler; several storage services in one process never
//! touch each other's registrations. The explicit register/unregister pair
//! replaces module-init, so tests and embedders control the lifetime.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Frees memory under allocation pressure; returns the bytes released.
pub trait OomHandler: Send + Sync {
    fn free(&self, bytes: u64) -> u64;
}

/// Handle to one registration; pass it back to [`unregister`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OomHandlerId(u64);

struct Registry {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(u64, Arc<dyn OomHandler>)>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        next_id: AtomicU64::new(0),
        handlers: Mutex::new(Vec::new()),
    })
}

pub fn register(handler: Arc<dyn OomHandler>) -> OomHandlerId {
    let registry = registry();
    let id = registry.next_id.fetch_add(1, Ordering::Relaxed);
    registry.handlers.lock().unwrap().push((id, handler));
    OomHandlerId(id)
}

pub fn unregister(id: OomHandlerId) {
    registry()
        .handlers
        .lock()
        .unwrap()
        .retain(|(registered, _)| *registered != id.0);
}

/// Ask every registered handler to release memory, stopping once `bytes`
/// have been freed.
pub fn try_free(bytes: u64) -> u64 {
    let handlers: Vec<_> = registry()
        .handlers
        .lock()
        .unwrap()
        .iter()
        .map(|(_, handler)| Arc::clone(handler))
        .collect();
    let mut released = 0u64;
    for handler in handlers {
        if released >= bytes {
            break;
        }
        released += handler.free(bytes - released);
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Fixed(u64, AtomicU64);

    impl OomHandler for Fixed {
        fn free(&self, bytes: u64) -> u64 {
            self.1.fetch_add(bytes, Ordering::SeqCst);
            self.0.min(bytes)
        }
    }

    // One test driving the whole lifecycle: the registry is process-global,
    // so splitting this across parallel test threads would interleave.
    #[test]
    fn test_register_free_unregister_targeted() {
        let first = Arc::new(Fixed(100, AtomicU64::new(0)));
        let second = Arc::new(Fixed(10, AtomicU64::new(0)));
        let first_id = register(first.clone());
        let second_id = register(second.clone());

        assert_eq!(try_free(40), 40);
        assert_eq!(first.1.load(Ordering::SeqCst), 40);
        assert_eq!(second.1.load(Ordering::SeqCst), 0);

        // Dropping the first registration leaves the second one live.
        unregister(first_id);
        assert_eq!(try_free(10), 10);
        assert_eq!(first.1.load(Ordering::SeqCst), 40);
        assert_eq!(second.1.load(Ordering::SeqCst), 10);

        unregister(second_id);
        assert_eq!(try_free(10), 0);
    }
}
