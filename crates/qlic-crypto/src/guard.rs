//! Serialization guard for platform crypto and keystore calls.
//!
//! Some platform keystore APIs are not safe to call concurrently. Every
//! attestation or signing call the handshake makes is routed through one
//! shared [`CryptoGuard`], so two connections can never enter the
//! underlying API at the same time. The requirement is serialization, not
//! any particular primitive; a plain mutex-guarded facade is enough.

use std::sync::{Arc, Mutex};

/// Shared guard serializing access to the underlying crypto/keystore API.
#[derive(Clone, Default)]
pub struct CryptoGuard {
    lock: Arc<Mutex<()>>,
}

impl CryptoGuard {
    /// Create a new guard. Clones share the same serialization point.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding exclusive access to the guarded API.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        // Lock poisoning only occurs if a guarded call panicked; the state
        // behind the guard is external, so continuing is sound.
        let _held = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn calls_are_serialized() {
        let guard = CryptoGuard::new();
        let depth = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = guard.clone();
                let depth = depth.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        guard.with(|| {
                            let inside = depth.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(inside, 0);
                            depth.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn clones_share_the_lock() {
        let a = CryptoGuard::new();
        let b = a.clone();
        assert!(Arc::ptr_eq(&a.lock, &b.lock));
    }
}
