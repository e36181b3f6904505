//! Staged publication of heavy resources to the render thread
//!
//! Every mutable heavy resource in the engine (EQ kernel, convolution IR,
//! HRTF filter set) crosses the thread boundary the same way: a control
//! thread builds the new data outside any lock, moves it into a staged
//! slot under a short critical section, and sets a `ready` flag; the
//! render thread try-locks the slot at the next buffer, takes ownership
//! (swap or memcpy-scale copy) and clears the flag. On contention the
//! render thread simply defers to the next callback.
//!
//! Replaced data ends up back in the staged slot and is dropped on the
//! control thread the next time it publishes - never inside the audio
//! callback.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// A single staged slot with publish/adopt semantics.
///
/// The lock is only ever held for memcpy-scale work, so the control-side
/// `publish_with` effectively spins; the render-side `try_consume_with`
/// is a single try-lock and never blocks.
pub struct Published<T> {
    slot: Mutex<T>,
    ready: AtomicBool,
}

impl<T> Published<T> {
    pub fn new(initial: T) -> Self {
        Self {
            slot: Mutex::new(initial),
            ready: AtomicBool::new(false),
        }
    }

    /// Control thread: mutate the staged slot and mark it ready.
    ///
    /// Build the data *before* calling this; the closure should only move
    /// or copy it into place.
    pub fn publish_with(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.slot.lock();
        f(&mut guard);
        self.ready.store(true, Ordering::Release);
    }

    /// Render thread: adopt the staged value if one is ready and the lock
    /// is free. Returns `false` without blocking otherwise.
    pub fn try_consume_with(&self, f: impl FnOnce(&mut T)) -> bool {
        if !self.ready.load(Ordering::Acquire) {
            return false;
        }
        let Some(mut guard) = self.slot.try_lock() else {
            return false;
        };
        f(&mut guard);
        self.ready.store(false, Ordering::Release);
        true
    }

    /// Whether a staged value is waiting to be adopted.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Control thread: bounded wait for the render thread to consume the
    /// staged value, sleeping 1 ms per poll. Returns `false` on timeout.
    pub fn wait_consumed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.ready.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Control-side access to the slot contents (e.g. for readback while
    /// nothing is staged). Blocks briefly if a publish is in flight.
    pub fn with_slot<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.slot.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_publish_then_consume() {
        let published = Published::new(0u32);
        assert!(!published.is_ready());

        published.publish_with(|v| *v = 42);
        assert!(published.is_ready());

        let mut seen = 0;
        assert!(published.try_consume_with(|v| seen = *v));
        assert_eq!(seen, 42);
        assert!(!published.is_ready());

        // Nothing staged: consume is a no-op
        assert!(!published.try_consume_with(|_| panic!("must not run")));
    }

    #[test]
    fn test_wait_consumed_timeout() {
        let published = Published::new(0u32);
        published.publish_with(|v| *v = 1);

        // Never consumed: times out
        assert!(!published.wait_consumed(Duration::from_millis(20)));

        published.try_consume_with(|_| {});
        assert!(published.wait_consumed(Duration::from_millis(20)));
    }

    #[test]
    fn test_cross_thread_handoff() {
        let published = Arc::new(Published::new(Vec::<u32>::new()));

        let publisher = {
            let published = Arc::clone(&published);
            std::thread::spawn(move || {
                for i in 0..100u32 {
                    let data = vec![i; 16];
                    published.publish_with(|slot| *slot = data);
                    assert!(published.wait_consumed(Duration::from_secs(1)));
                }
            })
        };

        let mut adopted = Vec::new();
        while adopted.len() < 100 {
            published.try_consume_with(|slot| {
                adopted.push(slot[0]);
                assert!(slot.iter().all(|&v| v == slot[0]));
            });
        }

        publisher.join().unwrap();
        assert_eq!(adopted.len(), 100);
    }
}
