//! Triple-slot hand-off between a control thread and the audio thread.
//!
//! Three atomic pointers `next`, `current`, `old` carry values from a
//! single publisher (control thread) to a single consumer (audio thread)
//! without locks or allocation on the consumer side:
//!
//! - the publisher drains `next` and `old`, builds a value, and stores it
//!   into `next`;
//! - the consumer, once per tick, exchanges `next` out; if it got a value
//!   it rotates `current` into `old` and installs the new value;
//! - the publisher later reclaims `old` and destroys it.
//!
//! The publisher must never store into `next` while `old` is occupied;
//! if the consumer finds `old` occupied during rotation the protocol was
//! broken: we panic in debug builds and leak the displaced value in
//! release builds (freeing memory in an unknown ownership state is worse
//! than leaking it). At most three values are alive at any time.
//!
//! All exchanges use acquire/release ordering so everything the publisher
//! set up inside a value happens-before the consumer's use of it.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

#[derive(Debug)]
pub struct TripleSlot<T> {
    next: AtomicPtr<T>,
    current: AtomicPtr<T>,
    old: AtomicPtr<T>,
}

// SAFETY: values are moved between threads through the atomics; each slot
// is owned by exactly one side at a time per the protocol above.
unsafe impl<T: Send> Send for TripleSlot<T> {}
unsafe impl<T: Send> Sync for TripleSlot<T> {}

impl<T> Default for TripleSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TripleSlot<T> {
    pub fn new() -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            current: AtomicPtr::new(ptr::null_mut()),
            old: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn take(slot: &AtomicPtr<T>) -> Option<Box<T>> {
        let p = slot.swap(ptr::null_mut(), Ordering::AcqRel);
        // SAFETY: a non-null pointer in a slot is always a leaked Box that
        // no other slot references.
        (!p.is_null()).then(|| unsafe { Box::from_raw(p) })
    }

    /// Publisher: reclaim a published-but-unconsumed `next` and the
    /// consumer's discarded `old`. Must run before every [`publish`].
    ///
    /// [`publish`]: TripleSlot::publish
    pub fn discard_stale(&self) -> (Option<Box<T>>, Option<Box<T>>) {
        (Self::take(&self.next), Self::take(&self.old))
    }

    /// Publisher: reclaim only the consumer's discarded value.
    pub fn take_old(&self) -> Option<Box<T>> {
        Self::take(&self.old)
    }

    /// Publisher: hand a new value to the consumer. The `next` slot must
    /// be empty, which a preceding [`discard_stale`] guarantees.
    ///
    /// [`discard_stale`]: TripleSlot::discard_stale
    pub fn publish(&self, value: Box<T>) {
        let prev = self.next.swap(Box::into_raw(value), Ordering::AcqRel);
        if !prev.is_null() {
            debug_assert!(prev.is_null(), "publish onto occupied next slot");
            // Release build: leak rather than free a value of unknown state.
        }
    }

    /// Consumer: take a pending value, if any, and rotate it in. Returns
    /// true when a new value became current.
    ///
    /// Rotation is deferred while `old` is still occupied: a pending value
    /// must never displace `current` before the publisher has reclaimed
    /// the previously evicted one. The pending value stays in `next` and
    /// is picked up on a later tick.
    pub fn promote(&self) -> bool {
        if !self.old.load(Ordering::Acquire).is_null() {
            return false;
        }
        let next = self.next.swap(ptr::null_mut(), Ordering::AcqRel);
        if next.is_null() {
            return false;
        }
        let prev = self.current.swap(next, Ordering::AcqRel);
        let displaced = self.old.swap(prev, Ordering::AcqRel);
        // `old` was observed empty above and only this thread stores into it.
        if !displaced.is_null() {
            debug_assert!(displaced.is_null(), "publisher failed to drain old slot");
        }
        true
    }

    /// Consumer: shared reference to the installed value.
    ///
    /// # Safety contract
    /// The returned reference is valid until the consumer's next
    /// [`promote`]; only the consumer thread may use it.
    ///
    /// [`promote`]: TripleSlot::promote
    pub fn current(&self) -> Option<&T> {
        let p = self.current.load(Ordering::Acquire);
        // SAFETY: `current` is only replaced by the consumer itself
        // (promote) and only reclaimed after rotation into `old` and a
        // publisher drain, which cannot race with the consumer's use.
        unsafe { p.as_ref() }
    }

    /// Consumer: exclusive reference to the installed value. Same contract
    /// as [`current`], plus the single-consumer discipline makes the
    /// exclusivity sound.
    ///
    /// [`current`]: TripleSlot::current
    #[allow(clippy::mut_from_ref)]
    pub fn current_mut(&self) -> Option<&mut T> {
        let p = self.current.load(Ordering::Acquire);
        // SAFETY: as `current`; there is exactly one consumer thread.
        unsafe { p.as_mut() }
    }

    pub fn has_next(&self) -> bool {
        !self.next.load(Ordering::Acquire).is_null()
    }

    pub fn has_current(&self) -> bool {
        !self.current.load(Ordering::Acquire).is_null()
    }

    pub fn has_old(&self) -> bool {
        !self.old.load(Ordering::Acquire).is_null()
    }

    /// Drain every slot. Only valid once the consumer has stopped.
    pub fn drain(&self) -> [Option<Box<T>>; 3] {
        [
            Self::take(&self.next),
            Self::take(&self.current),
            Self::take(&self.old),
        ]
    }
}

impl<T> Drop for TripleSlot<T> {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct Tracked(Arc<AtomicUsize>);

    impl Tracked {
        fn new(live: &Arc<AtomicUsize>) -> Box<Self> {
            live.fetch_add(1, Ordering::SeqCst);
            Box::new(Tracked(live.clone()))
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_publish_promote_cycle() {
        let slot = TripleSlot::new();
        assert!(!slot.promote());
        assert!(slot.current().is_none());

        slot.publish(Box::new(1u32));
        assert!(slot.has_next());
        assert!(slot.promote());
        assert_eq!(slot.current().copied(), Some(1));
        assert!(!slot.has_old());

        // Second publish rotates the first value into `old`.
        slot.discard_stale();
        slot.publish(Box::new(2));
        assert!(slot.promote());
        assert_eq!(slot.current().copied(), Some(2));
        assert_eq!(slot.take_old().map(|b| *b), Some(1));
    }

    #[test]
    fn test_unconsumed_next_is_reclaimed() {
        let live = Arc::new(AtomicUsize::new(0));
        let slot = TripleSlot::new();
        slot.publish(Tracked::new(&live));
        // Never promoted; the publisher reclaims it before the next publish.
        let (stale, old) = slot.discard_stale();
        assert!(stale.is_some());
        assert!(old.is_none());
        drop(stale);
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_drains_all_slots() {
        let live = Arc::new(AtomicUsize::new(0));
        {
            let slot = TripleSlot::new();
            slot.publish(Tracked::new(&live));
            slot.promote();
            slot.discard_stale();
            slot.publish(Tracked::new(&live));
            slot.promote();
            slot.discard_stale();
            slot.publish(Tracked::new(&live));
            assert_eq!(live.load(Ordering::SeqCst), 3);
        }
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    // Publisher and consumer hammer the slot concurrently; afterwards no
    // value may be leaked and no pending `next` may be left unobservable.
    #[test]
    fn test_concurrent_publish_consume() {
        let live = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(TripleSlot::new());

        let publisher = {
            let slot = slot.clone();
            let live = live.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    slot.discard_stale();
                    slot.publish(Tracked::new(&live));
                }
            })
        };

        let consumer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                let mut installs = 0u32;
                for _ in 0..10_000 {
                    if slot.promote() {
                        assert!(slot.current().is_some());
                        installs += 1;
                    }
                }
                installs
            })
        };

        publisher.join().unwrap();
        let installs = consumer.join().unwrap();
        assert!(installs > 0);

        // Everything still alive is parked in the three slots.
        let drained = slot.drain().into_iter().flatten().count();
        assert_eq!(live.load(Ordering::SeqCst), drained);
        drop(slot);
    }
}
