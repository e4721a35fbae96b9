//! Generation (epoch) tracking for deferred reclamation.
//!
//! Writers advance the current generation after publishing a batch of
//! changes. Readers pin the generation that was current when they started via
//! a [`GenerationGuard`]; memory retired at generation `g` is only released
//! once [`GenerationHandler::first_used_generation`] has moved past `g`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::types::Generation;

/// Summary of reader activity captured from a [`GenerationHandler`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReaderSnapshot {
    /// Total active guards.
    pub active: u64,
    /// Oldest generation pinned by any guard.
    pub oldest_generation: Option<Generation>,
    /// Newest generation pinned by any guard.
    pub newest_generation: Option<Generation>,
}

/// Epoch counter plus the reader floor used to bound reclamation.
#[derive(Debug, Default)]
pub struct GenerationHandler {
    current: AtomicU64,
    readers: Mutex<BTreeMap<Generation, u32>>,
}

impl GenerationHandler {
    /// Creates a handler starting at generation zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the current generation.
    pub fn current_generation(&self) -> Generation {
        self.current.load(Ordering::Acquire)
    }

    /// Advances the current generation and returns the new value.
    pub fn inc_generation(&self) -> Generation {
        // The reader floor lock orders the bump against guards being taken.
        let readers = self.readers.lock();
        let next = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            generation = next,
            pinned = readers.len(),
            "generation.inc"
        );
        next
    }

    /// Returns the oldest generation any live guard may still observe.
    ///
    /// Equals the current generation when no guard is held.
    pub fn first_used_generation(&self) -> Generation {
        let readers = self.readers.lock();
        match readers.keys().next() {
            Some(&oldest) => oldest,
            None => self.current.load(Ordering::Acquire),
        }
    }

    /// Registers a reader at the current generation.
    pub fn take_guard(self: &Arc<Self>) -> GenerationGuard {
        let generation = {
            let mut readers = self.readers.lock();
            let generation = self.current.load(Ordering::Acquire);
            let counter = readers.entry(generation).or_insert(0);
            *counter = counter
                .checked_add(1)
                .expect("generation reader count overflow");
            generation
        };
        GenerationGuard {
            handler: Arc::clone(self),
            generation,
        }
    }

    /// Number of guards currently pinning `generation`.
    pub fn generation_ref_count(&self, generation: Generation) -> u32 {
        self.readers.lock().get(&generation).copied().unwrap_or(0)
    }

    /// Returns a snapshot describing currently active readers.
    pub fn reader_snapshot(&self) -> ReaderSnapshot {
        let readers = self.readers.lock();
        ReaderSnapshot {
            active: readers.values().map(|&count| u64::from(count)).sum(),
            oldest_generation: readers.keys().next().copied(),
            newest_generation: readers.keys().next_back().copied(),
        }
    }

    fn release(&self, generation: Generation) {
        let mut readers = self.readers.lock();
        match readers.get_mut(&generation) {
            Some(counter) if *counter > 1 => *counter -= 1,
            Some(_) => {
                readers.remove(&generation);
            }
            None => debug_assert!(false, "released an unregistered generation {generation}"),
        }
    }
}

/// RAII registration of a reader; releases its generation on drop.
#[derive(Debug)]
pub struct GenerationGuard {
    handler: Arc<GenerationHandler>,
    generation: Generation,
}

impl GenerationGuard {
    /// Generation pinned by this guard.
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.handler.release(self.generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_used_tracks_current_without_readers() {
        let handler = GenerationHandler::new();
        assert_eq!(handler.current_generation(), 0);
        assert_eq!(handler.first_used_generation(), 0);
        assert_eq!(handler.inc_generation(), 1);
        assert_eq!(handler.first_used_generation(), 1);
    }

    #[test]
    fn guard_pins_generation_until_dropped() {
        let handler = GenerationHandler::new();
        handler.inc_generation();
        let guard = handler.take_guard();
        assert_eq!(guard.generation(), 1);
        handler.inc_generation();
        handler.inc_generation();
        assert_eq!(handler.current_generation(), 3);
        assert_eq!(handler.first_used_generation(), 1);
        assert_eq!(handler.generation_ref_count(1), 1);

        let second = handler.take_guard();
        assert_eq!(second.generation(), 3);
        let snapshot = handler.reader_snapshot();
        assert_eq!(snapshot.active, 2);
        assert_eq!(snapshot.oldest_generation, Some(1));
        assert_eq!(snapshot.newest_generation, Some(3));

        drop(guard);
        assert_eq!(handler.first_used_generation(), 3);
        drop(second);
        assert_eq!(handler.reader_snapshot(), ReaderSnapshot::default());
    }

    #[test]
    fn guards_on_same_generation_are_counted() {
        let handler = GenerationHandler::new();
        let a = handler.take_guard();
        let b = handler.take_guard();
        assert_eq!(handler.generation_ref_count(0), 2);
        drop(a);
        assert_eq!(handler.generation_ref_count(0), 1);
        handler.inc_generation();
        assert_eq!(handler.first_used_generation(), 0);
        drop(b);
        assert_eq!(handler.first_used_generation(), 1);
    }
}
