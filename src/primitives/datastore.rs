//! Chunked arena addressed by [`EntryRef`] handles.
//!
//! The arena splits into two halves:
//!
//! - [`SlotTable`] is the shared, read-only view handed to readers. Each slot
//!   holds an `Arc` of an immutable entry, so a reader that resolved a handle
//!   keeps a stable value even if the writer later replaces the slot.
//! - [`DataStore`] is the writer half. It owns allocation, the free lists, the
//!   frozen bits and the generation hold lists. Slots are only overwritten when
//!   they are unreachable by readers: freshly allocated, not yet frozen, or
//!   reclaimed after [`DataStore::trim_hold_lists`].

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use tracing::{debug, info};

use crate::types::{EntryRef, Generation, CHUNK_SLOTS, MAX_CHUNKS};

const FROZEN_WORDS: usize = CHUNK_SLOTS / 64;

struct Chunk<T> {
    slots: Box<[ArcSwapOption<T>]>,
}

impl<T> Chunk<T> {
    fn new() -> Self {
        let slots: Vec<ArcSwapOption<T>> =
            (0..CHUNK_SLOTS).map(|_| ArcSwapOption::empty()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

type Directory<T> = Vec<Option<Arc<Chunk<T>>>>;

/// Shared read side of the arena.
///
/// Lookups never take a lock: the chunk directory and every slot are atomic
/// pointers. Only the single writer replaces them.
pub struct SlotTable<T> {
    chunks: ArcSwap<Directory<T>>,
}

impl<T> SlotTable<T> {
    fn new() -> Self {
        Self {
            chunks: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Resolves `entry` to its current value.
    ///
    /// # Panics
    /// Panics when `entry` is invalid, names a released chunk or a free slot.
    /// Callers must only resolve handles reachable from a root they hold.
    pub fn get(&self, entry: EntryRef) -> Arc<T> {
        assert!(entry.valid(), "resolving an invalid entry ref");
        self.try_get(entry)
            .unwrap_or_else(|| panic!("{entry:?} does not name a live entry"))
    }

    /// Resolves `entry`, returning `None` for invalid or free handles.
    pub fn try_get(&self, entry: EntryRef) -> Option<Arc<T>> {
        if !entry.valid() {
            return None;
        }
        let chunks = self.chunks.load();
        let chunk = chunks.get(entry.chunk() as usize)?.as_ref()?;
        chunk.slots[entry.offset() as usize].load_full()
    }

    fn replace(&self, entry: EntryRef, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let chunks = self.chunks.load();
        let chunk = chunks[entry.chunk() as usize]
            .as_ref()
            .expect("writing into a released chunk");
        chunk.slots[entry.offset() as usize].swap(value)
    }

    // Directory updates copy the small vector of chunk pointers; the chunk
    // itself is built before it becomes visible.
    fn install(&self, chunk_id: u32) {
        let chunk = Arc::new(Chunk::new());
        let mut next: Directory<T> = (**self.chunks.load()).clone();
        let idx = chunk_id as usize;
        if next.len() <= idx {
            next.resize_with(idx + 1, || None);
        }
        debug_assert!(next[idx].is_none(), "chunk {chunk_id} installed twice");
        next[idx] = Some(chunk);
        self.chunks.store(Arc::new(next));
    }

    fn release(&self, chunk_id: u32) {
        let mut next: Directory<T> = (**self.chunks.load()).clone();
        next[chunk_id as usize] = None;
        self.chunks.store(Arc::new(next));
    }
}

/// Point-in-time accounting of a [`DataStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DataStoreStats {
    /// Chunks currently backed by memory.
    pub chunks: usize,
    /// Slots holding an entry (including retired, not yet reclaimed ones).
    pub live: usize,
    /// Retired slots waiting for a generation to pass.
    pub held: usize,
    /// Slots available for reuse in installed chunks.
    pub free: usize,
    /// Chunks currently marked for compaction.
    pub compacting: usize,
}

#[derive(Default)]
struct ChunkMeta {
    installed: bool,
    compacting: bool,
    live: u32,
    used: u32,
    free: Vec<u32>,
    frozen: Vec<u64>,
}

impl ChunkMeta {
    fn has_room(&self) -> bool {
        !self.free.is_empty() || (self.used as usize) < CHUNK_SLOTS
    }

    fn reset(&mut self) {
        *self = ChunkMeta::default();
    }

    fn set_frozen(&mut self, offset: u32, frozen: bool) {
        let word = offset as usize / 64;
        let bit = 1u64 << (offset % 64);
        if frozen {
            self.frozen[word] |= bit;
        } else {
            self.frozen[word] &= !bit;
        }
    }

    fn is_frozen(&self, offset: u32) -> bool {
        self.frozen[offset as usize / 64] & (1u64 << (offset % 64)) != 0
    }
}

/// Writer half of the arena: allocation, copy-on-write and deferred release.
pub struct DataStore<T> {
    table: Arc<SlotTable<T>>,
    chunks: Vec<ChunkMeta>,
    free_chunk_ids: Vec<u32>,
    active: Option<u32>,
    unfrozen: Vec<EntryRef>,
    hold_until_freeze: Vec<EntryRef>,
    pending_hold: Vec<EntryRef>,
    hold_lists: VecDeque<(Generation, Vec<EntryRef>)>,
}

impl<T> Default for DataStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DataStore<T> {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self {
            table: Arc::new(SlotTable::new()),
            chunks: Vec::new(),
            free_chunk_ids: Vec::new(),
            active: None,
            unfrozen: Vec::new(),
            hold_until_freeze: Vec::new(),
            pending_hold: Vec::new(),
            hold_lists: VecDeque::new(),
        }
    }

    /// Shared read view handed to readers.
    pub fn reader(&self) -> Arc<SlotTable<T>> {
        Arc::clone(&self.table)
    }

    /// Resolves `entry`; see [`SlotTable::get`].
    pub fn get(&self, entry: EntryRef) -> Arc<T> {
        self.table.get(entry)
    }

    /// Stores `value` in a fresh, unfrozen slot.
    pub fn allocate(&mut self, value: T) -> EntryRef {
        let entry = self.reserve();
        self.table.replace(entry, Some(Arc::new(value)));
        entry
    }

    /// Writes `value` into a slot the writer obtained from [`DataStore::take`],
    /// [`DataStore::edit`] or [`DataStore::relocate`].
    ///
    /// # Panics
    /// Panics if the slot is frozen.
    pub fn put(&mut self, entry: EntryRef, value: T) {
        assert!(!self.is_frozen(entry), "in-place write to frozen {entry:?}");
        self.table.replace(entry, Some(Arc::new(value)));
    }

    /// Returns `true` once `entry` has been published by [`DataStore::freeze`].
    pub fn is_frozen(&self, entry: EntryRef) -> bool {
        let meta = &self.chunks[entry.chunk() as usize];
        meta.installed && meta.is_frozen(entry.offset())
    }

    /// Returns `true` when `entry` lives in a chunk being compacted.
    pub fn needs_move(&self, entry: EntryRef) -> bool {
        self.chunks[entry.chunk() as usize].compacting
    }

    /// Retires `entry`.
    ///
    /// Frozen entries wait on the hold list for a generation to pass. Entries
    /// never published wait for the next freeze before joining the hold list.
    pub fn hold(&mut self, entry: EntryRef) {
        debug_assert!(entry.valid(), "holding an invalid entry ref");
        if self.is_frozen(entry) {
            self.pending_hold.push(entry);
        } else {
            self.hold_until_freeze.push(entry);
        }
    }

    /// Marks every entry allocated since the previous freeze as frozen.
    pub fn freeze(&mut self) {
        for entry in std::mem::take(&mut self.unfrozen) {
            let meta = &mut self.chunks[entry.chunk() as usize];
            if meta.installed {
                meta.set_frozen(entry.offset(), true);
            }
        }
        self.pending_hold.append(&mut self.hold_until_freeze);
    }

    /// Tags every entry retired since the last transfer with `generation`.
    pub fn transfer_hold_lists(&mut self, generation: Generation) {
        if self.pending_hold.is_empty() {
            return;
        }
        let held = std::mem::take(&mut self.pending_hold);
        debug!(generation, held = held.len(), "datastore.hold.transfer");
        self.hold_lists.push_back((generation, held));
    }

    /// Frees every held entry retired strictly before `first_used`.
    ///
    /// Returns the number of slots reclaimed.
    pub fn trim_hold_lists(&mut self, first_used: Generation) -> usize {
        let mut freed = 0usize;
        while let Some((generation, _)) = self.hold_lists.front() {
            if *generation >= first_used {
                break;
            }
            let (_, entries) = self
                .hold_lists
                .pop_front()
                .expect("front checked above");
            freed += entries.len();
            for entry in entries {
                self.free(entry);
            }
        }
        if freed > 0 {
            debug!(first_used, freed, "datastore.hold.trim");
        }
        freed
    }

    /// Marks every chunk holding live entries for compaction and returns their ids.
    ///
    /// New allocations avoid the returned chunks until [`DataStore::finish_compact`].
    pub fn start_compact(&mut self) -> Vec<u32> {
        let ids: Vec<u32> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, meta)| meta.installed && meta.live > 0)
            .map(|(id, _)| id as u32)
            .collect();
        for &id in &ids {
            self.chunks[id as usize].compacting = true;
        }
        self.active = None;
        debug!(chunks = ids.len(), "datastore.compact.start");
        ids
    }

    /// Ends the compaction cycle started by [`DataStore::start_compact`].
    pub fn finish_compact(&mut self, ids: Vec<u32>) {
        let mut released = 0usize;
        for id in ids {
            let meta = &mut self.chunks[id as usize];
            meta.compacting = false;
            if meta.installed && meta.live == 0 && self.active != Some(id) {
                self.release_chunk(id);
                released += 1;
            }
        }
        let stats = self.stats();
        info!(
            released,
            chunks = stats.chunks,
            live = stats.live,
            held = stats.held,
            "datastore.compact.finish"
        );
    }

    /// Returns the current accounting snapshot.
    pub fn stats(&self) -> DataStoreStats {
        let mut stats = DataStoreStats {
            held: self.pending_hold.len()
                + self.hold_until_freeze.len()
                + self.hold_lists.iter().map(|(_, held)| held.len()).sum::<usize>(),
            ..DataStoreStats::default()
        };
        for meta in self.chunks.iter().filter(|meta| meta.installed) {
            stats.chunks += 1;
            stats.live += meta.live as usize;
            stats.free += meta.free.len() + (CHUNK_SLOTS - meta.used as usize);
            stats.compacting += usize::from(meta.compacting);
        }
        stats
    }

    fn reserve(&mut self) -> EntryRef {
        let chunk_id = self.allocation_chunk();
        let meta = &mut self.chunks[chunk_id as usize];
        let offset = match meta.free.pop() {
            Some(offset) => offset,
            None => {
                let offset = meta.used;
                meta.used += 1;
                offset
            }
        };
        meta.live += 1;
        meta.set_frozen(offset, false);
        let entry = EntryRef::new(chunk_id, offset);
        self.unfrozen.push(entry);
        entry
    }

    fn allocation_chunk(&mut self) -> u32 {
        if let Some(active) = self.active {
            if self.chunks[active as usize].has_room() {
                return active;
            }
        }
        let reusable = self
            .chunks
            .iter()
            .position(|meta| meta.installed && !meta.compacting && meta.has_room());
        let chunk_id = match reusable {
            Some(id) => id as u32,
            None => self.install_chunk(),
        };
        self.active = Some(chunk_id);
        chunk_id
    }

    fn install_chunk(&mut self) -> u32 {
        let chunk_id = match self.free_chunk_ids.pop() {
            Some(id) => id,
            None => {
                assert!(self.chunks.len() < MAX_CHUNKS, "entry ref space exhausted");
                self.chunks.push(ChunkMeta::default());
                (self.chunks.len() - 1) as u32
            }
        };
        let meta = &mut self.chunks[chunk_id as usize];
        meta.installed = true;
        meta.frozen = vec![0; FROZEN_WORDS];
        self.table.install(chunk_id);
        chunk_id
    }

    fn release_chunk(&mut self, chunk_id: u32) {
        self.table.release(chunk_id);
        self.chunks[chunk_id as usize].reset();
        self.free_chunk_ids.push(chunk_id);
    }

    fn free(&mut self, entry: EntryRef) {
        self.table.replace(entry, None);
        let chunk_id = entry.chunk();
        let meta = &mut self.chunks[chunk_id as usize];
        debug_assert!(meta.live > 0, "double free of {entry:?}");
        meta.live -= 1;
        meta.set_frozen(entry.offset(), false);
        meta.free.push(entry.offset());
        if meta.live == 0 && !meta.compacting && self.active != Some(chunk_id) {
            self.release_chunk(chunk_id);
        }
    }
}

impl<T: Clone> DataStore<T> {
    /// Moves the value of an unfrozen entry out of its slot for editing.
    ///
    /// The slot stays reserved; the writer returns the value with [`DataStore::put`].
    pub fn take(&mut self, entry: EntryRef) -> T {
        assert!(!self.is_frozen(entry), "taking frozen {entry:?}");
        let value = self
            .table
            .replace(entry, None)
            .unwrap_or_else(|| panic!("{entry:?} does not name a live entry"));
        Arc::try_unwrap(value).unwrap_or_else(|shared| (*shared).clone())
    }

    /// Copy-on-write access to `entry`.
    ///
    /// Unfrozen entries are taken in place. Frozen entries are copied into a
    /// fresh slot and the original is retired. Returns the slot to write back
    /// with [`DataStore::put`] together with the editable value.
    pub fn edit(&mut self, entry: EntryRef) -> (EntryRef, T) {
        if self.is_frozen(entry) {
            self.relocate(entry)
        } else {
            (entry, self.take(entry))
        }
    }

    /// Copies `entry` into a fresh slot and retires the original.
    pub fn relocate(&mut self, entry: EntryRef) -> (EntryRef, T) {
        let value = (*self.get(entry)).clone();
        let fresh = self.reserve();
        self.hold(entry);
        (fresh, value)
    }
}
