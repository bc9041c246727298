//! Cache of recently decompressed blocks.
//!
//! Seek-heavy access patterns tend to revisit a small working set of blocks,
//! so the reader keeps decompressed payloads around up to a byte budget.
//! Eviction is round-robin over the slot arena with a cursor that persists
//! across insertions, not LRU: the cost of a miss is one block decode, and
//! the simpler policy avoids any per-hit bookkeeping.

struct Slot {
    key: u64,
    size_on_disk: usize,
    data: Vec<u8>,
}

/// A budget-bounded cache of decompressed block payloads, keyed by the
/// compressed offset of the block start. Each entry remembers the block's
/// on-disk size so a hit also yields the offset of the following block.
pub struct BlockCache {
    slots: Vec<Option<Slot>>,
    budget: usize,
    used: usize,
    cursor: usize,
}

impl BlockCache {
    /// Creates a cache holding at most `budget` bytes of decompressed data.
    /// A zero budget disables caching entirely.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            slots: Vec::new(),
            budget,
            used: 0,
            cursor: 0,
        }
    }

    /// Current byte budget.
    #[must_use]
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes of payload currently held.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Adjusts the byte budget, evicting until the cache fits.
    pub fn set_budget(&mut self, budget: usize) {
        self.budget = budget;
        while self.used > self.budget {
            self.evict_one();
        }
    }

    /// Copies the payload for `key` into `out` if cached, returning the
    /// block's on-disk size.
    pub fn fetch(&self, key: u64, out: &mut Vec<u8>) -> Option<usize> {
        for slot in self.slots.iter().flatten() {
            if slot.key == key {
                out.clear();
                out.extend_from_slice(&slot.data);
                return Some(slot.size_on_disk);
            }
        }
        None
    }

    /// Whether a block with this key is cached.
    #[must_use]
    pub fn contains(&self, key: u64) -> bool {
        self.slots.iter().flatten().any(|slot| slot.key == key)
    }

    /// Stores a decompressed payload. A payload larger than the whole budget
    /// is not cached; an existing entry for the same key is refreshed.
    pub fn insert(&mut self, key: u64, data: &[u8], size_on_disk: usize) {
        if data.len() > self.budget {
            return;
        }
        self.remove(key);
        while self.used + data.len() > self.budget {
            self.evict_one();
        }
        self.used += data.len();
        let slot = Some(Slot {
            key,
            size_on_disk,
            data: data.to_vec(),
        });
        if let Some(free) = self.slots.iter().position(Option::is_none) {
            self.slots[free] = slot;
        } else {
            self.slots.push(slot);
        }
    }

    /// Drops every cached block, keeping the budget.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.used = 0;
        self.cursor = 0;
    }

    fn remove(&mut self, key: u64) {
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|s| s.key == key) {
                if let Some(s) = slot.take() {
                    self.used -= s.data.len();
                }
                return;
            }
        }
    }

    /// Evicts the first occupied slot at or after the cursor, leaving the
    /// cursor just past it so successive evictions rotate through the arena.
    fn evict_one(&mut self) {
        if self.slots.is_empty() {
            self.used = 0;
            return;
        }
        for _ in 0..self.slots.len() {
            if self.cursor >= self.slots.len() {
                self.cursor = 0;
            }
            let idx = self.cursor;
            self.cursor += 1;
            if let Some(slot) = self.slots[idx].take() {
                self.used -= slot.data.len();
                return;
            }
        }
        self.used = 0;
    }
}
