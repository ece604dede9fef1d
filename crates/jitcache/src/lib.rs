//! Executable memory for translated units, plus the bounded code cache that
//! decides which translations stay resident.
mod region;

use easyerr::Error;

use crate::region::{Protection, Region};

/// Default total budget for resident translated code.
pub const DEFAULT_BUDGET: usize = 8 * bytesize::MIB as usize;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to map executable memory: {f0}")]
    Map(rustix::io::Errno),
    #[error("failed to protect executable memory: {f0}")]
    Protect(rustix::io::Errno),
}

/// One translated unit's finalized host code, mapped read+execute.
pub struct ExecAlloc {
    region: Region,
    len: usize,
}

impl ExecAlloc {
    /// Maps a fresh region, copies `code` into it and flips it to
    /// read+execute.
    pub fn new(code: &[u8]) -> Result<Self, CacheError> {
        let region = Region::new(code.len()).map_err(CacheError::Map)?;

        // SAFETY: the region is at least code.len() bytes and writable
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), region.as_ptr(), code.len());
        }

        region
            .protect(Protection::ReadExec)
            .map_err(CacheError::Protect)?;

        Ok(Self {
            region,
            len: code.len(),
        })
    }

    /// Pointer to the code at `offset`.
    ///
    /// # Safety considerations
    /// The pointer is only meaningful while this allocation is alive; calling
    /// into it hands control to generated code.
    pub fn entry(&self, offset: usize) -> *const u8 {
        assert!(offset < self.len);
        // SAFETY: offset is in bounds
        unsafe { self.region.as_ptr().add(offset) }
    }

    /// Length of the code (not the page-rounded mapping).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Bytes actually held by the mapping.
    pub fn mapped_len(&self) -> usize {
        self.region.len()
    }
}

struct MetaNode {
    key: u32,
    size: usize,
    lru: u64,
}

/// Accounting for resident translated code, keyed by guest start address.
///
/// A binary min-heap over LRU stamps picks eviction victims. Stamps move on
/// every touch, so the heap is restored right before an eviction pass rather
/// than on every update.
pub struct CodeCache {
    budget: usize,
    used: usize,
    next_stamp: u64,
    heap: Vec<MetaNode>,
}

impl CodeCache {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            next_stamp: 0,
            heap: Vec::new(),
        }
    }

    pub fn with_default_budget() -> Self {
        Self::new(DEFAULT_BUDGET)
    }

    /// Bytes currently accounted for.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn contains(&self, key: u32) -> bool {
        self.find(key).is_some()
    }

    fn find(&self, key: u32) -> Option<usize> {
        self.heap.iter().position(|n| n.key == key)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
    }

    fn heap_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[i].lru >= self.heap[parent].lru {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn heap_down(&mut self, mut i: usize) {
        loop {
            let (c1, c2) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if c1 < self.heap.len() && self.heap[c1].lru < self.heap[smallest].lru {
                smallest = c1;
            }
            if c2 < self.heap.len() && self.heap[c2].lru < self.heap[smallest].lru {
                smallest = c2;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    /// Restores the heap property after stamps have moved.
    fn heapify(&mut self) {
        for i in 1..self.heap.len() {
            self.heap_up(i);
        }
    }

    fn pop_lru(&mut self) -> MetaNode {
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let node = self.heap.pop().unwrap();
        self.heap_down(0);
        node
    }

    /// Evicts least-recently-used entries until at least `min_needed` bytes
    /// are freed, never touching `protect`. Frees roughly twice what is
    /// needed to amortize upcoming allocations. Returns the evicted keys.
    fn release(&mut self, min_needed: usize, protect: Option<u32>) -> Vec<u32> {
        let mut to_free = min_needed as i64 * 2;
        let mut evicted = Vec::new();
        let mut held_back: Option<MetaNode> = None;

        self.heapify();
        while to_free > 0 && self.heap.len() > held_back.is_some() as usize {
            let node = self.pop_lru();
            if Some(node.key) == protect {
                held_back = Some(node);
                continue;
            }
            tracing::debug!(key = node.key, size = node.size, "evicting translated unit");
            self.used -= node.size;
            to_free -= node.size as i64;
            evicted.push(node.key);
        }
        if let Some(node) = held_back {
            self.heap.push(node);
            self.heap_up(self.heap.len() - 1);
        }

        evicted
    }

    /// Accounts for a new allocation of `size` bytes, evicting whatever is
    /// necessary to stay inside the budget. `protect` (normally the unit
    /// currently being built or executed) is never chosen as a victim. When
    /// the cache is empty the allocation is granted even over budget, so
    /// progress is always possible. Returns the keys of evicted units; the
    /// caller owns dropping their memory and marking their guest ranges
    /// stale.
    pub fn alloc(&mut self, size: usize, key: u32, protect: Option<u32>) -> Vec<u32> {
        debug_assert!(self.find(key).is_none(), "key {key:#x} already cached");

        let evicted = if self.used + size > self.budget {
            self.release(self.used + size - self.budget, protect)
        } else {
            Vec::new()
        };

        self.used += size;
        let lru = self.bump_stamp();
        self.heap.push(MetaNode { key, size, lru });
        // the newest entry is already in heap order

        evicted
    }

    /// Re-sizes an existing entry (a unit re-translated in place), touching
    /// it and evicting for any growth.
    pub fn realloc(&mut self, key: u32, new_size: usize) -> Vec<u32> {
        let Some(i) = self.find(key) else {
            return self.alloc(new_size, key, Some(key));
        };

        let lru = self.bump_stamp();
        self.heap[i].lru = lru;

        let old_size = self.heap[i].size;
        let growth = new_size.saturating_sub(old_size);
        let evicted = if growth > 0 && self.used + growth > self.budget {
            self.release(self.used + growth - self.budget, Some(key))
        } else {
            Vec::new()
        };

        // the entry may have moved while evicting
        let i = self.find(key).expect("protected entry survived release");
        self.used = self.used - old_size + new_size;
        self.heap[i].size = new_size;

        evicted
    }

    /// Drops an entry's accounting. Returns whether it existed.
    pub fn free(&mut self, key: u32) -> bool {
        let Some(i) = self.find(key) else {
            return false;
        };
        self.used -= self.heap[i].size;
        let last = self.heap.len() - 1;
        self.swap(i, last);
        self.heap.pop();
        if i < self.heap.len() {
            self.heap_down(i);
        }
        true
    }

    /// Refreshes an entry's LRU stamp.
    pub fn touch(&mut self, key: u32) {
        if let Some(i) = self.find(key) {
            let lru = self.bump_stamp();
            self.heap[i].lru = lru;
        }
    }

    fn bump_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp += 1;
        stamp
    }
}
