//! Extent space allocator.
//!
//! Manages the backing device as a pool of fixed-size extents. Allocation
//! state is one bit per extent, scanned forward from a rotating cursor so
//! consecutive allocations spread across the device. Each allocated extent is
//! attributed to an owner and, once written, linked into that owner's extent
//! LRU in the extent [`IndexTable`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use crate::list::{IndexTable, Layout};
use crate::owner::{OwnerId, NO_OWNER};

/// Index of an extent on the backing device.
pub type ExtentId = usize;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtentError {
    #[error("Out of extent space: all {capacity} extents are allocated")]
    NoSpace { capacity: usize },
}

/// Bitmap allocator plus per-extent and per-owner bookkeeping.
pub struct ExtentSpace {
    /// Total number of extents.
    capacity: usize,

    /// One bit per extent, set iff allocated. Padding bits past `capacity`
    /// are permanently set.
    bitmap: Box<[AtomicU64]>,

    /// Where the next scan starts. Advisory only.
    cursor: AtomicUsize,

    /// Number of allocated extents.
    live_extents: AtomicUsize,

    /// Allocated extents per owner, indexed by owner id.
    owner_extents: Box<[AtomicUsize]>,

    /// Linked extents with no same-owner linked neighbour.
    fragments: AtomicUsize,

    /// Objects still referencing each extent.
    live_objects: Box<[AtomicU32]>,

    /// Compressed bytes of those objects.
    live_bytes: Box<[AtomicU64]>,

    /// Whether each extent is currently linked into its owner's LRU.
    linked: Box<[AtomicBool]>,

    /// Serializes LRU link changes with the fragmentation update.
    frag_lock: Mutex<()>,

    /// Extent nodes and owner extent-LRU heads.
    exts: IndexTable,
}

impl std::fmt::Debug for ExtentSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentSpace")
            .field("capacity", &self.capacity)
            .field("live_extents", &self.live_extents())
            .field("fragments", &self.fragments())
            .finish_non_exhaustive()
    }
}

impl ExtentSpace {
    /// Create an empty space of `capacity` extents for up to `owners` owners.
    pub fn new(capacity: usize, owners: usize) -> Self {
        let words = capacity.div_ceil(WORD_BITS);
        let bitmap: Box<[AtomicU64]> = (0..words)
            .map(|w| {
                let first = w * WORD_BITS;
                let valid = capacity.saturating_sub(first).min(WORD_BITS);
                let padding = if valid == WORD_BITS {
                    0
                } else {
                    u64::MAX << valid
                };
                AtomicU64::new(padding)
            })
            .collect();

        Self {
            capacity,
            bitmap,
            cursor: AtomicUsize::new(0),
            live_extents: AtomicUsize::new(0),
            owner_extents: (0..=owners).map(|_| AtomicUsize::new(0)).collect(),
            fragments: AtomicUsize::new(0),
            live_objects: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            live_bytes: (0..capacity).map(|_| AtomicU64::new(0)).collect(),
            linked: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            frag_lock: Mutex::new(()),
            exts: IndexTable::new(Layout::new(0, capacity, owners)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The extent table: extent nodes and owner extent-LRU heads.
    pub fn table(&self) -> &IndexTable {
        &self.exts
    }

    /// Extent-LRU head index for an owner.
    pub fn owner_head(&self, owner: OwnerId) -> usize {
        self.exts.layout().owner_head(owner)
    }

    /// Map an extent-table node index back to its extent id.
    pub fn extent_of_node(&self, node: usize) -> ExtentId {
        node - self.exts.layout().objects
    }

    fn node(&self, extent: ExtentId) -> usize {
        self.exts.layout().extent(extent)
    }

    /// Allocate an extent for `owner`.
    ///
    /// The returned extent is claimed by the caller: its exclusive bit is
    /// clear until [`release_exclusive`](Self::release_exclusive) links it.
    pub fn allocate(&self, owner: OwnerId) -> Result<ExtentId, ExtentError> {
        assert!(owner != NO_OWNER, "extents must be allocated to an owner");
        let extent = loop {
            let start = self.cursor.load(Ordering::Relaxed) % self.capacity.max(1);
            let found = self
                .find_zero(start, self.capacity)
                .or_else(|| self.find_zero(0, start))
                .ok_or(ExtentError::NoSpace {
                    capacity: self.capacity,
                })?;

            let mask = 1u64 << (found % WORD_BITS);
            let prev = self.bitmap[found / WORD_BITS].fetch_or(mask, Ordering::AcqRel);
            if prev & mask == 0 {
                break found;
            }
            trace!(extent = found, "Lost allocation race, rescanning");
        };

        self.cursor.store(extent, Ordering::Relaxed);
        self.live_objects[extent].store(0, Ordering::Relaxed);
        self.live_bytes[extent].store(0, Ordering::Relaxed);
        self.owner_extents[owner as usize].fetch_add(1, Ordering::Relaxed);
        self.live_extents.fetch_add(1, Ordering::Relaxed);
        self.exts.set_owner(self.node(extent), owner);

        debug!(extent, owner, "Allocated extent");
        Ok(extent)
    }

    /// Free an allocated extent. The caller must hold its claim and have
    /// detached it from the owner's LRU.
    ///
    /// # Panics
    ///
    /// Freeing an extent that is not allocated is a consistency violation.
    pub fn free(&self, extent: ExtentId) {
        let word = extent / WORD_BITS;
        let mask = 1u64 << (extent % WORD_BITS);
        assert!(
            extent < self.capacity && self.bitmap[word].load(Ordering::Acquire) & mask != 0,
            "double free of extent {extent}"
        );

        let node = self.node(extent);
        assert!(
            !self.linked[extent].load(Ordering::Acquire),
            "freeing extent {extent} while linked in an owner LRU"
        );
        let owner = self.exts.owner(node);
        debug_assert!(owner != NO_OWNER, "allocated extent {extent} has no owner");

        self.exts.claim_exclusive(node);
        self.exts.set_owner(node, NO_OWNER);
        self.owner_extents[owner as usize].fetch_sub(1, Ordering::Relaxed);
        self.live_extents.fetch_sub(1, Ordering::Relaxed);

        let prev = self.bitmap[word].fetch_and(!mask, Ordering::AcqRel);
        assert!(prev & mask != 0, "double free of extent {extent}");

        debug!(extent, owner, "Freed extent");
    }

    /// Test-and-clear the extent's exclusive bit.
    pub fn claim_exclusive(&self, extent: ExtentId) -> bool {
        self.exts.claim_exclusive(self.node(extent))
    }

    pub fn test_exclusive(&self, extent: ExtentId) -> bool {
        self.exts.test_exclusive(self.node(extent))
    }

    /// Link a claimed extent at the MRU end of its owner's LRU and make it
    /// claimable again.
    pub fn release_exclusive(&self, extent: ExtentId) {
        let node = self.node(extent);
        let owner = self.exts.owner(node);
        debug_assert!(owner != NO_OWNER, "releasing unowned extent {extent}");
        {
            let _frag = self.frag_lock.lock();
            if !self.linked[extent].load(Ordering::Relaxed) {
                self.exts.insert_head(node, self.owner_head(owner));
                self.link_fragment(extent, owner);
            }
        }
        self.exts.release_exclusive(node);
    }

    /// Unlink a claimed extent from its owner's LRU. Returns whether it was
    /// linked.
    pub fn detach(&self, extent: ExtentId) -> bool {
        let node = self.node(extent);
        let owner = self.exts.owner(node);
        let _frag = self.frag_lock.lock();
        if !self.linked[extent].load(Ordering::Relaxed) {
            return false;
        }
        self.exts.remove(node, self.owner_head(owner));
        self.unlink_fragment(extent, owner);
        true
    }

    fn linked_to(&self, extent: Option<ExtentId>, owner: OwnerId) -> bool {
        match extent {
            Some(e) if e < self.capacity => {
                self.linked[e].load(Ordering::Relaxed) && self.exts.owner(self.node(e)) == owner
            }
            _ => false,
        }
    }

    fn link_fragment(&self, extent: ExtentId, owner: OwnerId) {
        let left = self.linked_to(extent.checked_sub(1), owner);
        let right = self.linked_to(Some(extent + 1), owner);

        if !left && !right {
            self.fragments.fetch_add(1, Ordering::Relaxed);
        }
        // A lone neighbour stops being lone.
        if left && !self.linked_to(extent.checked_sub(2), owner) {
            self.fragments.fetch_sub(1, Ordering::Relaxed);
        }
        if right && !self.linked_to(Some(extent + 2), owner) {
            self.fragments.fetch_sub(1, Ordering::Relaxed);
        }
        self.linked[extent].store(true, Ordering::Relaxed);
    }

    fn unlink_fragment(&self, extent: ExtentId, owner: OwnerId) {
        self.linked[extent].store(false, Ordering::Relaxed);
        let left = self.linked_to(extent.checked_sub(1), owner);
        let right = self.linked_to(Some(extent + 1), owner);

        if !left && !right {
            self.fragments.fetch_sub(1, Ordering::Relaxed);
        }
        if left && !self.linked_to(extent.checked_sub(2), owner) {
            self.fragments.fetch_add(1, Ordering::Relaxed);
        }
        if right && !self.linked_to(Some(extent + 2), owner) {
            self.fragments.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account one more object stored in `extent`.
    pub fn add_live(&self, extent: ExtentId, bytes: u64) {
        self.live_objects[extent].fetch_add(1, Ordering::AcqRel);
        self.live_bytes[extent].fetch_add(bytes, Ordering::Relaxed);
    }

    /// Account one object leaving `extent`. Returns the remaining count.
    pub fn sub_live(&self, extent: ExtentId, bytes: u64) -> u32 {
        self.live_bytes[extent].fetch_sub(bytes, Ordering::Relaxed);
        let prev = self.live_objects[extent].fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "live object count underflow on extent {extent}");
        prev - 1
    }

    pub fn live_objects(&self, extent: ExtentId) -> u32 {
        self.live_objects[extent].load(Ordering::Acquire)
    }

    pub fn live_bytes(&self, extent: ExtentId) -> u64 {
        self.live_bytes[extent].load(Ordering::Relaxed)
    }

    pub fn is_allocated(&self, extent: ExtentId) -> bool {
        let mask = 1u64 << (extent % WORD_BITS);
        self.bitmap[extent / WORD_BITS].load(Ordering::Acquire) & mask != 0
    }

    pub fn is_linked(&self, extent: ExtentId) -> bool {
        self.linked[extent].load(Ordering::Acquire)
    }

    pub fn owner_of(&self, extent: ExtentId) -> OwnerId {
        self.exts.owner(self.node(extent))
    }

    pub fn owner_extents(&self, owner: OwnerId) -> usize {
        self.owner_extents
            .get(owner as usize)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn live_extents(&self) -> usize {
        self.live_extents.load(Ordering::Relaxed)
    }

    pub fn fragments(&self) -> usize {
        self.fragments.load(Ordering::Relaxed)
    }

    /// Fraction of extents allocated (0.0 - 1.0).
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.live_extents() as f64 / self.capacity as f64
    }

    /// Recount isolated linked extents from scratch.
    pub fn count_fragments(&self) -> usize {
        (0..self.capacity)
            .filter(|&e| self.linked[e].load(Ordering::Relaxed))
            .filter(|&e| {
                let owner = self.owner_of(e);
                !self.linked_to(e.checked_sub(1), owner) && !self.linked_to(Some(e + 1), owner)
            })
            .count()
    }

    /// First zero bit in `[from, to)`.
    fn find_zero(&self, from: usize, to: usize) -> Option<usize> {
        let mut bit = from;
        while bit < to {
            let word = bit / WORD_BITS;
            let value = self.bitmap[word].load(Ordering::Acquire);
            let free = !value & (u64::MAX << (bit % WORD_BITS));
            if free != 0 {
                let found = word * WORD_BITS + free.trailing_zeros() as usize;
                return (found < to).then_some(found);
            }
            bit = (word + 1) * WORD_BITS;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_allocate_and_free() {
        let space = ExtentSpace::new(4, 2);

        let extents: Vec<_> = (0..4).map(|_| space.allocate(1).unwrap()).collect();
        assert_eq!(space.live_extents(), 4);
        assert_eq!(space.owner_extents(1), 4);
        assert!(matches!(
            space.allocate(1),
            Err(ExtentError::NoSpace { capacity: 4 })
        ));

        space.free(extents[0]);
        assert_eq!(space.live_extents(), 3);
        assert!(!space.is_allocated(extents[0]));
        assert_eq!(space.owner_of(extents[0]), NO_OWNER);

        space.allocate(2).unwrap();
        assert_eq!(space.owner_extents(2), 1);
    }

    #[test]
    fn test_wraparound_returns_first_hole() {
        let capacity = 10;
        let space = ExtentSpace::new(capacity, 1);
        for expected in 0..capacity {
            assert_eq!(space.allocate(1).unwrap(), expected);
        }

        space.free(3);
        assert_eq!(space.allocate(1).unwrap(), 3);
    }

    #[test]
    fn test_cursor_prefers_forward_progress() {
        let space = ExtentSpace::new(8, 1);
        for _ in 0..5 {
            space.allocate(1).unwrap();
        }
        space.free(1);
        // The cursor sits at 4, so the scan continues forward to 5 before
        // wrapping back to the hole at 1.
        assert_eq!(space.allocate(1).unwrap(), 5);
    }

    #[test]
    fn test_padding_bits_never_allocated() {
        let space = ExtentSpace::new(70, 1);
        let ids: HashSet<_> = (0..70).map(|_| space.allocate(1).unwrap()).collect();
        assert_eq!(ids.len(), 70);
        assert!(ids.iter().all(|&e| e < 70));
        assert!(space.allocate(1).is_err());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let space = ExtentSpace::new(4, 1);
        let e = space.allocate(1).unwrap();
        space.free(e);
        space.free(e);
    }

    #[test]
    fn test_claim_and_release_links_extent() {
        let space = ExtentSpace::new(4, 1);
        let e = space.allocate(1).unwrap();
        assert!(!space.claim_exclusive(e));

        space.release_exclusive(e);
        assert!(space.is_linked(e));
        assert!(space.test_exclusive(e));

        assert!(space.claim_exclusive(e));
        assert!(!space.claim_exclusive(e));
        assert!(space.detach(e));
        assert!(!space.detach(e));
        space.free(e);
        assert_eq!(space.live_extents(), 0);
    }

    #[test]
    fn test_fragment_counting() {
        let space = ExtentSpace::new(8, 2);
        let ids: Vec<_> = (0..5).map(|_| space.allocate(1).unwrap()).collect();

        space.release_exclusive(ids[0]);
        assert_eq!(space.fragments(), 1);
        space.release_exclusive(ids[2]);
        assert_eq!(space.fragments(), 2);
        // Filling the gap joins everything into one run.
        space.release_exclusive(ids[1]);
        assert_eq!(space.fragments(), 0);

        assert!(space.claim_exclusive(ids[1]));
        space.detach(ids[1]);
        assert_eq!(space.fragments(), 2);
        assert_eq!(space.fragments(), space.count_fragments());
    }

    #[test]
    fn test_fragment_neighbours_must_share_owner() {
        let space = ExtentSpace::new(4, 2);
        let a = space.allocate(1).unwrap();
        let b = space.allocate(2).unwrap();
        space.release_exclusive(a);
        space.release_exclusive(b);
        assert_eq!(space.fragments(), 2);
        assert_eq!(space.count_fragments(), 2);
    }

    #[test]
    fn test_live_counts() {
        let space = ExtentSpace::new(2, 1);
        let e = space.allocate(1).unwrap();
        space.add_live(e, 100);
        space.add_live(e, 50);
        assert_eq!(space.live_objects(e), 2);
        assert_eq!(space.live_bytes(e), 150);
        assert_eq!(space.sub_live(e, 100), 1);
        assert_eq!(space.sub_live(e, 50), 0);
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let space = Arc::new(ExtentSpace::new(256, 4));
        let handles: Vec<_> = (1..=4u16)
            .map(|owner| {
                let space = space.clone();
                std::thread::spawn(move || {
                    (0..64)
                        .map(|_| space.allocate(owner).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for e in h.join().unwrap() {
                assert!(all.insert(e), "extent {e} handed out twice");
            }
        }
        assert_eq!(all.len(), 256);
        let per_owner: usize = (1..=4).map(|o| space.owner_extents(o)).sum();
        assert_eq!(per_owner, space.live_extents());
        for e in 0..256 {
            assert_eq!(space.is_allocated(e), space.owner_of(e) != NO_OWNER);
        }
    }
}
