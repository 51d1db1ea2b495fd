//! Index-addressed intrusive list arena.
//!
//! Every list node and every list head lives in one flat arena and is named by
//! its integer index. The arena is split into three contiguous ranges (see
//! [`Layout`]): object nodes, extent nodes and owner heads. A node is a set of
//! parallel atomic slots (`prev`, `next`, a lock bit, an owner id and a claim
//! bit), so the same table can host any number of circular lists without
//! allocating per link.
//!
//! Structural mutation always happens under the lock bit of the list head,
//! taken through [`IndexTable::lock`]. The returned [`ListGuard`] exposes the
//! pre-locked operations; the plain `insert_*`/`remove` methods on the table
//! lock and unlock the head around a single operation.

use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::thread;

use crate::owner::{OwnerId, NO_OWNER};

/// Spins before falling back to `yield_now` while waiting for a lock bit.
const SPIN_LIMIT: u32 = 64;

/// Sizes of the three index ranges of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    /// Number of object nodes, indices `[0, objects)`.
    pub objects: usize,
    /// Number of extent nodes, indices `[objects, objects + extents)`.
    pub extents: usize,
    /// Number of owner heads, indices `[objects + extents, len)`.
    pub owners: usize,
}

/// What a given index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Object(usize),
    Extent(usize),
    Owner(OwnerId),
}

impl Layout {
    pub fn new(objects: usize, extents: usize, owners: usize) -> Self {
        Self {
            objects,
            extents,
            owners,
        }
    }

    /// Total number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.objects + self.extents + self.owners
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn object(&self, object: usize) -> usize {
        debug_assert!(object < self.objects, "object {object} out of range");
        object
    }

    pub fn extent(&self, extent: usize) -> usize {
        debug_assert!(extent < self.extents, "extent {extent} out of range");
        self.objects + extent
    }

    /// Head index for an owner. Owner ids start at 1; 0 means "no owner".
    pub fn owner_head(&self, owner: OwnerId) -> usize {
        debug_assert!(
            owner != NO_OWNER && (owner as usize) <= self.owners,
            "owner {owner} out of range"
        );
        self.objects + self.extents + owner as usize - 1
    }

    /// Resolve an index to the entity it names.
    pub fn kind(&self, index: usize) -> NodeKind {
        if index < self.objects {
            NodeKind::Object(index)
        } else if index < self.objects + self.extents {
            NodeKind::Extent(index - self.objects)
        } else {
            debug_assert!(index < self.len(), "index {index} out of range");
            NodeKind::Owner((index - self.objects - self.extents + 1) as OwnerId)
        }
    }
}

/// Struct-of-arrays node storage for circular doubly linked lists.
pub struct IndexTable {
    layout: Layout,
    prev: Box<[AtomicUsize]>,
    next: Box<[AtomicUsize]>,
    locked: Box<[AtomicBool]>,
    owner: Box<[AtomicU16]>,
    claim: Box<[AtomicBool]>,
}

impl std::fmt::Debug for IndexTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexTable")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl IndexTable {
    /// Create a table where every node is an empty self-referencing ring.
    pub fn new(layout: Layout) -> Self {
        let len = layout.len();
        Self {
            layout,
            prev: (0..len).map(AtomicUsize::new).collect(),
            next: (0..len).map(AtomicUsize::new).collect(),
            locked: (0..len).map(|_| AtomicBool::new(false)).collect(),
            owner: (0..len).map(|_| AtomicU16::new(NO_OWNER)).collect(),
            claim: (0..len).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Reset a node to a detached ring. The caller must own the node.
    pub fn init_node(&self, index: usize) {
        self.prev[index].store(index, Ordering::Relaxed);
        self.next[index].store(index, Ordering::Relaxed);
        self.owner[index].store(NO_OWNER, Ordering::Relaxed);
        self.claim[index].store(false, Ordering::Relaxed);
    }

    /// Take the lock bit of `head` and return a guard for pre-locked operations.
    pub fn lock(&self, head: usize) -> ListGuard<'_> {
        self.lock_bit(head);
        ListGuard { table: self, head }
    }

    /// Try to take the lock bit of `head` without spinning.
    pub fn try_lock(&self, head: usize) -> Option<ListGuard<'_>> {
        self.locked[head]
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| ListGuard { table: self, head })
    }

    pub fn insert_head(&self, index: usize, head: usize) {
        self.lock(head).insert_head(index);
    }

    pub fn insert_tail(&self, index: usize, head: usize) {
        self.lock(head).insert_tail(index);
    }

    pub fn remove(&self, index: usize, head: usize) {
        self.lock(head).remove(index);
    }

    pub fn set_owner(&self, index: usize, owner: OwnerId) {
        debug_assert!(!matches!(self.layout.kind(index), NodeKind::Owner(_)));
        self.owner[index].store(owner, Ordering::Release);
    }

    pub fn owner(&self, index: usize) -> OwnerId {
        self.owner[index].load(Ordering::Acquire)
    }

    /// Test-and-clear the claim bit. Returns whether the caller won it.
    pub fn claim_exclusive(&self, index: usize) -> bool {
        self.claim[index].swap(false, Ordering::AcqRel)
    }

    pub fn test_exclusive(&self, index: usize) -> bool {
        self.claim[index].load(Ordering::Acquire)
    }

    pub fn release_exclusive(&self, index: usize) {
        self.claim[index].store(true, Ordering::Release);
    }

    /// Whether the node is currently linked into some list.
    pub fn is_linked(&self, index: usize) -> bool {
        self.next[index].load(Ordering::Acquire) != index
    }

    /// Unlocked forward walk. Only meaningful while the list is quiescent.
    pub fn iter(&self, head: usize) -> Iter<'_> {
        Iter::new(self, head, Direction::Forward)
    }

    fn next_of(&self, index: usize) -> usize {
        self.next[index].load(Ordering::Acquire)
    }

    fn prev_of(&self, index: usize) -> usize {
        self.prev[index].load(Ordering::Acquire)
    }

    fn lock_bit(&self, index: usize) {
        let mut spins = 0u32;
        while self.locked[index]
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if spins < SPIN_LIMIT {
                spins += 1;
                hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }

    fn unlock_bit(&self, index: usize) {
        let was = self.locked[index].swap(false, Ordering::Release);
        debug_assert!(was, "unlocking node {index} that was not locked");
    }

    /// Lock the nodes touched by a link change, in index order, skipping the
    /// already-held head and duplicates.
    fn lock_nodes(&self, head: usize, nodes: &mut [usize; 3]) -> usize {
        nodes.sort_unstable();
        let sorted = *nodes;
        let mut held = 0;
        let mut last = usize::MAX;
        for node in sorted {
            if node == head || node == last {
                continue;
            }
            self.lock_bit(node);
            last = node;
            nodes[held] = node;
            held += 1;
        }
        held
    }

    fn unlock_nodes(&self, nodes: &[usize]) {
        for &node in nodes.iter().rev() {
            self.unlock_bit(node);
        }
    }
}

/// Pre-locked view of one list. Dropping the guard releases the head lock.
pub struct ListGuard<'a> {
    table: &'a IndexTable,
    head: usize,
}

impl<'a> ListGuard<'a> {
    pub fn head(&self) -> usize {
        self.head
    }

    pub fn insert_head(&self, index: usize) {
        let next = self.table.next_of(self.head);
        self.link(index, self.head, next);
    }

    pub fn insert_tail(&self, index: usize) {
        let prev = self.table.prev_of(self.head);
        self.link(index, prev, self.head);
    }

    /// Unlink `index`. Removing the head itself is a no-op.
    pub fn remove(&self, index: usize) {
        if index == self.head {
            return;
        }
        let t = self.table;
        let prev = t.prev_of(index);
        let next = t.next_of(index);
        debug_assert!(next != index, "removing detached node {index}");

        let mut nodes = [index, prev, next];
        let held = t.lock_nodes(self.head, &mut nodes);
        t.next[prev].store(next, Ordering::Release);
        t.prev[next].store(prev, Ordering::Release);
        t.prev[index].store(index, Ordering::Release);
        t.next[index].store(index, Ordering::Release);
        t.unlock_nodes(&nodes[..held]);
    }

    pub fn is_empty(&self) -> bool {
        self.table.next_of(self.head) == self.head
    }

    /// Node right after the head (most recently inserted at head).
    pub fn first(&self) -> Option<usize> {
        let next = self.table.next_of(self.head);
        (next != self.head).then_some(next)
    }

    /// Node right before the head (the cold end of an LRU).
    pub fn last(&self) -> Option<usize> {
        let prev = self.table.prev_of(self.head);
        (prev != self.head).then_some(prev)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter::new(self.table, self.head, Direction::Forward)
    }

    pub fn iter_rev(&self) -> Iter<'_> {
        Iter::new(self.table, self.head, Direction::Reverse)
    }

    /// Forward walk that tolerates removal of the yielded node.
    pub fn iter_safe(&self) -> SafeIter<'_> {
        SafeIter::new(self.table, self.head, Direction::Forward)
    }

    /// Reverse walk that tolerates removal of the yielded node.
    pub fn iter_rev_safe(&self) -> SafeIter<'_> {
        SafeIter::new(self.table, self.head, Direction::Reverse)
    }

    fn link(&self, index: usize, prev: usize, next: usize) {
        let t = self.table;
        debug_assert!(index != self.head, "linking head {index} into itself");
        debug_assert!(
            t.next_of(index) == index,
            "node {index} is already linked"
        );

        let mut nodes = [index, prev, next];
        let held = t.lock_nodes(self.head, &mut nodes);
        t.next[index].store(next, Ordering::Release);
        t.prev[index].store(prev, Ordering::Release);
        t.prev[next].store(index, Ordering::Release);
        t.next[prev].store(index, Ordering::Release);
        t.unlock_nodes(&nodes[..held]);
    }
}

impl Drop for ListGuard<'_> {
    fn drop(&mut self) {
        self.table.unlock_bit(self.head);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

fn step(table: &IndexTable, index: usize, dir: Direction) -> usize {
    match dir {
        Direction::Forward => table.next_of(index),
        Direction::Reverse => table.prev_of(index),
    }
}

/// Lazy walk from the head around the ring. The successor is read when the
/// next item is requested, so the yielded node must stay linked meanwhile.
#[derive(Clone)]
pub struct Iter<'a> {
    table: &'a IndexTable,
    head: usize,
    cursor: usize,
    dir: Direction,
}

impl<'a> Iter<'a> {
    fn new(table: &'a IndexTable, head: usize, dir: Direction) -> Self {
        Self {
            table,
            head,
            cursor: head,
            dir,
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let next = step(self.table, self.cursor, self.dir);
        if next == self.head {
            return None;
        }
        self.cursor = next;
        Some(next)
    }
}

/// Walk that snapshots the successor before yielding each node.
#[derive(Clone)]
pub struct SafeIter<'a> {
    table: &'a IndexTable,
    head: usize,
    upcoming: usize,
    dir: Direction,
}

impl<'a> SafeIter<'a> {
    fn new(table: &'a IndexTable, head: usize, dir: Direction) -> Self {
        Self {
            table,
            head,
            upcoming: step(table, head, dir),
            dir,
        }
    }
}

impl Iterator for SafeIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.upcoming == self.head {
            return None;
        }
        let current = self.upcoming;
        self.upcoming = step(self.table, current, self.dir);
        Some(current)
    }
}
