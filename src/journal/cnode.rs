//! Block records and the block version index
//!
//! A block record (cnode) is one occurrence of a block inside one
//! transaction. Records live in a fixed-capacity arena and are linked by
//! index, never by pointer:
//!
//! ```text
//!   transaction chain (next/prev)      hash chain (hnext/hprev)
//!   head ─▶ c3 ─▶ c7 ─▶ c1 ─▶ tail     bucket[h] ─▶ newest ─▶ … ─▶ oldest
//! ```
//!
//! The same hnext/hprev links serve both indexes, because a record is in
//! the open transaction's index or the in-memory lists' index, never both.

use std::ops::{Index, IndexMut};

use bytes::Bytes;

/// Buckets per index
pub const HASH_BUCKETS: usize = 8192;

/// Identity of a block across devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub dev: u32,
    pub block: u64,
}

impl BlockKey {
    pub fn new(dev: u32, block: u64) -> Self {
        Self { dev, block }
    }
}

/// Handle into the [`CnodeArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CnodeId(usize);

/// One block's membership in one transaction
#[derive(Debug, Clone)]
pub struct Cnode {
    pub key: BlockKey,
    /// Live copy; `None` once superseded or written home
    pub data: Option<Bytes>,
    /// Journal list slot, `None` while in the open transaction
    pub list: Option<usize>,
    /// Transaction that freed the block. The copy stays live until that
    /// transaction is durable, the record until checkpoint.
    pub freed_by: Option<u64>,
    /// Allocated in the open transaction and never logged before
    pub fresh: bool,
    next: Option<CnodeId>,
    prev: Option<CnodeId>,
    hnext: Option<CnodeId>,
    hprev: Option<CnodeId>,
}

impl Cnode {
    fn blank(key: BlockKey) -> Self {
        Self {
            key,
            data: None,
            list: None,
            freed_by: None,
            fresh: false,
            next: None,
            prev: None,
            hnext: None,
            hprev: None,
        }
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Pool of block records with a hard capacity
#[derive(Debug)]
pub struct CnodeArena {
    nodes: Vec<Cnode>,
    free: Vec<CnodeId>,
    capacity: usize,
}

impl CnodeArena {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Take a record from the pool; `None` when exhausted
    pub fn alloc(&mut self, key: BlockKey) -> Option<CnodeId> {
        if let Some(id) = self.free.pop() {
            self.nodes[id.0] = Cnode::blank(key);
            return Some(id);
        }
        if self.nodes.len() >= self.capacity {
            return None;
        }
        self.nodes.push(Cnode::blank(key));
        Some(CnodeId(self.nodes.len() - 1))
    }

    /// Return a record; it must already be unlinked from every chain
    pub fn release(&mut self, id: CnodeId) {
        let node = &mut self.nodes[id.0];
        node.data = None;
        node.list = None;
        self.free.push(id);
    }

    /// Records that can still be allocated
    pub fn available(&self) -> usize {
        self.capacity - self.in_use()
    }

    pub fn in_use(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

impl Index<CnodeId> for CnodeArena {
    type Output = Cnode;

    fn index(&self, id: CnodeId) -> &Cnode {
        &self.nodes[id.0]
    }
}

impl IndexMut<CnodeId> for CnodeArena {
    fn index_mut(&mut self, id: CnodeId) -> &mut Cnode {
        &mut self.nodes[id.0]
    }
}

// =============================================================================
// Transaction Chain
// =============================================================================

/// Insertion-ordered chain of the records in one transaction
#[derive(Debug, Default, Clone, Copy)]
pub struct CnodeChain {
    head: Option<CnodeId>,
    tail: Option<CnodeId>,
    len: usize,
}

impl CnodeChain {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_back(&mut self, arena: &mut CnodeArena, id: CnodeId) {
        arena[id].prev = self.tail;
        arena[id].next = None;
        match self.tail {
            Some(tail) => arena[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    pub fn remove(&mut self, arena: &mut CnodeArena, id: CnodeId) {
        let (prev, next) = (arena[id].prev, arena[id].next);
        match prev {
            Some(prev) => arena[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => arena[next].prev = prev,
            None => self.tail = prev,
        }
        arena[id].prev = None;
        arena[id].next = None;
        self.len -= 1;
    }

    /// Record ids in insertion order
    pub fn ids(&self, arena: &CnodeArena) -> Vec<CnodeId> {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = arena[id].next;
        }
        ids
    }
}

// =============================================================================
// Hash Index
// =============================================================================

/// Bucketed hash from block key to records, newest record first
#[derive(Debug)]
pub struct BlockIndex {
    buckets: Vec<Option<CnodeId>>,
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            buckets: vec![None; HASH_BUCKETS],
        }
    }

    fn bucket(key: &BlockKey) -> usize {
        ((key.block ^ (u64::from(key.dev) << 20)) as usize) & (HASH_BUCKETS - 1)
    }

    /// Link `id` at the head of its bucket so it shadows older records
    pub fn insert(&mut self, arena: &mut CnodeArena, id: CnodeId) {
        let bucket = Self::bucket(&arena[id].key);
        let head = self.buckets[bucket];
        arena[id].hnext = head;
        arena[id].hprev = None;
        if let Some(head) = head {
            arena[head].hprev = Some(id);
        }
        self.buckets[bucket] = Some(id);
    }

    pub fn remove(&mut self, arena: &mut CnodeArena, id: CnodeId) {
        let (hprev, hnext) = (arena[id].hprev, arena[id].hnext);
        match hprev {
            Some(prev) => arena[prev].hnext = hnext,
            None => {
                let bucket = Self::bucket(&arena[id].key);
                self.buckets[bucket] = hnext;
            }
        }
        if let Some(next) = hnext {
            arena[next].hprev = hprev;
        }
        arena[id].hnext = None;
        arena[id].hprev = None;
    }

    /// Newest record for `key`
    pub fn find(&self, arena: &CnodeArena, key: &BlockKey) -> Option<CnodeId> {
        let mut cursor = self.buckets[Self::bucket(key)];
        while let Some(id) = cursor {
            if arena[id].key == *key {
                return Some(id);
            }
            cursor = arena[id].hnext;
        }
        None
    }

    /// Every record for `key`, newest first
    pub fn all(&self, arena: &CnodeArena, key: &BlockKey) -> Vec<CnodeId> {
        let mut found = Vec::new();
        let mut cursor = self.find(arena, key);
        while let Some(id) = cursor {
            if arena[id].key == *key {
                found.push(id);
            }
            cursor = arena[id].hnext;
        }
        found
    }

    /// Records for the same key inserted after `id`, oldest first
    pub fn newer(&self, arena: &CnodeArena, id: CnodeId) -> Vec<CnodeId> {
        let key = arena[id].key;
        let mut found = Vec::new();
        let mut cursor = arena[id].hprev;
        while let Some(other) = cursor {
            if arena[other].key == key {
                found.push(other);
            }
            cursor = arena[other].hprev;
        }
        found
    }

    /// Records for the same key inserted before `id`, newest first
    pub fn older(&self, arena: &CnodeArena, id: CnodeId) -> Vec<CnodeId> {
        let key = arena[id].key;
        let mut found = Vec::new();
        let mut cursor = arena[id].hnext;
        while let Some(other) = cursor {
            if arena[other].key == key {
                found.push(other);
            }
            cursor = arena[other].hnext;
        }
        found
    }
}
