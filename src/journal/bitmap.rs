//! Freed-block quarantine bitmaps
//!
//! Each journal list slot owns a sparse bitmap of the blocks freed by its
//! transaction. The bitmap is split into block-sized nodes, allocated only
//! for the regions that actually see a free, and recycled through a pool.

/// One block-sized run of bits
#[derive(Debug, Clone)]
pub struct BitmapNode {
    words: Vec<u64>,
}

impl BitmapNode {
    fn new(words: usize) -> Self {
        Self {
            words: vec![0; words],
        }
    }

    fn set(&mut self, bit: usize) {
        self.words[bit / 64] |= 1 << (bit % 64);
    }

    fn test(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }
}

/// Free list of bitmap nodes, capped at `max_free` retained nodes
#[derive(Debug)]
pub struct BitmapPool {
    free: Vec<BitmapNode>,
    max_free: usize,
    words_per_node: usize,
    in_use: usize,
}

impl BitmapPool {
    pub fn new(block_size: u32, max_free: usize) -> Self {
        Self {
            free: Vec::new(),
            max_free,
            words_per_node: block_size as usize / 8,
            in_use: 0,
        }
    }

    /// Bits covered by one node
    pub fn bits_per_node(&self) -> u64 {
        self.words_per_node as u64 * 64
    }

    fn get(&mut self) -> BitmapNode {
        self.in_use += 1;
        self.free
            .pop()
            .unwrap_or_else(|| BitmapNode::new(self.words_per_node))
    }

    fn put(&mut self, mut node: BitmapNode) {
        self.in_use -= 1;
        if self.free.len() < self.max_free {
            node.clear();
            self.free.push(node);
        }
    }

    /// Nodes currently owned by list bitmaps
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Nodes waiting on the free list
    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

/// Sparse bitmap over every block of the device
#[derive(Debug, Default)]
pub struct ListBitmap {
    nodes: Vec<Option<BitmapNode>>,
    bits_per_node: u64,
    set_count: usize,
}

impl ListBitmap {
    pub fn new(device_blocks: u64, pool: &BitmapPool) -> Self {
        let bits_per_node = pool.bits_per_node();
        let slots = device_blocks.div_ceil(bits_per_node) as usize;
        Self {
            nodes: (0..slots).map(|_| None).collect(),
            bits_per_node,
            set_count: 0,
        }
    }

    fn locate(&self, block: u64) -> Option<(usize, usize)> {
        if self.bits_per_node == 0 {
            return None;
        }
        let slot = (block / self.bits_per_node) as usize;
        let bit = (block % self.bits_per_node) as usize;
        (slot < self.nodes.len()).then_some((slot, bit))
    }

    /// Mark `block` freed; returns false for blocks beyond the device
    pub fn set(&mut self, pool: &mut BitmapPool, block: u64) -> bool {
        let Some((slot, bit)) = self.locate(block) else {
            return false;
        };
        let node = self.nodes[slot].get_or_insert_with(|| pool.get());
        if !node.test(bit) {
            node.set(bit);
            self.set_count += 1;
        }
        true
    }

    pub fn test(&self, block: u64) -> bool {
        match self.locate(block) {
            Some((slot, bit)) => self.nodes[slot].as_ref().is_some_and(|node| node.test(bit)),
            None => false,
        }
    }

    /// Blocks currently marked
    pub fn len(&self) -> usize {
        self.set_count
    }

    pub fn is_empty(&self) -> bool {
        self.set_count == 0
    }

    /// Clear every bit, handing nodes back to the pool
    pub fn release(&mut self, pool: &mut BitmapPool) {
        for slot in self.nodes.iter_mut() {
            if let Some(node) = slot.take() {
                pool.put(node);
            }
        }
        self.set_count = 0;
    }
}
