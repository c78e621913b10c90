//! A single 16 MiB buddy-tree chunk: the unit an [`crate::memory::arena::Arena`]
//! grows by, grounded in the teacher's `BuddyAllocator` in
//! `memory/allocator/zones.rs` but reworked into Netty's complete-binary-tree
//! encoding so sub-page requests share a single tree instead of a parallel
//! free-list-per-order structure.

use parking_lot::Mutex;
use std::sync::Arc;

use super::region::Region;
use super::subpage::{FreeResult as SubpageFreeResult, Subpage};

/// Opaque locator for a live allocation, meaningful only to the chunk that
/// issued it. Layout: bit 63 = is-subpage flag, bits 32..63 = bitmap index
/// within the subpage, bits 0..32 = memory-map node index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

const SUBPAGE_FLAG: u64 = 1 << 63;
const IDX_MASK: u64 = 0xFFFF_FFFF;

impl Handle {
    fn new_run(memory_map_idx: u32) -> Self {
        Self(memory_map_idx as u64)
    }

    fn new_subpage(memory_map_idx: u32, bitmap_idx: u32) -> Self {
        Self((memory_map_idx as u64) | ((bitmap_idx as u64) << 32) | SUBPAGE_FLAG)
    }

    fn memory_map_idx(self) -> u32 {
        (self.0 & IDX_MASK) as u32
    }

    fn bitmap_idx(self) -> u32 {
        ((self.0 >> 32) & 0x7FFF_FFFF) as u32
    }

    fn is_subpage(self) -> bool {
        self.0 & SUBPAGE_FLAG != 0
    }

    /// Sentinel handle for unpooled chunks, where the whole region is the
    /// allocation and there is no tree node to locate.
    pub fn whole_region() -> Self {
        Self::new_run(0)
    }
}

struct ChunkMeta {
    memory_map: Vec<u8>,
    free_bytes: usize,
    /// Indexed by `leaf_idx - leaves`; `Some` while a page hosts a live subpage.
    subpages: Vec<Option<Arc<Subpage>>>,
}

pub struct Chunk {
    region: Region,
    page_size: usize,
    max_order: u8,
    chunk_size: usize,
    leaves: u32,
    unpooled: bool,
    meta: Mutex<ChunkMeta>,
}

impl Chunk {
    pub fn new_pooled(page_size: usize, max_order: u8) -> Option<Self> {
        let leaves = 1u32 << max_order;
        let chunk_size = page_size * leaves as usize;
        let region = Region::alloc(chunk_size)?;
        let mut memory_map = vec![0u8; (2 * leaves) as usize];
        for id in 1..(2 * leaves) {
            memory_map[id as usize] = depth(id);
        }
        Some(Self {
            region,
            page_size,
            max_order,
            chunk_size,
            leaves,
            unpooled: false,
            meta: Mutex::new(ChunkMeta {
                memory_map,
                free_bytes: chunk_size,
                subpages: (0..leaves).map(|_| None).collect(),
            }),
        })
    }

    pub fn new_unpooled(capacity: usize) -> Option<Self> {
        let region = Region::alloc(capacity)?;
        Some(Self {
            region,
            page_size: capacity,
            max_order: 0,
            chunk_size: capacity,
            leaves: 1,
            unpooled: true,
            meta: Mutex::new(ChunkMeta { memory_map: Vec::new(), free_bytes: 0, subpages: Vec::new() }),
        })
    }

    pub fn is_unpooled(&self) -> bool {
        self.unpooled
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Percentage of this chunk's bytes currently allocated, 0..=100.
    pub fn usage(&self) -> u32 {
        let meta = self.meta.lock();
        if self.chunk_size == 0 {
            return 0;
        }
        (((self.chunk_size - meta.free_bytes) as u64 * 100) / self.chunk_size as u64) as u32
    }

    fn size_for_depth(&self, d: u8) -> usize {
        self.chunk_size >> d
    }

    /// Allocates a run of whole pages. `pages` must be a power of two and
    /// `pages * page_size <= chunk_size`.
    pub fn allocate_run(&self, pages: u32) -> Option<Handle> {
        debug_assert!(pages.is_power_of_two());
        let d = self.max_order - pages.trailing_zeros() as u8;
        let mut meta = self.meta.lock();
        let idx = alloc_node(&mut meta.memory_map, self.max_order, d)?;
        meta.free_bytes -= self.size_for_depth(d);
        Some(Handle::new_run(idx))
    }

    /// Allocates one element of `elem_size` from a subpage, creating a fresh
    /// subpage (by claiming one leaf page) if no existing subpage for this
    /// size class is passed in.
    pub fn allocate_subpage_in(&self, subpage: &Arc<Subpage>) -> Option<Handle> {
        let result = subpage.allocate()?;
        let leaf_idx = self.leaves + subpage.page_index as u32;
        Some(Handle::new_subpage(leaf_idx, result.bit_index))
    }

    /// Claims a fresh leaf page and installs a new subpage of `elem_size` on it.
    pub fn new_subpage(&self, elem_size: usize) -> Option<(Handle, Arc<Subpage>)> {
        let mut meta = self.meta.lock();
        let leaf_idx = alloc_node(&mut meta.memory_map, self.max_order, self.max_order)?;
        meta.free_bytes -= self.page_size;
        let page_index = (leaf_idx - self.leaves) as usize;
        let subpage = Arc::new(Subpage::new(page_index, elem_size, self.page_size));
        meta.subpages[page_index] = Some(Arc::clone(&subpage));
        let result = subpage.allocate().expect("freshly created subpage has free slots");
        Some((Handle::new_subpage(leaf_idx, result.bit_index), subpage))
    }

    pub fn offset_of(&self, handle: Handle) -> usize {
        if self.unpooled {
            return 0;
        }
        if handle.is_subpage() {
            let page_index = (handle.memory_map_idx() - self.leaves) as usize;
            let meta = self.meta.lock();
            let subpage = meta.subpages[page_index].as_ref().expect("subpage handle without subpage");
            page_index * self.page_size + handle.bitmap_idx() as usize * subpage.elem_size
        } else {
            let id = handle.memory_map_idx();
            let d = depth(id);
            let size = self.size_for_depth(d);
            let leaves_at_depth = 1u32 << d;
            let idx_within_depth = id - leaves_at_depth;
            idx_within_depth as usize * size
        }
    }

    /// Releases `handle`. Returns `Some((subpage, freed_subpage_result))`
    /// when the handle pointed into a subpage, so the arena can update its
    /// own per-size-class free lists without having to re-locate the
    /// subpage by size class.
    pub fn free(&self, handle: Handle) -> Option<(Arc<Subpage>, SubpageFreeResult)> {
        if self.unpooled {
            return None;
        }
        if handle.is_subpage() {
            let leaf_idx = handle.memory_map_idx();
            let page_index = (leaf_idx - self.leaves) as usize;
            let mut meta = self.meta.lock();
            let subpage = meta.subpages[page_index].clone().expect("subpage handle without subpage");
            drop(meta);
            let result = subpage.free(handle.bitmap_idx());
            if result.destroyed {
                let mut meta = self.meta.lock();
                meta.subpages[page_index] = None;
                free_node(&mut meta.memory_map, leaf_idx);
                meta.free_bytes += self.page_size;
            }
            Some((subpage, result))
        } else {
            let id = handle.memory_map_idx();
            let d = depth(id);
            let mut meta = self.meta.lock();
            free_node(&mut meta.memory_map, id);
            meta.free_bytes += self.size_for_depth(d);
            None
        }
    }
}

fn depth(id: u32) -> u8 {
    debug_assert!(id >= 1);
    (31 - id.leading_zeros()) as u8
}

/// Descends the tree from the root, at each step choosing the left child if
/// it can satisfy depth `d`, otherwise the right. Marks the taken node
/// unusable and propagates `min(left, right)` back up to the root.
fn alloc_node(mmap: &mut [u8], max_order: u8, d: u8) -> Option<u32> {
    let mut id: u32 = 1;
    let mut cur_depth: u8 = 0;
    if mmap[1] > d {
        return None;
    }
    while cur_depth < d {
        let left = id * 2;
        let right = left + 1;
        id = if mmap[left as usize] <= d { left } else { right };
        cur_depth += 1;
    }
    mmap[id as usize] = max_order + 1;
    propagate_up(mmap, id);
    Some(id)
}

/// Inverts `alloc_node`: restores `id`'s natural depth, then walks up
/// writing `min(left, right)` at each ancestor.
fn free_node(mmap: &mut [u8], id: u32) {
    mmap[id as usize] = depth(id);
    propagate_up(mmap, id);
}

/// Writes `min(left, right)` at the parent, the same as `alloc_node` does
/// while descending — except when both siblings are back to their own
/// natural depth (fully free, nothing allocated anywhere beneath either),
/// in which case the pair is mergeable and the parent collapses to *its*
/// natural depth instead. Without this collapse branch a parent whose
/// children were both freed would get stuck at `depth(left)` forever,
/// since `min` of two equal natural depths is just that depth again, one
/// level too deep for the parent to ever be offered to a same-sized or
/// larger request. Mirrors the teacher's buddy-offset merge in
/// `memory/allocator/zones.rs`.
fn propagate_up(mmap: &mut [u8], mut id: u32) {
    while id > 1 {
        let parent = id / 2;
        let left = parent * 2;
        let right = left + 1;
        let l = mmap[left as usize];
        let r = mmap[right as usize];
        mmap[parent as usize] = if l == depth(left) && r == depth(right) { depth(parent) } else { l.min(r) };
        id = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_chunk() -> Chunk {
        // page_size=64, max_order=4 -> 16 leaves, 1024-byte chunk; small
        // enough to exercise exhaustion without allocating megabytes in tests.
        Chunk::new_pooled(64, 4).unwrap()
    }

    #[test]
    fn allocates_whole_chunk_as_one_run() {
        let c = small_chunk();
        let h = c.allocate_run(16).unwrap();
        assert_eq!(c.usage(), 100);
        assert!(c.allocate_run(1).is_none());
        c.free(h);
        assert_eq!(c.usage(), 0);
    }

    #[test]
    fn splits_and_merges_buddies() {
        let c = small_chunk();
        let a = c.allocate_run(4).unwrap();
        let b = c.allocate_run(4).unwrap();
        let d = c.allocate_run(8).unwrap();
        assert_eq!(c.usage(), 100);
        c.free(a);
        c.free(b);
        c.free(d);
        assert_eq!(c.usage(), 0);
        // After freeing everything the chunk must be able to satisfy a
        // full-chunk request again, proving the buddies fully re-merged.
        let whole = c.allocate_run(16).unwrap();
        assert_eq!(c.usage(), 100);
        c.free(whole);
    }

    #[test]
    fn distinct_runs_get_distinct_offsets() {
        let c = small_chunk();
        let a = c.allocate_run(1).unwrap();
        let b = c.allocate_run(1).unwrap();
        assert_ne!(c.offset_of(a), c.offset_of(b));
    }

    #[test]
    fn subpage_allocations_share_one_page() {
        let c = small_chunk();
        let (h1, sp) = c.new_subpage(16).unwrap();
        let h2 = c.allocate_subpage_in(&sp).unwrap();
        assert_ne!(c.offset_of(h1), c.offset_of(h2));
        assert_eq!(c.offset_of(h1) / 64, c.offset_of(h2) / 64);
    }

    #[test]
    fn freeing_last_subpage_slot_returns_page_to_tree() {
        let c = small_chunk();
        let (h1, sp) = c.new_subpage(64).unwrap();
        assert_eq!(sp.num_slots, 1);
        let usage_with_page = c.usage();
        let (_, result) = c.free(h1).unwrap();
        assert!(result.destroyed);
        assert!(c.usage() < usage_with_page);
    }

    #[test]
    fn unpooled_chunk_has_no_tree_bookkeeping() {
        let c = Chunk::new_unpooled(1 << 20).unwrap();
        assert!(c.is_unpooled());
        assert_eq!(c.chunk_size(), 1 << 20);
    }
}
