//! Splits one page of a [`crate::memory::chunk::Chunk`] into fixed-size
//! elements for allocations smaller than a page. Bitmap-tracked free slots;
//! `doNotDestroy` (here: `SubpageState::live`) holds true for as long as any
//! slot is taken, mirroring the invariant in §3.

use parking_lot::Mutex;

pub struct Subpage {
    /// Index of the owning page within the chunk (`pageSize`-sized units).
    pub page_index: usize,
    /// Fixed element size served by this subpage.
    pub elem_size: usize,
    pub num_slots: u32,
    state: Mutex<SubpageState>,
}

struct SubpageState {
    bitmap: Vec<u64>,
    free_count: u32,
    /// True while any slot is allocated; cleared only once the subpage is
    /// fully empty and about to be torn down.
    live: bool,
}

pub struct AllocResult {
    pub bit_index: u32,
    /// True if this allocation just filled the last free slot.
    pub became_full: bool,
}

pub struct FreeResult {
    /// True if this free just emptied the subpage entirely (the owning page
    /// should be returned to the chunk's buddy tree).
    pub destroyed: bool,
    /// True if this free transitioned the subpage from "full, unlinked from
    /// any arena free list" to "has a free slot again".
    pub became_available: bool,
}

impl Subpage {
    pub fn new(page_index: usize, elem_size: usize, page_size: usize) -> Self {
        let num_slots = (page_size / elem_size) as u32;
        let words = ((num_slots as usize) + 63) / 64;
        Self {
            page_index,
            elem_size,
            num_slots,
            state: Mutex::new(SubpageState {
                bitmap: vec![0u64; words.max(1)],
                free_count: num_slots,
                live: true,
            }),
        }
    }

    pub fn allocate(&self) -> Option<AllocResult> {
        let mut state = self.state.lock();
        if state.free_count == 0 {
            return None;
        }
        let bit = find_first_clear(&state.bitmap, self.num_slots)?;
        let word = (bit / 64) as usize;
        state.bitmap[word] |= 1u64 << (bit % 64);
        state.free_count -= 1;
        state.live = true;
        Some(AllocResult { bit_index: bit, became_full: state.free_count == 0 })
    }

    pub fn free(&self, bit_index: u32) -> FreeResult {
        let mut state = self.state.lock();
        let word = (bit_index / 64) as usize;
        let mask = 1u64 << (bit_index % 64);
        debug_assert!(state.bitmap[word] & mask != 0, "double free of subpage slot {bit_index}");
        state.bitmap[word] &= !mask;
        let was_full = state.free_count == 0;
        state.free_count += 1;
        let destroyed = state.free_count == self.num_slots;
        if destroyed {
            state.live = false;
        }
        FreeResult { destroyed, became_available: was_full && !destroyed }
    }

    pub fn is_live(&self) -> bool {
        self.state.lock().live
    }
}

fn find_first_clear(bitmap: &[u64], num_slots: u32) -> Option<u32> {
    for (word_idx, word) in bitmap.iter().enumerate() {
        if *word != u64::MAX {
            let bit = word.trailing_ones();
            let idx = word_idx as u32 * 64 + bit;
            if idx < num_slots {
                return Some(idx);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_all_slots_then_refuses() {
        let sp = Subpage::new(0, 16, 8192);
        assert_eq!(sp.num_slots, 512);
        let mut bits = Vec::new();
        for _ in 0..512 {
            bits.push(sp.allocate().unwrap().bit_index);
        }
        assert!(sp.allocate().is_none());
        bits.sort_unstable();
        let expected: Vec<u32> = (0..512).collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn free_reopens_slot_and_reports_transition() {
        let sp = Subpage::new(0, 4096, 8192);
        assert_eq!(sp.num_slots, 2);
        let a = sp.allocate().unwrap();
        assert!(!a.became_full);
        let b = sp.allocate().unwrap();
        assert!(b.became_full);

        let r = sp.free(a.bit_index);
        assert!(!r.destroyed);
        assert!(r.became_available);

        let r2 = sp.free(b.bit_index);
        assert!(r2.destroyed);
        assert!(!sp.is_live());
    }
}
