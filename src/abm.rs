//! Active Block Manager: authoritative store for per-block state.
//!
//! Pure bookkeeping, no I/O — mirrors the discipline in
//! `kernel/src/memory/frame_allocator.rs`, where a single lock guards a
//! flat table of metadata and every mutation goes through a narrow set of
//! functions rather than letting callers poke fields directly.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::geometry::Geometry;

/// Lifecycle state of one block (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    Clean,
    Dirty,
    Dirty4kb,
    Bad,
}

/// Validity of one sub-page slot within a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubpageState {
    NotInvalid,
    Valid,
    Invalid,
}

/// A block identity: (channel, chip, block). Carries no ownership — look
/// block metadata up by this id rather than holding a reference to it, the
/// same way GC/recycle/compaction request descriptors reference their
/// owning batch by id rather than by pointer (design note on cyclic
/// references).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pub channel_no: u32,
    pub chip_no: u32,
    pub block_no: u32,
}

impl BlockId {
    pub fn new(channel_no: u32, chip_no: u32, block_no: u32) -> Self {
        BlockId { channel_no, chip_no, block_no }
    }

    fn die(&self, geometry: &Geometry) -> u32 {
        geometry.punit_id(self.channel_no, self.chip_no)
    }
}

/// Per-block metadata (spec.md §3).
#[derive(Debug, Clone)]
pub struct BlockMeta {
    pub id: BlockId,
    pub state: BlockState,
    /// `pst[page * K + sub]`.
    pub pst: Vec<SubpageState>,
    pub nr_invalid_subpages: usize,
}

impl BlockMeta {
    fn new(id: BlockId, nr_subpages: usize) -> Self {
        BlockMeta {
            id,
            state: BlockState::Free,
            pst: vec![SubpageState::NotInvalid; nr_subpages],
            nr_invalid_subpages: 0,
        }
    }

    fn nr_valid_subpages(&self) -> usize {
        self.pst.iter().filter(|s| matches!(s, SubpageState::Valid)).count()
    }
}

/// Per-die intrusive-list state (modeled as owned index deques rather than
/// real intrusive links, since Rust has no safe back-pointer for that).
struct DieLists {
    free: VecDeque<u32>,
    clean: VecDeque<u32>,
    dirty: VecDeque<u32>,
    dirty_4kb: VecDeque<u32>,
}

impl DieLists {
    fn new() -> Self {
        DieLists {
            free: VecDeque::new(),
            clean: VecDeque::new(),
            dirty: VecDeque::new(),
            dirty_4kb: VecDeque::new(),
        }
    }

    fn list_mut(&mut self, state: BlockState) -> Option<&mut VecDeque<u32>> {
        match state {
            BlockState::Free => Some(&mut self.free),
            BlockState::Clean => Some(&mut self.clean),
            BlockState::Dirty => Some(&mut self.dirty),
            BlockState::Dirty4kb => Some(&mut self.dirty_4kb),
            BlockState::Bad => None,
        }
    }

    fn remove_from(&mut self, state: BlockState, block_no: u32) {
        if let Some(list) = self.list_mut(state) {
            if let Some(pos) = list.iter().position(|&b| b == block_no) {
                list.remove(pos);
            }
        }
    }
}

struct AbmInner {
    blocks: Vec<BlockMeta>,
    dies: Vec<DieLists>,
}

/// Active Block Manager.
pub struct Abm {
    geometry: Geometry,
    inner: Mutex<AbmInner>,
}

impl Abm {
    /// Allocates every block in `FREE` state. `persist` is a hook point for
    /// the external bad-block persistence file (out of scope here, see
    /// `SPEC_FULL.md` §1 Non-goals); when `true`, callers are expected to
    /// follow up with [`Abm::mark_bad`] calls reconstructed from that file.
    pub fn create(geometry: Geometry, _persist: bool) -> Self {
        let nr_dies = geometry.nr_punits() as usize;
        let nr_subpages = geometry.nr_subpages_per_block() as usize;
        let mut dies: Vec<DieLists> = (0..nr_dies).map(|_| DieLists::new()).collect();
        let mut blocks = Vec::with_capacity(geometry.nr_total_blocks() as usize);

        for punit in 0..nr_dies as u32 {
            let (ch, chip) = geometry.punit_to_channel_chip(punit);
            for blk in 0..geometry.nr_blocks_per_die() {
                blocks.push(BlockMeta::new(BlockId::new(ch, chip, blk), nr_subpages));
                dies[punit as usize].free.push_back(blk);
            }
        }

        Abm { geometry, inner: Mutex::new(AbmInner { blocks, dies }) }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn get_block(&self, id: BlockId) -> BlockMeta {
        let inner = self.inner.lock().unwrap();
        inner.blocks[self.geometry.block_index(id.channel_no, id.chip_no, id.block_no)].clone()
    }

    /// Reserves the head FREE block of `(channel, chip)`, removing it from
    /// the free list without changing its recorded state. Returns `None`
    /// if the die has no free blocks left.
    pub fn get_free_block_prepare(&self, channel_no: u32, chip_no: u32) -> Option<BlockId> {
        let die = self.geometry.punit_id(channel_no, chip_no) as usize;
        let mut inner = self.inner.lock().unwrap();
        let blk = inner.dies[die].free.pop_front()?;
        Some(BlockId::new(channel_no, chip_no, blk))
    }

    /// Transitions a block reserved via [`Abm::get_free_block_prepare`] from
    /// FREE to CLEAN and inserts it into that die's CLEAN list.
    pub fn get_free_block_commit(&self, id: BlockId) {
        let die = id.die(&self.geometry) as usize;
        let idx = self.geometry.block_index(id.channel_no, id.chip_no, id.block_no);
        let mut inner = self.inner.lock().unwrap();
        assert_eq!(
            inner.blocks[idx].state,
            BlockState::Free,
            "get_free_block_commit on a block not in FREE state"
        );
        inner.blocks[idx].state = BlockState::Clean;
        inner.dies[die].clean.push_back(id.block_no);
    }

    fn subpage_slot(&self, page_no: u32, sub: u32) -> usize {
        (page_no * self.geometry.subpages_per_page + sub) as usize
    }

    /// Flips `pst[page * K + sub]` from NOT_INVALID to VALID. Transitions
    /// CLEAN -> DIRTY_4KB on the first 4KB write to the block.
    pub fn validate_page_4kb(&self, id: BlockId, page_no: u32, sub: u32) {
        let die = id.die(&self.geometry) as usize;
        let idx = self.geometry.block_index(id.channel_no, id.chip_no, id.block_no);
        let slot = self.subpage_slot(page_no, sub);
        let mut inner = self.inner.lock().unwrap();

        let state = inner.blocks[idx].state;
        assert!(
            matches!(state, BlockState::Clean | BlockState::Dirty4kb),
            "validate_page_4kb on a block not CLEAN/DIRTY_4KB (was {:?})",
            state
        );
        assert_eq!(
            inner.blocks[idx].pst[slot],
            SubpageState::NotInvalid,
            "double-write to sub-page column (block {:?}, page {page_no}, sub {sub})",
            id,
        );
        inner.blocks[idx].pst[slot] = SubpageState::Valid;

        if state == BlockState::Clean {
            inner.blocks[idx].state = BlockState::Dirty4kb;
            inner.dies[die].remove_from(BlockState::Clean, id.block_no);
            inner.dies[die].dirty_4kb.push_back(id.block_no);
        }
    }

    /// Flips `pst[page * K + sub]` from NOT_INVALID to VALID in the normal
    /// (16KB) stream, transitioning CLEAN -> DIRTY on first write.
    pub fn validate_page_16kb(&self, id: BlockId, page_no: u32, sub: u32) {
        let die = id.die(&self.geometry) as usize;
        let idx = self.geometry.block_index(id.channel_no, id.chip_no, id.block_no);
        let slot = self.subpage_slot(page_no, sub);
        let mut inner = self.inner.lock().unwrap();

        let state = inner.blocks[idx].state;
        assert!(
            matches!(state, BlockState::Clean | BlockState::Dirty),
            "validate_page_16kb on a block not CLEAN/DIRTY (was {:?})",
            state
        );
        assert_eq!(
            inner.blocks[idx].pst[slot],
            SubpageState::NotInvalid,
            "double-write to sub-page column (block {:?}, page {page_no}, sub {sub})",
            id,
        );
        inner.blocks[idx].pst[slot] = SubpageState::Valid;

        if state == BlockState::Clean {
            inner.blocks[idx].state = BlockState::Dirty;
            inner.dies[die].remove_from(BlockState::Clean, id.block_no);
            inner.dies[die].dirty.push_back(id.block_no);
        }
    }

    /// Flips `pst[page * K + sub]` from VALID to INVALID. Idempotent if the
    /// slot is already INVALID.
    pub fn invalidate_page(&self, id: BlockId, page_no: u32, sub: u32) {
        let idx = self.geometry.block_index(id.channel_no, id.chip_no, id.block_no);
        let slot = self.subpage_slot(page_no, sub);
        let mut inner = self.inner.lock().unwrap();

        match inner.blocks[idx].pst[slot] {
            SubpageState::Invalid => {}
            SubpageState::Valid => {
                inner.blocks[idx].pst[slot] = SubpageState::Invalid;
                inner.blocks[idx].nr_invalid_subpages += 1;
            }
            SubpageState::NotInvalid => {
                panic!(
                    "invalidate_page on a never-written sub-page (block {:?}, page {page_no}, sub {sub})",
                    id
                );
            }
        }
    }

    /// Requires the caller has quiesced the block (no remaining VALID
    /// sub-pages). Clears `pst`, resets the invalid counter, and
    /// transitions to FREE or BAD.
    pub fn erase_block(&self, id: BlockId, is_bad: bool) {
        let die = id.die(&self.geometry) as usize;
        let idx = self.geometry.block_index(id.channel_no, id.chip_no, id.block_no);
        let mut inner = self.inner.lock().unwrap();

        assert_eq!(
            inner.blocks[idx].nr_valid_subpages(),
            0,
            "erase_block on a block with remaining VALID sub-pages"
        );

        let old_state = inner.blocks[idx].state;
        assert_ne!(old_state, BlockState::Free, "double-erase of a FREE block");
        assert_ne!(old_state, BlockState::Bad, "double-erase of a BAD block");
        inner.dies[die].remove_from(old_state, id.block_no);

        for s in inner.blocks[idx].pst.iter_mut() {
            *s = SubpageState::NotInvalid;
        }
        inner.blocks[idx].nr_invalid_subpages = 0;

        if is_bad {
            inner.blocks[idx].state = BlockState::Bad;
        } else {
            inner.blocks[idx].state = BlockState::Free;
            inner.dies[die].free.push_back(id.block_no);
        }
    }

    /// Snapshot of the dirty (16KB-stream) list for one die.
    pub fn dirty_blocks(&self, punit: u32) -> Vec<BlockMeta> {
        let inner = self.inner.lock().unwrap();
        inner.dies[punit as usize]
            .dirty
            .iter()
            .map(|&blk| {
                let (ch, chip) = self.geometry.punit_to_channel_chip(punit);
                inner.blocks[self.geometry.block_index(ch, chip, blk)].clone()
            })
            .collect()
    }

    /// Snapshot of the dirty-4KB list for one die.
    pub fn dirty_4kb_blocks(&self, punit: u32) -> Vec<BlockMeta> {
        let inner = self.inner.lock().unwrap();
        inner.dies[punit as usize]
            .dirty_4kb
            .iter()
            .map(|&blk| {
                let (ch, chip) = self.geometry.punit_to_channel_chip(punit);
                inner.blocks[self.geometry.block_index(ch, chip, blk)].clone()
            })
            .collect()
    }

    pub fn nr_free_blocks(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.dies.iter().map(|d| d.free.len() as u64).sum()
    }

    pub fn nr_dirty_4kb_blocks(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.dies.iter().map(|d| d.dirty_4kb.len() as u64).sum()
    }

    pub fn nr_total_blocks(&self) -> u64 {
        self.geometry.nr_total_blocks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geo() -> Geometry {
        Geometry::new(4, 8, 4, 4, 4).unwrap()
    }

    #[test]
    fn prepare_then_commit_transitions_free_to_clean() {
        let abm = Abm::create(geo(), false);
        let id = abm.get_free_block_prepare(0, 0).unwrap();
        assert_eq!(abm.get_block(id).state, BlockState::Free);
        abm.get_free_block_commit(id);
        assert_eq!(abm.get_block(id).state, BlockState::Clean);
    }

    #[test]
    fn validate_then_invalidate_tracks_counter() {
        let abm = Abm::create(geo(), false);
        let id = abm.get_free_block_prepare(1, 2).unwrap();
        abm.get_free_block_commit(id);
        abm.validate_page_16kb(id, 0, 0);
        abm.validate_page_16kb(id, 0, 1);
        assert_eq!(abm.get_block(id).state, BlockState::Dirty);

        abm.invalidate_page(id, 0, 0);
        let meta = abm.get_block(id);
        assert_eq!(meta.nr_invalid_subpages, 1);
        // idempotent
        abm.invalidate_page(id, 0, 0);
        assert_eq!(abm.get_block(id).nr_invalid_subpages, 1);
    }

    #[test]
    #[should_panic(expected = "double-write")]
    fn double_validate_panics() {
        let abm = Abm::create(geo(), false);
        let id = abm.get_free_block_prepare(0, 0).unwrap();
        abm.get_free_block_commit(id);
        abm.validate_page_16kb(id, 0, 0);
        abm.validate_page_16kb(id, 0, 0);
    }

    #[test]
    fn erase_resets_and_frees() {
        let abm = Abm::create(geo(), false);
        let id = abm.get_free_block_prepare(0, 0).unwrap();
        abm.get_free_block_commit(id);
        abm.validate_page_16kb(id, 0, 0);
        abm.invalidate_page(id, 0, 0);
        abm.erase_block(id, false);
        let meta = abm.get_block(id);
        assert_eq!(meta.state, BlockState::Free);
        assert_eq!(meta.nr_invalid_subpages, 0);
        assert!(meta.pst.iter().all(|s| matches!(s, SubpageState::NotInvalid)));
    }

    #[test]
    fn bad_block_never_returned_again() {
        let abm = Abm::create(geo(), false);
        let id = abm.get_free_block_prepare(0, 0).unwrap();
        abm.get_free_block_commit(id);
        abm.validate_page_16kb(id, 0, 0);
        abm.invalidate_page(id, 0, 0);
        abm.erase_block(id, true);
        assert_eq!(abm.get_block(id).state, BlockState::Bad);

        // Drain the rest of the die's free list and confirm this block
        // never reappears.
        while let Some(other) = abm.get_free_block_prepare(0, 0) {
            assert_ne!(other, id);
        }
    }
}
