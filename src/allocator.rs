//! Active-block allocator: three independent write-stream cursors
//! round-robining a monotonic (parallel unit, page offset) position across
//! every die (spec.md §4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::abm::{Abm, BlockId};
use crate::addr::{PhyAddr, Stream};
use crate::error::FtlError;
use crate::geometry::Geometry;

/// The pool cap (`POOL_SIZE`) gating when the fine-grained stream hands
/// its die slots to the recycle engine instead of requesting fresh FREE
/// blocks. Shared between the allocator and the recycle engine (the latter
/// may widen or tighten it — spec.md §4.5).
pub struct PoolCap {
    percent: AtomicU64,
}

impl PoolCap {
    pub const DEFAULT_PERCENT: u64 = 60;

    pub fn new() -> Self {
        PoolCap { percent: AtomicU64::new(Self::DEFAULT_PERCENT) }
    }

    pub fn percent(&self) -> u64 {
        self.percent.load(Ordering::Relaxed)
    }

    pub fn max_dirty_4kb_blks(&self, total_blocks: u64) -> u64 {
        total_blocks * self.percent() / 100
    }

    pub fn widen(&self) {
        self.percent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tighten(&self) {
        let _ = self.percent.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| {
            if p > 5 {
                Some(p - 1)
            } else {
                None
            }
        });
    }
}

/// Outcome of an allocation attempt that could not immediately produce a
/// physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStall {
    /// No free blocks remain on some die; the caller should run GC and
    /// retry.
    NeedsGc,
    /// The fine-grained pool is over its cap; the caller should run the
    /// recycle engine and retry.
    NeedsRecycle,
}

struct Cursor {
    curr_punit: u32,
    curr_page_ofs: u32,
    /// Active block handle per die, indexed by punit.
    active: Vec<Option<BlockId>>,
    /// Set when the previous call served the last page of the current
    /// generation of active blocks. The refresh (or, for the fine stream,
    /// the recycle cap check) this implies is deferred to the top of the
    /// *next* call, so the PPA that triggered the wrap is always returned
    /// rather than dropped on a stall.
    pending_refresh: bool,
}

impl Cursor {
    fn new(nr_punits: u32) -> Self {
        Cursor {
            curr_punit: 0,
            curr_page_ofs: 0,
            active: vec![None; nr_punits as usize],
            pending_refresh: false,
        }
    }
}

pub struct ActiveBlockAllocator {
    geometry: Geometry,
    normal: Mutex<Cursor>,
    fine: Mutex<Cursor>,
    compaction: Mutex<Cursor>,
    pub pool_cap: PoolCap,
}

impl ActiveBlockAllocator {
    pub fn new(geometry: Geometry) -> Self {
        let n = geometry.nr_punits();
        ActiveBlockAllocator {
            geometry,
            normal: Mutex::new(Cursor::new(n)),
            fine: Mutex::new(Cursor::new(n)),
            compaction: Mutex::new(Cursor::new(n)),
            pool_cap: PoolCap::new(),
        }
    }

    fn cursor(&self, stream: Stream) -> &Mutex<Cursor> {
        match stream {
            Stream::Normal => &self.normal,
            Stream::Fine => &self.fine,
            Stream::Compaction => &self.compaction,
        }
    }

    /// Acquires and commits one FREE block per die for the given cursor.
    /// Returns `Err(NeedsGc)` if any die has no FREE block left, leaving
    /// already-acquired dies committed (matching the original: a partial
    /// refresh is still progress, the caller retries after GC).
    fn refresh_all_dies(&self, abm: &Abm, cursor: &mut Cursor) -> Result<(), AllocStall> {
        for punit in 0..self.geometry.nr_punits() {
            let (ch, chip) = self.geometry.punit_to_channel_chip(punit);
            let id = abm.get_free_block_prepare(ch, chip).ok_or(AllocStall::NeedsGc)?;
            abm.get_free_block_commit(id);
            cursor.active[punit as usize] = Some(id);
        }
        Ok(())
    }

    /// spec.md §4.3's per-stream allocation algorithm.
    pub fn get_free_ppa(&self, abm: &Abm, stream: Stream) -> Result<PhyAddr, AllocStall> {
        let mut cursor = self.cursor(stream).lock().unwrap();

        // First-ever allocation: every die starts with no active block.
        if cursor.active.iter().all(Option::is_none) {
            self.refresh_all_dies(abm, &mut cursor)?;
        }

        // A previous call served the last page of the current generation
        // of active blocks; resolve the refresh (or, for the fine stream,
        // the recycle cap check) before handing out anything from the new
        // generation. On failure this returns early with the cursor still
        // marked pending, so the caller's retry re-attempts the same check
        // rather than serving a page off an out-of-range offset.
        if cursor.pending_refresh {
            match stream {
                Stream::Normal | Stream::Compaction => {
                    self.refresh_all_dies(abm, &mut cursor)?;
                }
                Stream::Fine => {
                    let cap = self.pool_cap.max_dirty_4kb_blks(abm.nr_total_blocks());
                    if abm.nr_dirty_4kb_blocks() > cap {
                        // Hand the die slots to the recycle engine instead
                        // of requesting fresh FREE blocks.
                        return Err(AllocStall::NeedsRecycle);
                    }
                    self.refresh_all_dies(abm, &mut cursor)?;
                }
            }
            cursor.curr_page_ofs = 0;
            cursor.pending_refresh = false;
        }

        let punit = cursor.curr_punit;
        let (ch, chip) = self.geometry.punit_to_channel_chip(punit);
        let id = cursor.active[punit as usize]
            .expect("active block slot unset after refresh");
        let page_no = cursor.curr_page_ofs;
        let ppa = PhyAddr::new(ch, chip, id.block_no, page_no);

        // Advance the cursor for the next caller.
        let nr_punits = self.geometry.nr_punits();
        let wrapped_punit = cursor.curr_punit + 1 == nr_punits;
        cursor.curr_punit = (cursor.curr_punit + 1) % nr_punits;

        if wrapped_punit {
            cursor.curr_page_ofs += 1;
            if cursor.curr_page_ofs == self.geometry.nr_pages_per_block {
                cursor.pending_refresh = true;
            }
        }

        Ok(ppa)
    }

    pub fn active_block(&self, stream: Stream, punit: u32) -> Option<BlockId> {
        self.cursor(stream).lock().unwrap().active[punit as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abm::Abm;

    fn geo() -> Geometry {
        Geometry::new(2, 2, 4, 4, 4).unwrap()
    }

    #[test]
    fn round_robins_across_punits_then_pages() {
        let g = geo();
        let abm = Abm::create(g, false);
        let alloc = ActiveBlockAllocator::new(g);

        let mut seen = Vec::new();
        for _ in 0..(g.nr_punits() * 2) {
            let ppa = alloc.get_free_ppa(&abm, Stream::Normal).unwrap();
            seen.push((ppa.channel_no, ppa.chip_no, ppa.page_no));
        }
        // First nr_punits() allocations are all page 0, one per die.
        assert!(seen[..g.nr_punits() as usize].iter().all(|&(_, _, p)| p == 0));
        // Next nr_punits() allocations are all page 1.
        assert!(seen[g.nr_punits() as usize..].iter().all(|&(_, _, p)| p == 1));
    }

    #[test]
    fn exhausting_free_blocks_signals_needs_gc() {
        let g = Geometry::new(1, 1, 1, 2, 4).unwrap();
        let abm = Abm::create(g, false);
        let alloc = ActiveBlockAllocator::new(g);
        // One die, one block, two pages: page 0 then page 1 succeed, the
        // wrap after page 1 needs a second free block which doesn't exist.
        alloc.get_free_ppa(&abm, Stream::Normal).unwrap();
        alloc.get_free_ppa(&abm, Stream::Normal).unwrap();
        let err = alloc.get_free_ppa(&abm, Stream::Normal).unwrap_err();
        assert_eq!(err, AllocStall::NeedsGc);
    }
}
