//! Recycle engine (spec.md §4.5): reuses half-drained blocks from the
//! fine-grained stream's dirty-4KB list instead of always pulling a fresh
//! FREE block per column, spreading one erase across up to K column lives.
//!
//! Grounded on `fgm_ftl.c`'s `compare_blks` / reusable-block selection and
//! `bdbm_fgm_ftl_get_reusable_active_blks`: per-die candidate selection by
//! (column_idx, nr_invalid_pg), a shared column read across all chosen
//! blocks, and a validity-ratio branch between a compaction pass and
//! one-for-one relocation. The exact pointer/cursor choreography the
//! original uses to land one-for-one writes back on the same physical
//! pages could not be fully re-derived from the retrieved excerpt (its
//! write loop walks `nr_llm_reqs` — only the valid reads — through the
//! plain fine-stream allocator, which tracks page offset only, not
//! source/destination correspondence); this reproduces the documented
//! contract instead by addressing the destination directly: the same
//! (block, page) at column `column_idx + 1`, with no fresh allocation
//! needed except when draining the final column. See DESIGN.md.

use crate::abm::{Abm, BlockId, BlockMeta, SubpageState};
use crate::addr::{PhyAddr, Stream, WriteTag};
use crate::allocator::ActiveBlockAllocator;
use crate::compaction::{self, PackedSlot, ReadPage};
use crate::device::DeviceManager;
use crate::error::FtlError;
use crate::geometry::Geometry;
use crate::llm_gate::LlmGate;
use crate::mapping::Mapping;
use crate::request::{LlmReq, ReqType, Slot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleOutcome {
    Completed { relocated: u32, drained: bool },
    NotEnoughDies,
}

fn block_id_of(ppa: PhyAddr) -> BlockId {
    BlockId::new(ppa.channel_no, ppa.chip_no, ppa.block_no)
}

/// `column_idx == K-1` ranks worse than every other column (spec.md §4.5);
/// everything else ranks by its own value, smaller preferred.
fn column_rank(column_idx: u32, k: u32) -> u32 {
    if column_idx == k - 1 {
        k
    } else {
        column_idx
    }
}

/// Derives (column_idx, nr_invalid_pg) for one dirty-4KB block from its
/// invalid sub-page count, adjusting for the boundary case where the count
/// divides evenly into a column that was never actually started.
fn block_column(meta: &BlockMeta, pages_per_block: u32, k: u32) -> (u32, u32) {
    let mut column_idx = meta.nr_invalid_subpages as u32 / pages_per_block;
    let mut nr_invalid_pg = meta.nr_invalid_subpages as u32 % pages_per_block;
    if nr_invalid_pg == 0 && column_idx == k {
        column_idx -= 1;
        nr_invalid_pg = pages_per_block;
    } else if nr_invalid_pg == 0 && column_idx > 0 && meta.pst[column_idx as usize] == SubpageState::NotInvalid {
        column_idx -= 1;
        nr_invalid_pg = pages_per_block;
    }
    (column_idx, nr_invalid_pg)
}

pub struct Recycle {
    geometry: Geometry,
}

impl Recycle {
    pub fn new(geometry: Geometry) -> Self {
        Recycle { geometry }
    }

    pub fn run(
        &self,
        abm: &Abm,
        mapping: &Mapping,
        allocator: &ActiveBlockAllocator,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<RecycleOutcome, FtlError> {
        let Some((reusable, column_idx)) = self.select_reusable(abm) else {
            return Ok(RecycleOutcome::NotEnoughDies);
        };
        let k = self.geometry.subpages_per_page;
        let drains_last_column = column_idx + 1 == k;

        let reads = self.submit_column_reads(abm, &reusable, column_idx, gate, device)?;
        let nr_slots = reusable.len() as u64 * self.geometry.nr_pages_per_block as u64;
        let nr_valid = reads.len() as u64;
        let ratio = if nr_slots == 0 { 0 } else { nr_valid * 100 / nr_slots };

        if ratio > 95 {
            self.write_compacted(&reads, abm, mapping, allocator, gate, device)?;
        } else {
            self.write_one_for_one(&reads, column_idx, drains_last_column, abm, mapping, allocator, gate, device)?;
        }

        for &(id, page_no, _) in &reads {
            abm.invalidate_page(id, page_no, column_idx);
        }

        if drains_last_column {
            for &(_, id) in &reusable {
                self.erase(id, abm, gate, device);
            }
        }

        self.tune_pool_cap(allocator, ratio);

        Ok(RecycleOutcome::Completed { relocated: nr_valid as u32, drained: drains_last_column })
    }

    fn select_reusable(&self, abm: &Abm) -> Option<(Vec<(u32, BlockId)>, u32)> {
        let pages_per_block = self.geometry.nr_pages_per_block;
        let k = self.geometry.subpages_per_page;
        let mut chosen = Vec::with_capacity(self.geometry.nr_punits() as usize);
        let mut shared_column_idx = None;

        for punit in 0..self.geometry.nr_punits() {
            let candidates = abm.dirty_4kb_blocks(punit);
            let mut best: Option<(BlockId, u32, u32)> = None;
            for meta in &candidates {
                let (column_idx, nr_invalid_pg) = block_column(meta, pages_per_block, k);
                let replace = match best {
                    None => true,
                    Some((_, bc, bp)) => {
                        let rank = column_rank(column_idx, k);
                        let brank = column_rank(bc, k);
                        rank < brank || (rank == brank && nr_invalid_pg > bp)
                    }
                };
                if replace {
                    best = Some((meta.id, column_idx, nr_invalid_pg));
                }
            }
            match best {
                Some((id, column_idx, _)) => {
                    if shared_column_idx.is_none() {
                        shared_column_idx = Some(column_idx);
                    }
                    chosen.push((punit, id));
                }
                None => return None,
            }
        }

        Some((chosen, shared_column_idx.unwrap()))
    }

    /// Reads only `column_idx` of every page of every reusable block,
    /// skipping pages whose slot there is not VALID (matching the
    /// original's `has_valid` filter: unwritten columns don't enter the
    /// batch at all).
    fn submit_column_reads(
        &self,
        abm: &Abm,
        reusable: &[(u32, BlockId)],
        column_idx: u32,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<Vec<(BlockId, u32, LlmReq)>, FtlError> {
        let k = self.geometry.subpages_per_page as usize;
        let mut results = Vec::new();
        for &(_punit, id) in reusable {
            let meta = abm.get_block(id);
            for page_no in 0..self.geometry.nr_pages_per_block {
                let slot = (page_no * self.geometry.subpages_per_page + column_idx) as usize;
                if !matches!(meta.pst[slot], SubpageState::Valid) {
                    continue;
                }
                let ppa = PhyAddr::new(id.channel_no, id.chip_no, id.block_no, page_no);
                let mut req = LlmReq::new(ReqType::RecRead, ppa, k);
                req.main[column_idx as usize] = Slot::Data(Vec::new());
                let punit = ppa.punit_id(&self.geometry);
                gate.submit(punit, || device.submit(&mut req))?;
                results.push((id, page_no, req));
            }
        }
        Ok(results)
    }

    fn alloc_ppa(&self, abm: &Abm, allocator: &ActiveBlockAllocator, stream: Stream) -> Result<PhyAddr, FtlError> {
        allocator
            .get_free_ppa(abm, stream)
            .map_err(|e| FtlError::Resource(format!("recycle write phase stalled: {:?}", e)))
    }

    /// Validity ratio above the compaction threshold: pack sparse reads
    /// into fewer destination pages on the compaction stream, same as GC's
    /// sparse-valid write phase.
    fn write_compacted(
        &self,
        reads: &[(BlockId, u32, LlmReq)],
        abm: &Abm,
        mapping: &Mapping,
        allocator: &ActiveBlockAllocator,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<(), FtlError> {
        let k = self.geometry.subpages_per_page as usize;
        let read_pages: Vec<ReadPage> = reads
            .iter()
            .map(|(_, _, req)| ReadPage { slots: req.main.clone(), lpas: req.oob.clone() })
            .collect();
        let mut records = compaction::pack(&read_pages, k);
        if records.is_empty() {
            return Ok(());
        }
        let last_is_full =
            records.last().map(|r| r.slots.iter().all(|s| matches!(s, PackedSlot::Data { .. }))).unwrap_or(true);
        let fine_slots = if last_is_full {
            Vec::new()
        } else {
            let last = records.pop().expect("checked non-empty above");
            compaction::split_for_column(&last)
        };

        for rec in &records {
            let ppa = self.alloc_ppa(abm, allocator, Stream::Compaction)?;
            let mut write = LlmReq::new(ReqType::RecWrite, ppa, k);
            for (col, slot) in rec.slots.iter().enumerate() {
                if let PackedSlot::Data { buf, lpa } = slot {
                    self.commit_fine_write(mapping, abm, *lpa, ppa, col as u8);
                    write.main[col] = Slot::Data(buf.clone());
                    write.oob[col] = *lpa;
                }
            }
            let punit = ppa.punit_id(&self.geometry);
            gate.submit(punit, || device.submit(&mut write))?;
        }
        for (_src_col, slot) in fine_slots {
            if let PackedSlot::Data { buf, lpa } = slot {
                let ppa = self.alloc_ppa(abm, allocator, Stream::Fine)?;
                self.commit_fine_write(mapping, abm, lpa, ppa, 0);
                let mut write = LlmReq::new(ReqType::RecWrite, ppa, k);
                write.main[0] = Slot::Data(buf);
                write.oob[0] = lpa;
                let punit = ppa.punit_id(&self.geometry);
                gate.submit(punit, || device.submit(&mut write))?;
            }
        }
        Ok(())
    }

    /// Validity ratio at or below the compaction threshold: relocate each
    /// surviving sub-page into the next column of the *same* physical page
    /// it already occupies — no fresh allocation, which is what lets one
    /// erase amortise across up to K column lives. The final column has no
    /// "next" column to fall into: there, each surviving sub-page is
    /// relocated through a fresh allocation instead, promoted onto the
    /// compaction stream (`WriteTag::CompactedNormal`) when its lifetime
    /// write count is exactly 1, or the plain fine stream otherwise.
    fn write_one_for_one(
        &self,
        reads: &[(BlockId, u32, LlmReq)],
        column_idx: u32,
        drains_last_column: bool,
        abm: &Abm,
        mapping: &Mapping,
        allocator: &ActiveBlockAllocator,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<(), FtlError> {
        let k = self.geometry.subpages_per_page as usize;
        for (id, page_no, req) in reads {
            let lpa_sub = req.oob[column_idx as usize];
            if lpa_sub < 0 {
                continue;
            }
            let buf = match &req.main[column_idx as usize] {
                Slot::Data(buf) => buf.clone(),
                Slot::Hole => continue,
            };

            if drains_last_column {
                let promote = mapping.find_lpa_4kb(lpa_sub).map(|e| e.count == 1).unwrap_or(false);
                let (stream, req_type, _tag) = if promote {
                    (Stream::Compaction, ReqType::GcRecWrite, WriteTag::CompactedNormal(lpa_sub as u64))
                } else {
                    (Stream::Fine, ReqType::RecWrite, WriteTag::Fine)
                };
                let ppa = self.alloc_ppa(abm, allocator, stream)?;
                self.commit_fine_write(mapping, abm, lpa_sub, ppa, 0);
                let mut write = LlmReq::new(req_type, ppa, k);
                write.main[0] = Slot::Data(buf);
                write.oob[0] = lpa_sub;
                let punit = ppa.punit_id(&self.geometry);
                gate.submit(punit, || device.submit(&mut write))?;
            } else {
                let dest_col = (column_idx + 1) as u8;
                let ppa = PhyAddr::new(id.channel_no, id.chip_no, id.block_no, *page_no);
                self.commit_fine_write(mapping, abm, lpa_sub, ppa, dest_col);
                let mut write = LlmReq::new(ReqType::RecWrite, ppa, k);
                write.main[dest_col as usize] = Slot::Data(buf);
                write.oob[dest_col as usize] = lpa_sub;
                let punit = ppa.punit_id(&self.geometry);
                gate.submit(punit, || device.submit(&mut write))?;
            }
        }
        Ok(())
    }

    fn commit_fine_write(&self, mapping: &Mapping, abm: &Abm, lpa_sub: i64, ppa: PhyAddr, col: u8) {
        let (stale, stale_page) = mapping.write_4kb(&self.geometry, lpa_sub, ppa, col, true);
        if let Some((stale_ppa, stale_off)) = stale {
            abm.invalidate_page(block_id_of(stale_ppa), stale_ppa.page_no, stale_off as u32);
        }
        if let Some(stale_page_ppa) = stale_page {
            for sub in 0..self.geometry.subpages_per_page {
                abm.invalidate_page(block_id_of(stale_page_ppa), stale_page_ppa.page_no, sub);
            }
        }
        abm.validate_page_4kb(block_id_of(ppa), ppa.page_no, col as u32);
    }

    fn erase(&self, id: BlockId, abm: &Abm, gate: &LlmGate, device: &dyn DeviceManager) {
        let ppa = PhyAddr::new(id.channel_no, id.chip_no, id.block_no, 0);
        let k = self.geometry.subpages_per_page as usize;
        let mut req = LlmReq::new(ReqType::GcErase, ppa, k);
        let punit = ppa.punit_id(&self.geometry);
        let result = gate.submit(punit, || device.submit(&mut req));
        abm.erase_block(id, result.is_err());
    }

    /// Widens the pool cap when this cycle's validity ratio was high
    /// (little reclaimed, the cap is too tight) and tightens it when low
    /// (plenty reclaimed, the cap can afford to be stricter) — spec.md
    /// §4.5's adaptive cap, gated by the 70%/5% thresholds.
    fn tune_pool_cap(&self, allocator: &ActiveBlockAllocator, ratio: u64) {
        if ratio > 70 {
            allocator.pool_cap.widen();
        } else if ratio < 5 {
            allocator.pool_cap.tighten();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abm::Abm;
    use crate::device::MemoryDevice;
    use crate::mapping::Mapping;

    struct Harness {
        geometry: Geometry,
        abm: Abm,
        mapping: Mapping,
        allocator: ActiveBlockAllocator,
        gate: LlmGate,
        device: MemoryDevice,
        recycle: Recycle,
    }

    fn harness() -> Harness {
        let geometry = Geometry::new(1, 1, 3, 4, 4).unwrap();
        let abm = Abm::create(geometry, false);
        let mapping = Mapping::create(&geometry);
        let allocator = ActiveBlockAllocator::new(geometry);
        let gate = LlmGate::new(geometry.nr_punits());
        let device = MemoryDevice::new(geometry.subpages_per_page as usize);
        let recycle = Recycle::new(geometry);
        Harness { geometry, abm, mapping, allocator, gate, device, recycle }
    }

    /// Writes a single 4KB logical sub-page through the fine stream,
    /// landing at column 0 of a fresh page.
    fn host_write_fine(h: &Harness, lpa_sub: i64, byte: u8) -> PhyAddr {
        let ppa = h.allocator.get_free_ppa(&h.abm, Stream::Fine).unwrap();
        let (stale, stale_page) = h.mapping.write_4kb(&h.geometry, lpa_sub, ppa, 0, false);
        if let Some((stale_ppa, stale_off)) = stale {
            h.abm.invalidate_page(block_id_of(stale_ppa), stale_ppa.page_no, stale_off as u32);
        }
        if let Some(stale_page_ppa) = stale_page {
            for sub in 0..h.geometry.subpages_per_page {
                h.abm.invalidate_page(block_id_of(stale_page_ppa), stale_page_ppa.page_no, sub);
            }
        }
        h.abm.validate_page_4kb(block_id_of(ppa), ppa.page_no, 0);
        let k = h.geometry.subpages_per_page as usize;
        let mut req = LlmReq::new(ReqType::Write, ppa, k);
        req.main[0] = Slot::Data(vec![byte]);
        req.oob[0] = lpa_sub;
        let punit = ppa.punit_id(&h.geometry);
        h.gate.submit(punit, || h.device.submit(&mut req)).unwrap();
        ppa
    }

    #[test]
    fn no_reusable_blocks_when_die_has_none_dirty_4kb() {
        let h = harness();
        let outcome = h.recycle.run(&h.abm, &h.mapping, &h.allocator, &h.gate, &h.device).unwrap();
        assert_eq!(outcome, RecycleOutcome::NotEnoughDies);
    }

    #[test]
    fn relocates_column_zero_of_a_dirty_4kb_block() {
        let h = harness();
        // Fill every column of the active fine-stream block for this
        // single-die geometry: pages_per_block=4, K=4, so one block holds
        // 16 sub-pages; after 4 host writes column 0 of page 0 is VALID
        // and the block has become DIRTY_4KB.
        for lpa in 0..4 {
            host_write_fine(&h, lpa, lpa as u8);
        }
        assert_eq!(h.abm.nr_dirty_4kb_blocks(), 1);

        let before = h.mapping.find_lpa_4kb(0).unwrap();
        assert!(before.ppa.is_some());

        let outcome = h.recycle.run(&h.abm, &h.mapping, &h.allocator, &h.gate, &h.device).unwrap();
        match outcome {
            RecycleOutcome::Completed { relocated, .. } => assert_eq!(relocated, 4),
            RecycleOutcome::NotEnoughDies => panic!("expected a reusable block"),
        }

        // Every relocated sub-page now maps somewhere live (not a
        // tombstone), and none point at the vacated column 0 page.
        for lpa in 0..4 {
            let entry = h.mapping.find_lpa_4kb(lpa).expect("relocated entry still live");
            assert!(entry.ppa.is_some());
        }
    }

    #[test]
    fn relocates_partially_invalid_column_into_next_column_in_place() {
        let h = harness();
        for lpa in 0..4 {
            host_write_fine(&h, lpa, lpa as u8);
        }
        // Overwrite three of the four logical sub-pages with fresh data,
        // invalidating their old column-0 slots in the first block while
        // leaving lpa 3's original write live there.
        for lpa in 0..3 {
            host_write_fine(&h, lpa, 0x10 + lpa as u8);
        }
        assert_eq!(h.abm.nr_dirty_4kb_blocks(), 2);

        let outcome = h.recycle.run(&h.abm, &h.mapping, &h.allocator, &h.gate, &h.device).unwrap();
        match outcome {
            RecycleOutcome::Completed { relocated, drained } => {
                assert_eq!(relocated, 1);
                assert!(!drained);
            }
            RecycleOutcome::NotEnoughDies => panic!("expected the first block to still be reusable"),
        }

        let entry = h.mapping.find_lpa_4kb(3).expect("relocated entry still live");
        assert!(entry.ppa.is_some());
    }
}
