//! Garbage collector (spec.md §4.4): victim selection, read classification,
//! relocation writes for both the full-valid and sparse-valid cases, and
//! the final erase phase.
//!
//! Grounded on `fgm_ftl.c`'s `bdbm_fgm_ftl_do_gc`: victim selection per die
//! excludes that die's current active normal/compaction block, pages are
//! classified by counting VALID sub-pages, and the write phase's `lpa_cg`
//! tag (`-2` compacted vs the coarse page number) was confirmed by reading
//! the actual GC write-construction loop rather than the distilled
//! summary, which reads as `lpa_cg = lpa[0] / K` but the source sets
//! `lpa_cg = lpa[0]` directly — see DESIGN.md.

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

/// Outcome of one `do_gc` pass, replacing the original's overloaded
/// "return 0" for both "nothing to do" and "ran out of candidates" (spec.md
/// §9 open question (a)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcOutcome {
    /// Every die yielded a victim; this many blocks were relocated and
    /// erased.
    Completed { blocks_erased: u32 },
    /// At least one die had no eligible victim (excluding its active
    /// normal/compaction blocks); no work was done this pass. A production
    /// trigger policy should escalate rather than silently no-op; this
    /// crate only reports the condition.
    NoVictim,
}

fn block_id_of(ppa: PhyAddr) -> BlockId {
    BlockId::new(ppa.channel_no, ppa.chip_no, ppa.block_no)
}

pub struct Gc {
    geometry: Geometry,
}

impl Gc {
    pub fn new(geometry: Geometry) -> Self {
        Gc { geometry }
    }

    /// `is_gc_needed`: free blocks below 2% of total.
    pub fn is_needed(&self, abm: &Abm) -> bool {
        abm.nr_free_blocks() * 100 < abm.nr_total_blocks() * 2
    }

    /// One `do_gc` pass.
    pub fn run(
        &self,
        abm: &Abm,
        mapping: &Mapping,
        allocator: &ActiveBlockAllocator,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<GcOutcome, FtlError> {
        let victims = match self.select_victims(abm, allocator) {
            Some(v) => v,
            None => return Ok(GcOutcome::NoVictim),
        };

        let k = self.geometry.subpages_per_page as usize;
        let mut full_valid: Vec<(BlockId, u32)> = Vec::new();
        let mut sparse: Vec<(BlockId, u32, Vec<bool>)> = Vec::new();

        for &id in &victims {
            let meta = abm.get_block(id);
            for page_no in 0..self.geometry.nr_pages_per_block {
                let base = page_no as usize * k;
                let mask: Vec<bool> =
                    meta.pst[base..base + k].iter().map(|s| matches!(s, SubpageState::Valid)).collect();
                let nr_valid = mask.iter().filter(|&&v| v).count();
                if nr_valid == k {
                    full_valid.push((id, page_no));
                } else if nr_valid > 0 {
                    sparse.push((id, page_no, mask));
                }
            }
        }

        gate.flush();

        let full_masks: Vec<(BlockId, u32, Vec<bool>)> =
            full_valid.iter().map(|&(id, p)| (id, p, vec![true; k])).collect();
        let full_reads = self.submit_reads(&full_masks, ReqType::GcRead, gate, device)?;
        let sparse_reads = self.submit_reads(&sparse, ReqType::GcRead, gate, device)?;

        self.write_full_valid(&full_valid, full_reads, abm, mapping, allocator, gate, device)?;
        self.write_sparse(&sparse, sparse_reads, abm, mapping, allocator, gate, device)?;

        for &id in &victims {
            self.erase_victim(id, abm, gate, device);
        }

        Ok(GcOutcome::Completed { blocks_erased: victims.len() as u32 })
    }

    /// Per parallel unit: the dirty (16KB-stream) block with the most
    /// invalid sub-pages, excluding that die's current active normal and
    /// compaction blocks. First-encountered wins ties; an all-invalid
    /// block is an early exit (maximal gain). `None` if any die comes up
    /// empty.
    fn select_victims(&self, abm: &Abm, allocator: &ActiveBlockAllocator) -> Option<Vec<BlockId>> {
        let nr_subpages_per_block = self.geometry.nr_subpages_per_block() as usize;
        let mut victims = Vec::with_capacity(self.geometry.nr_punits() as usize);

        for punit in 0..self.geometry.nr_punits() {
            let active_normal = allocator.active_block(Stream::Normal, punit);
            let active_compaction = allocator.active_block(Stream::Compaction, punit);
            let dirty = abm.dirty_blocks(punit);

            let mut best: Option<BlockMeta> = None;
            for meta in dirty {
                if Some(meta.id) == active_normal || Some(meta.id) == active_compaction {
                    continue;
                }
                let maximal = meta.nr_invalid_subpages == nr_subpages_per_block;
                let replace = match &best {
                    None => true,
                    Some(b) => meta.nr_invalid_subpages > b.nr_invalid_subpages,
                };
                if replace {
                    best = Some(meta);
                }
                if maximal {
                    break;
                }
            }

            match best {
                Some(meta) => victims.push(meta.id),
                None => return None,
            }
        }

        Some(victims)
    }

    /// Issues one `GcRead` per page, marking the wanted sub-pages with an
    /// empty `Slot::Data` placeholder per `MemoryDevice`'s read contract.
    fn submit_reads(
        &self,
        pages: &[(BlockId, u32, Vec<bool>)],
        req_type: ReqType,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<Vec<LlmReq>, FtlError> {
        let k = self.geometry.subpages_per_page as usize;
        let mut results = Vec::with_capacity(pages.len());
        for (id, page_no, mask) in pages {
            let ppa = PhyAddr::new(id.channel_no, id.chip_no, id.block_no, *page_no);
            let mut req = LlmReq::new(req_type, ppa, k);
            for (slot, &want) in req.main.iter_mut().zip(mask.iter()) {
                if want {
                    *slot = Slot::Data(Vec::new());
                }
            }
            let punit = ppa.punit_id(&self.geometry);
            gate.submit(punit, || device.submit(&mut req))?;
            results.push(req);
        }
        Ok(results)
    }

    fn alloc_ppa(
        &self,
        abm: &Abm,
        allocator: &ActiveBlockAllocator,
        stream: Stream,
    ) -> Result<PhyAddr, FtlError> {
        allocator
            .get_free_ppa(abm, stream)
            .map_err(|e| FtlError::Resource(format!("GC write phase stalled: {:?}", e)))
    }

    /// Write phase for FULL-VALID pages (spec.md §4.4 step 4): a page whose
    /// K sub-pages carry the same OOB tag was a single coarse 16KB write
    /// and is relocated through the normal stream; otherwise it was K
    /// separately fine-mapped sub-pages that happened to all still be
    /// valid, relocated through the compaction stream one sub-page at a
    /// time into the same destination physical page.
    fn write_full_valid(
        &self,
        pages: &[(BlockId, u32)],
        reads: Vec<LlmReq>,
        abm: &Abm,
        mapping: &Mapping,
        allocator: &ActiveBlockAllocator,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<(), FtlError> {
        let k = self.geometry.subpages_per_page as usize;

        for (&(victim_id, victim_page), req) in pages.iter().zip(reads) {
            let oob = req.oob.clone();
            let is_coarse = oob[0] >= 0 && oob.iter().all(|&v| v == oob[0]);
            let tag = if is_coarse { WriteTag::Normal(oob[0] as u64) } else { WriteTag::Compacted };

            let ppa = if let WriteTag::Normal(page_number) = tag {
                let ppa = self.alloc_ppa(abm, allocator, tag.stream())?;
                let subpages: Vec<i64> =
                    (0..k as u64).map(|i| (page_number * k as u64 + i) as i64).collect();
                let (_prev, stolen) = mapping.commit_16kb(page_number, ppa, &subpages);
                for stale in stolen.into_iter().flatten() {
                    abm.invalidate_page(block_id_of(stale.0), stale.0.page_no, stale.1 as u32);
                }
                for sub in 0..k as u32 {
                    abm.validate_page_16kb(block_id_of(ppa), ppa.page_no, sub);
                }
                ppa
            } else {
                let ppa = self.alloc_ppa(abm, allocator, tag.stream())?;
                for col in 0..k {
                    let lpa_sub = oob[col];
                    if lpa_sub < 0 {
                        continue;
                    }
                    let (stale, stale_page) =
                        mapping.write_4kb(&self.geometry, lpa_sub, ppa, col as u8, true);
                    if let Some((stale_ppa, stale_off)) = stale {
                        abm.invalidate_page(block_id_of(stale_ppa), stale_ppa.page_no, stale_off as u32);
                    }
                    if let Some(stale_page_ppa) = stale_page {
                        for sub in 0..k as u32 {
                            abm.invalidate_page(block_id_of(stale_page_ppa), stale_page_ppa.page_no, sub);
                        }
                    }
                    abm.validate_page_4kb(block_id_of(ppa), ppa.page_no, col as u32);
                }
                ppa
            };

            for sub in 0..k as u32 {
                abm.invalidate_page(victim_id, victim_page, sub);
            }

            let mut write = LlmReq::new(ReqType::GcWrite, ppa, k);
            write.main = req.main;
            write.oob = oob;
            let punit = ppa.punit_id(&self.geometry);
            gate.submit(punit, || device.submit(&mut write))?;
        }

        Ok(())
    }

    /// Write phase for SPARSE-VALID pages (spec.md §4.4 step 5, §4.6): pack
    /// surviving sub-pages left-first into fewer physical pages through the
    /// compaction stream; the final, possibly-partial record is instead
    /// split into individual fine-stream writes, one destination physical
    /// page per surviving sub-page, matching the original's fix-up over
    /// `hlm_reqs_pool_write_compaction`'s output.
    fn write_sparse(
        &self,
        pages: &[(BlockId, u32, Vec<bool>)],
        reads: Vec<LlmReq>,
        abm: &Abm,
        mapping: &Mapping,
        allocator: &ActiveBlockAllocator,
        gate: &LlmGate,
        device: &dyn DeviceManager,
    ) -> Result<(), FtlError> {
        let k = self.geometry.subpages_per_page as usize;

        let mut read_pages = Vec::with_capacity(reads.len());
        for req in &reads {
            read_pages.push(ReadPage { slots: req.main.clone(), lpas: req.oob.clone() });
        }
        let _ = pages; // victims are erased wholesale later; no per-victim bookkeeping needed here.

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
            let mut write = LlmReq::new(ReqType::GcWrite, ppa, k);
            for (col, slot) in rec.slots.iter().enumerate() {
                if let PackedSlot::Data { buf, lpa } = slot {
                    let (stale, stale_page) =
                        mapping.write_4kb(&self.geometry, *lpa, ppa, col as u8, true);
                    if let Some((stale_ppa, stale_off)) = stale {
                        abm.invalidate_page(block_id_of(stale_ppa), stale_ppa.page_no, stale_off as u32);
                    }
                    if let Some(stale_page_ppa) = stale_page {
                        for sub in 0..k as u32 {
                            abm.invalidate_page(block_id_of(stale_page_ppa), stale_page_ppa.page_no, sub);
                        }
                    }
                    abm.validate_page_4kb(block_id_of(ppa), ppa.page_no, col as u32);
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
                let (stale, stale_page) = mapping.write_4kb(&self.geometry, lpa, ppa, 0, true);
                if let Some((stale_ppa, stale_off)) = stale {
                    abm.invalidate_page(block_id_of(stale_ppa), stale_ppa.page_no, stale_off as u32);
                }
                if let Some(stale_page_ppa) = stale_page {
                    for sub in 0..k as u32 {
                        abm.invalidate_page(block_id_of(stale_page_ppa), stale_page_ppa.page_no, sub);
                    }
                }
                abm.validate_page_4kb(block_id_of(ppa), ppa.page_no, 0);

                let mut write = LlmReq::new(ReqType::GcWrite, ppa, k);
                write.main[0] = Slot::Data(buf);
                write.oob[0] = lpa;
                let punit = ppa.punit_id(&self.geometry);
                gate.submit(punit, || device.submit(&mut write))?;
            }
        }

        Ok(())
    }

    /// Erase phase (spec.md §4.4 step 7): a device error marks the block
    /// BAD via the ABM rather than failing the whole pass.
    fn erase_victim(&self, id: BlockId, abm: &Abm, gate: &LlmGate, device: &dyn DeviceManager) {
        let ppa = PhyAddr::new(id.channel_no, id.chip_no, id.block_no, 0);
        let k = self.geometry.subpages_per_page as usize;
        let mut req = LlmReq::new(ReqType::GcErase, ppa, k);
        let punit = ppa.punit_id(&self.geometry);
        let result = gate.submit(punit, || device.submit(&mut req));
        abm.erase_block(id, result.is_err());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abm::Abm;
    use crate::addr::LogAddr;
    use crate::device::MemoryDevice;
    use crate::mapping::Mapping;
    use crate::request::{ReqType, Slot};

    struct Harness {
        geometry: Geometry,
        abm: Abm,
        mapping: Mapping,
        allocator: ActiveBlockAllocator,
        gate: LlmGate,
        device: MemoryDevice,
        gc: Gc,
    }

    fn harness() -> Harness {
        let geometry = Geometry::new(1, 1, 3, 4, 4).unwrap();
        Harness {
            geometry,
            abm: Abm::create(geometry, false),
            mapping: Mapping::create(&geometry),
            allocator: ActiveBlockAllocator::new(geometry),
            gate: LlmGate::new(geometry.nr_punits()),
            device: MemoryDevice::new(geometry.subpages_per_page as usize),
            gc: Gc::new(geometry),
        }
    }

    /// Issues one coarse 16KB host write through the full stack, the way
    /// the (not-yet-written) facade will.
    fn host_write_coarse(h: &Harness, lpa_page: u64, byte: u8) {
        let ppa = h.allocator.get_free_ppa(&h.abm, Stream::Normal).unwrap();
        let la = LogAddr::coarse(&h.geometry, lpa_page);
        let (_prev, _stolen) = h.mapping.commit_16kb(lpa_page, ppa, &la.lpa);
        let k = h.geometry.subpages_per_page as usize;
        let mut req = LlmReq::new(ReqType::Write, ppa, k);
        for col in 0..k {
            req.main[col] = Slot::Data(vec![byte]);
            req.oob[col] = lpa_page as i64;
            h.abm.validate_page_16kb(block_id_of(ppa), ppa.page_no, col as u32);
        }
        let punit = ppa.punit_id(&h.geometry);
        h.gate.submit(punit, || h.device.submit(&mut req)).unwrap();
    }

    #[test]
    fn relocates_full_valid_coarse_page_and_frees_victim() {
        let h = harness();
        // Fill block 0's 4 pages with coarse writes, one logical page each.
        for page in 0..h.geometry.nr_pages_per_block as u64 {
            host_write_coarse(&h, page, page as u8);
        }
        // No invalidations: every page on the die's active block is still
        // full-valid, but it's also the active block, so it can't be a
        // victim yet. Force a rotation by writing one more page's worth so
        // the active block advances and the filled block becomes dirty.
        host_write_coarse(&h, 100, 9);

        assert!(matches!(h.gc.run(&h.abm, &h.mapping, &h.allocator, &h.gate, &h.device), Ok(GcOutcome::Completed { .. })));

        // All four relocated logical pages still read back correctly.
        for page in 0..h.geometry.nr_pages_per_block as u64 {
            let entry = h.mapping.lookup_16kb(page);
            assert_eq!(entry.status, crate::mapping::PageStatus::Valid);
        }
    }

    #[test]
    fn no_victim_when_every_die_lacks_one() {
        let h = harness();
        // Nothing dirty anywhere yet: every die's dirty list is empty.
        assert_eq!(h.gc.run(&h.abm, &h.mapping, &h.allocator, &h.gate, &h.device).unwrap(), GcOutcome::NoVictim);
    }

    #[test]
    fn relocates_sparse_valid_page_via_compaction() {
        let h = harness();
        for page in 0..h.geometry.nr_pages_per_block as u64 {
            host_write_coarse(&h, page, page as u8);
        }
        // Invalidate 3 of page 0's 4 sub-pages, leaving it sparse (1 valid).
        let ppa0 = h.mapping.lookup_16kb(0).phyaddr.unwrap();
        for sub in 1..4u32 {
            h.abm.invalidate_page(block_id_of(ppa0), ppa0.page_no, sub);
        }
        h.mapping.invalidate_16kb(0);
        // Rotate the active block so block 0 becomes a GC candidate.
        host_write_coarse(&h, 100, 9);

        let outcome = h.gc.run(&h.abm, &h.mapping, &h.allocator, &h.gate, &h.device).unwrap();
        assert!(matches!(outcome, GcOutcome::Completed { .. }));
    }
}
