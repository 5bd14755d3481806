//! The FTL facade: wires the ABM, mapping tables, allocator, GC engine,
//! recycle engine, and LLM gate into the operations the host-I/O layer
//! actually calls (spec.md §2 item 7: "get_free_ppa, map_lpa_to_ppa,
//! get_ppa, invalidate_lpa, do_gc / is_gc_needed, scan_badblocks").
//!
//! Grounded on how `kernel::block`'s device façade in the teacher repo
//! composes narrower subsystems behind one public surface without owning
//! their locks directly: each call here takes at most one component lock
//! at a time, released before the next, so a blocking device submission
//! never holds back an unrelated mapping lookup.

use log::{debug, warn};

use crate::abm::{Abm, BlockId};
use crate::addr::{enclosing_page, sub_column, PhyAddr, WriteTag};
use crate::allocator::{ActiveBlockAllocator, AllocStall};
use crate::device::DeviceManager;
use crate::error::FtlError;
use crate::gc::{Gc, GcOutcome};
use crate::geometry::Geometry;
use crate::llm_gate::LlmGate;
use crate::mapping::{Mapping, PageEntry, PageStatus, SubpageEntry};
use crate::recycle::{Recycle, RecycleOutcome};
use crate::request::{LlmReq, ReqType, Slot, SUBPAGE_BYTES};

/// Bounded retry budget for RESOURCE stalls (spec.md §7: "retries with
/// bounded back-off (10 attempts ... for pool allocation)"). This crate has
/// no timers of its own, so the "1s" half of that policy is left to the
/// caller driving this facade from a real clock; what lives here is the
/// attempt bound and the GC/recycle escalation in between attempts.
const MAX_ALLOC_ATTEMPTS: u32 = 10;

fn block_id_of(ppa: PhyAddr) -> BlockId {
    BlockId::new(ppa.channel_no, ppa.chip_no, ppa.block_no)
}

/// Owns every FTL subsystem for one device geometry and drives the
/// operations consumed by host I/O.
pub struct FtlFacade {
    geometry: Geometry,
    abm: Abm,
    mapping: Mapping,
    allocator: ActiveBlockAllocator,
    gate: LlmGate,
    gc: Gc,
    recycle: Recycle,
    device: Box<dyn DeviceManager>,
}

impl FtlFacade {
    pub fn create(geometry: Geometry, device: Box<dyn DeviceManager>) -> Self {
        FtlFacade {
            geometry,
            abm: Abm::create(geometry, false),
            mapping: Mapping::create(&geometry),
            allocator: ActiveBlockAllocator::new(geometry),
            gate: LlmGate::new(geometry.nr_punits()),
            gc: Gc::new(geometry),
            recycle: Recycle::new(geometry),
            device,
        }
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Bad-block scan: drains every die's FREE list once, trial-erasing
    /// each block. A block that fails its trial erase transitions to BAD
    /// and is never handed out by `get_free_block_prepare` again. Intended
    /// to run once at startup, before any host I/O (persisting the result
    /// to a file is out of scope here, per `SPEC_FULL.md` §1 Non-goals).
    pub fn scan_badblocks(&self) -> Result<u32, FtlError> {
        let mut nr_bad = 0;
        let k = self.geometry.subpages_per_page as usize;
        for punit in 0..self.geometry.nr_punits() {
            let (ch, chip) = self.geometry.punit_to_channel_chip(punit);
            while let Some(id) = self.abm.get_free_block_prepare(ch, chip) {
                self.abm.get_free_block_commit(id);
                let ppa = PhyAddr::new(ch, chip, id.block_no, 0);
                let mut req = LlmReq::new(ReqType::GcErase, ppa, k);
                let result = self.gate.submit(punit, || self.device.submit(&mut req));
                let is_bad = result.is_err();
                if is_bad {
                    nr_bad += 1;
                    warn!("block {:?} failed trial erase during bad-block scan", id);
                }
                self.abm.erase_block(id, is_bad);
            }
        }
        Ok(nr_bad)
    }

    pub fn is_gc_needed(&self) -> bool {
        self.gc.is_needed(&self.abm)
    }

    pub fn do_gc(&self) -> Result<GcOutcome, FtlError> {
        self.gc.run(&self.abm, &self.mapping, &self.allocator, &self.gate, self.device.as_ref())
    }

    fn run_recycle(&self) -> Result<RecycleOutcome, FtlError> {
        self.recycle.run(&self.abm, &self.mapping, &self.allocator, &self.gate, self.device.as_ref())
    }

    /// `get_free_ppa`: dispatches on the tag's stream and, on a stall, runs
    /// GC or the recycle engine and retries up to `MAX_ALLOC_ATTEMPTS`
    /// times before failing with RESOURCE (spec.md §4.3, §7).
    pub fn get_free_ppa(&self, tag: WriteTag) -> Result<PhyAddr, FtlError> {
        for attempt in 0..MAX_ALLOC_ATTEMPTS {
            match self.allocator.get_free_ppa(&self.abm, tag.stream()) {
                Ok(ppa) => return Ok(ppa),
                Err(AllocStall::NeedsGc) => {
                    debug!("allocation stalled on attempt {attempt} for stream {:?}, running gc", tag.stream());
                    match self.do_gc()? {
                        GcOutcome::NoVictim => {
                            return Err(FtlError::Resource("gc found no victim on some die".into()));
                        }
                        GcOutcome::Completed { .. } => continue,
                    }
                }
                Err(AllocStall::NeedsRecycle) => {
                    debug!("fine-grained pool over cap on attempt {attempt}, running recycle");
                    match self.run_recycle()? {
                        RecycleOutcome::NotEnoughDies => {
                            return Err(FtlError::Resource(
                                "recycle found no reusable block on some die".into(),
                            ));
                        }
                        RecycleOutcome::Completed { .. } => {
                            // The fine cursor's own pending-refresh check on
                            // the next call re-tests the cap and pulls fresh
                            // FREE blocks once recycle has relieved enough
                            // pressure; recycle's relocations land directly
                            // on their own blocks' next column and never
                            // need to be handed back to this cursor.
                            continue;
                        }
                    }
                }
            }
        }
        Err(FtlError::Resource(format!(
            "allocation did not succeed after {MAX_ALLOC_ATTEMPTS} attempts"
        )))
    }

    /// `map_lpa_to_ppa` for a coarse (16KB) write. Commits the forward
    /// table entry, invalidates whatever it replaced — the page's own
    /// previous location and any 4KB entries stolen out from under it
    /// (I6) — and validates the new location's K sub-pages. Returns the
    /// contiguous logical sub-page numbers committed, for tagging the
    /// device write's OOB slots.
    fn map_coarse(&self, lpa_page: u64, ppa: PhyAddr) -> Vec<i64> {
        let k = self.geometry.subpages_per_page as u64;
        let subpages: Vec<i64> = (0..k).map(|i| (lpa_page * k + i) as i64).collect();
        let (prev, stolen) = self.mapping.commit_16kb(lpa_page, ppa, &subpages);
        if let Some(prev_ppa) = prev {
            for sub in 0..self.geometry.subpages_per_page {
                self.abm.invalidate_page(block_id_of(prev_ppa), prev_ppa.page_no, sub);
            }
        }
        for stale in stolen.into_iter().flatten() {
            self.abm.invalidate_page(block_id_of(stale.0), stale.0.page_no, stale.1 as u32);
        }
        for sub in 0..self.geometry.subpages_per_page {
            self.abm.validate_page_16kb(block_id_of(ppa), ppa.page_no, sub);
        }
        subpages
    }

    /// `map_lpa_to_ppa` for a fine (4KB) write: commits the sub-page entry
    /// at column 0 (the fine stream's sole target column for host writes),
    /// invalidates whatever it replaced, and validates the new location.
    fn map_fine(&self, lpa_sub: i64, ppa: PhyAddr) {
        let (stale, stale_page) = self.mapping.write_4kb(&self.geometry, lpa_sub, ppa, 0, false);
        if let Some((stale_ppa, stale_off)) = stale {
            self.abm.invalidate_page(block_id_of(stale_ppa), stale_ppa.page_no, stale_off as u32);
        }
        if let Some(stale_page_ppa) = stale_page {
            for sub in 0..self.geometry.subpages_per_page {
                self.abm.invalidate_page(block_id_of(stale_page_ppa), stale_page_ppa.page_no, sub);
            }
        }
        self.abm.validate_page_4kb(block_id_of(ppa), ppa.page_no, 0);
    }

    fn check_page_bounds(&self, lpa_page: u64) -> Result<(), FtlError> {
        if lpa_page >= self.geometry.nr_pages_per_ssd() {
            return Err(FtlError::InvalidInput(format!("logical page {lpa_page} out of range")));
        }
        Ok(())
    }

    fn check_subpage_bounds(&self, lpa_sub: i64) -> Result<(), FtlError> {
        if lpa_sub < 0 || lpa_sub as u64 >= self.geometry.nr_subpages_per_ssd() {
            return Err(FtlError::InvalidInput(format!("logical sub-page {lpa_sub} out of range")));
        }
        Ok(())
    }

    /// `get_ppa` at the 16KB grain.
    pub fn get_ppa_16kb(&self, lpa_page: u64) -> Result<PageEntry, FtlError> {
        self.check_page_bounds(lpa_page)?;
        Ok(self.mapping.lookup_16kb(lpa_page))
    }

    /// `get_ppa` at the 4KB grain. `None` for an absent or tombstoned entry
    /// (I5).
    pub fn get_ppa_4kb(&self, lpa_sub: i64) -> Result<Option<SubpageEntry>, FtlError> {
        self.check_subpage_bounds(lpa_sub)?;
        Ok(self.mapping.find_lpa_4kb(lpa_sub))
    }

    /// `invalidate_lpa` at the 16KB grain.
    pub fn invalidate_lpa_16kb(&self, lpa_page: u64) -> Result<(), FtlError> {
        self.check_page_bounds(lpa_page)?;
        if let Some(prev) = self.mapping.invalidate_16kb(lpa_page) {
            for sub in 0..self.geometry.subpages_per_page {
                self.abm.invalidate_page(block_id_of(prev), prev.page_no, sub);
            }
        }
        Ok(())
    }

    /// `invalidate_lpa` at the 4KB grain.
    pub fn invalidate_lpa_4kb(&self, lpa_sub: i64) -> Result<(), FtlError> {
        self.check_subpage_bounds(lpa_sub)?;
        if let Some((ppa, sp_off)) = self.mapping.invalidate_4kb(lpa_sub) {
            self.abm.invalidate_page(block_id_of(ppa), ppa.page_no, sp_off as u32);
        }
        Ok(())
    }

    /// Host-visible 16KB write: `get_free_ppa`, `map_lpa_to_ppa`, submit, in
    /// that order (spec.md §5: mapping mutation happens before the ordered
    /// device submission).
    pub fn write_16kb(&self, lpa_page: u64, data: &[u8]) -> Result<(), FtlError> {
        self.check_page_bounds(lpa_page)?;
        let k = self.geometry.subpages_per_page as usize;
        if data.len() != k * SUBPAGE_BYTES {
            return Err(FtlError::InvalidInput(format!(
                "16KB write payload must be exactly {} bytes, got {}",
                k * SUBPAGE_BYTES,
                data.len()
            )));
        }
        let ppa = self.get_free_ppa(WriteTag::Normal(lpa_page))?;
        let subpages = self.map_coarse(lpa_page, ppa);

        let mut req = LlmReq::new(ReqType::Write, ppa, k);
        for (col, chunk) in data.chunks(SUBPAGE_BYTES).enumerate() {
            req.main[col] = Slot::Data(chunk.to_vec());
            req.oob[col] = subpages[col];
        }
        let punit = ppa.punit_id(&self.geometry);
        self.gate.submit(punit, || self.device.submit(&mut req))
    }

    /// Host-visible 16KB read. An absent or invalidated entry reads back as
    /// all-zero (R2's "implementation-defined default").
    pub fn read_16kb(&self, lpa_page: u64) -> Result<Vec<u8>, FtlError> {
        let entry = self.get_ppa_16kb(lpa_page)?;
        let k = self.geometry.subpages_per_page as usize;
        let ppa = match entry.phyaddr {
            Some(ppa) if entry.status == PageStatus::Valid => ppa,
            _ => return Ok(vec![0u8; k * SUBPAGE_BYTES]),
        };
        let mut req = LlmReq::new(ReqType::Read, ppa, k);
        for slot in req.main.iter_mut() {
            *slot = Slot::Data(Vec::new());
        }
        let punit = ppa.punit_id(&self.geometry);
        self.gate.submit(punit, || self.device.submit(&mut req))?;
        let mut out = Vec::with_capacity(k * SUBPAGE_BYTES);
        for slot in &req.main {
            match slot {
                Slot::Data(buf) => out.extend_from_slice(buf),
                Slot::Hole => out.extend(std::iter::repeat(0u8).take(SUBPAGE_BYTES)),
            }
        }
        Ok(out)
    }

    /// Host-visible 4KB write.
    pub fn write_4kb(&self, lpa_sub: i64, data: &[u8]) -> Result<(), FtlError> {
        self.check_subpage_bounds(lpa_sub)?;
        if data.len() != SUBPAGE_BYTES {
            return Err(FtlError::InvalidInput(format!(
                "4KB write payload must be exactly {SUBPAGE_BYTES} bytes, got {}",
                data.len()
            )));
        }
        let ppa = self.get_free_ppa(WriteTag::Fine)?;
        self.map_fine(lpa_sub, ppa);

        let k = self.geometry.subpages_per_page as usize;
        let mut req = LlmReq::new(ReqType::Write, ppa, k);
        req.main[0] = Slot::Data(data.to_vec());
        req.oob[0] = lpa_sub;
        let punit = ppa.punit_id(&self.geometry);
        self.gate.submit(punit, || self.device.submit(&mut req))
    }

    /// Host-visible 4KB read. Falls back to slicing the enclosing 16KB
    /// page when the sub-page was last written coarsely (I6: a sub-page is
    /// never covered by both a live 4KB entry and a VALID 16KB entry at
    /// once, so exactly one of these two branches has live data).
    pub fn read_4kb(&self, lpa_sub: i64) -> Result<Vec<u8>, FtlError> {
        self.check_subpage_bounds(lpa_sub)?;
        let k = self.geometry.subpages_per_page as usize;

        if let Some(entry) = self.mapping.find_lpa_4kb(lpa_sub) {
            let ppa = entry.ppa.expect("non-tombstone entry carries a PhyAddr");
            let mut req = LlmReq::new(ReqType::Read, ppa, k);
            req.main[entry.sp_off as usize] = Slot::Data(Vec::new());
            let punit = ppa.punit_id(&self.geometry);
            self.gate.submit(punit, || self.device.submit(&mut req))?;
            return Ok(match &req.main[entry.sp_off as usize] {
                Slot::Data(buf) => buf.clone(),
                Slot::Hole => vec![0u8; SUBPAGE_BYTES],
            });
        }

        let lpa_page = enclosing_page(&self.geometry, lpa_sub) as u64;
        let col = sub_column(&self.geometry, lpa_sub);
        let entry = self.get_ppa_16kb(lpa_page)?;
        let ppa = match entry.phyaddr {
            Some(ppa) if entry.status == PageStatus::Valid => ppa,
            _ => return Ok(vec![0u8; SUBPAGE_BYTES]),
        };
        let mut req = LlmReq::new(ReqType::Read, ppa, k);
        req.main[col] = Slot::Data(Vec::new());
        let punit = ppa.punit_id(&self.geometry);
        self.gate.submit(punit, || self.device.submit(&mut req))?;
        Ok(match &req.main[col] {
            Slot::Data(buf) => buf.clone(),
            Slot::Hole => vec![0u8; SUBPAGE_BYTES],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn facade() -> FtlFacade {
        let geometry = Geometry::new(2, 2, 4, 4, 4).unwrap();
        FtlFacade::create(geometry, Box::new(MemoryDevice::new(geometry.subpages_per_page as usize)))
    }

    #[test]
    fn sixteen_kb_write_then_read_round_trips() {
        let f = facade();
        let payload = vec![b'A'; 4 * SUBPAGE_BYTES];
        f.write_16kb(0, &payload).unwrap();
        assert_eq!(f.read_16kb(0).unwrap(), payload);
        let entry = f.get_ppa_16kb(0).unwrap();
        assert_eq!(entry.status, PageStatus::Valid);
    }

    #[test]
    fn four_kb_write_then_read_round_trips_and_leaves_enclosing_page_unallocated() {
        let f = facade();
        let payload = vec![b'B'; SUBPAGE_BYTES];
        f.write_4kb(7, &payload).unwrap();
        assert_eq!(f.read_4kb(7).unwrap(), payload);
        let entry = f.get_ppa_4kb(7).unwrap().unwrap();
        assert_eq!(entry.count, 1);
        let page_entry = f.get_ppa_16kb(1).unwrap();
        assert_eq!(page_entry.status, PageStatus::NotAllocated);
    }

    #[test]
    fn coarse_overwrite_tombstones_live_fine_entry() {
        let f = facade();
        f.write_4kb(42, &vec![b'X'; SUBPAGE_BYTES]).unwrap();
        let payload = vec![b'Y'; 4 * SUBPAGE_BYTES];
        f.write_16kb(10, &payload).unwrap();
        assert!(f.get_ppa_4kb(42).unwrap().is_none());
        assert_eq!(f.read_4kb(42).unwrap(), vec![b'Y'; SUBPAGE_BYTES]);
    }

    #[test]
    fn invalidate_then_read_returns_zeroed_default() {
        let f = facade();
        f.write_16kb(0, &vec![b'A'; 4 * SUBPAGE_BYTES]).unwrap();
        f.invalidate_lpa_16kb(0).unwrap();
        assert_eq!(f.read_16kb(0).unwrap(), vec![0u8; 4 * SUBPAGE_BYTES]);
    }

    #[test]
    fn out_of_range_logical_page_is_rejected() {
        let f = facade();
        let max = f.geometry().nr_pages_per_ssd();
        assert!(f.write_16kb(max - 1, &vec![0u8; 4 * SUBPAGE_BYTES]).is_ok());
        assert!(matches!(
            f.write_16kb(max, &vec![0u8; 4 * SUBPAGE_BYTES]),
            Err(FtlError::InvalidInput(_))
        ));
    }

    #[test]
    fn scan_badblocks_on_a_fresh_device_finds_none() {
        let f = facade();
        assert_eq!(f.scan_badblocks().unwrap(), 0);
        // Every block went through prepare/commit/erase; the free list is
        // restored to full strength afterward.
        assert_eq!(f.abm.nr_free_blocks(), f.geometry.nr_total_blocks());
    }
}
