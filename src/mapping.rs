//! 16KB forward table and 4KB sub-page hash map.
//!
//! Both tables are mutated under one lock (spec.md §5: "Mapping tables are
//! mutated under a single spinlock"), encapsulated here rather than pushed
//! up into the facade, so every caller gets the atomicity for free.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addr::PhyAddr;
use crate::geometry::Geometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    NotAllocated,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy)]
pub struct PageEntry {
    pub status: PageStatus,
    pub phyaddr: Option<PhyAddr>,
    pub sp_off: u8,
}

impl PageEntry {
    fn empty() -> Self {
        PageEntry { status: PageStatus::NotAllocated, phyaddr: None, sp_off: 0 }
    }
}

/// One entry of the 4KB sub-page hash map.
///
/// `count` is the lifetime write count of this logical sub-page; on
/// invalidation it is negated in place as a tombstone (the original negates
/// `count` and sets `ppa.punit_id = -1`; we model the latter as
/// `ppa = None` since `PhyAddr` has no punit_id field of its own to
/// overload — see `addr::PhyAddr::punit_id`, which is always derived).
#[derive(Debug, Clone, Copy)]
pub struct SubpageEntry {
    pub lpa: i64,
    pub count: i64,
    pub ppa: Option<PhyAddr>,
    pub sp_off: u8,
}

impl SubpageEntry {
    pub fn is_tombstone(&self) -> bool {
        self.count < 0 || self.ppa.is_none()
    }
}

struct MappingInner {
    page_table: Vec<PageEntry>,
    sp_table: HashMap<i64, SubpageEntry>,
}

/// Dual-grain mapping tables.
pub struct Mapping {
    inner: Mutex<MappingInner>,
}

impl Mapping {
    pub fn create(geometry: &Geometry) -> Self {
        let page_table = vec![PageEntry::empty(); geometry.nr_pages_per_ssd() as usize];
        Mapping { inner: Mutex::new(MappingInner { page_table, sp_table: HashMap::new() }) }
    }

    pub fn lookup_16kb(&self, lpa_page: u64) -> PageEntry {
        let inner = self.inner.lock().unwrap();
        inner.page_table[lpa_page as usize]
    }

    /// `find_lpa_4kb` from the original: returns `None` for an absent or
    /// tombstoned entry (this is how I5 is enforced).
    pub fn find_lpa_4kb(&self, lpa_sub: i64) -> Option<SubpageEntry> {
        let inner = self.inner.lock().unwrap();
        inner.sp_table.get(&lpa_sub).copied().filter(|e| !e.is_tombstone())
    }

    /// Commits a 16KB write, and atomically invalidates any live 4KB
    /// entries that cover the same sub-pages (I6: the most recent write
    /// wins and must invalidate the other before its own map commit).
    /// Returns the previous 16KB PhyAddr (if it was VALID) and, for each
    /// sub-page, the tombstoned 4KB entry's old (PhyAddr, sp_off) so the
    /// caller can invalidate those physical locations in the ABM.
    pub fn commit_16kb(
        &self,
        lpa_page: u64,
        phyaddr: PhyAddr,
        subpages: &[i64],
    ) -> (Option<PhyAddr>, Vec<Option<(PhyAddr, u8)>>) {
        let mut inner = self.inner.lock().unwrap();

        let prev = match inner.page_table[lpa_page as usize].status {
            PageStatus::Valid => inner.page_table[lpa_page as usize].phyaddr,
            _ => None,
        };

        let mut stolen = Vec::with_capacity(subpages.len());
        for &lpa_sub in subpages {
            let stolen_one = match inner.sp_table.get_mut(&lpa_sub) {
                Some(entry) if !entry.is_tombstone() => {
                    let old = (entry.ppa.unwrap(), entry.sp_off);
                    entry.count = -entry.count.abs().max(1);
                    entry.ppa = None;
                    Some(old)
                }
                _ => None,
            };
            stolen.push(stolen_one);
        }

        inner.page_table[lpa_page as usize] =
            PageEntry { status: PageStatus::Valid, phyaddr: Some(phyaddr), sp_off: 0 };

        (prev, stolen)
    }

    /// Marks the 16KB entry for `lpa_page` INVALID. Returns the previous
    /// PhyAddr if it was VALID.
    pub fn invalidate_16kb(&self, lpa_page: u64) -> Option<PhyAddr> {
        let mut inner = self.inner.lock().unwrap();
        let entry = &mut inner.page_table[lpa_page as usize];
        let prev = match entry.status {
            PageStatus::Valid => entry.phyaddr,
            _ => None,
        };
        if prev.is_some() {
            entry.status = PageStatus::Invalid;
        }
        prev
    }

    /// Writes a 4KB entry. `from_recycle` preserves the lifetime write
    /// count instead of incrementing it (spec.md §4.2). Returns the stale
    /// (PhyAddr, sp_off) if this logical sub-page had a live prior 4KB
    /// entry pointing elsewhere, and whether the enclosing 16KB page had a
    /// VALID entry that must now be invalidated (I6).
    pub fn write_4kb(
        &self,
        geometry: &Geometry,
        lpa_sub: i64,
        ppa: PhyAddr,
        sp_off: u8,
        from_recycle: bool,
    ) -> (Option<(PhyAddr, u8)>, Option<PhyAddr>) {
        let mut inner = self.inner.lock().unwrap();

        let stale = match inner.sp_table.get(&lpa_sub) {
            Some(entry) if !entry.is_tombstone() => Some((entry.ppa.unwrap(), entry.sp_off)),
            _ => None,
        };

        let count = match inner.sp_table.get(&lpa_sub) {
            Some(entry) if from_recycle => entry.count.abs(),
            Some(entry) => entry.count.abs() + 1,
            None => 1,
        };
        inner.sp_table.insert(lpa_sub, SubpageEntry { lpa: lpa_sub, count, ppa: Some(ppa), sp_off });

        let page_no = lpa_sub.div_euclid(geometry.subpages_per_page as i64) as u64;
        let enclosing = &mut inner.page_table[page_no as usize];
        let stale_page = match enclosing.status {
            PageStatus::Valid => {
                let addr = enclosing.phyaddr;
                enclosing.status = PageStatus::Invalid;
                addr
            }
            _ => None,
        };

        (stale, stale_page)
    }

    /// Tombstones a live 4KB entry. Idempotent: returns `None` if already
    /// tombstoned or absent. Returns the old (PhyAddr, sp_off) otherwise.
    pub fn invalidate_4kb(&self, lpa_sub: i64) -> Option<(PhyAddr, u8)> {
        let mut inner = self.inner.lock().unwrap();
        match inner.sp_table.get_mut(&lpa_sub) {
            Some(entry) if !entry.is_tombstone() => {
                let old = (entry.ppa.unwrap(), entry.sp_off);
                entry.count = -entry.count.abs().max(1);
                entry.ppa = None;
                Some(old)
            }
            _ => None,
        }
    }
}
