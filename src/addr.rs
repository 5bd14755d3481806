//! Physical and logical address types.
//!
//! `lpa_cg` in the original implementation overloads a numeric field as a
//! discriminator (`-1`/`-2`/`-3` sentinels alongside real page numbers).
//! Per the design notes this is re-expressed as an explicit sum type so the
//! sentinel values never leak past this module.

use crate::geometry::Geometry;

/// A physical NAND location: one die, one block, one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhyAddr {
    pub channel_no: u32,
    pub chip_no: u32,
    pub block_no: u32,
    pub page_no: u32,
}

impl PhyAddr {
    pub fn new(channel_no: u32, chip_no: u32, block_no: u32, page_no: u32) -> Self {
        PhyAddr { channel_no, chip_no, block_no, page_no }
    }

    /// `punit_id` is always derivable from (channel_no, chip_no); this
    /// caches it for a given geometry rather than storing it redundantly.
    #[inline]
    pub fn punit_id(&self, geometry: &Geometry) -> u32 {
        geometry.punit_id(self.channel_no, self.chip_no)
    }

    #[inline]
    pub fn block_index(&self, geometry: &Geometry) -> usize {
        geometry.block_index(self.channel_no, self.chip_no, self.block_no)
    }
}

/// Discriminates the write stream and relocation role of a logical write,
/// replacing the original's overloaded `lpa_cg` sentinels
/// (`-1` fine, `-2` compacted, `-3` compacted-but-normal-mapped).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTag {
    /// A full 16KB logical page write, normal stream: either a host write or
    /// a GC relocation of a page whose K sub-pages all shared one coarse
    /// logical address. Carries that logical page number directly.
    Normal(u64),
    /// A single 4KB logical sub-page write, fine-grained stream: either a
    /// host sub-page write or one column of a GC compaction pack, which is
    /// split into one fine write per destination column (`ofs` on
    /// `LogAddr` carries the column).
    Fine,
    /// A GC relocation of a page that was fully valid but whose K sub-pages
    /// were separately fine-mapped (not one coarse logical page): still
    /// written whole, but through the compaction stream and re-mapped
    /// sub-page-by-sub-page rather than as one coarse entry.
    Compacted,
    /// The recycle engine's one-for-one relocation of a sub-page that has
    /// only ever been written once (`count == 1`) and is draining out of
    /// the last reusable column: promoted out of the one-for-one path into
    /// the compaction stream rather than re-entering the pool. The original
    /// encodes this with the same sentinel as `Compacted`; kept distinct
    /// here so recycle's promotion accounting doesn't conflate the two
    /// origins.
    CompactedNormal(u64),
}

impl WriteTag {
    /// Which allocator stream this tag dispatches to (spec.md §4.3).
    pub fn stream(&self) -> Stream {
        match self {
            WriteTag::Normal(_) => Stream::Normal,
            WriteTag::Fine => Stream::Fine,
            WriteTag::Compacted | WriteTag::CompactedNormal(_) => Stream::Compaction,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stream {
    Normal,
    Fine,
    Compaction,
}

/// A logical address carrying both the coarse (16KB) and per-sub-page (4KB)
/// grain, plus the destination sub-page slot for sub-page-granular writes.
#[derive(Debug, Clone)]
pub struct LogAddr {
    pub tag: WriteTag,
    /// Per-sub-page logical addresses, `-1` for absent/hole. Length equals
    /// `geometry.subpages_per_page`.
    pub lpa: Vec<i64>,
    /// Destination sub-page slot within the target physical page.
    pub ofs: usize,
}

impl LogAddr {
    /// A plain 16KB write: all K sub-pages present, contiguous logical
    /// sub-page numbers `page * k .. page * k + k`.
    pub fn coarse(geometry: &Geometry, lpa_page: u64) -> Self {
        let k = geometry.subpages_per_page as u64;
        let lpa = (0..k).map(|i| (lpa_page * k + i) as i64).collect();
        LogAddr { tag: WriteTag::Normal(lpa_page), lpa, ofs: 0 }
    }

    /// A single 4KB write targeting logical sub-page `lpa_sub`.
    pub fn fine(geometry: &Geometry, lpa_sub: i64) -> Self {
        let k = geometry.subpages_per_page as usize;
        let mut lpa = vec![-1; k];
        lpa[0] = lpa_sub;
        LogAddr { tag: WriteTag::Fine, lpa, ofs: 0 }
    }
}

/// The enclosing 16KB logical page number for a logical sub-page address.
#[inline]
pub fn enclosing_page(geometry: &Geometry, lpa_sub: i64) -> i64 {
    lpa_sub.div_euclid(geometry.subpages_per_page as i64)
}

/// The sub-page column (0..K-1) of a logical sub-page address within its
/// enclosing page.
#[inline]
pub fn sub_column(geometry: &Geometry, lpa_sub: i64) -> usize {
    lpa_sub.rem_euclid(geometry.subpages_per_page as i64) as usize
}
