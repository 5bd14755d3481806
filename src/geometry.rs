//! Device geometry: the read-only configuration surface of the FTL core.

use crate::error::FtlError;

/// Physical shape of the NAND device, fixed for the lifetime of the FTL.
///
/// Validated once at construction the way `frame_allocator::init` validates
/// the bootloader memory map before trusting it, rather than asserting on
/// first use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub nr_channels: u32,
    pub nr_chips_per_channel: u32,
    pub nr_blocks_per_chip: u32,
    pub nr_pages_per_block: u32,
    /// K: subpages per physical page (4 in the reference geometry).
    pub subpages_per_page: u32,
}

impl Geometry {
    pub fn new(
        nr_channels: u32,
        nr_chips_per_channel: u32,
        nr_blocks_per_chip: u32,
        nr_pages_per_block: u32,
        subpages_per_page: u32,
    ) -> Result<Self, FtlError> {
        if nr_channels == 0
            || nr_chips_per_channel == 0
            || nr_blocks_per_chip == 0
            || nr_pages_per_block == 0
            || subpages_per_page == 0
        {
            return Err(FtlError::InvalidInput(
                "geometry dimensions must all be non-zero".into(),
            ));
        }
        Ok(Geometry {
            nr_channels,
            nr_chips_per_channel,
            nr_blocks_per_chip,
            nr_pages_per_block,
            subpages_per_page,
        })
    }

    /// `punit_id = channel_no * chips_per_channel + chip_no`.
    #[inline]
    pub fn punit_id(&self, channel_no: u32, chip_no: u32) -> u32 {
        channel_no * self.nr_chips_per_channel + chip_no
    }

    #[inline]
    pub fn punit_to_channel_chip(&self, punit: u32) -> (u32, u32) {
        (punit / self.nr_chips_per_channel, punit % self.nr_chips_per_channel)
    }

    #[inline]
    pub fn nr_punits(&self) -> u32 {
        self.nr_channels * self.nr_chips_per_channel
    }

    #[inline]
    pub fn nr_blocks_per_die(&self) -> u32 {
        self.nr_blocks_per_chip
    }

    #[inline]
    pub fn nr_subpages_per_block(&self) -> u32 {
        self.nr_pages_per_block * self.subpages_per_page
    }

    #[inline]
    pub fn nr_total_blocks(&self) -> u64 {
        self.nr_punits() as u64 * self.nr_blocks_per_chip as u64
    }

    #[inline]
    pub fn nr_pages_per_ssd(&self) -> u64 {
        self.nr_total_blocks() * self.nr_pages_per_block as u64
    }

    #[inline]
    pub fn nr_subpages_per_ssd(&self) -> u64 {
        self.nr_pages_per_ssd() * self.subpages_per_page as u64
    }

    /// Flat block index within a die's per-die arrays: `(ch * chips + chip) * blocks + blk`.
    #[inline]
    pub fn block_index(&self, channel_no: u32, chip_no: u32, block_no: u32) -> usize {
        let punit = self.punit_id(channel_no, chip_no) as u64;
        (punit * self.nr_blocks_per_chip as u64 + block_no as u64) as usize
    }
}
