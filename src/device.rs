//! The device manager boundary: deliberately out of scope (spec.md §1).
//!
//! Only the interface lives here, mirroring how `kernel::block::BlockDevice`
//! is a trait the kernel depends on without owning any concrete driver in
//! the same module.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::addr::PhyAddr;
use crate::error::FtlError;
use crate::request::{LlmReq, ReqType, Slot};

/// Issues flash commands for a physical request and reports completion
/// synchronously. A production device manager would hand this off to an
/// async completion queue; the LLM gate above it is what serialises
/// concurrent callers per parallel unit regardless of how completion is
/// signalled underneath.
pub trait DeviceManager: Send + Sync {
    /// Submit one request and block until it completes. For a read, the
    /// device fills `req.main`'s DATA slots in place; for a write or
    /// erase, the device consumes them.
    fn submit(&self, req: &mut LlmReq) -> Result<(), FtlError>;

    /// Await quiescence of all previously submitted requests.
    fn flush(&self) -> Result<(), FtlError>;
}

/// An in-memory device manager backing every physical page with plain
/// `Vec<u8>` storage plus its out-of-band logical-address tags. No real
/// driver lives in this crate, so this is what the GC, recycle, and
/// facade tests submit requests to.
///
/// Read slots are marked by the caller pre-filling them with
/// `Slot::Data(Vec::new())`; this device overwrites that placeholder with
/// the stored bytes and OOB tag, or resets it to `Slot::Hole` when the
/// physical column has no stored page (never written, or erased). Write
/// slots carrying `Slot::Data` are stored; holes leave whatever was
/// physically there before (matching partial-page NAND programming
/// semantics).
pub struct MemoryDevice {
    pages: Mutex<HashMap<PhyAddr, Vec<Option<(Vec<u8>, i64)>>>>,
    subpages_per_page: usize,
}

impl MemoryDevice {
    pub fn new(subpages_per_page: usize) -> Self {
        MemoryDevice { pages: Mutex::new(HashMap::new()), subpages_per_page }
    }
}

impl DeviceManager for MemoryDevice {
    fn submit(&self, req: &mut LlmReq) -> Result<(), FtlError> {
        let mut pages = self.pages.lock().unwrap();
        match req.req_type {
            ReqType::Read | ReqType::GcRead | ReqType::RecRead => {
                let stored = pages.get(&req.phyaddr);
                for (col, slot) in req.main.iter_mut().enumerate() {
                    if matches!(slot, Slot::Data(_)) {
                        match stored.and_then(|page| page[col].clone()) {
                            Some((buf, lpa)) => {
                                *slot = Slot::Data(buf);
                                req.oob[col] = lpa;
                            }
                            None => *slot = Slot::Hole,
                        }
                    }
                }
            }
            ReqType::Write
            | ReqType::GcWrite
            | ReqType::GcRecWrite
            | ReqType::RecWrite => {
                let page =
                    pages.entry(req.phyaddr).or_insert_with(|| vec![None; self.subpages_per_page]);
                for (col, slot) in req.main.iter().enumerate() {
                    if let Slot::Data(buf) = slot {
                        page[col] = Some((buf.clone(), req.oob[col]));
                    }
                }
            }
            ReqType::GcErase => {
                pages.remove(&req.phyaddr);
            }
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), FtlError> {
        Ok(())
    }
}
