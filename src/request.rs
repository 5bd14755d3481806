//! Low-level request descriptors exchanged with the device manager, and
//! the counting-barrier re-expression of the original's "done token"
//! (design note: "a systems-language design can model this as a single
//! counting barrier per batch rather than lock/unlock inversion").

use std::sync::{Condvar, Mutex};

use crate::addr::PhyAddr;

/// Byte size of one sub-page (spec.md §1: "4KB subpages" of a 16KB page).
pub const SUBPAGE_BYTES: usize = 4096;

/// Request type tag carried on every LLM request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    Write,
    Read,
    GcRead,
    GcWrite,
    GcRecWrite,
    RecRead,
    RecWrite,
    GcErase,
}

/// One sub-page slot of a request's main buffer: either real data or a
/// hole (the physical slot is not touched by this request).
#[derive(Debug, Clone)]
pub enum Slot {
    Data(Vec<u8>),
    Hole,
}

impl Slot {
    pub fn is_data(&self) -> bool {
        matches!(self, Slot::Data(_))
    }
}

/// A single low-level request: K main-buffer slots plus K out-of-band
/// logical-address tags, `-1` marking an absent tag.
#[derive(Debug, Clone)]
pub struct LlmReq {
    pub req_type: ReqType,
    pub phyaddr: PhyAddr,
    pub main: Vec<Slot>,
    pub oob: Vec<i64>,
}

impl LlmReq {
    pub fn new(req_type: ReqType, phyaddr: PhyAddr, k: usize) -> Self {
        LlmReq {
            req_type,
            phyaddr,
            main: (0..k).map(|_| Slot::Hole).collect(),
            oob: vec![-1; k],
        }
    }
}

/// A counting barrier initialised to an expected count, decremented as
/// each member of a batch completes, released once it reaches zero.
/// Replaces the original's per-batch "done token" signalling.
pub struct CompletionBarrier {
    state: Mutex<usize>,
    cv: Condvar,
}

impl CompletionBarrier {
    pub fn new(expected: usize) -> Self {
        CompletionBarrier { state: Mutex::new(expected), cv: Condvar::new() }
    }

    /// Signals that one member of the batch has completed.
    pub fn arrive(&self) {
        let mut remaining = self.state.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
        }
        if *remaining == 0 {
            self.cv.notify_all();
        }
    }

    /// Blocks until every member of the batch has arrived.
    pub fn wait(&self) {
        let mut remaining = self.state.lock().unwrap();
        while *remaining > 0 {
            remaining = self.cv.wait(remaining).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn barrier_releases_after_all_arrive() {
        let barrier = Arc::new(CompletionBarrier::new(4));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let b = barrier.clone();
            handles.push(thread::spawn(move || b.arrive()));
        }
        barrier.wait();
        for h in handles {
            h.join().unwrap();
        }
    }
}
