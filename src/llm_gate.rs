//! Per-parallel-unit low-level submission gate.
//!
//! One mutual-exclusion token per parallel unit, serialising submission to
//! the device manager. Grounded on `llm_noq.c`'s `punit_locks`: a plain
//! array of locks indexed by `punit_id`, acquired before `make_req` and
//! released in `end_req`. Since our [`crate::device::DeviceManager`]
//! boundary is synchronous rather than callback-driven, `make_req` and
//! `end_req` collapse into one scoped critical section — the lock guard's
//! drop is the `end_req` release.

use std::sync::Mutex;

use crate::error::FtlError;

pub struct LlmGate {
    punit_locks: Vec<Mutex<()>>,
}

impl LlmGate {
    pub fn new(nr_punits: u32) -> Self {
        LlmGate { punit_locks: (0..nr_punits).map(|_| Mutex::new(())).collect() }
    }

    /// Acquires the gate for `punit`, runs `f`, then releases it — the
    /// `make_req` -> device submit -> `end_req` sequence in one call.
    pub fn submit<F>(&self, punit: u32, f: F) -> Result<(), FtlError>
    where
        F: FnOnce() -> Result<(), FtlError>,
    {
        let _guard = self.punit_locks[punit as usize]
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        f()
    }

    /// Acquires and releases every punit lock, establishing a memory
    /// barrier that guarantees all prior operations have completed.
    pub fn flush(&self) {
        for lock in &self.punit_locks {
            let _guard = lock.lock().unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Drains every punit lock before teardown, mirroring `llm_noq_destroy`
    /// acquiring every completion lock so no `submit` is mid-flight when
    /// the gate is discarded.
    pub fn shutdown(&self) {
        self.flush();
    }
}
