//! Error taxonomy for the FTL core.
//!
//! Mirrors the kind of hand-rolled error enum `crate::block` uses for
//! `BlockError`: a plain enum with a manual `Display`, no `thiserror`.
//! Programming errors (violated invariants) are not represented here —
//! those are asserted and unwind/abort at the call site instead of being
//! returned, per the error handling design.

use core::fmt;

/// Error kinds surfaced to callers of the FTL facade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtlError {
    /// Logical address out of range, NULL mapping entry, oversized request.
    InvalidInput(String),
    /// No free block available, request pool exhausted, pending queue full.
    Resource(String),
    /// Low-level device make_req/erase failure.
    Device(String),
}

impl fmt::Display for FtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FtlError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            FtlError::Resource(msg) => write!(f, "resource exhausted: {msg}"),
            FtlError::Device(msg) => write!(f, "device error: {msg}"),
        }
    }
}

impl std::error::Error for FtlError {}
