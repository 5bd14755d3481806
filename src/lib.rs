//! Core flash translation layer for a block-addressable NAND device with
//! sub-page (4KB) programming inside a larger 16KB physical page.
//!
//! This crate is the core only: dual-grain logical-to-physical mapping, the
//! active-block allocator, the active block manager (ABM), garbage
//! collection, the sub-page recycle engine, and the per-die submission
//! gate. The block-device shim, the user/kernel request proxy, and the
//! concrete device manager that issues real flash commands are external
//! collaborators this crate only depends on through [`device::DeviceManager`].
//!
//! [`facade::FtlFacade`] is the entry point.

pub mod abm;
pub mod addr;
pub mod allocator;
pub mod compaction;
pub mod device;
pub mod error;
pub mod facade;
pub mod gc;
pub mod geometry;
pub mod llm_gate;
pub mod mapping;
pub mod recycle;
pub mod request;

pub use device::DeviceManager;
pub use error::FtlError;
pub use facade::FtlFacade;
pub use geometry::Geometry;
