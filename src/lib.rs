//! Sparse qcow2 virtual disk exposed as a 512-byte-sector block device.
//!
//! The engine translates guest sectors through the qcow2 two-level
//! L1/L2 mapping, allocates clusters on demand on a resizable backing
//! block device, tracks cluster liveness in the refcount table, and
//! buffers guest writes in a range-locked write-back cache.
//!
//! Compressed clusters, encryption, snapshots and backing files are
//! detected and refused.

pub mod cache;
pub mod dev;
pub mod error;
pub mod header;
pub mod helpers;
pub mod offset;
pub mod ops;
pub mod ram_io;
pub mod rlock;
pub mod sync_io;
pub mod tokio_io;
pub mod utils;
