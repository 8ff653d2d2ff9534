//! Low-level primitives the region is built on.
//!
//! Positioned file I/O over the backing file, and the locks used to
//! coordinate node processes.

/// Cross-process locks and thread placement.
///
/// The initializer's exclusive claim on the backing file, the spin lock
/// stored inside the region, and CPU pinning.
pub mod concurrency;

/// I/O abstractions over the backing file.
pub mod io;
