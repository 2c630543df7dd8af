//! sector-rr: capture and replay raw sector reads
//!
//! A passthrough FUSE filesystem over a backing directory. In capture mode
//! every read is served live and its bytes are persisted keyed by
//! (offset, length); in replay mode reads are served only from those
//! persisted bytes.

/// Single-file export and import of sector records
pub mod archive;

/// Command-line definition
pub mod cli;

/// Mount-time configuration
pub mod config;

/// Operation errors and their errno mapping
pub mod error;

/// FUSE adapter and mounting
pub mod fuse;

/// Path-addressed passthrough operations
pub mod passthrough;

/// Virtual path to backing path mapping
pub mod resolve;

/// On-disk sector records
pub mod store;
