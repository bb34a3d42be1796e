//! A single-file, memory-mappable directory image ("zar image").
//!
//! An image concatenates the payload bytes of a directory tree and appends
//! two trailing metadata blocks: the ordered entry sequence describing the
//! tree layout, and a membership filter over the contained paths.  Each
//! trailer is located by a fixed-width varint footer at the tail of the
//! file, so a reader needs nothing but one read-only mapping to resolve a
//! path to an exact byte range.

pub mod builder;
pub mod entry;
pub mod error;
pub mod filter;
pub mod reader;
pub mod sink;
pub mod stats;
pub mod varint;
pub mod walk;

/// File payloads are padded up to a multiple of this boundary when page
/// alignment is enabled at build time.
pub const PAGE_BOUNDARY: u64 = 4096;
