//! Error types for the zar library.
//!
//! All fallible operations return a [`Result<T>`] which is an alias for
//! `Result<T, ImageError>`.  Builds fail fast: nothing is retried and no
//! partial image is ever usable.  On the read side the entry and filter
//! trailers decode independently, so a caller may continue past a failed
//! section with the other one.

use std::path::PathBuf;

/// Result type alias for operations that may return an [`ImageError`].
pub type Result<T> = std::result::Result<T, ImageError>;

/// Error types for building and reading zar images.
#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    /// I/O error from the sink, a source file, or the mapping.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A manifest line failed to parse.
    #[error("manifest line {line}: {message}")]
    Manifest { line: usize, message: String },

    /// The manifest format token is not one we know.
    #[error("manifest format not recognized: {0:?}")]
    UnknownManifestFormat(String),

    /// Serializing a trailer failed.
    #[error("failed to encode {0}")]
    Encode(&'static str, #[source] serde_json::Error),

    /// Decoding a trailer section failed.
    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, String),

    /// A device node with data cannot be represented as a whiteout.
    #[error("device node {0:?} has non-zero size and is not a whiteout")]
    NonWhiteoutDevice(PathBuf),

    /// The stat result contradicts what directory enumeration claimed.
    #[error("file type of {0:?} changed between readdir() and fstat()")]
    FileTypeChanged(PathBuf),

    /// Entry names must survive the textual metadata encoding.
    #[error("file name {0:?} is not valid UTF-8")]
    NonUnicodeName(PathBuf),

    /// A sized membership filter needs at least one element.
    #[error("membership filter needs at least one element")]
    EmptyFilter,

    /// A footer slot did not decode to a valid offset within the image.
    #[error("image footer corrupt: {0}")]
    FooterCorrupt(String),

    /// A regular-file entry points outside the data region.
    #[error("entry payload {begin}..{end} lies outside the data region")]
    BadEntryRange { begin: i64, end: i64 },
}

impl From<rustix::io::Errno> for ImageError {
    fn from(errno: rustix::io::Errno) -> Self {
        ImageError::Io(errno.into())
    }
}
