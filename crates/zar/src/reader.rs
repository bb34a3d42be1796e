//! Reading images: footer parsing, trailer decoding, traversal.
//!
//! A reader is one read-only shared mapping of the image file.  The final
//! footer slot locates the filter descriptor; the slot just past the entry
//! blob locates the entries.  The two trailer decodes are independent, so
//! a caller can keep using whichever section survived.  Decoded payload
//! slices borrow from the mapping and must not outlive it.

use std::fs::File;
use std::path::Path;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use log::debug;
use memmap2::Mmap;
use serde::de::DeserializeOwned;

use crate::entry::{Entry, EntryKind};
use crate::error::{ImageError, Result};
use crate::filter::{BloomFilter, FilterDescriptor, BLOOM_FILTER_NAME};
use crate::varint::{decode_varint, MAX_VARINT_LEN};

/// Answer of a membership query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The path is certainly not in the image.
    Absent,
    /// The filter cannot rule the path out; traverse to resolve.
    MaybePresent,
}

/// One event produced while traversing the entry sequence.  `depth` is the
/// nesting level of the item itself; a close event reports the depth of
/// the contents it is closing.
#[derive(Debug, PartialEq)]
pub enum ImageItem<'a> {
    DirectoryOpen {
        name: &'a str,
        depth: usize,
    },
    DirectoryClose {
        depth: usize,
    },
    File {
        name: &'a str,
        depth: usize,
        /// Payload bytes from the mapping, present when detail was requested.
        data: Option<&'a [u8]>,
    },
    Symlink {
        name: &'a str,
        target: &'a str,
        depth: usize,
    },
    Whiteout {
        name: &'a str,
        depth: usize,
    },
}

/// A memory-mapped view of an image file.
pub struct ImageReader {
    mmap: Mmap,
}

impl ImageReader {
    /// Opens the image read-only and maps it shared.  An image too short
    /// to hold its two footer slots is rejected outright.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        if mmap.len() < 2 * MAX_VARINT_LEN {
            return Err(ImageError::FooterCorrupt(format!(
                "image is only {} bytes",
                mmap.len()
            )));
        }
        debug!("mapped {} bytes of {path:?}", mmap.len());
        Ok(Self { mmap })
    }

    /// Total length of the mapped image in bytes.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.len() == 0
    }

    /// Decodes the footer slot ending at `slot_end` into a trailer offset,
    /// checked to land strictly before the slot.
    fn footer_offset(&self, slot_end: usize, what: &str) -> Result<usize> {
        let slot = &self.mmap[slot_end - MAX_VARINT_LEN..slot_end];
        let (v, _) = decode_varint(slot).ok_or_else(|| {
            ImageError::FooterCorrupt(format!("{what} footer is not a valid varint"))
        })?;
        match usize::try_from(v) {
            Ok(loc) if loc < slot_end - MAX_VARINT_LEN => Ok(loc),
            _ => Err(ImageError::FooterCorrupt(format!(
                "{what} footer points at {v}, outside the image"
            ))),
        }
    }

    /// Reads the final footer slot and decodes the filter descriptor it
    /// locates.
    pub fn read_descriptor(&self) -> Result<FilterDescriptor> {
        let end = self.mmap.len();
        let loc = self.footer_offset(end, "descriptor")?;
        debug!("filter descriptor at {loc}");
        decode_trailer("filter descriptor", &self.mmap[loc..end - MAX_VARINT_LEN])
    }

    /// Decodes the filter blob located by the descriptor.
    pub fn read_filter(&self, descriptor: &FilterDescriptor) -> Result<BloomFilter> {
        if descriptor.name != BLOOM_FILTER_NAME {
            return Err(ImageError::Decode(
                "filter",
                format!("filter algorithm not recognized: {:?}", descriptor.name),
            ));
        }
        let (loc, size) = self.filter_bounds(descriptor)?;
        decode_trailer("filter", &self.mmap[loc..loc + size])
    }

    /// Reads the footer slot immediately preceding the filter blob and
    /// decodes the entry sequence it locates.
    pub fn read_entries(&self, descriptor: &FilterDescriptor) -> Result<Vec<Entry>> {
        let (filter_loc, _) = self.filter_bounds(descriptor)?;
        if filter_loc < MAX_VARINT_LEN {
            return Err(ImageError::FooterCorrupt(format!(
                "no room for an entries footer before offset {filter_loc}"
            )));
        }
        let entries_loc = self.footer_offset(filter_loc, "entries")?;
        debug!("entries at {entries_loc}");
        decode_trailer(
            "entries",
            &self.mmap[entries_loc..filter_loc - MAX_VARINT_LEN],
        )
    }

    fn filter_bounds(&self, descriptor: &FilterDescriptor) -> Result<(usize, usize)> {
        let loc = usize::try_from(descriptor.filter_loc);
        let size = usize::try_from(descriptor.filter_size);
        match (loc, size) {
            (Ok(loc), Ok(size)) if loc.checked_add(size).is_some_and(|e| e <= self.mmap.len()) => {
                Ok((loc, size))
            }
            _ => Err(ImageError::Decode(
                "filter",
                format!(
                    "descriptor places the filter at {}+{}, outside the image",
                    descriptor.filter_loc, descriptor.filter_size
                ),
            )),
        }
    }

    /// Walks the entry sequence in order, reporting directory opens and
    /// closes, files, symlinks, and whiteouts to the visitor.  When
    /// `detail` is set, file events carry their payload slice from the
    /// mapping.
    pub fn traverse<'a, F>(&'a self, entries: &'a [Entry], detail: bool, mut visit: F) -> Result<()>
    where
        F: FnMut(ImageItem<'a>),
    {
        let mut depth = 0usize;
        for entry in entries {
            match entry.kind {
                EntryKind::Directory => {
                    if entry.is_directory_close() {
                        if depth == 0 {
                            return Err(ImageError::Decode(
                                "entries",
                                "directory close without a matching open".to_owned(),
                            ));
                        }
                        visit(ImageItem::DirectoryClose { depth });
                        depth -= 1;
                    } else {
                        visit(ImageItem::DirectoryOpen {
                            name: &entry.name,
                            depth,
                        });
                        depth += 1;
                    }
                }
                EntryKind::RegularFile => {
                    let data = if detail {
                        Some(self.file_bytes(entry)?)
                    } else {
                        None
                    };
                    visit(ImageItem::File {
                        name: &entry.name,
                        depth,
                        data,
                    });
                }
                EntryKind::Symlink => visit(ImageItem::Symlink {
                    name: &entry.name,
                    target: &entry.link,
                    depth,
                }),
                EntryKind::WhiteoutFile => visit(ImageItem::Whiteout {
                    name: &entry.name,
                    depth,
                }),
            }
        }
        Ok(())
    }

    /// Payload bytes of a regular-file entry, bounds-checked against the
    /// mapping.
    pub fn file_bytes(&self, entry: &Entry) -> Result<&[u8]> {
        let out_of_range = ImageError::BadEntryRange {
            begin: entry.begin,
            end: entry.end,
        };
        match (usize::try_from(entry.begin), usize::try_from(entry.end)) {
            (Ok(begin), Ok(end)) if begin <= end && end <= self.mmap.len() => {
                Ok(&self.mmap[begin..end])
            }
            _ => Err(out_of_range),
        }
    }

    /// Queries the filter for a `/`-joined image path.  A negative answer
    /// is certain; a positive one must be resolved by traversal.
    pub fn lookup(&self, filter: &BloomFilter, path: &str) -> Lookup {
        if filter.test(path.as_bytes()) {
            Lookup::MaybePresent
        } else {
            Lookup::Absent
        }
    }
}

fn decode_trailer<T: DeserializeOwned>(what: &'static str, raw: &[u8]) -> Result<T> {
    let blob = BASE64_STANDARD
        .decode(raw)
        .map_err(|err| ImageError::Decode(what, err.to_string()))?;
    serde_json::from_slice(&blob).map_err(|err| ImageError::Decode(what, err.to_string()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_image(td: &tempfile::TempDir, bytes: &[u8]) -> std::path::PathBuf {
        let path = td.path().join("test.img");
        File::create(&path).unwrap().write_all(bytes).unwrap();
        path
    }

    #[test]
    fn test_open_rejects_truncated_image() {
        let td = tempfile::tempdir().unwrap();
        let path = write_image(&td, b"tiny");
        assert!(matches!(
            ImageReader::open(&path),
            Err(ImageError::FooterCorrupt(_))
        ));
    }

    #[test]
    fn test_footer_offset_out_of_range() {
        let td = tempfile::tempdir().unwrap();
        // A 20-byte image whose final slot claims the descriptor starts at
        // byte 100.
        let mut bytes = vec![0u8; 2 * MAX_VARINT_LEN];
        crate::varint::encode_varint(100, (&mut bytes[MAX_VARINT_LEN..]).try_into().unwrap());
        let path = write_image(&td, &bytes);

        let reader = ImageReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_descriptor(),
            Err(ImageError::FooterCorrupt(_))
        ));
    }

    #[test]
    fn test_footer_negative_offset() {
        let td = tempfile::tempdir().unwrap();
        let mut bytes = vec![0u8; 2 * MAX_VARINT_LEN];
        crate::varint::encode_varint(-3, (&mut bytes[MAX_VARINT_LEN..]).try_into().unwrap());
        let path = write_image(&td, &bytes);

        let reader = ImageReader::open(&path).unwrap();
        assert!(matches!(
            reader.read_descriptor(),
            Err(ImageError::FooterCorrupt(_))
        ));
    }

    #[test]
    fn test_file_bytes_bounds_checked() {
        let td = tempfile::tempdir().unwrap();
        let path = write_image(&td, &[0u8; 2 * MAX_VARINT_LEN]);
        let reader = ImageReader::open(&path).unwrap();

        let entry = Entry::file("f", 0, 1_000_000, 0, 0);
        assert!(matches!(
            reader.file_bytes(&entry),
            Err(ImageError::BadEntryRange { .. })
        ));

        let entry = Entry::file("f", 5, 2, 0, 0);
        assert!(matches!(
            reader.file_bytes(&entry),
            Err(ImageError::BadEntryRange { .. })
        ));
    }

    #[test]
    fn test_traverse_rejects_stray_close() {
        let td = tempfile::tempdir().unwrap();
        let path = write_image(&td, &[0u8; 2 * MAX_VARINT_LEN]);
        let reader = ImageReader::open(&path).unwrap();

        let entries = vec![Entry::directory_close()];
        let err = reader.traverse(&entries, false, |_| {}).unwrap_err();
        assert!(matches!(err, ImageError::Decode("entries", _)));
    }
}
