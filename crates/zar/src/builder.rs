//! Building images: payload emission, filter construction, trailers.
//!
//! The builder owns the sink, the entry list, and the statistics for the
//! whole build.  Walkers feed it through the `push_*` operations in
//! emission order; `finalize` then sizes the filter from the statistics,
//! inserts every recorded path, and appends the three self-locating
//! trailers before closing the sink.

use std::path::Path;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use log::{debug, info};
use serde::Serialize;

use crate::entry::{image_paths, Entry};
use crate::error::{ImageError, Result};
use crate::filter::{bloom::DEFAULT_FP_PROB, BloomFilter, FilterDescriptor, BLOOM_FILTER_NAME};
use crate::sink::ImageSink;
use crate::stats::ImageStats;
use crate::walk::{FilesystemWalker, ManifestFormat, ManifestWalker};

/// Accumulates one image build from first payload byte to closed sink.
pub struct ImageBuilder {
    sink: ImageSink,
    page_align: bool,
    entries: Vec<Entry>,
    stats: ImageStats,
}

impl ImageBuilder {
    /// Creates the output file and an empty build on top of it.
    pub fn create(output: &Path, page_align: bool) -> Result<Self> {
        Ok(Self {
            sink: ImageSink::create(output)?,
            page_align,
            entries: Vec::new(),
            stats: ImageStats::default(),
        })
    }

    pub fn stats(&self) -> &ImageStats {
        &self.stats
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Appends the opening half of a directory pair.
    pub fn push_directory_open(&mut self, name: &str, mod_time: i64, mode: u32) {
        self.stats.add_dir();
        self.entries.push(Entry::directory_open(name, mod_time, mode));
    }

    /// Appends the closing half of a directory pair.
    pub fn push_directory_close(&mut self) {
        self.entries.push(Entry::directory_close());
    }

    /// Appends a symlink entry carrying its unresolved target.
    pub fn push_symlink(&mut self, name: &str, target: &str, mod_time: i64, mode: u32) {
        self.stats.add_symlink();
        self.entries.push(Entry::symlink(name, target, mod_time, mode));
    }

    /// Appends a whiteout marker for an overlay-style deletion.
    pub fn push_whiteout(&mut self, name: &str, mod_time: i64) {
        self.entries.push(Entry::whiteout(name, mod_time));
    }

    /// Writes a regular file's payload and appends its entry.  `begin` is
    /// the sink counter before the write; `end` is the real end returned
    /// by the sink, which excludes any page padding.
    pub fn push_file(&mut self, name: &str, content: &[u8], mod_time: i64, mode: u32) -> Result<()> {
        let begin = self.sink.count() as i64;
        let end = self.sink.write(content, self.page_align)? as i64;
        self.stats.add_file();
        self.entries.push(Entry::file(name, begin, end, mod_time, mode));
        Ok(())
    }

    /// Sizes the filter from the regular-file count and loads it with every
    /// file and symlink path.  Directories and symlinks are inserted without
    /// having participated in sizing; the resulting oversubscription is part
    /// of the format and deliberately not corrected here.
    fn build_filter(&self) -> Result<BloomFilter> {
        let mut filter = match self.stats.num_files {
            0 => BloomFilter::empty(),
            n => BloomFilter::sized(n, DEFAULT_FP_PROB)?,
        };
        for path in image_paths(&self.entries) {
            filter.add(path.as_bytes());
        }
        Ok(filter)
    }

    /// Appends the three trailers and closes the sink:
    ///
    /// 1. the encoded entry sequence, followed by its footer slot;
    /// 2. the encoded filter blob;
    /// 3. the filter descriptor locating that blob, followed by the final
    ///    footer slot.
    ///
    /// The last ten bytes of the image therefore locate the descriptor,
    /// and the slot just past the entry blob locates the entries.
    pub fn finalize(mut self) -> Result<()> {
        let filter = self.build_filter()?;

        let entries_loc = self.sink.count() as i64;
        debug!("entry trailer at {entries_loc}");
        let blob = encode_trailer("entries", &self.entries)?;
        self.sink.write(&blob, false)?;
        self.sink.write_varint(entries_loc)?;

        let filter_loc = self.sink.count() as i64;
        let blob = encode_trailer("filter", &filter)?;
        self.sink.write(&blob, false)?;
        let filter_end = self.sink.count() as i64;

        let descriptor = FilterDescriptor {
            active: true,
            name: BLOOM_FILTER_NAME.to_owned(),
            filter_loc,
            filter_size: filter_end - filter_loc,
        };

        let descriptor_loc = self.sink.count() as i64;
        debug!("filter trailer at {filter_loc}, descriptor at {descriptor_loc}");
        let blob = encode_trailer("filter descriptor", &descriptor)?;
        self.sink.write(&blob, false)?;
        self.sink.write_varint(descriptor_loc)?;

        let total = self.sink.close()?;
        info!(
            "image complete: {total} bytes, {} files, {} symlinks, {} directories",
            self.stats.num_files, self.stats.num_symlinks, self.stats.num_dirs
        );
        Ok(())
    }
}

/// Serializes a trailer value and wraps it in base64.  The wrapping keeps
/// the trailer bytes in a textual-safe subset and is part of the format;
/// readers invert it.
fn encode_trailer<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>> {
    let blob = serde_json::to_vec(value).map_err(|source| ImageError::Encode(what, source))?;
    Ok(BASE64_STANDARD.encode(&blob).into_bytes())
}

/// Builds an image by walking the `source` directory tree.
pub fn build_image(source: &Path, output: &Path, page_align: bool) -> Result<()> {
    let mut builder = ImageBuilder::create(output, page_align)?;
    FilesystemWalker::new(&mut builder).walk(source)?;
    builder.finalize()
}

/// Builds an image driven by a manifest script.  `f`-line paths resolve
/// against `root` when relative.
pub fn build_image_from_manifest(
    manifest: &Path,
    root: &Path,
    output: &Path,
    page_align: bool,
    format: ManifestFormat,
) -> Result<()> {
    let mut builder = ImageBuilder::create(output, page_align)?;
    ManifestWalker::new(&mut builder, root).walk(manifest, format)?;
    builder.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_builder(td: &tempfile::TempDir, page_align: bool) -> ImageBuilder {
        ImageBuilder::create(&td.path().join("test.img"), page_align).unwrap()
    }

    #[test]
    fn test_push_file_records_offsets() {
        let td = tempfile::tempdir().unwrap();
        let mut builder = scratch_builder(&td, false);

        builder.push_file("a.txt", b"hello", 7, 0o644).unwrap();
        builder.push_file("b.txt", b"world!", 8, 0o600).unwrap();

        let entries = builder.entries();
        assert_eq!((entries[0].begin, entries[0].end), (0, 5));
        assert_eq!((entries[1].begin, entries[1].end), (5, 11));
        assert_eq!(builder.stats().num_files, 2);
    }

    #[test]
    fn test_push_file_page_aligned_offsets() {
        let td = tempfile::tempdir().unwrap();
        let mut builder = scratch_builder(&td, true);

        builder.push_file("x", b"x", 0, 0).unwrap();
        builder.push_file("y", b"y", 0, 0).unwrap();

        let entries = builder.entries();
        assert_eq!((entries[0].begin, entries[0].end), (0, 1));
        assert_eq!((entries[1].begin, entries[1].end), (4096, 4097));
    }

    #[test]
    fn test_statistics_accumulate() {
        let td = tempfile::tempdir().unwrap();
        let mut builder = scratch_builder(&td, false);

        builder.push_directory_open("d", 0, 0o755);
        builder.push_file("f", b"data", 0, 0o644).unwrap();
        builder.push_symlink("s", "f", 0, 0o777);
        builder.push_whiteout("w", 0);
        builder.push_directory_close();

        assert_eq!(
            *builder.stats(),
            ImageStats {
                num_files: 1,
                num_dirs: 1,
                num_symlinks: 1,
            }
        );
    }

    #[test]
    fn test_filter_construction_from_entries() {
        // Scripted entry stream: a file and a symlink at the root, plus an
        // empty subdirectory in between them.
        let td = tempfile::tempdir().unwrap();
        let mut builder = scratch_builder(&td, false);

        builder.push_file("Apples.txt", b"0123456789", 0, 0o644).unwrap();
        builder.push_directory_open("Groceries", 0, 0o755);
        builder.push_directory_close();
        builder.push_symlink("OtherApples.txt", "Apples.txt", 0, 0o777);

        let filter = builder.build_filter().unwrap();
        assert_eq!(filter.num_elem, 1);
        assert!(filter.test(b"/Apples.txt"));
        assert!(filter.test(b"/OtherApples.txt"));
        assert!(!filter.test(b"/Oranges.txt"));
    }

    #[test]
    fn test_whiteouts_stay_out_of_the_filter() {
        let td = tempfile::tempdir().unwrap();
        let mut builder = scratch_builder(&td, false);

        builder.push_file("present", b"x", 0, 0).unwrap();
        builder.push_whiteout("deleted", 0);

        let filter = builder.build_filter().unwrap();
        assert!(filter.test(b"/present"));
        assert!(!filter.test(b"/deleted"));
    }
}
