//! Append-only byte sink backing an image build.
//!
//! The sink owns all file-offset arithmetic: it tracks the running byte
//! count, pads writes out to the page boundary when asked, and emits the
//! fixed-width varint footer slots.  It is single-shot: closing consumes
//! the sink, so nothing can be appended to a finished image.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;

use crate::error::Result;
use crate::varint::{encode_varint, MAX_VARINT_LEN};
use crate::PAGE_BOUNDARY;

/// Buffered append-only writer for an image file.
pub struct ImageSink {
    out: BufWriter<File>,
    count: u64,
}

impl ImageSink {
    /// Creates (or truncates) the backing file and attaches a buffered
    /// writer.  The byte counter starts at zero.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let out = BufWriter::new(File::create(path)?);
        Ok(Self { out, count: 0 })
    }

    /// The number of bytes laid out so far, padding included.  This is the
    /// `begin` offset of whatever gets written next.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Appends `data` and, if `page_align` is set, pads the layout out to
    /// the next multiple of [`PAGE_BOUNDARY`] with zero bytes.
    ///
    /// Returns the counter value after the data but *before* the padding:
    /// the exclusive upper bound of the logical payload.  The internal
    /// counter advances past the padding.  Conflating the two corrupts the
    /// entry offsets of a page-aligned image.
    pub fn write(&mut self, data: &[u8], page_align: bool) -> Result<u64> {
        self.out.write_all(data)?;
        self.count += data.len() as u64;
        let real_end = self.count;

        if page_align {
            let pad = (PAGE_BOUNDARY - self.count % PAGE_BOUNDARY) % PAGE_BOUNDARY;
            if pad > 0 {
                debug!("write of {} bytes padded by {pad}", data.len());
                self.out.write_all(&vec![0u8; pad as usize])?;
                self.count += pad;
            }
        }

        Ok(real_end)
    }

    /// Writes `v` as a zero-padded [`MAX_VARINT_LEN`]-byte footer slot,
    /// never page aligned.
    pub fn write_varint(&mut self, v: i64) -> Result<u64> {
        let mut slot = [0u8; MAX_VARINT_LEN];
        encode_varint(v, &mut slot);
        self.write(&slot, false)
    }

    /// Flushes and closes the backing file, returning the final byte count.
    pub fn close(mut self) -> Result<u64> {
        self.out.flush()?;
        Ok(self.count)
    }
}
