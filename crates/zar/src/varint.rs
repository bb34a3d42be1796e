//! Variable-length signed integer codec used by the image footers.
//!
//! Values are zig-zag mapped and then emitted as little-endian base-128
//! groups: seven payload bits per byte, high bit set on every byte except
//! the last.  Any 64-bit value fits in [`MAX_VARINT_LEN`] bytes, which is
//! why the footer slots are exactly that wide.

/// Maximum encoded width of a 64-bit value; also the footer slot width.
pub const MAX_VARINT_LEN: usize = 10;

/// Encodes `v` into the front of `buf`, returning the number of bytes
/// written.  The remainder of the slot is left untouched, so a zeroed
/// buffer yields the zero-padded fixed-width footer form.
pub fn encode_varint(v: i64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut ux = ((v << 1) ^ (v >> 63)) as u64;
    let mut i = 0;
    while ux >= 0x80 {
        buf[i] = ux as u8 | 0x80;
        ux >>= 7;
        i += 1;
    }
    buf[i] = ux as u8;
    i + 1
}

/// Decodes a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.  Trailing slot padding is ignored.  Returns
/// `None` for unterminated or overlong input.
pub fn decode_varint(buf: &[u8]) -> Option<(i64, usize)> {
    let mut ux: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return None; // more than 64 bits
            }
            ux |= (b as u64) << shift;
            let v = (ux >> 1) as i64 ^ -((ux & 1) as i64);
            return Some((v, i + 1));
        }
        ux |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}
