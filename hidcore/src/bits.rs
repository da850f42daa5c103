//! Bit-level access to report buffers.
//!
//! Report fields are addressed by a bit offset and a bit width, counted from
//! the least significant bit of the first byte of the report. Fields neither
//! have to start nor end on a byte boundary.
//!
//! Field values are kept as little-endian 32-bit words, bit `n` of the field
//! living in bit `n % 32` of word `n / 32`.

/// Returns the amount of 32-bit words needed to hold a field of `width` bits.
pub fn words_for(width: u32) -> usize {
    width.div_ceil(32) as usize
}

/// Checks whether a field lies entirely inside a buffer of `len` bytes.
pub fn fits(len: usize, offset: u32, width: u32) -> bool {
    let end = offset as u64 + width as u64;
    end <= len as u64 * 8
}

/// Reads a field from a report buffer into `dst`.
///
/// `dst` must hold at least [`words_for`] words and is cleared first.
/// Returns `false` without touching `dst` if the field does not fit the
/// buffer.
pub fn read(src: &[u8], offset: u32, width: u32, dst: &mut [u32]) -> bool {
    if !fits(src.len(), offset, width) || dst.len() < words_for(width) {
        return false;
    }

    dst.iter_mut().for_each(|word| *word = 0);

    for i in 0..width {
        let pos = (offset + i) as usize;
        let bit = (src[pos / 8] >> (pos % 8)) & 1;
        dst[(i / 32) as usize] |= (bit as u32) << (i % 32);
    }

    true
}

/// Writes a field into a report buffer, leaving all other bits untouched.
///
/// Bits of `src` beyond `width` are ignored. Returns `false` without
/// touching `dst` if the field does not fit the buffer.
pub fn write(dst: &mut [u8], offset: u32, width: u32, src: &[u32]) -> bool {
    if !fits(dst.len(), offset, width) {
        return false;
    }

    for i in 0..width {
        let bit = src
            .get((i / 32) as usize)
            .map_or(0, |word| (word >> (i % 32)) & 1) as u8;
        let pos = (offset + i) as usize;
        dst[pos / 8] = (dst[pos / 8] & !(1 << (pos % 8))) | (bit << (pos % 8));
    }

    true
}

/// Interprets the lowest `width` bits of `raw` as a two's complement number.
pub fn sign_extend(raw: u32, width: u32) -> i32 {
    if width == 0 || width >= 32 {
        return raw as i32;
    }

    let shift = 32 - width;
    ((raw << shift) as i32) >> shift
}

/// Truncates a logical value to the lowest `width` bits, spread over as many
/// words as the width needs. Signed values are sign extended into the upper
/// words.
pub fn from_logical(value: i64, width: u32) -> Vec<u32> {
    let mut words = vec![0u32; words_for(width).max(1)];
    for (i, word) in words.iter_mut().enumerate() {
        let shift = i * 32;
        *word = if shift < 64 {
            (value >> shift) as u32
        } else if value < 0 {
            u32::MAX
        } else {
            0
        };
    }

    let tail = width % 32;
    if tail != 0 {
        if let Some(last) = words.last_mut() {
            *last &= (1u32 << tail) - 1;
        }
    }

    words
}
