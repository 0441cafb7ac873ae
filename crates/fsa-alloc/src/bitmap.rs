//! Bit operations on cluster bitmaps (1 = used, little-endian bit order).

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Set bits `start..end`, whole bytes at a time where possible.
pub fn bitmap_set_range(bitmap: &mut [u8], start: u32, end: u32) {
    let mut i = start;
    while i < end && i % 8 != 0 {
        bitmap_set(bitmap, i);
        i += 1;
    }
    while i + 8 <= end {
        let byte_idx = (i / 8) as usize;
        if byte_idx >= bitmap.len() {
            return;
        }
        bitmap[byte_idx] = 0xFF;
        i += 8;
    }
    while i < end {
        bitmap_set(bitmap, i);
        i += 1;
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// First zero bit in `start..end`, or `end` if every bit is set.
#[must_use]
pub fn bitmap_find_next_zero(bitmap: &[u8], end: u32, start: u32) -> u32 {
    (start..end)
        .find(|&idx| !bitmap_get(bitmap, idx))
        .unwrap_or(end)
}

/// Mark every bit from `start_bit` up to `end_bit` as used.
///
/// Pads the tail of a bitmap whose group is shorter than the bitmap block's
/// capacity (the last group of a filesystem), so the padding is never
/// handed out.
pub fn mark_bitmap_end(start_bit: u32, end_bit: u32, bitmap: &mut [u8]) {
    if start_bit >= end_bit {
        return;
    }
    bitmap_set_range(bitmap, start_bit, end_bit);
}
