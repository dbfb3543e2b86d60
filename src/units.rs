//! Byte-count conversions and the reproducible fill pattern used by the probe.

pub const KILOBYTE: u64 = 1024;
pub const MEGABYTE: u64 = KILOBYTE * 1024;
pub const GIGABYTE: u64 = MEGABYTE * 1024;

fn round_to(value: f64, decimal_places: u32) -> f64 {
    let scale = 10f64.powi(decimal_places as i32);
    (value * scale).round() / scale
}

pub fn byte_count_to_kb(byte_count: u64, decimal_places: u32) -> f64 {
    round_to(byte_count as f64 / KILOBYTE as f64, decimal_places)
}

pub fn byte_count_to_mb(byte_count: u64, decimal_places: u32) -> f64 {
    round_to(byte_count as f64 / MEGABYTE as f64, decimal_places)
}

pub fn byte_count_to_gb(byte_count: u64, decimal_places: u32) -> f64 {
    round_to(byte_count as f64 / GIGABYTE as f64, decimal_places)
}

/// Converts a copy rate in bytes/ms to GB/s.
pub fn bytes_per_ms_to_gb_per_sec(bytes_per_ms: f64, decimal_places: u32) -> f64 {
    round_to(bytes_per_ms * 1000.0 / GIGABYTE as f64, decimal_places)
}

/// Formats a byte count with the largest fitting unit, e.g. `1023 B`, `1.0 KB`, `2.5 GB`.
pub fn format_byte_count(byte_count: u64) -> String {
    if byte_count < KILOBYTE {
        format!("{} B", byte_count)
    } else if byte_count < MEGABYTE {
        format!("{:.1} KB", byte_count_to_kb(byte_count, 1))
    } else if byte_count < GIGABYTE {
        format!("{:.1} MB", byte_count_to_mb(byte_count, 1))
    } else {
        format!("{:.1} GB", byte_count_to_gb(byte_count, 1))
    }
}

/// Pseudo-random but reproducible byte for a buffer offset.
///
/// Test buffers are filled with this instead of a constant so that a host which
/// compresses or deduplicates memory pages cannot satisfy the allocation cheaply.
/// Only the low 32 bits of the offset take part in the hash.
pub fn randomish_memory_value(offset: u64) -> u8 {
    let mut x = offset as u32;
    x ^= x >> 17;
    x = x.wrapping_mul(0xed5a_d4bb);
    x ^= x >> 11;
    x = x.wrapping_mul(0xac4c_1b51);
    x ^= x >> 15;
    x = x.wrapping_mul(0x3184_8bab);
    x ^= x >> 14;
    (x & 0xff) as u8
}

/// Fills `buf` with the pattern, `base_offset` being the offset of `buf[0]`.
pub fn fill_with_pattern(buf: &mut [u8], base_offset: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = randomish_memory_value(base_offset + i as u64);
    }
}
