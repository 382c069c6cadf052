//! Little-endian wire encoding helpers.
//!
//! The worker protocol is little-endian throughout: 32-bit integers,
//! IEEE-754 f32 floats, NUL-terminated strings. These helpers keep the
//! byte fiddling in one place.

/// Append a `u32` in little-endian order.
#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append an `i32` in little-endian order.
#[inline]
pub fn append_i32_le(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append an `f32` in little-endian order.
#[inline]
pub fn append_f32_le(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a NUL-terminated string.
///
/// The protocol has no escaping: embedded NULs would truncate the string
/// on the far side, so callers must not pass them.
#[inline]
pub fn append_zstr(buf: &mut Vec<u8>, s: &str) {
    debug_assert!(!s.as_bytes().contains(&0), "wire strings cannot embed NUL");
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Read a `u32` from the start of `src`, if 4 bytes are available.
#[inline]
#[must_use]
pub fn read_u32_le(src: &[u8]) -> Option<u32> {
    let bytes: [u8; 4] = src.get(..4)?.try_into().ok()?;
    Some(u32::from_le_bytes(bytes))
}

/// Read an `i32` from the start of `src`, if 4 bytes are available.
#[inline]
#[must_use]
pub fn read_i32_le(src: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = src.get(..4)?.try_into().ok()?;
    Some(i32::from_le_bytes(bytes))
}

/// Read an `f32` from the start of `src`, if 4 bytes are available.
#[inline]
#[must_use]
pub fn read_f32_le(src: &[u8]) -> Option<f32> {
    let bytes: [u8; 4] = src.get(..4)?.try_into().ok()?;
    Some(f32::from_le_bytes(bytes))
}

/// Pack a 4-byte ASCII tag into its little-endian `u32` wire value.
#[inline]
#[must_use]
pub const fn pack_tag(tag: [u8; 4]) -> u32 {
    u32::from_le_bytes(tag)
}

/// Recover the ASCII bytes of a packed tag, for diagnostics.
#[inline]
#[must_use]
pub const fn unpack_tag(v: u32) -> [u8; 4] {
    v.to_le_bytes()
}
