//! Wraparound arithmetic for 32-bit frame identifiers
//!
//! Frame ids grow by one per simulation tick and wrap at `u32::MAX`. A frame
//! is "newer" when the signed difference to the other frame is positive, so
//! ordering stays correct across the wrap boundary as long as the two frames
//! are less than 2^31 ticks apart.

/// Frame identifier
pub type FrameId = u32;

/// Signed distance from `from` to `to`
///
/// `frame_diff(1, 2) == 1`, `frame_diff(u32::MAX, 0) == 1`, `frame_diff(0, u32::MAX) == -1`
#[inline]
pub fn frame_diff(from: FrameId, to: FrameId) -> i32 {
    to.wrapping_sub(from) as i32
}

/// Returns whether `a` is strictly newer than `b`
#[inline]
pub fn frame_newer(a: FrameId, b: FrameId) -> bool {
    frame_diff(b, a) > 0
}

/// Returns whether `a` is strictly older than `b`
#[inline]
pub fn frame_older(a: FrameId, b: FrameId) -> bool {
    frame_newer(b, a)
}

/// Returns whether `a` is newer than a 16-bit datagram sequence `b`
#[inline]
pub fn sequence_newer(a: u16, b: u16) -> bool {
    (b.wrapping_sub(a) as i16) < 0
}
