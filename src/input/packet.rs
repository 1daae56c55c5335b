//! INPUT channel payload: a burst of the most recent input snapshots
//!
//! ```text
//! [last_frame u32][count u8] count x ([digital u64][analog u64][camera tag u8][camera payload])
//! ```
//!
//! Camera tags: 0 none, 1 lossy (`u64`), 2 raw (`4 x f32`). Sending the
//! whole window every tick lets the receiver fill in frames lost on the
//! unreliable channel. The window is capped at [`MAX_BURST_LEN`] so that a
//! burst of raw camera snapshots still fits in one packet.

use crate::input::camera::CameraDelta;
use crate::input::snapshot::InputSnapshot;
use crate::net::channel::MAX_PACKET_SIZE;
use crate::net::framing::{FrameBuilder, FrameReader};
use crate::util::quat::Quat;
use crate::util::wrapping::FrameId;

const CAMERA_NONE: u8 = 0;
const CAMERA_LOSSY: u8 = 1;
const CAMERA_RAW: u8 = 2;

/// `last_frame` plus `count`
const BURST_HEADER_SIZE: usize = 5;
/// Digital, analog, camera tag and a raw quaternion
const MAX_SNAPSHOT_SIZE: usize = 8 + 8 + 1 + 16;

/// Upper bound on snapshots in one burst; the worst case fills [`MAX_PACKET_SIZE`]
pub const MAX_BURST_LEN: usize = (MAX_PACKET_SIZE - BURST_HEADER_SIZE) / MAX_SNAPSHOT_SIZE;

const _: () = assert!(MAX_BURST_LEN <= u8::MAX as usize);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BurstDecodeError {
    #[error("Input burst truncated at byte {0}")]
    Truncated(usize),
    #[error("Unknown camera tag {0}")]
    UnknownCameraTag(u8),
    #[error("{0} trailing bytes after input burst")]
    TrailingBytes(usize),
}

/// A decoded burst
#[derive(Debug, Clone, PartialEq)]
pub struct InputBurst {
    /// Frame of the last snapshot
    pub last_frame: FrameId,
    /// Snapshots oldest first; snapshot `i` belongs to `first_frame() + i`
    pub snapshots: Vec<InputSnapshot>,
}

impl InputBurst {
    pub fn first_frame(&self) -> FrameId {
        self.last_frame
            .wrapping_sub(self.snapshots.len().saturating_sub(1) as u32)
    }

    /// `(frame, snapshot)` pairs oldest first
    pub fn frames(&self) -> impl Iterator<Item = (FrameId, &InputSnapshot)> + '_ {
        let first = self.first_frame();
        self.snapshots
            .iter()
            .enumerate()
            .map(move |(i, s)| (first.wrapping_add(i as u32), s))
    }
}

/// Encode the newest `MAX_BURST_LEN` snapshots ending at `last_frame`
pub fn encode_input_burst(last_frame: FrameId, snapshots: &[InputSnapshot]) -> Vec<u8> {
    let skip = snapshots.len().saturating_sub(MAX_BURST_LEN);
    let snapshots = &snapshots[skip..];

    let mut builder = FrameBuilder::with_capacity(BURST_HEADER_SIZE + snapshots.len() * MAX_SNAPSHOT_SIZE)
        .write_u32(last_frame)
        .write_u8(snapshots.len() as u8);

    for s in snapshots {
        builder = builder.write_u64(s.digital).write_u64(s.analog);
        builder = match s.camera {
            CameraDelta::None => builder.write_u8(CAMERA_NONE),
            CameraDelta::Lossy(bits) => builder.write_u8(CAMERA_LOSSY).write_u64(bits),
            CameraDelta::Raw(q) => builder
                .write_u8(CAMERA_RAW)
                .write_f32(q.x)
                .write_f32(q.y)
                .write_f32(q.z)
                .write_f32(q.w),
        };
    }

    builder.build()
}

pub fn decode_input_burst(data: &[u8]) -> Result<InputBurst, BurstDecodeError> {
    let mut reader = FrameReader::new(data);
    let truncated = |r: &FrameReader| BurstDecodeError::Truncated(r.position());

    let last_frame = reader.read_u32().ok_or_else(|| truncated(&reader))?;
    let count = reader.read_u8().ok_or_else(|| truncated(&reader))? as usize;

    let mut snapshots = Vec::with_capacity(count);
    for _ in 0..count {
        let digital = reader.read_u64().ok_or_else(|| truncated(&reader))?;
        let analog = reader.read_u64().ok_or_else(|| truncated(&reader))?;
        let camera = match reader.read_u8().ok_or_else(|| truncated(&reader))? {
            CAMERA_NONE => CameraDelta::None,
            CAMERA_LOSSY => CameraDelta::Lossy(reader.read_u64().ok_or_else(|| truncated(&reader))?),
            CAMERA_RAW => {
                let mut c = [0.0f32; 4];
                for v in c.iter_mut() {
                    *v = reader.read_f32().ok_or_else(|| truncated(&reader))?;
                }
                CameraDelta::Raw(Quat::from_array(c))
            }
            tag => return Err(BurstDecodeError::UnknownCameraTag(tag)),
        };
        snapshots.push(InputSnapshot {
            digital,
            analog,
            camera,
        });
    }

    if reader.has_remaining() {
        return Err(BurstDecodeError::TrailingBytes(reader.remaining().len()));
    }

    Ok(InputBurst {
        last_frame,
        snapshots,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::history::FixedWindowHistory;

    fn snapshot(i: u64) -> InputSnapshot {
        InputSnapshot {
            digital: i,
            analog: i << 8,
            camera: match i % 3 {
                0 => CameraDelta::None,
                1 => CameraDelta::Lossy(i * 7),
                _ => CameraDelta::Raw(Quat::from_axis_angle([0.0, 0.0, 1.0], i as f32 * 0.1)),
            },
        }
    }

    #[test]
    fn test_burst_from_history_window() {
        let mut history = FixedWindowHistory::new(2, 8);
        for f in 100..110u32 {
            history.push(f, snapshot(u64::from(f)));
        }

        let (data, last) = history.raw_data();
        let bytes = encode_input_burst(last.unwrap(), data);
        let burst = decode_input_burst(&bytes).unwrap();

        assert_eq!(burst.last_frame, 109);
        assert_eq!(burst.first_frame(), 102);
        assert_eq!(burst.snapshots.len(), 8);
        for (frame, s) in burst.frames() {
            assert_eq!(*s, snapshot(u64::from(frame)));
        }
    }

    #[test]
    fn test_empty_burst() {
        let bytes = encode_input_burst(0, &[]);
        assert_eq!(bytes.len(), 5);
        let burst = decode_input_burst(&bytes).unwrap();
        assert!(burst.snapshots.is_empty());
        assert_eq!(burst.first_frame(), 0);
    }

    #[test]
    fn test_truncated_burst() {
        let bytes = encode_input_burst(5, &[snapshot(1), snapshot(2)]);
        let err = decode_input_burst(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, BurstDecodeError::Truncated(_)));
    }

    #[test]
    fn test_bad_camera_tag() {
        let mut bytes = encode_input_burst(5, &[snapshot(0)]);
        let tag_pos = bytes.len() - 1;
        bytes[tag_pos] = 9;
        assert_eq!(decode_input_burst(&bytes), Err(BurstDecodeError::UnknownCameraTag(9)));
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = encode_input_burst(5, &[snapshot(0)]);
        bytes.push(0);
        assert_eq!(decode_input_burst(&bytes), Err(BurstDecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_oversized_burst_keeps_newest() {
        let snapshots: Vec<_> = (0..300u64).map(snapshot).collect();
        let burst = decode_input_burst(&encode_input_burst(299, &snapshots)).unwrap();
        assert_eq!(burst.snapshots.len(), MAX_BURST_LEN);
        assert_eq!(burst.snapshots.last(), snapshots.last());
        assert_eq!(burst.first_frame(), 299 - (MAX_BURST_LEN as u32 - 1));
    }

    #[test]
    fn test_full_raw_camera_burst_fits_packet() {
        let raw = InputSnapshot {
            digital: u64::MAX >> 1,
            analog: u64::MAX,
            camera: CameraDelta::Raw(Quat::from_axis_angle([0.0, 1.0, 0.0], 0.3)),
        };
        let bytes = encode_input_burst(1000, &vec![raw; u8::MAX as usize]);
        assert!(bytes.len() <= MAX_PACKET_SIZE, "{} bytes", bytes.len());
        assert_eq!(bytes.len(), BURST_HEADER_SIZE + MAX_BURST_LEN * MAX_SNAPSHOT_SIZE);
        assert_eq!(decode_input_burst(&bytes).unwrap().snapshots.len(), MAX_BURST_LEN);
    }
}
