use serde::{Deserialize, Serialize};

/// Rotation quaternion used for per-frame camera deltas
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    #[inline]
    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    /// Rotation of `angle` radians around a (not necessarily unit) axis
    pub fn from_axis_angle(axis: [f32; 3], angle: f32) -> Self {
        let len = (axis[0] * axis[0] + axis[1] * axis[1] + axis[2] * axis[2]).sqrt();
        if len == 0.0 {
            return Self::IDENTITY;
        }
        let (s, c) = (angle * 0.5).sin_cos();
        let k = s / len;
        Self::new(axis[0] * k, axis[1] * k, axis[2] * k, c)
    }

    #[inline]
    pub fn to_array(self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }

    #[inline]
    pub fn from_array(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }

    #[inline]
    pub fn dot(&self, other: Quat) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    #[inline]
    pub fn length(&self) -> f32 {
        self.dot(*self).sqrt()
    }

    pub fn normalize(&self) -> Self {
        let len = self.length();
        if len > 0.0 && len.is_finite() {
            Self::new(self.x / len, self.y / len, self.z / len, self.w / len)
        } else {
            Self::IDENTITY
        }
    }

    /// True when both quaternions describe the same rotation within `epsilon`
    /// (q and -q are the same rotation)
    pub fn same_rotation(&self, other: Quat, epsilon: f32) -> bool {
        (1.0 - self.dot(other).abs()) < epsilon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_default() {
        assert_eq!(Quat::default(), Quat::IDENTITY);
        assert!((Quat::IDENTITY.length() - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_axis_angle_is_unit() {
        let q = Quat::from_axis_angle([0.0, 2.0, 0.0], 1.2);
        assert!((q.length() - 1.0).abs() < 1e-5);
        assert!(q.y > 0.0);
    }

    #[test]
    fn test_zero_axis_is_identity() {
        assert_eq!(Quat::from_axis_angle([0.0, 0.0, 0.0], 1.0), Quat::IDENTITY);
    }

    #[test]
    fn test_same_rotation_negated() {
        let q = Quat::from_axis_angle([1.0, 0.0, 0.0], 0.7);
        let neg = Quat::new(-q.x, -q.y, -q.z, -q.w);
        assert!(q.same_rotation(neg, 1e-6));
    }

    #[test]
    fn test_normalize_degenerate() {
        let q = Quat::new(0.0, 0.0, 0.0, 0.0).normalize();
        assert_eq!(q, Quat::IDENTITY);
    }
}
