use core::ops;

use crate::attitude::EulerAngles;
use crate::error::FilterError;
use crate::vector::normalize_components;
use crate::{F, Vector3};

/// Hamilton quaternion `w + xi + yj + zk`.
///
/// As an orientation it rotates sensor-frame vectors into the earth frame.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Quaternion {
    pub w: F,
    pub x: F,
    pub y: F,
    pub z: F,
}

impl Quaternion {
    pub const IDENTITY: Self = Self::new(1.0, 0.0, 0.0, 0.0);

    pub const fn new(w: F, x: F, y: F, z: F) -> Self {
        Self { w, x, y, z }
    }

    /// Pure quaternion `(0, v)`.
    pub const fn pure(v: Vector3) -> Self {
        Self::new(0.0, v[0], v[1], v[2])
    }

    pub fn conjugate(self) -> Self {
        Self::new(self.w, -self.x, -self.y, -self.z)
    }

    pub fn norm_squared(self) -> F {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    pub fn norm(self) -> F {
        libm::sqrtf(self.norm_squared())
    }

    pub fn normalized(self) -> Result<Self, FilterError> {
        let [w, x, y, z] = normalize_components(self.into_array())?;
        Ok(Self::new(w, x, y, z))
    }

    pub fn is_finite(self) -> bool {
        self.w.is_finite() && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    /// Vector part.
    pub fn vector(self) -> Vector3 {
        [self.x, self.y, self.z]
    }

    /// `q ⊗ (0, v) ⊗ q*`, assumes `self` is a unit quaternion.
    pub fn rotate(self, v: Vector3) -> Vector3 {
        (self * Self::pure(v) * self.conjugate()).vector()
    }

    /// Scalar-first `[w, x, y, z]`. Consumers taking scalar-last quaternions (three.js
    /// `Quaternion(x, y, z, w)` for one) have to reorder.
    pub fn into_array(self) -> [F; 4] {
        [self.w, self.x, self.y, self.z]
    }

    /// Heading-pitch-roll (z-y-x) angles to quaternion.
    pub fn from_euler(angles: EulerAngles) -> Self {
        let cy = libm::cosf(angles.heading * 0.5);
        let sy = libm::sinf(angles.heading * 0.5);
        let cp = libm::cosf(angles.pitch * 0.5);
        let sp = libm::sinf(angles.pitch * 0.5);
        let cr = libm::cosf(angles.roll * 0.5);
        let sr = libm::sinf(angles.roll * 0.5);

        Self::new(
            cr * cp * cy + sr * sp * sy,
            sr * cp * cy - cr * sp * sy,
            cr * sp * cy + sr * cp * sy,
            cr * cp * sy - sr * sp * cy,
        )
    }

    /// Inverse of [`Quaternion::from_euler`]; pitch is clamped to ±90° at the poles.
    pub fn to_euler(self) -> EulerAngles {
        let Self { w, x, y, z } = self;

        let roll = libm::atan2f(2.0 * (w * x + y * z), 1.0 - 2.0 * (x * x + y * y));
        let pitch = libm::asinf((2.0 * (w * y - z * x)).clamp(-1.0, 1.0));
        let heading = libm::atan2f(2.0 * (w * z + x * y), 1.0 - 2.0 * (y * y + z * z));

        EulerAngles {
            roll,
            pitch,
            heading,
        }
    }
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<Quaternion> for [F; 4] {
    fn from(q: Quaternion) -> Self {
        q.into_array()
    }
}

impl ops::Mul<Quaternion> for Quaternion {
    type Output = Self;

    fn mul(self, b: Self) -> Self {
        let a = self;
        Self::new(
            a.w * b.w - a.x * b.x - a.y * b.y - a.z * b.z,
            a.w * b.x + a.x * b.w + a.y * b.z - a.z * b.y,
            a.w * b.y - a.x * b.z + a.y * b.w + a.z * b.x,
            a.w * b.z + a.x * b.y - a.y * b.x + a.z * b.w,
        )
    }
}

impl ops::Mul<F> for Quaternion {
    type Output = Self;

    fn mul(self, k: F) -> Self {
        Self::new(self.w * k, self.x * k, self.y * k, self.z * k)
    }
}

impl ops::Mul<Quaternion> for F {
    type Output = Quaternion;

    fn mul(self, q: Quaternion) -> Quaternion {
        q * self
    }
}

impl ops::MulAssign<F> for Quaternion {
    fn mul_assign(&mut self, k: F) {
        *self = *self * k;
    }
}

impl ops::Add for Quaternion {
    type Output = Self;

    fn add(self, b: Self) -> Self {
        Self::new(self.w + b.w, self.x + b.x, self.y + b.y, self.z + b.z)
    }
}

impl ops::AddAssign for Quaternion {
    fn add_assign(&mut self, b: Self) {
        *self = *self + b;
    }
}

impl ops::Sub for Quaternion {
    type Output = Self;

    fn sub(self, b: Self) -> Self {
        Self::new(self.w - b.w, self.x - b.x, self.y - b.y, self.z - b.z)
    }
}

impl ops::SubAssign for Quaternion {
    fn sub_assign(&mut self, b: Self) {
        *self = *self - b;
    }
}

#[cfg(test)]
fn assert_vec_close(a: Vector3, b: Vector3) {
    for i in 0..3 {
        assert!((a[i] - b[i]).abs() < 1e-5, "{a:?} != {b:?}");
    }
}

#[test]
fn hamilton_product_basis() {
    let i = Quaternion::new(0.0, 1.0, 0.0, 0.0);
    let j = Quaternion::new(0.0, 0.0, 1.0, 0.0);
    let k = Quaternion::new(0.0, 0.0, 0.0, 1.0);

    assert_eq!(i * j, k);
    assert_eq!(j * k, i);
    assert_eq!(k * i, j);
    assert_eq!(j * i, Quaternion::new(0.0, 0.0, 0.0, -1.0));
    assert_eq!(i * i, Quaternion::new(-1.0, 0.0, 0.0, 0.0));
}

#[test]
fn normalizing_zero_quaternion_fails() {
    assert_eq!(
        Quaternion::new(0.0, 0.0, 0.0, 0.0).normalized(),
        Err(FilterError::DegenerateNormalization)
    );

    let q = Quaternion::new(2.0, 0.0, 0.0, 0.0).normalized().unwrap();
    assert_eq!(q, Quaternion::IDENTITY);

    let q = Quaternion::new(0.0, 3e25, 0.0, 4e25).normalized().unwrap();
    assert!((q.x - 0.6).abs() < 1e-6);
    assert!((q.z - 0.8).abs() < 1e-6);
}

#[test]
fn array_is_scalar_first() {
    let q = Quaternion::new(0.5, -0.5, 0.5, -0.5);
    assert_eq!(q.into_array(), [0.5, -0.5, 0.5, -0.5]);
    assert_eq!(<[F; 4]>::from(q.conjugate()), [0.5, 0.5, -0.5, 0.5]);
}

#[test]
fn rotate_quarter_turn_about_z() {
    let half = core::f32::consts::FRAC_PI_4;
    let q = Quaternion::new(libm::cosf(half), 0.0, 0.0, libm::sinf(half));

    assert_vec_close(q.rotate([1.0, 0.0, 0.0]), [0.0, 1.0, 0.0]);
    assert_vec_close(q.rotate([0.0, 0.0, 1.0]), [0.0, 0.0, 1.0]);
}

#[test]
fn euler_conversion_matches_axis_rotations() {
    let roll = Quaternion::from_euler(EulerAngles {
        roll: 0.3,
        pitch: 0.0,
        heading: 0.0,
    });
    assert!((roll.w - libm::cosf(0.15)).abs() < 1e-6);
    assert!((roll.x - libm::sinf(0.15)).abs() < 1e-6);

    let angles = EulerAngles {
        roll: 0.4,
        pitch: -0.7,
        heading: 2.5,
    };
    let back = Quaternion::from_euler(angles).to_euler();
    assert!((back.roll - angles.roll).abs() < 1e-5);
    assert!((back.pitch - angles.pitch).abs() < 1e-5);
    assert!((back.heading - angles.heading).abs() < 1e-5);
}
