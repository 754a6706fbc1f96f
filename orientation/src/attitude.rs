//! Initial attitude from a single accelerometer + magnetometer reading.
//!
//! Roll and pitch come from the gravity vector, heading from the magnetometer after
//! removing the tilt. No gyroscope is involved, so the result carries no integration drift.

use log::{debug, warn};

use crate::error::FilterError;
use crate::quaternion::Quaternion;
use crate::vector::{is_valid_reading, normalized};
use crate::{F, Vector3};

/// z-y-x Euler angles in radians.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EulerAngles {
    pub roll: F,
    pub pitch: F,
    pub heading: F,
}

impl EulerAngles {
    /// Level attitude implied by the accelerometer, heading left at zero.
    pub fn from_gravity(accel: Vector3) -> Result<Self, FilterError> {
        if !is_valid_reading(accel) {
            return Err(FilterError::InvalidSample);
        }
        let [ax, ay, az] = normalized(accel).map_err(|_| FilterError::InvalidSample)?;

        Ok(Self {
            roll: libm::atan2f(ay, az),
            pitch: libm::atan2f(-ax, libm::sqrtf(ay * ay + az * az)),
            heading: 0.0,
        })
    }

    /// Full attitude; heading stays zero when the magnetometer has no usable horizontal
    /// component.
    pub fn from_imu(accel: Vector3, mag: Option<Vector3>) -> Result<Self, FilterError> {
        let mut angles = Self::from_gravity(accel)?;
        if let Some(heading) = mag.and_then(|mag| tilt_compensated_heading(angles, mag)) {
            angles.heading = heading;
        }
        Ok(angles)
    }
}

fn tilt_compensated_heading(tilt: EulerAngles, mag: Vector3) -> Option<F> {
    if !is_valid_reading(mag) {
        return None;
    }
    let [mx, my, mz] = normalized(mag).ok()?;

    let (sr, cr) = (libm::sinf(tilt.roll), libm::cosf(tilt.roll));
    let (sp, cp) = (libm::sinf(tilt.pitch), libm::cosf(tilt.pitch));

    // magnetometer rotated back onto the horizontal plane
    let mxh = mx * cp + (my * sr + mz * cr) * sp;
    let myh = my * cr - mz * sr;

    if mxh * mxh + myh * myh < 1e-12 {
        // field parallel to gravity, heading undefined
        return None;
    }
    Some(libm::atan2f(-myh, mxh))
}

/// Seed orientation for a filter.
///
/// Fails with [`FilterError::InvalidSample`] when the accelerometer carries no gravity
/// direction (zero or non-finite), which always covers the all-zero accel + mag pair.
pub fn initial_attitude(accel: Vector3, mag: Option<Vector3>) -> Result<Quaternion, FilterError> {
    let angles = EulerAngles::from_imu(accel, mag).inspect_err(|_| {
        warn!("refusing to seed orientation from accel={accel:?} mag={mag:?}");
    })?;

    let q = Quaternion::from_euler(angles)
        .normalized()
        .map_err(|_| FilterError::InvalidSample)?;

    debug!(
        "seeded orientation from roll={} pitch={} heading={}: {q:?}",
        angles.roll, angles.pitch, angles.heading
    );
    Ok(q)
}

#[cfg(test)]
fn assert_quat_close(a: Quaternion, b: Quaternion) {
    // q and -q describe the same orientation
    let d = a
        .into_array()
        .iter()
        .zip(b.into_array())
        .map(|(a, b)| a * b)
        .sum::<F>()
        .abs();
    assert!((d - 1.0).abs() < 1e-5, "{a:?} != {b:?}");
}

#[test]
fn level_and_north_is_identity() {
    let q = initial_attitude([0.0, 0.0, 1.0], Some([1.0, 0.0, 0.0])).unwrap();

    assert!((q.w - 1.0).abs() < 1e-6);
    assert!(q.x.abs() < 1e-6);
    assert!(q.y.abs() < 1e-6);
    assert!(q.z.abs() < 1e-6);
}

#[test]
fn all_zero_readings_are_rejected() {
    assert_eq!(
        initial_attitude([0.0; 3], Some([0.0; 3])),
        Err(FilterError::InvalidSample)
    );
    assert_eq!(
        initial_attitude([0.0; 3], Some([1.0, 0.0, 0.0])),
        Err(FilterError::InvalidSample)
    );
    assert_eq!(
        initial_attitude([F::NAN, 0.0, 1.0], None),
        Err(FilterError::InvalidSample)
    );
}

#[test]
fn missing_magnetometer_leaves_heading_at_zero() {
    let q = initial_attitude([0.0, 0.0, 9.81], None).unwrap();
    assert_quat_close(q, Quaternion::IDENTITY);

    let q = initial_attitude([0.0, 0.0, 9.81], Some([0.0; 3])).unwrap();
    assert_quat_close(q, Quaternion::IDENTITY);

    // field pointing straight down carries no heading
    let q = initial_attitude([0.0, 0.0, 1.0], Some([0.0, 0.0, -0.5])).unwrap();
    assert_quat_close(q, Quaternion::IDENTITY);
}

#[test]
fn seed_reproduces_a_known_attitude() {
    let truth = Quaternion::from_euler(EulerAngles {
        roll: 0.35,
        pitch: -0.2,
        heading: 1.1,
    });

    // what a sensor with that orientation reads in a field with dip
    let earth_field = [0.6, 0.0, -0.8];
    let accel = truth.conjugate().rotate([0.0, 0.0, 1.0]);
    let mag = truth.conjugate().rotate(earth_field);

    let q = initial_attitude(accel, Some(mag)).unwrap();
    assert_quat_close(q, truth);
    assert!((q.norm() - 1.0).abs() < 1e-6);
}

#[test]
fn heading_follows_the_magnetometer() {
    // sensor yawed +90°: north now lies along the sensor's -y axis
    let angles = EulerAngles::from_imu([0.0, 0.0, 1.0], Some([0.0, -1.0, 0.0])).unwrap();
    assert!((angles.heading - core::f32::consts::FRAC_PI_2).abs() < 1e-5);
    assert!(angles.roll.abs() < 1e-6);
    assert!(angles.pitch.abs() < 1e-6);
}
