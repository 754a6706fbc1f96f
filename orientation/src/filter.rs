//! Gradient-descent orientation filter for IMU (gyro + accel) and MARG (gyro + accel + mag)
//! sensors.
//!
//! Every step integrates the gyroscope rate and subtracts `beta` times the normalized
//! gradient of the orientation error implied by the accelerometer (and magnetometer),
//! then re-normalizes. Readings that can not be used for a correction only remove that
//! correction term; the stored quaternion is never allowed to become non-finite.

use log::{debug, trace, warn};

use crate::attitude::initial_attitude;
use crate::config::{FilterConfig, validate_sample_period};
use crate::error::FilterError;
use crate::quaternion::Quaternion;
use crate::vector::{is_valid_reading, normalized};
use crate::{F, ImuSample, Vector3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterState {
    /// waiting for a sample to seed the orientation from
    Uninitialized,
    Tracking,
}

/// Owns the orientation estimate. Not internally synchronized; callers feeding it from
/// several contexts must serialize updates.
#[derive(Debug, Clone)]
pub struct OrientationFilter {
    /// filter tune
    beta: F,

    /// integration step in seconds
    sample_period: F,

    /// current orientation estimate, always unit norm
    q: Quaternion,

    state: FilterState,
}

impl OrientationFilter {
    pub fn new(config: FilterConfig) -> Result<Self, FilterError> {
        config.validate()?;

        Ok(Self {
            beta: config.beta,
            sample_period: config.sample_period,
            q: Quaternion::IDENTITY,
            state: FilterState::Uninitialized,
        })
    }

    /// Starts tracking from a known orientation.
    pub fn with_orientation(config: FilterConfig, q: Quaternion) -> Result<Self, FilterError> {
        let mut filter = Self::new(config)?;
        filter.q = q.normalized()?;
        filter.state = FilterState::Tracking;
        Ok(filter)
    }

    /// Starts tracking from a known-good accelerometer + magnetometer pair.
    pub fn seeded(
        config: FilterConfig,
        accel: Vector3,
        mag: Option<Vector3>,
    ) -> Result<Self, FilterError> {
        let mut filter = Self::new(config)?;
        filter.seed(accel, mag)?;
        Ok(filter)
    }
}

impl OrientationFilter {
    pub fn orientation(&self) -> Quaternion {
        self.q
    }

    pub fn state(&self) -> FilterState {
        self.state
    }

    pub fn is_tracking(&self) -> bool {
        self.state == FilterState::Tracking
    }

    pub fn config(&self) -> FilterConfig {
        FilterConfig::new(self.beta, self.sample_period)
    }

    pub fn set_config(&mut self, config: FilterConfig) -> Result<(), FilterError> {
        config.validate()?;
        self.beta = config.beta;
        self.sample_period = config.sample_period;
        Ok(())
    }

    /// (Re-)seeds the orientation and switches to tracking.
    pub fn seed(&mut self, accel: Vector3, mag: Option<Vector3>) -> Result<Quaternion, FilterError> {
        self.q = initial_attitude(accel, mag)?;
        self.state = FilterState::Tracking;
        Ok(self.q)
    }

    /// Forgets the estimate; the next [`update`](Self::update) seeds again.
    pub fn reset(&mut self) {
        debug!("orientation filter reset");
        self.q = Quaternion::IDENTITY;
        self.state = FilterState::Uninitialized;
    }

    /// Feeds one sample.
    ///
    /// A sample carrying its own elapsed time replaces the integration step from then on.
    /// While uninitialized the sample first seeds the orientation; that is the only case
    /// in which an error is returned, and the filter is then left untouched.
    pub fn update(&mut self, sample: impl ImuSample) -> Result<Quaternion, FilterError> {
        let dt = sample.dt().filter(|&dt| match validate_sample_period(dt) {
            Ok(()) => true,
            Err(e) => {
                warn!("ignoring sample time step: {e}");
                false
            }
        });

        if self.state == FilterState::Uninitialized {
            self.seed(sample.accel(), sample.mag())?;
        }
        if let Some(dt) = dt {
            self.sample_period = dt;
        }

        Ok(match sample.mag() {
            Some(mag) => self.update_marg(sample.gyro(), sample.accel(), mag),
            None => self.update_imu(sample.gyro(), sample.accel()),
        })
    }

    /// One gyroscope + accelerometer step.
    ///
    /// A zero or non-finite accelerometer reading skips the correction. Starts tracking
    /// from the current estimate if the filter was never seeded.
    pub fn update_imu(&mut self, gyro: Vector3, accel: Vector3) -> Quaternion {
        let q_dot = rate_of_change(self.q, gyro);

        let gradient = if is_valid_reading(accel) {
            normalized(accel)
                .ok()
                .map(|accel| gravity_gradient(self.q, accel))
        } else {
            trace!("accelerometer unusable, gyro-only step");
            None
        };

        self.step(q_dot, gradient)
    }

    /// One gyroscope + accelerometer + magnetometer step.
    ///
    /// Without a usable magnetometer reading this is exactly [`update_imu`](Self::update_imu).
    pub fn update_marg(&mut self, gyro: Vector3, accel: Vector3, mag: Vector3) -> Quaternion {
        if !is_valid_reading(mag) {
            return self.update_imu(gyro, accel);
        }
        if !is_valid_reading(accel) {
            trace!("accelerometer unusable, gyro-only step");
            let q_dot = rate_of_change(self.q, gyro);
            return self.step(q_dot, None);
        }

        let (Ok(a), Ok(m)) = (normalized(accel), normalized(mag)) else {
            return self.update_imu(gyro, accel);
        };
        let Some(gradient) = marg_gradient(self.q, a, m) else {
            trace!("no magnetic reference, falling back to accelerometer only");
            return self.update_imu(gyro, accel);
        };

        let q_dot = rate_of_change(self.q, gyro);
        self.step(q_dot, Some(gradient))
    }

    fn step(&mut self, mut q_dot: Quaternion, gradient: Option<Quaternion>) -> Quaternion {
        if let Some(gradient) = gradient {
            match gradient.normalized() {
                Ok(s) => q_dot -= self.beta * s,
                // already at the minimum
                Err(_) => trace!("vanishing gradient, correction skipped"),
            }
        }

        match (self.q + q_dot * self.sample_period).normalized() {
            Ok(q) => self.q = q,
            Err(e) => warn!("integration step dropped: {e}"),
        }
        self.state = FilterState::Tracking;

        self.q
    }
}

/// `0.5 * q ⊗ (0, ω)`
fn rate_of_change(q: Quaternion, gyro: Vector3) -> Quaternion {
    0.5 * q * Quaternion::pure(gyro)
}

/// Gradient of `|q* ⊗ (0,0,1) ⊗ q - a|²` for a normalized accelerometer reading `a`.
fn gravity_gradient(q: Quaternion, [ax, ay, az]: Vector3) -> Quaternion {
    let Quaternion {
        w: q0,
        x: q1,
        y: q2,
        z: q3,
    } = q;

    let _2q0 = 2.0 * q0;
    let _2q1 = 2.0 * q1;
    let _2q2 = 2.0 * q2;
    let _2q3 = 2.0 * q3;
    let _4q0 = 4.0 * q0;
    let _4q1 = 4.0 * q1;
    let _4q2 = 4.0 * q2;
    let _8q1 = 8.0 * q1;
    let _8q2 = 8.0 * q2;
    let q0q0 = q0 * q0;
    let q1q1 = q1 * q1;
    let q2q2 = q2 * q2;
    let q3q3 = q3 * q3;

    Quaternion::new(
        _4q0 * q2q2 + _2q2 * ax + _4q0 * q1q1 - _2q1 * ay,
        _4q1 * q3q3 - _2q3 * ax + 4.0 * q0q0 * q1 - _2q0 * ay - _4q1
            + _8q1 * q1q1
            + _8q1 * q2q2
            + _4q1 * az,
        4.0 * q0q0 * q2 + _2q0 * ax + _4q2 * q3q3 - _2q3 * ay - _4q2
            + _8q2 * q1q1
            + _8q2 * q2q2
            + _4q2 * az,
        4.0 * q1q1 * q3 - _2q1 * ax + 4.0 * q2q2 * q3 - _2q2 * ay,
    )
}

/// `J_gᵀ f_g + J_bᵀ f_b` for normalized accelerometer `a` and magnetometer `m`.
///
/// The earth field reference `b = (bx, 0, bz)` is the measured field rotated into the
/// earth frame with its horizontal part folded onto north. `None` when that horizontal
/// part vanishes.
fn marg_gradient(q: Quaternion, [ax, ay, az]: Vector3, m: Vector3) -> Option<Quaternion> {
    let [hx, hy, hz] = q.rotate(m);
    let bx = libm::sqrtf(hx * hx + hy * hy);
    let bz = hz;
    if bx < 1e-6 {
        return None;
    }
    let [mx, my, mz] = m;

    let Quaternion {
        w: q0,
        x: q1,
        y: q2,
        z: q3,
    } = q;

    let q0q1 = q0 * q1;
    let q0q2 = q0 * q2;
    let q0q3 = q0 * q3;
    let q1q1 = q1 * q1;
    let q1q2 = q1 * q2;
    let q1q3 = q1 * q3;
    let q2q2 = q2 * q2;
    let q2q3 = q2 * q3;
    let q3q3 = q3 * q3;

    let _2bx = 2.0 * bx;
    let _2bz = 2.0 * bz;
    let _4bx = 4.0 * bx;
    let _4bz = 4.0 * bz;

    // predicted minus measured gravity
    let fg = [
        2.0 * (q1q3 - q0q2) - ax,
        2.0 * (q0q1 + q2q3) - ay,
        2.0 * (0.5 - q1q1 - q2q2) - az,
    ];

    // predicted minus measured field
    let fb = [
        _2bx * (0.5 - q2q2 - q3q3) + _2bz * (q1q3 - q0q2) - mx,
        _2bx * (q1q2 - q0q3) + _2bz * (q0q1 + q2q3) - my,
        _2bx * (q0q2 + q1q3) + _2bz * (0.5 - q1q1 - q2q2) - mz,
    ];

    let jg = [
        [-2.0 * q2, 2.0 * q3, -2.0 * q0, 2.0 * q1],
        [2.0 * q1, 2.0 * q0, 2.0 * q3, 2.0 * q2],
        [0.0, -4.0 * q1, -4.0 * q2, 0.0],
    ];

    let jb = [
        [
            -_2bz * q2,
            _2bz * q3,
            -_4bx * q2 - _2bz * q0,
            -_4bx * q3 + _2bz * q1,
        ],
        [
            -_2bx * q3 + _2bz * q1,
            _2bx * q2 + _2bz * q0,
            _2bx * q1 + _2bz * q3,
            -_2bx * q0 + _2bz * q2,
        ],
        [
            _2bx * q2,
            _2bx * q3 - _4bz * q1,
            _2bx * q0 - _4bz * q2,
            _2bx * q1,
        ],
    ];

    let mut s = [0.0; 4];
    for (col, s) in s.iter_mut().enumerate() {
        for row in 0..3 {
            *s += jg[row][col] * fg[row] + jb[row][col] * fb[row];
        }
    }

    Some(Quaternion::new(s[0], s[1], s[2], s[3]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sample;
    use crate::attitude::EulerAngles;
    use crate::error::ConfigurationError;

    const DT: F = 0.01;

    /// Deterministic readings for long runs.
    struct XorShift(u32);

    impl XorShift {
        fn next(&mut self) -> F {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 17;
            self.0 ^= self.0 << 5;
            (self.0 as F / u32::MAX as F) * 2.0 - 1.0
        }

        fn vector(&mut self, scale: F) -> Vector3 {
            [
                self.next() * scale,
                self.next() * scale,
                self.next() * scale,
            ]
        }
    }

    fn assert_unit(q: Quaternion) {
        assert!(q.is_finite(), "{q:?}");
        assert!((q.norm() - 1.0).abs() < 1e-6, "|{q:?}| = {}", q.norm());
    }

    fn tilt_error(q: Quaternion) -> F {
        1.0 - q.rotate([0.0, 0.0, 1.0])[2]
    }

    fn sensor_reading(truth: Quaternion, earth: Vector3) -> Vector3 {
        truth.conjugate().rotate(earth)
    }

    #[test]
    fn stays_unit_norm() {
        let mut rng = XorShift(0x1234_5678);
        let mut filter = OrientationFilter::with_orientation(
            FilterConfig::new(0.2, DT),
            Quaternion::new(0.3, -0.5, 0.7, 0.1),
        )
        .unwrap();
        assert_unit(filter.orientation());

        for i in 0..5000 {
            let gyro = rng.vector(4.0);
            let accel = rng.vector(12.0);
            let q = if i % 3 == 0 {
                filter.update_imu(gyro, accel)
            } else {
                filter.update_marg(gyro, accel, rng.vector(0.5))
            };
            assert_unit(q);
        }
    }

    #[test]
    fn gyro_only_integration_reproduces_rotation() {
        let gx = 1.5;
        let steps = 200;
        let mut filter = OrientationFilter::new(FilterConfig::new(0.0, DT)).unwrap();

        for _ in 0..steps {
            filter.update_marg([gx, 0.0, 0.0], [0.0; 3], [0.0; 3]);
        }

        let angle = gx * steps as F * DT;
        let q = filter.orientation();
        assert_unit(q);
        assert!((q.to_euler().roll - angle).abs() < 1e-3);

        let y = q.rotate([0.0, 1.0, 0.0]);
        assert!(y[0].abs() < 1e-4);
        assert!((y[1] - libm::cosf(angle)).abs() < 1e-3);
        assert!((y[2] - libm::sinf(angle)).abs() < 1e-3);
    }

    #[test]
    fn converges_to_gravity_and_stays() {
        let start = Quaternion::from_euler(EulerAngles {
            roll: 0.8,
            pitch: -0.4,
            heading: 0.3,
        });
        let mut filter =
            OrientationFilter::with_orientation(FilterConfig::new(0.1, DT), start).unwrap();

        let mut error = tilt_error(filter.orientation());
        assert!(error > 0.1);

        for _ in 0..3000 {
            let q = filter.update_imu([0.0; 3], [0.0, 0.0, 1.0]);
            let next = tilt_error(q);
            if error > 1e-3 {
                assert!(next <= error, "tilt error grew from {error} to {next}");
            }
            error = next;
        }
        assert!(error < 1e-3);

        for _ in 0..500 {
            let q = filter.update_imu([0.0; 3], [0.0, 0.0, 1.0]);
            assert!(tilt_error(q) < 1e-3);
        }
    }

    #[test]
    fn marg_converges_to_heading() {
        let truth = Quaternion::from_euler(EulerAngles {
            roll: 0.0,
            pitch: 0.0,
            heading: 0.8,
        });
        let accel = sensor_reading(truth, [0.0, 0.0, 9.81]);
        let mag = sensor_reading(truth, [0.3, 0.0, -0.4]);

        let mut filter = OrientationFilter::with_orientation(
            FilterConfig::new(0.5, DT),
            Quaternion::IDENTITY,
        )
        .unwrap();
        for _ in 0..2000 {
            filter.update_marg([0.0; 3], accel, mag);
        }

        let euler = filter.orientation().to_euler();
        assert!((euler.heading - 0.8).abs() < 0.03, "{euler:?}");
        assert!(euler.roll.abs() < 0.03);
        assert!(euler.pitch.abs() < 0.03);
    }

    #[test]
    fn zero_magnetometer_degrades_to_imu() {
        let mut rng = XorShift(42);
        let start = Quaternion::new(0.9, 0.1, -0.2, 0.3).normalized().unwrap();
        let config = FilterConfig::new(0.3, DT);
        let mut marg = OrientationFilter::with_orientation(config, start).unwrap();
        let mut imu = OrientationFilter::with_orientation(config, start).unwrap();

        for _ in 0..200 {
            let gyro = rng.vector(2.0);
            let accel = rng.vector(10.0);
            assert_eq!(
                marg.update_marg(gyro, accel, [0.0; 3]),
                imu.update_imu(gyro, accel)
            );
        }

        let gyro = rng.vector(2.0);
        let accel = rng.vector(10.0);
        assert_eq!(
            marg.update(Sample::marg(gyro, accel, [0.0; 3])),
            imu.update(Sample::imu(gyro, accel))
        );
    }

    #[test]
    fn invalid_readings_never_corrupt_the_estimate() {
        let start = Quaternion::new(0.8, 0.2, 0.1, -0.3).normalized().unwrap();
        let config = FilterConfig::new(0.3, DT);
        let gyro = [0.2, -0.1, 0.4];

        let mut gyro_only = OrientationFilter::with_orientation(config, start).unwrap();
        let expected = gyro_only.update_imu(gyro, [0.0; 3]);

        let mut filter = OrientationFilter::with_orientation(config, start).unwrap();
        assert_eq!(filter.update_imu(gyro, [F::NAN, 0.0, 1.0]), expected);

        let mut filter = OrientationFilter::with_orientation(config, start).unwrap();
        assert_eq!(
            filter.update_marg(gyro, [0.0, F::INFINITY, 1.0], [0.3, 0.0, -0.4]),
            expected
        );

        let mut imu = OrientationFilter::with_orientation(config, start).unwrap();
        let mut filter = OrientationFilter::with_orientation(config, start).unwrap();
        assert_eq!(
            filter.update_marg(gyro, [0.0, 0.0, 1.0], [F::NAN, 0.0, 0.0]),
            imu.update_imu(gyro, [0.0, 0.0, 1.0])
        );

        let mut filter = OrientationFilter::with_orientation(config, start).unwrap();
        assert_eq!(filter.update_imu([F::NAN, 0.0, 0.0], [0.0, 0.0, 1.0]), start);
        assert_eq!(filter.update_imu([F::INFINITY, 0.0, 0.0], [0.0; 3]), start);
        assert_unit(filter.orientation());
    }

    #[test]
    fn huge_readings_still_correct() {
        let start = Quaternion::from_euler(EulerAngles {
            roll: 0.6,
            pitch: 0.0,
            heading: 0.0,
        });
        let config = FilterConfig::new(0.5, DT);
        let mut huge = OrientationFilter::with_orientation(config, start).unwrap();
        let mut unit = OrientationFilter::with_orientation(config, start).unwrap();

        for _ in 0..100 {
            assert_eq!(
                huge.update_imu([0.0; 3], [0.0, 0.0, 1e20]),
                unit.update_imu([0.0; 3], [0.0, 0.0, 1.0])
            );
        }
        assert!(tilt_error(huge.orientation()) < tilt_error(start));

        let mut huge = OrientationFilter::with_orientation(config, start).unwrap();
        let mut unit = OrientationFilter::with_orientation(config, start).unwrap();
        assert_eq!(
            huge.update_marg([0.0; 3], [0.0, 0.0, 1e20], [1e25, 0.0, -1e25]),
            unit.update_marg([0.0; 3], [0.0, 0.0, 1.0], [1.0, 0.0, -1.0])
        );
    }

    #[test]
    fn magnetometer_along_gravity_falls_back_to_imu() {
        let config = FilterConfig::new(0.3, DT);
        let mut marg = OrientationFilter::with_orientation(config, Quaternion::IDENTITY).unwrap();
        let mut imu = OrientationFilter::with_orientation(config, Quaternion::IDENTITY).unwrap();

        assert_eq!(
            marg.update_marg([0.1, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 0.0, -0.5]),
            imu.update_imu([0.1, 0.0, 0.0], [0.0, 0.0, 1.0])
        );
    }

    #[test]
    fn first_update_seeds_the_orientation() {
        let mut filter = OrientationFilter::new(FilterConfig::new(0.1, DT)).unwrap();
        assert_eq!(filter.state(), FilterState::Uninitialized);

        let q = filter
            .update(Sample::marg([0.0; 3], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]))
            .unwrap();
        assert_eq!(filter.state(), FilterState::Tracking);
        assert!((q.w - 1.0).abs() < 1e-6);
        assert!(q.x.abs() < 1e-6 && q.y.abs() < 1e-6 && q.z.abs() < 1e-6);

        let truth = Quaternion::from_euler(EulerAngles {
            roll: -0.3,
            pitch: 0.5,
            heading: -2.0,
        });
        let mut filter = OrientationFilter::new(FilterConfig::new(0.1, DT)).unwrap();
        let q = filter
            .update(Sample::marg(
                [0.0; 3],
                sensor_reading(truth, [0.0, 0.0, 1.0]),
                sensor_reading(truth, [0.5, 0.0, -0.3]),
            ))
            .unwrap();
        let dot: F = q
            .into_array()
            .iter()
            .zip(truth.into_array())
            .map(|(a, b)| a * b)
            .sum();
        assert!((dot.abs() - 1.0).abs() < 1e-4, "{q:?} vs {truth:?}");
    }

    #[test]
    fn degenerate_seed_is_refused() {
        let mut filter = OrientationFilter::new(FilterConfig::new(0.1, DT)).unwrap();

        assert_eq!(
            filter.update(Sample::marg([0.1, 0.0, 0.0], [0.0; 3], [0.0; 3])),
            Err(FilterError::InvalidSample)
        );
        assert_eq!(filter.state(), FilterState::Uninitialized);
        assert_eq!(filter.orientation(), Quaternion::IDENTITY);

        // the refused sample's time step is not kept either
        assert_eq!(
            filter.update(Sample::imu([0.0; 3], [0.0; 3]).with_dt(0.5)),
            Err(FilterError::InvalidSample)
        );
        assert_eq!(filter.config().sample_period, DT);

        assert_eq!(
            OrientationFilter::seeded(FilterConfig::new(0.1, DT), [0.0; 3], Some([0.0; 3]))
                .map(|f| f.orientation()),
            Err(FilterError::InvalidSample)
        );
    }

    #[test]
    fn reset_requires_a_new_seed() {
        let mut filter =
            OrientationFilter::seeded(FilterConfig::new(0.1, DT), [0.0, 1.0, 1.0], None).unwrap();
        assert!(filter.is_tracking());
        assert_ne!(filter.orientation(), Quaternion::IDENTITY);

        filter.reset();
        assert_eq!(filter.state(), FilterState::Uninitialized);
        assert_eq!(filter.orientation(), Quaternion::IDENTITY);
        assert_eq!(
            filter.update(Sample::imu([0.0; 3], [0.0; 3])),
            Err(FilterError::InvalidSample)
        );
    }

    #[test]
    fn sample_time_step_replaces_period() {
        let mut filter = OrientationFilter::new(FilterConfig::new(0.0, DT)).unwrap();
        filter
            .update(Sample::imu([0.0; 3], [0.0, 0.0, 1.0]).with_dt(0.02))
            .unwrap();
        assert_eq!(filter.config().sample_period, 0.02);

        // non-positive steps keep the previous period
        filter
            .update(Sample::imu([0.0; 3], [0.0, 0.0, 1.0]).with_dt(0.0))
            .unwrap();
        filter
            .update(Sample::imu([0.0; 3], [0.0, 0.0, 1.0]).with_dt(-1.0))
            .unwrap();
        assert_eq!(filter.config().sample_period, 0.02);

        // a 0.5s step at 1 rad/s turns by half a radian
        let before = filter.orientation().to_euler().heading;
        filter
            .update(Sample::imu([0.0, 0.0, 1.0], [0.0, 0.0, 1.0]).with_dt(0.5))
            .unwrap();
        let turned = filter.orientation().to_euler().heading - before;
        assert!((turned - 2.0 * libm::atanf(0.25)).abs() < 1e-5, "{turned}");
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert_eq!(
            OrientationFilter::new(FilterConfig::new(-1.0, DT)).map(|f| f.config()),
            Err(FilterError::Configuration(ConfigurationError::InvalidGain(
                -1.0
            )))
        );
        assert_eq!(
            OrientationFilter::new(FilterConfig::new(0.1, 0.0)).map(|f| f.config()),
            Err(FilterError::Configuration(
                ConfigurationError::InvalidSamplePeriod(0.0)
            ))
        );

        let mut filter = OrientationFilter::new(FilterConfig::new(0.1, DT)).unwrap();
        assert!(filter.set_config(FilterConfig::new(0.1, F::NAN)).is_err());
        assert_eq!(filter.config(), FilterConfig::new(0.1, DT));
    }
}
