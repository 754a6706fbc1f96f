//! Gradient-descent attitude estimation.
//!
//! Fuses gyroscope, accelerometer and (optionally) magnetometer readings into a unit
//! quaternion describing the orientation of the sensor relative to an earth-fixed frame
//! (x pointing to magnetic north, z pointing up).
//!
//! ```
//! use orientation::{FilterConfig, OrientationFilter, Sample};
//!
//! let config = FilterConfig::new(0.1, 1.0 / 100.0);
//! let mut filter = OrientationFilter::new(config).unwrap();
//!
//! let sample = Sample::marg([0.0; 3], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]);
//! let q = filter.update(&sample).unwrap();
//! assert!((q.norm() - 1.0).abs() < 1e-6);
//! ```
#![no_std]

pub mod attitude;
pub mod config;
pub mod error;
pub mod filter;
pub mod quaternion;
pub mod vector;

pub use attitude::{EulerAngles, initial_attitude};
pub use config::FilterConfig;
pub use error::FilterError;
pub use filter::{FilterState, OrientationFilter};
pub use quaternion::Quaternion;

pub type F = f32;
pub type Vector3 = [F; 3];

/// One reading from an IMU (or MARG) sensor.
pub trait ImuSample {
    /// angular rate in rad/s
    fn gyro(&self) -> Vector3;
    /// accelerometer reading, any consistent unit, zero when unavailable
    fn accel(&self) -> Vector3;
    /// magnetometer reading, any consistent unit
    fn mag(&self) -> Option<Vector3> {
        None
    }
    /// seconds elapsed since the previous sample, when the source measures it
    fn dt(&self) -> Option<F> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sample {
    pub gy: Vector3,
    pub xl: Vector3,
    pub mag: Option<Vector3>,
    pub dt: Option<F>,
}

impl Sample {
    pub fn imu(gy: Vector3, xl: Vector3) -> Self {
        Self {
            gy,
            xl,
            mag: None,
            dt: None,
        }
    }

    pub fn marg(gy: Vector3, xl: Vector3, mag: Vector3) -> Self {
        Self {
            gy,
            xl,
            mag: Some(mag),
            dt: None,
        }
    }

    pub fn with_dt(mut self, dt: F) -> Self {
        self.dt = Some(dt);
        self
    }
}

impl ImuSample for Sample {
    fn gyro(&self) -> Vector3 {
        self.gy
    }

    fn accel(&self) -> Vector3 {
        self.xl
    }

    fn mag(&self) -> Option<Vector3> {
        self.mag
    }

    fn dt(&self) -> Option<F> {
        self.dt
    }
}

impl<S: ImuSample> ImuSample for &S {
    fn gyro(&self) -> Vector3 {
        (**self).gyro()
    }

    fn accel(&self) -> Vector3 {
        (**self).accel()
    }

    fn mag(&self) -> Option<Vector3> {
        (**self).mag()
    }

    fn dt(&self) -> Option<F> {
        (**self).dt()
    }
}
