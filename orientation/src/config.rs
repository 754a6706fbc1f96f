use crate::F;
use crate::error::ConfigurationError;

/// Filter tune.
///
/// There is no default: `beta` depends on the sensor's gyroscope noise and how fast
/// accelerometer/magnetometer corrections should pull the estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FilterConfig {
    /// gradient step gain, 0 disables all correction
    pub beta: F,

    /// integration step in seconds
    pub sample_period: F,
}

impl FilterConfig {
    pub const fn new(beta: F, sample_period: F) -> Self {
        Self {
            beta,
            sample_period,
        }
    }

    pub fn from_sample_rate(beta: F, sample_rate_hz: F) -> Self {
        Self::new(beta, 1.0 / sample_rate_hz)
    }

    pub const fn with_beta(mut self, beta: F) -> Self {
        self.beta = beta;
        self
    }

    pub const fn with_sample_period(mut self, sample_period: F) -> Self {
        self.sample_period = sample_period;
        self
    }

    pub fn with_sample_rate(self, sample_rate_hz: F) -> Self {
        self.with_sample_period(1.0 / sample_rate_hz)
    }

    pub fn sample_rate(&self) -> F {
        1.0 / self.sample_period
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.beta.is_finite() || self.beta < 0.0 {
            return Err(ConfigurationError::InvalidGain(self.beta));
        }
        validate_sample_period(self.sample_period)
    }
}

pub(crate) fn validate_sample_period(dt: F) -> Result<(), ConfigurationError> {
    if !dt.is_finite() || dt <= 0.0 {
        return Err(ConfigurationError::InvalidSamplePeriod(dt));
    }
    Ok(())
}

#[test]
fn builder_and_rate_conversion() {
    let config = FilterConfig::new(0.1, 0.01)
        .with_beta(0.033)
        .with_sample_rate(512.0);

    assert_eq!(config.beta, 0.033);
    assert_eq!(config.sample_period, 1.0 / 512.0);
    assert_eq!(config.sample_rate(), 512.0);
    assert_eq!(
        FilterConfig::from_sample_rate(0.1, 100.0),
        FilterConfig::new(0.1, 1.0 / 100.0)
    );
}

#[test]
fn rejects_bad_gain_and_step() {
    assert_eq!(FilterConfig::new(0.1, 0.01).validate(), Ok(()));
    assert_eq!(FilterConfig::new(0.0, 0.01).validate(), Ok(()));

    assert_eq!(
        FilterConfig::new(-0.1, 0.01).validate(),
        Err(ConfigurationError::InvalidGain(-0.1))
    );
    assert!(matches!(
        FilterConfig::new(F::NAN, 0.01).validate(),
        Err(ConfigurationError::InvalidGain(_))
    ));
    assert_eq!(
        FilterConfig::new(0.1, 0.0).validate(),
        Err(ConfigurationError::InvalidSamplePeriod(0.0))
    );
    assert_eq!(
        FilterConfig::new(0.1, -0.01).validate(),
        Err(ConfigurationError::InvalidSamplePeriod(-0.01))
    );
    // 1 / 0 Hz
    assert!(FilterConfig::from_sample_rate(0.1, 0.0).validate().is_err());
}
