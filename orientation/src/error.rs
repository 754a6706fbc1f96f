use crate::F;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FilterError {
    #[error("Sample can not seed the filter: gravity direction unknown")]
    InvalidSample,

    #[error("Vector magnitude too small to normalize")]
    DegenerateNormalization,

    #[error("Configuration error: {0}")]
    Configuration(ConfigurationError),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigurationError {
    #[error("Gain must be finite and non-negative, got {0}")]
    InvalidGain(F),

    #[error("Sample period must be finite and positive, got {0}")]
    InvalidSamplePeriod(F),
}

impl From<ConfigurationError> for FilterError {
    fn from(e: ConfigurationError) -> Self {
        FilterError::Configuration(e)
    }
}
