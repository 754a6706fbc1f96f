use crate::error::FilterError;
use crate::{F, Vector3};

/// Components at or below this magnitude are treated as zero.
pub const DEGENERATE_MAGNITUDE: F = 1e-6;

/// `1 / sqrt(x)`, refusing zero, negative and non-finite input.
pub fn recip_sqrt(x: F) -> Result<F, FilterError> {
    if !x.is_finite() || x <= DEGENERATE_MAGNITUDE * DEGENERATE_MAGNITUDE {
        return Err(FilterError::DegenerateNormalization);
    }
    Ok(1.0 / libm::sqrtf(x))
}

/// Unit-length copy of `v`.
///
/// Divides by the largest component first so large finite readings don't overflow
/// when squared.
pub fn normalize_components<const N: usize>(v: [F; N]) -> Result<[F; N], FilterError> {
    let scale = v.iter().fold(0.0, |max: F, c| max.max(libm::fabsf(*c)));
    if !scale.is_finite() || scale <= DEGENERATE_MAGNITUDE {
        return Err(FilterError::DegenerateNormalization);
    }

    let scaled = v.map(|c| c / scale);
    let recip_norm = recip_sqrt(scaled.iter().map(|c| c * c).sum())?;
    Ok(scaled.map(|c| c * recip_norm))
}

pub fn norm_squared(v: Vector3) -> F {
    v[0] * v[0] + v[1] * v[1] + v[2] * v[2]
}

pub fn norm(v: Vector3) -> F {
    libm::sqrtf(norm_squared(v))
}

pub fn normalized(v: Vector3) -> Result<Vector3, FilterError> {
    normalize_components(v)
}

pub fn is_zero(v: Vector3) -> bool {
    v == [0.0; 3]
}

pub fn is_finite(v: Vector3) -> bool {
    v.iter().all(|c| c.is_finite())
}

/// A reading usable for a correction step: finite and not the "no reading" zero vector.
pub fn is_valid_reading(v: Vector3) -> bool {
    is_finite(v) && !is_zero(v)
}

#[test]
fn recip_sqrt_guards_degenerate_input() {
    assert_eq!(recip_sqrt(0.0), Err(FilterError::DegenerateNormalization));
    assert_eq!(recip_sqrt(-4.0), Err(FilterError::DegenerateNormalization));
    assert_eq!(recip_sqrt(F::NAN), Err(FilterError::DegenerateNormalization));
    assert_eq!(
        recip_sqrt(F::INFINITY),
        Err(FilterError::DegenerateNormalization)
    );
    assert_eq!(recip_sqrt(4.0), Ok(0.5));
}

#[test]
fn normalize_scales_to_unit_length() {
    let v = normalized([3.0, 0.0, 4.0]).unwrap();
    assert!((v[0] - 0.6).abs() < 1e-6);
    assert!((v[2] - 0.8).abs() < 1e-6);
    assert!((norm(v) - 1.0).abs() < 1e-6);

    assert!(normalized([0.0; 3]).is_err());
    assert!(normalized([1e-9, 0.0, 0.0]).is_err());
    assert!(normalized([F::NAN, 0.0, 1.0]).is_err());
}

#[test]
fn normalize_survives_huge_components() {
    assert_eq!(normalized([0.0, 0.0, 1e20]), Ok([0.0, 0.0, 1.0]));

    // squaring these overflows f32
    let v = normalized([3e30, 0.0, -4e30]).unwrap();
    assert!((v[0] - 0.6).abs() < 1e-6);
    assert!((v[2] + 0.8).abs() < 1e-6);
}

#[test]
fn readings_must_be_finite_and_non_zero() {
    assert!(is_valid_reading([0.0, 0.0, 9.81]));
    assert!(!is_valid_reading([0.0; 3]));
    assert!(!is_valid_reading([F::NAN, 0.0, 1.0]));
    assert!(!is_valid_reading([0.0, F::INFINITY, 1.0]));
}
