//! Element-wise comparison of device output against a host reference.

use log::debug;
use offload_api::{OffloadError, Result};

/// Above this many elements [`VerifyPolicy::Auto`] stops at the first mismatch.
pub const AUTO_EARLY_EXIT_THRESHOLD: usize = 4096;

/// An element passes when `|observed - expected| <= absolute + relative * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub absolute: f64,
    pub relative: f64,
}

impl Tolerance {
    pub const EXACT: Tolerance = Tolerance {
        absolute: 0.0,
        relative: 0.0,
    };

    pub fn absolute(absolute: f64) -> Self {
        Self {
            absolute,
            relative: 0.0,
        }
    }

    pub fn new(absolute: f64, relative: f64) -> Self {
        Self { absolute, relative }
    }

    fn allows(&self, observed: f64, expected: f64) -> bool {
        let allowed = self.absolute + self.relative * expected.abs();
        // NaN on either side fails.
        (observed - expected).abs() <= allowed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyPolicy {
    EarlyExit,
    Exhaustive,
    Auto,
}

impl VerifyPolicy {
    fn early_exit(self, len: usize) -> bool {
        match self {
            VerifyPolicy::EarlyExit => true,
            VerifyPolicy::Exhaustive => false,
            VerifyPolicy::Auto => len > AUTO_EARLY_EXIT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mismatch {
    pub index: usize,
    pub observed: f32,
    pub expected: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VerificationResult {
    pub checked: usize,
    pub max_abs_deviation: f64,
    pub max_rel_deviation: f64,
    pub first_mismatch: Option<Mismatch>,
    pub passed: bool,
}

impl VerificationResult {
    pub fn summary(&self) -> String {
        match &self.first_mismatch {
            None => format!(
                "{} elements within tolerance (max abs {:.3e}, max rel {:.3e})",
                self.checked, self.max_abs_deviation, self.max_rel_deviation
            ),
            Some(m) => format!(
                "mismatch at index {}: observed {}, expected {} (max abs {:.3e})",
                m.index, m.observed, m.expected, self.max_abs_deviation
            ),
        }
    }
}

pub fn verify(
    observed: &[f32],
    expected: &[f32],
    tolerance: Tolerance,
    policy: VerifyPolicy,
) -> Result<VerificationResult> {
    if observed.len() != expected.len() {
        return Err(OffloadError::LengthMismatch {
            expected: expected.len(),
            found: observed.len(),
        });
    }
    let early_exit = policy.early_exit(expected.len());
    let mut result = VerificationResult {
        checked: 0,
        max_abs_deviation: 0.0,
        max_rel_deviation: 0.0,
        first_mismatch: None,
        passed: true,
    };
    for (index, (&obs, &exp)) in observed.iter().zip(expected).enumerate() {
        let (o, e) = (obs as f64, exp as f64);
        let abs = (o - e).abs();
        result.checked += 1;
        if abs.is_nan() {
            result.max_abs_deviation = f64::NAN;
        } else if abs > result.max_abs_deviation {
            result.max_abs_deviation = abs;
        }
        if e != 0.0 && abs / e.abs() > result.max_rel_deviation {
            result.max_rel_deviation = abs / e.abs();
        }
        if !tolerance.allows(o, e) {
            result.passed = false;
            if result.first_mismatch.is_none() {
                result.first_mismatch = Some(Mismatch {
                    index,
                    observed: obs,
                    expected: exp,
                });
            }
            if early_exit {
                break;
            }
        }
    }
    debug!("verifier: {}", result.summary());
    Ok(result)
}
