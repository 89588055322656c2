//! Noise mechanisms.
//!
//! The set of mechanisms is closed: Laplace for pure ε-DP, Gaussian for
//! (ε, δ)-DP and an identity passthrough that only exists so tests can
//! observe exact aggregates. Randomness is always supplied by the caller.
//!
//! - **Laplace** adds Lap(0, Δ₁/ε) to floats and a two-sided geometric with
//!   the same decay to integers.
//! - **Gaussian** adds N(0, σ²) with σ = Δ₂·√(2·ln(1.25/δ))/ε.

use std::fmt;

use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal as StatsNormal};

use crate::{
    errors::{DpAggError, DpAggResult},
    sensitivity::Sensitivity,
};

/// Default two-sided miss probability for reported confidence intervals.
pub const DEFAULT_CONFIDENCE_ALPHA: f64 = 0.05;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseMechanism {
    #[default]
    Laplace,
    Gaussian,
    /// Deterministic passthrough. Offers no privacy; tests only.
    Identity,
}

impl fmt::Display for NoiseMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Laplace => write!(f, "laplace"),
            Self::Gaussian => write!(f, "gaussian"),
            Self::Identity => write!(f, "identity"),
        }
    }
}

/// Symmetric interval around a released value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
}

impl ConfidenceInterval {
    pub fn contains(&self, value: f64) -> bool {
        self.lower <= value && value <= self.upper
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

impl NoiseMechanism {
    pub fn validate(self, epsilon: f64, delta: f64) -> DpAggResult<()> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(DpAggError::config(format!(
                "epsilon must be finite and > 0, got {epsilon}"
            )));
        }
        if !(0.0..1.0).contains(&delta) {
            return Err(DpAggError::config(format!(
                "delta must be within [0, 1), got {delta}"
            )));
        }
        match self {
            Self::Laplace if delta != 0.0 => Err(DpAggError::config(format!(
                "laplace noise requires delta == 0, got {delta}"
            ))),
            Self::Gaussian if delta == 0.0 => Err(DpAggError::config(
                "gaussian noise requires delta within (0, 1)",
            )),
            _ => Ok(()),
        }
    }

    pub fn add_noise_f64<R: RngCore + ?Sized>(
        self,
        value: f64,
        sensitivity: &Sensitivity,
        epsilon: f64,
        delta: f64,
        rng: &mut R,
    ) -> DpAggResult<f64> {
        self.check(sensitivity, epsilon, delta)?;
        match self {
            Self::Laplace => Ok(value + sample_laplace(laplace_scale(sensitivity, epsilon), rng)),
            Self::Gaussian => {
                let sigma = gaussian_sigma(sensitivity, epsilon, delta);
                Ok(value + normal(sigma)?.sample(rng))
            }
            Self::Identity => Ok(value),
        }
    }

    pub fn add_noise_i64<R: RngCore + ?Sized>(
        self,
        value: i64,
        sensitivity: &Sensitivity,
        epsilon: f64,
        delta: f64,
        rng: &mut R,
    ) -> DpAggResult<i64> {
        self.check(sensitivity, epsilon, delta)?;
        let noise = match self {
            Self::Laplace => sample_two_sided_geometric(laplace_scale(sensitivity, epsilon), rng),
            Self::Gaussian => {
                let sigma = gaussian_sigma(sensitivity, epsilon, delta);
                normal(sigma)?.sample(rng).round() as i64
            }
            Self::Identity => 0,
        };
        Ok(value.saturating_add(noise))
    }

    /// Rejects budgets whose noise scale is not a finite positive number,
    /// such as a tiny ε against a huge sensitivity.
    pub fn validate_calibration(
        self,
        sensitivity: &Sensitivity,
        epsilon: f64,
        delta: f64,
    ) -> DpAggResult<()> {
        let scale = match self {
            Self::Laplace => laplace_scale(sensitivity, epsilon),
            Self::Gaussian => gaussian_sigma(sensitivity, epsilon, delta),
            Self::Identity => return Ok(()),
        };
        if !scale.is_finite() || scale <= 0.0 {
            return Err(DpAggError::config(format!(
                "{self} noise scale {scale} is not finite and positive"
            )));
        }
        Ok(())
    }

    /// Interval that contains the true value with probability `1 - alpha`,
    /// computed from the released value alone.
    pub fn confidence_interval_f64(
        self,
        noised_value: f64,
        sensitivity: &Sensitivity,
        epsilon: f64,
        delta: f64,
        alpha: f64,
    ) -> DpAggResult<ConfidenceInterval> {
        self.check(sensitivity, epsilon, delta)?;
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(DpAggError::config(format!(
                "confidence alpha must be within (0, 1), got {alpha}"
            )));
        }
        let half_width = match self {
            Self::Laplace => laplace_scale(sensitivity, epsilon) * (1.0 / alpha).ln(),
            Self::Gaussian => {
                let standard = StatsNormal::new(0.0, 1.0)
                    .map_err(|err| DpAggError::config(err.to_string()))?;
                gaussian_sigma(sensitivity, epsilon, delta)
                    * standard.inverse_cdf(1.0 - alpha / 2.0)
            }
            Self::Identity => {
                return Err(DpAggError::config(
                    "identity noise offers no confidence interval",
                ))
            }
        };
        Ok(ConfidenceInterval {
            lower: noised_value - half_width,
            upper: noised_value + half_width,
        })
    }

    fn check(self, sensitivity: &Sensitivity, epsilon: f64, delta: f64) -> DpAggResult<()> {
        self.validate(epsilon, delta)?;
        sensitivity.validate()?;
        self.validate_calibration(sensitivity, epsilon, delta)
    }
}

/// Laplace scale b = Δ₁/ε.
pub fn laplace_scale(sensitivity: &Sensitivity, epsilon: f64) -> f64 {
    sensitivity.l1() / epsilon
}

/// Classic Gaussian calibration σ = Δ₂·√(2·ln(1.25/δ))/ε.
pub fn gaussian_sigma(sensitivity: &Sensitivity, epsilon: f64, delta: f64) -> f64 {
    sensitivity.l2() * (2.0 * (1.25 / delta).ln()).sqrt() / epsilon
}

/// Generator for callers that do not bring their own randomness.
pub fn entropy_rng() -> ChaCha20Rng {
    let mut seed = [0u8; 32];
    StdRng::from_entropy().fill_bytes(&mut seed);
    ChaCha20Rng::from_seed(seed)
}

fn normal(sigma: f64) -> DpAggResult<Normal<f64>> {
    Normal::new(0.0, sigma)
        .map_err(|err| DpAggError::config(format!("gaussian sigma {sigma}: {err}")))
}

/// Inverse-CDF sampling of Lap(0, scale).
fn sample_laplace<R: RngCore + ?Sized>(scale: f64, rng: &mut R) -> f64 {
    loop {
        let u: f64 = rng.gen::<f64>() - 0.5;
        // u == -0.5 would evaluate ln(0).
        if u > -0.5 {
            return -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln();
        }
    }
}

/// Difference of two geometric draws, P(k) ∝ exp(-|k| / scale).
fn sample_two_sided_geometric<R: RngCore + ?Sized>(scale: f64, rng: &mut R) -> i64 {
    sample_geometric(scale, rng).saturating_sub(sample_geometric(scale, rng))
}

/// Inverse transform of a geometric with ratio e^{-1/scale}: floor(-scale · ln U).
/// The float-to-int cast saturates at `i64::MAX`.
fn sample_geometric<R: RngCore + ?Sized>(scale: f64, rng: &mut R) -> i64 {
    // 1 - [0, 1) keeps U away from zero.
    let u = 1.0 - rng.gen::<f64>();
    (-scale * u.ln()).floor() as i64
}
