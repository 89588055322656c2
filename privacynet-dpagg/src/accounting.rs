//! Rényi DP accounting across releases.
//!
//! RDP composes additively per order; the accumulated curve is converted to
//! (ε, δ) with the tighter bound from Canonne, Kamath & Steinke (2020),
//! Proposition 12, falling back to the KL bound for small divergences.

use serde::{Deserialize, Serialize};
use statrs::function::factorial::ln_binomial;
use tracing::debug;

use crate::errors::{DpAggError, DpAggResult};

pub const DEFAULT_RDP_ORDERS: [f64; 22] = [
    2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 12.0, 14.0, 16.0, 20.0, 24.0, 28.0, 32.0, 48.0,
    64.0, 128.0, 256.0, 512.0, 1024.0,
];

/// Privacy-relevant description of a mechanism invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DpEvent {
    NoOp,
    /// Release without formal guarantees.
    NonPrivate,
    /// Gaussian noise with standard deviation `noise_multiplier` times the
    /// L2 sensitivity.
    Gaussian { noise_multiplier: f64 },
    /// Laplace noise with scale `noise_multiplier` times the L1 sensitivity.
    Laplace { noise_multiplier: f64 },
    PoissonSampled {
        sampling_probability: f64,
        event: Box<DpEvent>,
    },
    SelfComposed { event: Box<DpEvent>, count: u64 },
    Composed(Vec<DpEvent>),
}

#[derive(Clone, Debug)]
pub struct RdpAccountant {
    orders: Vec<f64>,
    rdp: Vec<f64>,
}

impl Default for RdpAccountant {
    fn default() -> Self {
        Self {
            orders: DEFAULT_RDP_ORDERS.to_vec(),
            rdp: vec![0.0; DEFAULT_RDP_ORDERS.len()],
        }
    }
}

impl RdpAccountant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_orders(orders: Vec<f64>) -> DpAggResult<Self> {
        if orders.is_empty() {
            return Err(DpAggError::config("at least one RDP order is required"));
        }
        if let Some(order) = orders.iter().find(|order| !(**order > 1.0) || !order.is_finite()) {
            return Err(DpAggError::config(format!(
                "RDP orders must be finite and > 1, got {order}"
            )));
        }
        let rdp = vec![0.0; orders.len()];
        Ok(Self { orders, rdp })
    }

    pub fn orders(&self) -> &[f64] {
        &self.orders
    }

    /// Accumulated RDP per order.
    pub fn rdp(&self) -> &[f64] {
        &self.rdp
    }

    pub fn supports(&self, event: &DpEvent) -> bool {
        match event {
            DpEvent::NoOp
            | DpEvent::Gaussian { .. }
            | DpEvent::Laplace { .. } => true,
            DpEvent::NonPrivate => false,
            DpEvent::PoissonSampled { event, .. } => {
                matches!(**event, DpEvent::Gaussian { .. })
                    && self.orders.iter().all(|order| order.fract() == 0.0)
            }
            DpEvent::SelfComposed { event, .. } => self.supports(event),
            DpEvent::Composed(events) => events.iter().all(|event| self.supports(event)),
        }
    }

    /// Adds `count` compositions of `event`. The accountant is left unchanged
    /// when the event is unsupported or malformed.
    pub fn compose(&mut self, event: &DpEvent, count: u64) -> DpAggResult<()> {
        if !self.supports(event) {
            return Err(DpAggError::config(format!(
                "event not supported by RDP accounting: {event:?}"
            )));
        }
        let mut delta = vec![0.0; self.orders.len()];
        self.accumulate(event, count as f64, &mut delta)?;
        for (total, step) in self.rdp.iter_mut().zip(delta) {
            *total += step;
        }
        debug!(?event, count, "composed privacy event");
        Ok(())
    }

    fn accumulate(&self, event: &DpEvent, count: f64, out: &mut [f64]) -> DpAggResult<()> {
        match event {
            DpEvent::NoOp => Ok(()),
            DpEvent::NonPrivate => Err(DpAggError::config(
                "non-private events have unbounded RDP",
            )),
            DpEvent::Gaussian { noise_multiplier } => {
                check_noise_multiplier(*noise_multiplier)?;
                self.add_curve(count, out, |order| {
                    poisson_gaussian_rdp(1.0, *noise_multiplier, order)
                })
            }
            DpEvent::Laplace { noise_multiplier } => {
                check_noise_multiplier(*noise_multiplier)?;
                self.add_curve(count, out, |order| laplace_rdp(*noise_multiplier, order))
            }
            DpEvent::PoissonSampled {
                sampling_probability,
                event,
            } => {
                let q = *sampling_probability;
                if !(0.0..=1.0).contains(&q) {
                    return Err(DpAggError::config(format!(
                        "sampling probability must be within [0, 1], got {q}"
                    )));
                }
                let DpEvent::Gaussian { noise_multiplier } = **event else {
                    return Err(DpAggError::config(
                        "only Gaussian events may be Poisson sampled",
                    ));
                };
                check_noise_multiplier(noise_multiplier)?;
                self.add_curve(count, out, |order| {
                    poisson_gaussian_rdp(q, noise_multiplier, order)
                })
            }
            DpEvent::SelfComposed { event, count: inner } => {
                self.accumulate(event, count * *inner as f64, out)
            }
            DpEvent::Composed(events) => events
                .iter()
                .try_for_each(|event| self.accumulate(event, count, out)),
        }
    }

    fn add_curve(
        &self,
        count: f64,
        out: &mut [f64],
        rdp_at: impl Fn(f64) -> f64,
    ) -> DpAggResult<()> {
        if count == 0.0 {
            return Ok(());
        }
        for (slot, &order) in out.iter_mut().zip(&self.orders) {
            *slot += count * rdp_at(order);
        }
        Ok(())
    }

    /// Smallest ε such that the composed events are (ε, `target_delta`)-DP.
    pub fn epsilon(&self, target_delta: f64) -> DpAggResult<f64> {
        if !(0.0..=1.0).contains(&target_delta) {
            return Err(DpAggError::config(format!(
                "delta must be within [0, 1], got {target_delta}"
            )));
        }
        if target_delta == 0.0 {
            return Ok(if self.rdp.iter().all(|r| *r == 0.0) {
                0.0
            } else {
                f64::INFINITY
            });
        }
        let best = self
            .orders
            .iter()
            .zip(&self.rdp)
            .map(|(&order, &rdp)| {
                if target_delta.powi(2) + (-rdp).exp_m1() > 0.0 {
                    0.0
                } else if order > 1.01 {
                    rdp + (-1.0 / order).ln_1p() - (target_delta * order).ln() / (order - 1.0)
                } else {
                    f64::INFINITY
                }
            })
            .fold(f64::INFINITY, f64::min);
        Ok(best.max(0.0))
    }

    /// Smallest δ such that the composed events are (`target_epsilon`, δ)-DP.
    pub fn delta(&self, target_epsilon: f64) -> DpAggResult<f64> {
        if !(target_epsilon >= 0.0) {
            return Err(DpAggError::config(format!(
                "epsilon must be >= 0, got {target_epsilon}"
            )));
        }
        let best_log_delta = self
            .orders
            .iter()
            .zip(&self.rdp)
            .map(|(&order, &rdp)| {
                let kl_bound = if rdp == 0.0 {
                    f64::NEG_INFINITY
                } else {
                    0.5 * (-(-rdp).exp()).ln_1p()
                };
                if order > 1.01 {
                    let rdp_bound = (order - 1.0) * (rdp - target_epsilon + (-1.0 / order).ln_1p())
                        - order.ln();
                    kl_bound.min(rdp_bound)
                } else {
                    kl_bound
                }
            })
            .fold(f64::INFINITY, f64::min);
        Ok(best_log_delta.exp().min(1.0))
    }
}

fn check_noise_multiplier(noise_multiplier: f64) -> DpAggResult<()> {
    if noise_multiplier.is_nan() || noise_multiplier < 0.0 {
        return Err(DpAggError::config(format!(
            "noise multiplier must be >= 0, got {noise_multiplier}"
        )));
    }
    Ok(())
}

/// RDP of the sampled Gaussian mechanism at an integer `order`.
fn poisson_gaussian_rdp(q: f64, sigma: f64, order: f64) -> f64 {
    if q == 0.0 {
        return 0.0;
    }
    if sigma == 0.0 {
        return f64::INFINITY;
    }
    if q == 1.0 {
        return order / (2.0 * sigma * sigma);
    }
    log_a_int(q, sigma, order as u64) / (order - 1.0)
}

/// ln A_α for integer α, summed in log space.
fn log_a_int(q: f64, sigma: f64, order: u64) -> f64 {
    let log_q = q.ln();
    let log_1mq = (-q).ln_1p();
    (0..=order)
        .map(|i| {
            let i_f = i as f64;
            ln_binomial(order, i)
                + i_f * log_q
                + (order - i) as f64 * log_1mq
                + (i_f * i_f - i_f) / (2.0 * sigma * sigma)
        })
        .fold(f64::NEG_INFINITY, log_add)
}

/// RDP of the Laplace mechanism with scale `b` per unit sensitivity
/// (Mironov 2017, Table II).
fn laplace_rdp(b: f64, order: f64) -> f64 {
    if b == 0.0 {
        return f64::INFINITY;
    }
    // α/(2α-1)·e^{(α-1)/b} + (α-1)/(2α-1)·e^{-α/b}, evaluated in log space.
    let first = (order / (2.0 * order - 1.0)).ln() + (order - 1.0) / b;
    let second = ((order - 1.0) / (2.0 * order - 1.0)).ln() - order / b;
    log_add(first, second) / (order - 1.0)
}

fn log_add(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a > b { (a, b) } else { (b, a) };
    if lo == f64::NEG_INFINITY {
        return hi;
    }
    hi + (lo - hi).exp().ln_1p()
}
