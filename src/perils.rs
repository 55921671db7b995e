use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::config::{CatastropheConfig, ClaimsConfig};
use crate::random::unit_mean_lognormal;
use crate::types::Segment;

/// A catastrophe that struck one segment this turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatastropheHit {
    pub segment: Segment,
    /// Factor applied to baseline claims of every company writing the segment.
    pub severity_multiplier: f64,
}

/// Stochastic claims behaviour. The engine draws catastrophes once per
/// segment (on the segment's stream) and claims noise once per company
/// segment (on the company's stream).
///
/// Formulas behind this seam are provisional; replace the implementation,
/// not the callers.
pub trait ClaimsModel: Send + Sync {
    fn draw_catastrophe(&self, segment: &Segment, rng: &mut dyn RngCore) -> Option<CatastropheHit>;

    /// Unit-mean multiplicative noise on baseline claims.
    fn claims_noise(&self, rng: &mut dyn RngCore) -> f64;
}

/// PLACEHOLDER: Bernoulli catastrophe per segment with a fixed severity,
/// unit-mean lognormal attritional noise.
#[derive(Debug, Clone)]
pub struct PlaceholderClaims {
    catastrophe: CatastropheConfig,
    noise_sigma: f64,
}

impl PlaceholderClaims {
    pub fn new(catastrophe: &CatastropheConfig, claims: &ClaimsConfig) -> Self {
        PlaceholderClaims { catastrophe: catastrophe.clone(), noise_sigma: claims.noise_sigma }
    }
}

impl ClaimsModel for PlaceholderClaims {
    fn draw_catastrophe(&self, segment: &Segment, rng: &mut dyn RngCore) -> Option<CatastropheHit> {
        if self.catastrophe.probability <= 0.0 {
            return None;
        }
        // random() is in [0, 1): probability 1.0 always hits.
        let u: f64 = rng.random();
        (u < self.catastrophe.probability).then(|| CatastropheHit {
            segment: segment.clone(),
            severity_multiplier: self.catastrophe.severity_multiplier,
        })
    }

    fn claims_noise(&self, rng: &mut dyn RngCore) -> f64 {
        unit_mean_lognormal(rng, self.noise_sigma)
    }
}
