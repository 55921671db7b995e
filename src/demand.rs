//! Pluggable demand models.
//!
//! A [`DemandModel`] is the selector resolved once from configuration. For
//! each segment of a turn the engine binds it to that segment's parameters,
//! yielding a [`DemandFunction`] that maps the segment's priced offers to
//! per-company demand. Binding validates the parameters, so a bad segment is
//! rejected before any stage runs rather than mid-turn.
//!
//! All models here are PLACEHOLDERS pending validated economics. They are
//! pure: the same offers always produce the same demand.

use std::collections::BTreeMap;

use crate::config::SegmentParams;
use crate::error::{ComputationError, ConfigurationError};
use crate::types::{CompanyId, Segment};

/// One company's resolved offer in a segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Offer {
    /// Price relative to the segment reference (multiplier × tier price factor).
    pub relative_price: f64,
    /// Tier pull on customers at equal price.
    pub attractiveness: f64,
}

/// Segment-wide view of the competition, computed once per segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompetitorContext {
    pub companies: usize,
    pub mean_relative_price: f64,
}

impl CompetitorContext {
    pub fn from_offers(offers: &BTreeMap<CompanyId, Offer>) -> Self {
        let companies = offers.len();
        let mean_relative_price = if companies == 0 {
            0.0
        } else {
            offers.values().map(|o| o.relative_price).sum::<f64>() / companies as f64
        };
        CompetitorContext { companies, mean_relative_price }
    }

    /// Mean price of everyone except a company quoting `own`. `None` when alone.
    pub fn mean_of_others(&self, own: f64) -> Option<f64> {
        if self.companies < 2 {
            return None;
        }
        let n = self.companies as f64;
        Some((self.mean_relative_price * n - own) / (n - 1.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DemandOutcome {
    pub demand_by_company: BTreeMap<CompanyId, f64>,
    /// The configured elasticity, reported verbatim for audit.
    pub elasticity_used: f64,
}

impl DemandOutcome {
    pub fn total(&self) -> f64 {
        self.demand_by_company.values().sum()
    }
}

pub trait DemandFunction: Send + Sync {
    fn model(&self) -> DemandModel;

    /// Per-company demand for one segment. `offers` must be non-empty and
    /// every relative price positive. Demands are non-negative and sum to at
    /// most the segment's base demand.
    fn calculate_demand(
        &self,
        offers: &BTreeMap<CompanyId, Offer>,
        context: &CompetitorContext,
    ) -> Result<DemandOutcome, ComputationError>;
}

fn check_offers(segment: &Segment, offers: &BTreeMap<CompanyId, Offer>) -> Result<(), ComputationError> {
    if offers.is_empty() {
        return Err(ComputationError::EmptySegment { segment: segment.clone() });
    }
    for (&company, offer) in offers {
        if !(offer.relative_price > 0.0 && offer.relative_price.is_finite()) {
            return Err(ComputationError::NonPositivePrice {
                segment: segment.clone(),
                company,
                value: offer.relative_price,
            });
        }
    }
    Ok(())
}

fn finish(
    demand_by_company: BTreeMap<CompanyId, f64>,
    elasticity_used: f64,
) -> Result<DemandOutcome, ComputationError> {
    for &d in demand_by_company.values() {
        ComputationError::check_finite("company demand", d)?;
    }
    Ok(DemandOutcome { demand_by_company, elasticity_used })
}

/// Constant-elasticity demand: segment volume responds to the average price
/// as `base × p̄^ε`; companies split it by `attractiveness × p^ε`.
#[derive(Debug, Clone)]
pub struct ConstantElasticity {
    segment: Segment,
    base_demand: f64,
    elasticity: f64,
}

impl ConstantElasticity {
    pub fn new(params: &SegmentParams) -> Result<Self, ConfigurationError> {
        params.validate()?;
        Ok(ConstantElasticity {
            segment: params.segment.clone(),
            base_demand: params.base_demand,
            elasticity: params.price_elasticity,
        })
    }
}

impl DemandFunction for ConstantElasticity {
    fn model(&self) -> DemandModel {
        DemandModel::ConstantElasticity
    }

    fn calculate_demand(
        &self,
        offers: &BTreeMap<CompanyId, Offer>,
        context: &CompetitorContext,
    ) -> Result<DemandOutcome, ComputationError> {
        check_offers(&self.segment, offers)?;

        let total = (self.base_demand * context.mean_relative_price.powf(self.elasticity))
            .min(self.base_demand)
            .max(0.0);

        let weights: BTreeMap<CompanyId, f64> = offers
            .iter()
            .map(|(&id, o)| (id, o.attractiveness * o.relative_price.powf(self.elasticity)))
            .collect();
        let weight_sum: f64 = weights.values().sum();

        let demand = weights
            .into_iter()
            .map(|(id, w)| {
                let d = if weight_sum > 0.0 { total * w / weight_sum } else { 0.0 };
                (id, d.max(0.0))
            })
            .collect();
        finish(demand, self.elasticity)
    }
}

/// Linear demand per company: `Q = a − b(p − 1) + cX` where `a` is an equal
/// split of base demand, `b = −ε·a` (so ε is the point elasticity at the
/// reference price) and `X = a × (mean competitor price − p)`.
#[derive(Debug, Clone)]
pub struct LinearDemand {
    segment: Segment,
    base_demand: f64,
    elasticity: f64,
    competitive_intensity: f64,
}

impl LinearDemand {
    pub fn new(params: &SegmentParams) -> Result<Self, ConfigurationError> {
        params.validate()?;
        Ok(LinearDemand {
            segment: params.segment.clone(),
            base_demand: params.base_demand,
            elasticity: params.price_elasticity,
            competitive_intensity: params.competitive_intensity,
        })
    }
}

impl DemandFunction for LinearDemand {
    fn model(&self) -> DemandModel {
        DemandModel::Linear
    }

    fn calculate_demand(
        &self,
        offers: &BTreeMap<CompanyId, Offer>,
        context: &CompetitorContext,
    ) -> Result<DemandOutcome, ComputationError> {
        check_offers(&self.segment, offers)?;

        let a = self.base_demand / offers.len() as f64;
        let b = -self.elasticity * a;

        let mut demand: BTreeMap<CompanyId, f64> = offers
            .iter()
            .map(|(&id, o)| {
                let p = o.relative_price;
                let x = context.mean_of_others(p).map_or(0.0, |others| a * (others - p));
                let q = (a - b * (p - 1.0) + self.competitive_intensity * x) * o.attractiveness;
                (id, q.max(0.0))
            })
            .collect();

        let sum: f64 = demand.values().sum();
        if sum > self.base_demand {
            let scale = self.base_demand / sum;
            for d in demand.values_mut() {
                *d *= scale;
            }
        }
        finish(demand, self.elasticity)
    }
}

/// Demand-model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemandModel {
    ConstantElasticity,
    Linear,
}

impl DemandModel {
    /// Resolve a configuration string. `placeholder` is an alias for the
    /// constant-elasticity model.
    pub fn from_selector(name: &str) -> Result<Self, ConfigurationError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "constant_elasticity" | "placeholder" => Ok(DemandModel::ConstantElasticity),
            "linear" => Ok(DemandModel::Linear),
            _ => Err(ConfigurationError::UnknownDemandModel { name: name.to_string() }),
        }
    }

    pub fn selector(self) -> &'static str {
        match self {
            DemandModel::ConstantElasticity => "constant_elasticity",
            DemandModel::Linear => "linear",
        }
    }

    /// Bind to one segment's parameters.
    pub fn bind(self, params: &SegmentParams) -> Result<Box<dyn DemandFunction>, ConfigurationError> {
        Ok(match self {
            DemandModel::ConstantElasticity => Box::new(ConstantElasticity::new(params)?),
            DemandModel::Linear => Box::new(LinearDemand::new(params)?),
        })
    }
}
