use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{ProductTier, SegmentParams};
use crate::demand::{CompetitorContext, DemandFunction, Offer};
use crate::error::{DataError, UnitError};
use crate::types::{CompanyId, Segment};

/// A company's price for one segment. Input only; never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingDecision {
    pub segment: Segment,
    pub tier: String,
    pub price_multiplier: f64,
}

/// One company's outcome in one segment for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketResult {
    pub company: CompanyId,
    pub segment: Segment,
    pub tier: String,
    /// Policies written this turn.
    pub demand_served: u64,
    pub market_share: f64,
    /// Premium per policy.
    pub effective_price: f64,
    pub premium_written: f64,
}

/// Everything market simulation produces for one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub segment: Segment,
    /// Policies demanded across the segment; equals the sum served.
    pub total_demand: u64,
    pub elasticity_used: f64,
    /// Share-weighted mean premium per policy. Zero when nothing is served.
    pub mean_effective_price: f64,
    /// Herfindahl–Hirschman index over served shares, in [0, 1].
    pub concentration: f64,
    pub results: BTreeMap<CompanyId, MarketResult>,
}

impl SegmentOutcome {
    pub fn served_total(&self) -> u64 {
        self.results.values().map(|r| r.demand_served).sum()
    }
}

/// Split `total` whole policies in proportion to `demand`. Each allocation is
/// floored; the rounding residue goes to the largest demand (lowest id on a
/// tie), so the allocations sum to exactly `total`.
pub fn allocate(total: u64, demand: &BTreeMap<CompanyId, f64>) -> BTreeMap<CompanyId, u64> {
    let sum: f64 = demand.values().filter(|d| **d > 0.0).sum();
    if total == 0 || sum <= 0.0 {
        return demand.keys().map(|&id| (id, 0)).collect();
    }

    let mut served: BTreeMap<CompanyId, u64> = demand
        .iter()
        .map(|(&id, &d)| {
            let raw = (total as f64 * d.max(0.0) / sum).floor();
            (id, (raw.max(0.0) as u64).min(total))
        })
        .collect();

    let allocated: u64 = served.values().sum();
    if allocated < total {
        let largest = demand
            .iter()
            .fold(None::<(CompanyId, f64)>, |best, (&id, &d)| match best {
                Some((_, bd)) if bd >= d => best,
                _ => Some((id, d)),
            })
            .map(|(id, _)| id);
        if let Some(id) = largest
            && let Some(s) = served.get_mut(&id)
        {
            *s += total - allocated;
        }
    }
    served
}

/// Resolves one segment: all competing offers, one demand-function call.
pub struct MarketSimulator<'a> {
    params: &'a SegmentParams,
    tiers: &'a [ProductTier],
    demand: &'a dyn DemandFunction,
}

impl<'a> MarketSimulator<'a> {
    pub fn new(params: &'a SegmentParams, tiers: &'a [ProductTier], demand: &'a dyn DemandFunction) -> Self {
        MarketSimulator { params, tiers, demand }
    }

    /// Companies absent from `decisions` simply do not compete here.
    pub fn simulate(
        &self,
        decisions: &BTreeMap<CompanyId, PricingDecision>,
    ) -> Result<SegmentOutcome, UnitError> {
        let segment = &self.params.segment;

        let mut offers = BTreeMap::new();
        let mut tier_of = BTreeMap::new();
        for (&company, decision) in decisions {
            let tier = self
                .tiers
                .iter()
                .find(|t| t.name == decision.tier)
                .ok_or_else(|| DataError::UnknownTier { company, tier: decision.tier.clone() })?;
            offers.insert(
                company,
                Offer {
                    relative_price: decision.price_multiplier * tier.price_factor,
                    attractiveness: tier.attractiveness,
                },
            );
            tier_of.insert(company, tier);
        }

        let context = CompetitorContext::from_offers(&offers);
        let outcome = self.demand.calculate_demand(&offers, &context)?;

        let total = outcome.total().min(self.params.base_demand).max(0.0).floor() as u64;
        let served = allocate(total, &outcome.demand_by_company);

        let mut results = BTreeMap::new();
        for (&company, &units) in &served {
            let (Some(offer), Some(tier)) = (offers.get(&company), tier_of.get(&company)) else {
                continue;
            };
            let effective_price = self.params.base_premium * offer.relative_price;
            let market_share = if total > 0 { units as f64 / total as f64 } else { 0.0 };
            results.insert(
                company,
                MarketResult {
                    company,
                    segment: segment.clone(),
                    tier: tier.name.clone(),
                    demand_served: units,
                    market_share,
                    effective_price,
                    premium_written: units as f64 * effective_price,
                },
            );
        }

        let mean_effective_price = results.values().map(|r| r.market_share * r.effective_price).sum();
        let concentration = results.values().map(|r| r.market_share * r.market_share).sum();

        debug!(
            segment = %segment,
            model = self.demand.model().selector(),
            companies = results.len(),
            total_demand = total,
            "segment resolved"
        );

        Ok(SegmentOutcome {
            segment: segment.clone(),
            total_demand: total,
            elasticity_used: outcome.elasticity_used,
            mean_effective_price,
            concentration,
            results,
        })
    }
}
