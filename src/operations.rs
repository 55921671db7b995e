use std::collections::BTreeMap;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::GameState;
use crate::error::{ComputationError, DataError, UnitError};
use crate::market::MarketResult;
use crate::perils::{CatastropheHit, ClaimsModel};
use crate::types::{CompanyId, Segment};

/// Claims written against one segment's premium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentClaims {
    pub segment: Segment,
    pub premium: f64,
    pub baseline_claims: f64,
    /// Baseline × catastrophe severity when the segment was hit.
    pub claims: f64,
    pub catastrophe: bool,
}

/// One company's underwriting outcome for the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationsResult {
    pub company: CompanyId,
    pub premium_earned: f64,
    pub exposure_units: u64,
    pub baseline_claims: f64,
    pub claims_incurred: f64,
    pub claims_paid: f64,
    pub claims_reserved: f64,
    pub expenses: f64,
    pub loss_ratio: f64,
    pub expense_ratio: f64,
    /// Loss ratio + expense ratio; above 1.0 is an underwriting loss and is never clamped.
    pub combined_ratio: f64,
    /// Set when no premium was earned; all ratios are then 0.
    pub no_exposure: bool,
    pub by_segment: Vec<SegmentClaims>,
}

impl OperationsResult {
    pub fn underwriting_profit(&self) -> f64 {
        self.premium_earned - self.claims_incurred - self.expenses
    }
}

pub struct OperationsSimulator<'a> {
    game: &'a GameState,
    claims: &'a dyn ClaimsModel,
}

impl<'a> OperationsSimulator<'a> {
    pub fn new(game: &'a GameState, claims: &'a dyn ClaimsModel) -> Self {
        OperationsSimulator { game, claims }
    }

    /// `market` holds only this company's results. `rng` must be the
    /// company's claims stream; noise is drawn once per segment in segment order.
    pub fn simulate(
        &self,
        company: CompanyId,
        market: &[MarketResult],
        catastrophes: &BTreeMap<Segment, CatastropheHit>,
        rng: &mut dyn RngCore,
    ) -> Result<OperationsResult, UnitError> {
        let mut ordered: Vec<&MarketResult> = market.iter().collect();
        ordered.sort_by(|a, b| a.segment.cmp(&b.segment));

        let mut by_segment = Vec::with_capacity(ordered.len());
        for result in ordered {
            let params = self.game.segment_params(&result.segment).ok_or_else(|| DataError::UnknownSegment {
                company,
                segment: result.segment.clone(),
            })?;
            let tier = self
                .game
                .tier(&result.tier)
                .ok_or_else(|| DataError::UnknownTier { company, tier: result.tier.clone() })?;

            let premium = ComputationError::check_finite("premium written", result.premium_written)?;
            if premium < 0.0 {
                return Err(ComputationError::Negative { quantity: "premium written", value: premium }.into());
            }

            let noise = self.claims.claims_noise(rng);
            let baseline_claims = premium * params.expected_loss_ratio * tier.loss_factor * noise;
            let hit = catastrophes.get(&result.segment);
            let claims = hit.map_or(baseline_claims, |h| baseline_claims * h.severity_multiplier);

            by_segment.push(SegmentClaims {
                segment: result.segment.clone(),
                premium,
                baseline_claims,
                claims,
                catastrophe: hit.is_some(),
            });
        }

        let premium_earned: f64 = by_segment.iter().map(|s| s.premium).sum();
        let baseline_claims: f64 = by_segment.iter().map(|s| s.baseline_claims).sum();
        let claims_incurred = ComputationError::check_finite(
            "claims incurred",
            by_segment.iter().map(|s| s.claims).sum(),
        )?;
        let exposure_units = market.iter().map(|r| r.demand_served).sum();
        let expenses = self.game.expenses.fixed_per_turn + self.game.expenses.variable_rate * premium_earned;

        let no_exposure = premium_earned <= 0.0;
        let (loss_ratio, expense_ratio) = if no_exposure {
            (0.0, 0.0)
        } else {
            (claims_incurred / premium_earned, expenses / premium_earned)
        };

        let claims_paid = claims_incurred * self.game.claims.paid_fraction;

        Ok(OperationsResult {
            company,
            premium_earned,
            exposure_units,
            baseline_claims,
            claims_incurred,
            claims_paid,
            claims_reserved: claims_incurred - claims_paid,
            expenses,
            loss_ratio,
            expense_ratio,
            combined_ratio: loss_ratio + expense_ratio,
            no_exposure,
            by_segment,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::perils::PlaceholderClaims;
    use crate::random::{StreamKind, TurnSeed};

    fn game(probability: f64, severity: f64, sigma: f64) -> GameState {
        let mut gs = GameState::canonical();
        gs.catastrophe.probability = probability;
        gs.catastrophe.severity_multiplier = severity;
        gs.claims.noise_sigma = sigma;
        gs
    }

    fn result(company: u64, state: &str, line: &str, units: u64, price: f64) -> MarketResult {
        MarketResult {
            company: CompanyId(company),
            segment: Segment::new(state, line),
            tier: "standard".into(),
            demand_served: units,
            market_share: 0.5,
            effective_price: price,
            premium_written: units as f64 * price,
        }
    }

    fn simulate(
        gs: &GameState,
        market: &[MarketResult],
        cats: &BTreeMap<Segment, CatastropheHit>,
    ) -> Result<OperationsResult, UnitError> {
        let model = PlaceholderClaims::new(&gs.catastrophe, &gs.claims);
        let mut rng = TurnSeed::derive(gs.seed, 1).company_stream(StreamKind::Claims, CompanyId(1));
        OperationsSimulator::new(gs, &model).simulate(CompanyId(1), market, cats, &mut rng)
    }

    #[test]
    fn zero_premium_yields_no_exposure_sentinel() {
        let gs = game(0.0, 1.0, 0.0);
        let ops = simulate(&gs, &[], &BTreeMap::new()).unwrap();
        assert!(ops.no_exposure);
        assert_eq!(ops.loss_ratio, 0.0);
        assert_eq!(ops.expense_ratio, 0.0);
        assert_eq!(ops.combined_ratio, 0.0);
        assert_eq!(ops.expenses, gs.expenses.fixed_per_turn);
    }

    #[test]
    fn deterministic_claims_follow_expected_loss_ratio() {
        let gs = game(0.0, 1.0, 0.0);
        let ops = simulate(&gs, &[result(1, "FL", "auto", 10_000, 24.0)], &BTreeMap::new()).unwrap();
        assert!((ops.premium_earned - 240_000.0).abs() < 1e-6);
        assert!((ops.loss_ratio - 0.66).abs() < 1e-12, "loss ratio {}", ops.loss_ratio);
        assert_eq!(ops.exposure_units, 10_000);
    }

    #[test]
    fn catastrophe_multiplies_baseline_claims_without_clamping() {
        let gs = game(1.0, 10.0, 0.0);
        let fl_auto = Segment::new("FL", "auto");
        let cats = BTreeMap::from([(
            fl_auto.clone(),
            CatastropheHit { segment: fl_auto, severity_multiplier: 10.0 },
        )]);
        let ops = simulate(&gs, &[result(1, "FL", "auto", 10_000, 24.0)], &cats).unwrap();
        assert!((ops.claims_incurred - ops.baseline_claims * 10.0).abs() < 1e-6);
        assert!(ops.combined_ratio > 1.0, "combined ratio {}", ops.combined_ratio);
        assert!(ops.by_segment[0].catastrophe);
    }

    #[test]
    fn catastrophe_only_affects_hit_segments() {
        let gs = game(1.0, 10.0, 0.0);
        let tx = Segment::new("TX", "auto");
        let cats = BTreeMap::from([(tx.clone(), CatastropheHit { segment: tx, severity_multiplier: 10.0 })]);
        let ops = simulate(
            &gs,
            &[result(1, "FL", "auto", 1_000, 24.0), result(1, "TX", "auto", 1_000, 22.0)],
            &cats,
        )
        .unwrap();
        let fl = ops.by_segment.iter().find(|s| s.segment.state == "FL").unwrap();
        let tx = ops.by_segment.iter().find(|s| s.segment.state == "TX").unwrap();
        assert_eq!(fl.claims, fl.baseline_claims);
        assert!((tx.claims - tx.baseline_claims * 10.0).abs() < 1e-9);
    }

    #[test]
    fn paid_and_reserved_split_incurred_claims() {
        let gs = game(0.0, 1.0, 0.1);
        let ops = simulate(&gs, &[result(1, "CA", "home", 2_000, 52.0)], &BTreeMap::new()).unwrap();
        assert!((ops.claims_paid + ops.claims_reserved - ops.claims_incurred).abs() < 1e-6);
        assert!((ops.claims_paid - ops.claims_incurred * 0.6).abs() < 1e-6);
    }

    #[test]
    fn unknown_segment_is_a_data_error() {
        let gs = game(0.0, 1.0, 0.0);
        let err = simulate(&gs, &[result(1, "NY", "auto", 10, 1.0)], &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, UnitError::Data(DataError::UnknownSegment { .. })));
    }

    #[test]
    fn same_stream_reproduces_claims() {
        let gs = game(0.0, 1.0, 0.2);
        let market = [result(1, "FL", "auto", 5_000, 24.0), result(1, "FL", "home", 800, 55.0)];
        let a = simulate(&gs, &market, &BTreeMap::new()).unwrap();
        let b = simulate(&gs, &market, &BTreeMap::new()).unwrap();
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn combined_ratio_is_exact_sum(
            units in prop::collection::vec(0u64..50_000, 0..6),
            sigma in 0.0f64..0.5,
        ) {
            let gs = game(0.0, 1.0, sigma);
            let states = ["FL", "TX", "CA"];
            let market: Vec<MarketResult> = units
                .iter()
                .enumerate()
                .map(|(i, &u)| result(1, states[i % 3], if i < 3 { "auto" } else { "home" }, u, 20.0))
                .collect();
            let ops = simulate(&gs, &market, &BTreeMap::new()).unwrap();
            prop_assert_eq!(ops.combined_ratio, ops.loss_ratio + ops.expense_ratio);
        }
    }
}
