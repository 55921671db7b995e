use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::types::{CompanyId, Segment};

/// Economic parameters for one market segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentParams {
    pub segment: Segment,
    /// Policies demanded per turn at the reference price. Also the segment cap.
    pub base_demand: f64,
    /// Configured price elasticity (negative: demand falls as price rises).
    pub price_elasticity: f64,
    /// Weight of the competitive-effect term in the linear model.
    pub competitive_intensity: f64,
    /// Premium per policy at multiplier 1.0 on a tier with price factor 1.0.
    pub base_premium: f64,
    /// Expected claims as a fraction of earned premium.
    pub expected_loss_ratio: f64,
}

/// A product tier a company can sell into a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductTier {
    pub name: String,
    pub price_factor: f64,
    /// Relative pull on customers at equal price.
    pub attractiveness: f64,
    /// Multiplier on the segment's expected loss ratio.
    pub loss_factor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseConfig {
    /// Overhead charged every turn regardless of volume.
    pub fixed_per_turn: f64,
    /// Acquisition and admin cost as a fraction of premium.
    pub variable_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimsConfig {
    /// σ of the unit-mean lognormal noise on baseline claims. 0 disables noise.
    pub noise_sigma: f64,
    /// Fraction of incurred claims paid in cash this turn; the rest is reserved.
    pub paid_fraction: f64,
}

/// PLACEHOLDER catastrophe parameters pending a validated actuarial model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatastropheConfig {
    /// Per-segment, per-turn probability of a catastrophe.
    pub probability: f64,
    /// Multiplier applied to baseline claims in a hit segment.
    pub severity_multiplier: f64,
}

/// PLACEHOLDER weekly return parameters. Portfolio characteristics scale
/// each premium linearly over their [0, 100] range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentConfig {
    pub base_rate: f64,
    pub risk_premium: f64,
    pub term_premium: f64,
    pub credit_spread: f64,
    pub liquidity_cost: f64,
    pub base_volatility: f64,
    /// Fraction of volatility removed at diversification = 100.
    pub diversification_benefit: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalConfig {
    pub premium_capital_factor: f64,
    pub reserve_capital_factor: f64,
    /// Lower bound of required capital; keeps the solvency denominator positive.
    pub minimum_capital_floor: f64,
    /// Solvency ratio below which a company is put on watch.
    pub watch_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PluginSettings {
    pub enabled: bool,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Resolved configuration snapshot for one turn. Read-only during processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    /// Root of every stochastic draw in the turn.
    pub seed: u64,
    pub companies: Vec<CompanyId>,
    pub segments: Vec<SegmentParams>,
    pub tiers: Vec<ProductTier>,
    pub expenses: ExpenseConfig,
    pub claims: ClaimsConfig,
    pub catastrophe: CatastropheConfig,
    pub investment: InvestmentConfig,
    pub capital: CapitalConfig,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginSettings>,
}

/// Engine construction parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Demand-model selector, resolved once at construction.
    pub demand_model: String,
    /// Upper bound on concurrently executing units.
    pub worker_limit: usize,
    /// Wall-clock budget for one turn; the turn's own deadline applies too.
    pub turn_budget: Duration,
    /// Longest the coordinator waits on plugins at a single hook.
    pub hook_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            demand_model: "constant_elasticity".to_string(),
            worker_limit: 4,
            turn_budget: Duration::from_secs(60),
            hook_timeout: Duration::from_secs(5),
        }
    }
}

fn require(
    ok: bool,
    field: &'static str,
    expected: &'static str,
    value: f64,
) -> Result<(), ConfigurationError> {
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidParameter { field, expected, value })
    }
}

impl SegmentParams {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let check = |ok: bool, field: &'static str, expected: &'static str, value: f64| {
            if ok && value.is_finite() {
                Ok(())
            } else {
                Err(ConfigurationError::InvalidSegment {
                    segment: self.segment.clone(),
                    field,
                    expected,
                    value,
                })
            }
        };
        check(self.base_demand > 0.0, "base_demand", "positive", self.base_demand)?;
        check(self.price_elasticity <= 0.0, "price_elasticity", "non-positive", self.price_elasticity)?;
        check(
            self.competitive_intensity >= 0.0,
            "competitive_intensity",
            "non-negative",
            self.competitive_intensity,
        )?;
        check(self.base_premium > 0.0, "base_premium", "positive", self.base_premium)?;
        check(
            self.expected_loss_ratio >= 0.0,
            "expected_loss_ratio",
            "non-negative",
            self.expected_loss_ratio,
        )
    }
}

impl GameState {
    pub fn segment_params(&self, segment: &Segment) -> Option<&SegmentParams> {
        self.segments.iter().find(|s| &s.segment == segment)
    }

    pub fn tier(&self, name: &str) -> Option<&ProductTier> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn plugin_enabled(&self, name: &str) -> Option<bool> {
        self.plugins.get(name).map(|p| p.enabled)
    }

    /// Reject parameter sets the stages cannot evaluate.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut seen = BTreeSet::new();
        for params in &self.segments {
            params.validate()?;
            if !seen.insert(&params.segment) {
                return Err(ConfigurationError::DuplicateSegment { segment: params.segment.clone() });
            }
        }
        for tier in &self.tiers {
            require(tier.price_factor > 0.0, "tier.price_factor", "positive", tier.price_factor)?;
            require(tier.attractiveness > 0.0, "tier.attractiveness", "positive", tier.attractiveness)?;
            require(tier.loss_factor >= 0.0, "tier.loss_factor", "non-negative", tier.loss_factor)?;
        }
        let e = &self.expenses;
        require(e.fixed_per_turn >= 0.0, "expenses.fixed_per_turn", "non-negative", e.fixed_per_turn)?;
        require(e.variable_rate >= 0.0, "expenses.variable_rate", "non-negative", e.variable_rate)?;
        let c = &self.claims;
        require(c.noise_sigma >= 0.0, "claims.noise_sigma", "non-negative", c.noise_sigma)?;
        require(
            (0.0..=1.0).contains(&c.paid_fraction),
            "claims.paid_fraction",
            "within [0, 1]",
            c.paid_fraction,
        )?;
        let cat = &self.catastrophe;
        require(
            (0.0..=1.0).contains(&cat.probability),
            "catastrophe.probability",
            "within [0, 1]",
            cat.probability,
        )?;
        require(
            cat.severity_multiplier >= 0.0,
            "catastrophe.severity_multiplier",
            "non-negative",
            cat.severity_multiplier,
        )?;
        let inv = &self.investment;
        require(inv.base_volatility >= 0.0, "investment.base_volatility", "non-negative", inv.base_volatility)?;
        require(
            (0.0..=1.0).contains(&inv.diversification_benefit),
            "investment.diversification_benefit",
            "within [0, 1]",
            inv.diversification_benefit,
        )?;
        let cap = &self.capital;
        require(
            cap.minimum_capital_floor > 0.0,
            "capital.minimum_capital_floor",
            "positive",
            cap.minimum_capital_floor,
        )?;
        require(
            cap.premium_capital_factor >= 0.0,
            "capital.premium_capital_factor",
            "non-negative",
            cap.premium_capital_factor,
        )?;
        require(
            cap.reserve_capital_factor >= 0.0,
            "capital.reserve_capital_factor",
            "non-negative",
            cap.reserve_capital_factor,
        )?;
        require(cap.watch_threshold >= 1.0, "capital.watch_threshold", "at least 1", cap.watch_threshold)
    }

    /// The built-in classroom scenario: three states × two lines, three tiers,
    /// six companies. Numeric values are PLACEHOLDER calibration.
    pub fn canonical() -> Self {
        let segment = |state: &str, line: &str, base_demand: f64, base_premium: f64, elr: f64| {
            SegmentParams {
                segment: Segment::new(state, line),
                base_demand,
                price_elasticity: -1.2,
                competitive_intensity: 0.5,
                base_premium,
                expected_loss_ratio: elr,
            }
        };

        GameState {
            seed: 42,
            companies: (1..=6).map(CompanyId).collect(),
            segments: vec![
                segment("FL", "auto", 1_000_000.0, 24.0, 0.66),
                segment("FL", "home", 400_000.0, 55.0, 0.58),
                segment("TX", "auto", 900_000.0, 22.0, 0.64),
                segment("TX", "home", 350_000.0, 48.0, 0.60),
                segment("CA", "auto", 1_200_000.0, 26.0, 0.68),
                segment("CA", "home", 500_000.0, 52.0, 0.55),
            ],
            tiers: vec![
                ProductTier { name: "basic".into(), price_factor: 0.85, attractiveness: 0.9, loss_factor: 1.05 },
                ProductTier { name: "standard".into(), price_factor: 1.0, attractiveness: 1.0, loss_factor: 1.0 },
                ProductTier { name: "premium".into(), price_factor: 1.25, attractiveness: 1.15, loss_factor: 0.92 },
            ],
            expenses: ExpenseConfig { fixed_per_turn: 25_000.0, variable_rate: 0.22 },
            claims: ClaimsConfig { noise_sigma: 0.08, paid_fraction: 0.6 },
            catastrophe: CatastropheConfig { probability: 0.01, severity_multiplier: 4.0 },
            investment: InvestmentConfig {
                base_rate: 0.0004,
                risk_premium: 0.0008,
                term_premium: 0.0002,
                credit_spread: 0.0003,
                liquidity_cost: 0.0001,
                base_volatility: 0.012,
                diversification_benefit: 0.5,
            },
            capital: CapitalConfig {
                premium_capital_factor: 2.0,
                reserve_capital_factor: 0.3,
                minimum_capital_floor: 250_000.0,
                watch_threshold: 1.5,
            },
            plugins: BTreeMap::from([
                ("solvency_watch".to_string(), PluginSettings { enabled: true, params: serde_json::Value::Null }),
                (
                    "market_concentration".to_string(),
                    PluginSettings { enabled: true, params: serde_json::Value::Null },
                ),
            ]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_validates() {
        GameState::canonical().validate().expect("canonical game state must be valid");
    }

    #[test]
    fn non_positive_base_demand_is_rejected() {
        let mut gs = GameState::canonical();
        gs.segments[0].base_demand = 0.0;
        let err = gs.validate().unwrap_err();
        assert!(
            matches!(err, ConfigurationError::InvalidSegment { field: "base_demand", .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn duplicate_segment_is_rejected() {
        let mut gs = GameState::canonical();
        let dup = gs.segments[1].clone();
        gs.segments.push(dup);
        assert!(matches!(gs.validate(), Err(ConfigurationError::DuplicateSegment { .. })));
    }

    #[test]
    fn zero_capital_floor_is_rejected() {
        let mut gs = GameState::canonical();
        gs.capital.minimum_capital_floor = 0.0;
        assert!(matches!(
            gs.validate(),
            Err(ConfigurationError::InvalidParameter { field: "capital.minimum_capital_floor", .. })
        ));
    }

    #[test]
    fn catastrophe_probability_above_one_is_rejected() {
        let mut gs = GameState::canonical();
        gs.catastrophe.probability = 1.5;
        assert!(gs.validate().is_err());
    }

    #[test]
    fn nan_parameter_is_rejected() {
        let mut gs = GameState::canonical();
        gs.expenses.variable_rate = f64::NAN;
        assert!(gs.validate().is_err());
    }

    #[test]
    fn lookups_find_configured_entries() {
        let gs = GameState::canonical();
        assert!(gs.segment_params(&Segment::new("FL", "auto")).is_some());
        assert!(gs.segment_params(&Segment::new("NY", "auto")).is_none());
        assert_eq!(gs.tier("premium").map(|t| t.price_factor), Some(1.25));
        assert_eq!(gs.plugin_enabled("solvency_watch"), Some(true));
        assert_eq!(gs.plugin_enabled("nope"), None);
    }

    #[test]
    fn game_state_json_roundtrip_preserves_values() {
        let gs = GameState::canonical();
        let json = serde_json::to_string(&gs).unwrap();
        let back: GameState = serde_json::from_str(&json).unwrap();
        assert_eq!(gs, back);
    }
}
