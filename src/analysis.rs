use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::aggregator::CompanyTurnResult;
use crate::config::GameState;
use crate::engine::TurnOutcome;
use crate::types::{CompanyId, Segment, TurnId};

/// Per-turn market statistics derived from a turn outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnStats {
    pub turn: u64,
    pub total_demand: u64,
    pub total_premium: f64,
    pub total_claims: f64,
    pub total_investment_return: f64,
    /// Sum of ending capital across companies with a result for the turn.
    pub total_capital: f64,
    /// Mean combined ratio across companies that wrote business.
    pub mean_combined_ratio: f64,
    pub cat_segments: u32,
    pub insolvent_count: u32,
    pub watch_count: u32,
    pub failed_count: u32,
    /// Herfindahl index averaged across resolved segments.
    pub mean_hhi: f64,
}

impl TurnStats {
    pub fn from_outcome(outcome: &TurnOutcome) -> Self {
        let s = &outcome.summary;
        let mean_hhi = if s.segment_concentration.is_empty() {
            0.0
        } else {
            s.segment_concentration.values().sum::<f64>() / s.segment_concentration.len() as f64
        };
        TurnStats {
            turn: outcome.turn.0,
            total_demand: s.total_demand,
            total_premium: s.total_premium,
            total_claims: s.total_claims,
            total_investment_return: s.total_investment_return,
            total_capital: s.total_capital,
            mean_combined_ratio: s.mean_combined_ratio,
            cat_segments: s.catastrophe_segments.len() as u32,
            insolvent_count: s.insolvent_companies as u32,
            watch_count: s.watch_companies as u32,
            failed_count: outcome.failed_companies.len() as u32,
            mean_hhi,
        }
    }

    /// Claims / premium across the market. Returns 0.0 when nothing was written.
    pub fn loss_ratio(&self) -> f64 {
        if self.total_premium > 0.0 { self.total_claims / self.total_premium } else { 0.0 }
    }
}

/// Distribution statistics for a continuous metric across N runs.
#[derive(Debug, Clone, PartialEq)]
pub struct DistStats {
    pub n: usize,
    pub min: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

/// Distribution of a sparse count metric; median and max are enough.
#[derive(Debug, Clone, PartialEq)]
pub struct CountDist {
    pub n: usize,
    pub p50: u32,
    pub max: u32,
    pub mean: f64,
}

/// Cross-run distribution of the key [`TurnStats`] metrics for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDist {
    pub turn: u64,
    pub loss_ratio: DistStats,
    pub combined_ratio: DistStats,
    /// Total capital in millions.
    pub total_capital_m: DistStats,
    pub mean_hhi: DistStats,
    pub cat_segments: CountDist,
    pub insolvents: CountDist,
}

/// Linear-interpolated percentiles, sample standard deviation. `None` when empty.
pub fn percentile_stats(values: &mut [f64]) -> Option<DistStats> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();

    let interp = |p: f64| -> f64 {
        let h = p * (n - 1) as f64;
        let lo = h.floor() as usize;
        let hi = (lo + 1).min(n - 1);
        let frac = h - lo as f64;
        values[lo] * (1.0 - frac) + values[hi] * frac
    };

    let mean = values.iter().sum::<f64>() / n as f64;
    let variance = if n > 1 {
        values.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        0.0
    };

    Some(DistStats {
        n,
        min: values[0],
        p5: interp(0.05),
        p25: interp(0.25),
        p50: interp(0.50),
        p75: interp(0.75),
        p95: interp(0.95),
        max: values[n - 1],
        mean,
        std_dev: variance.sqrt(),
    })
}

fn count_dist(values: &mut [u32]) -> Option<CountDist> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let n = values.len();
    let mean = values.iter().map(|&x| x as f64).sum::<f64>() / n as f64;

    let h = 0.5 * (n - 1) as f64;
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    let frac = h - lo as f64;
    let p50 = (values[lo] as f64 * (1.0 - frac) + values[hi] as f64 * frac).round() as u32;

    Some(CountDist { n, p50, max: values[n - 1], mean })
}

/// Per-turn cross-run distributions. Turns present in fewer than 2 runs are
/// skipped. Sorted by turn.
pub fn analyse_distributions(all_runs: &[Vec<TurnStats>]) -> Vec<TurnDist> {
    let all_turns: BTreeSet<u64> = all_runs.iter().flat_map(|run| run.iter().map(|s| s.turn)).collect();

    let mut result = Vec::new();
    for turn in all_turns {
        let stats: Vec<&TurnStats> =
            all_runs.iter().filter_map(|run| run.iter().find(|s| s.turn == turn)).collect();
        if stats.len() < 2 {
            continue;
        }

        let mut lr: Vec<f64> = stats.iter().map(|s| s.loss_ratio()).collect();
        let mut cr: Vec<f64> = stats.iter().map(|s| s.mean_combined_ratio).collect();
        let mut cap: Vec<f64> = stats.iter().map(|s| s.total_capital / 1_000_000.0).collect();
        let mut hhi: Vec<f64> = stats.iter().map(|s| s.mean_hhi).collect();
        let mut cats: Vec<u32> = stats.iter().map(|s| s.cat_segments).collect();
        let mut insolvent: Vec<u32> = stats.iter().map(|s| s.insolvent_count).collect();

        if let (Some(loss_ratio), Some(combined_ratio), Some(total_capital_m), Some(mean_hhi), Some(cat_segments), Some(insolvents)) = (
            percentile_stats(&mut lr),
            percentile_stats(&mut cr),
            percentile_stats(&mut cap),
            percentile_stats(&mut hhi),
            count_dist(&mut cats),
            count_dist(&mut insolvent),
        ) {
            result.push(TurnDist { turn, loss_ratio, combined_ratio, total_capital_m, mean_hhi, cat_segments, insolvents });
        }
    }
    result
}

/// A turn result that breaks an accounting identity.
#[derive(Debug, Clone, PartialEq)]
pub enum IntegrityViolation {
    /// Served policies in a segment differ from the segment total.
    DemandNotConserved { segment: Segment, served: u64, total: u64 },
    /// Segment total exceeds the configured base demand.
    DemandAboveBase { segment: Segment, total: u64, base: f64 },
    /// combined ratio != loss ratio + expense ratio.
    CombinedRatioMismatch { company: CompanyId, combined: f64, sum: f64 },
    /// Ending capital does not equal the sum of its components.
    CapitalRollForward { company: CompanyId, expected: f64, actual: f64 },
    /// Solvency was computed against a non-positive requirement.
    NonPositiveRequirement { company: CompanyId, required: f64 },
    /// A result is filed under a different turn.
    WrongTurn { company: CompanyId, expected: TurnId, actual: TurnId },
    /// A company counted as completed has no result.
    MissingResult { company: CompanyId },
}

impl fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DemandNotConserved { segment, served, total } => {
                write!(f, "DemandNotConserved {segment}: served={served} total={total}")
            }
            Self::DemandAboveBase { segment, total, base } => {
                write!(f, "DemandAboveBase {segment}: total={total} base={base}")
            }
            Self::CombinedRatioMismatch { company, combined, sum } => {
                write!(f, "CombinedRatioMismatch {company}: combined={combined} loss+expense={sum}")
            }
            Self::CapitalRollForward { company, expected, actual } => {
                write!(f, "CapitalRollForward {company}: expected={expected:.2} actual={actual:.2}")
            }
            Self::NonPositiveRequirement { company, required } => {
                write!(f, "NonPositiveRequirement {company}: required={required}")
            }
            Self::WrongTurn { company, expected, actual } => {
                write!(f, "WrongTurn {company}: expected={expected} actual={actual}")
            }
            Self::MissingResult { company } => write!(f, "MissingResult {company}"),
        }
    }
}

/// Check a processed turn against the market and capital identities.
/// `results` holds the committed results for the turn. Returns one item per violation.
pub fn verify_turn(
    game: &GameState,
    outcome: &TurnOutcome,
    results: &BTreeMap<CompanyId, CompanyTurnResult>,
) -> Vec<IntegrityViolation> {
    let mut violations = Vec::new();

    for (segment, s) in &outcome.segments {
        let served = s.served_total();
        if served != s.total_demand {
            violations.push(IntegrityViolation::DemandNotConserved {
                segment: segment.clone(),
                served,
                total: s.total_demand,
            });
        }
        if let Some(params) = game.segment_params(segment)
            && s.total_demand as f64 > params.base_demand
        {
            violations.push(IntegrityViolation::DemandAboveBase {
                segment: segment.clone(),
                total: s.total_demand,
                base: params.base_demand,
            });
        }
    }

    for &company in &outcome.completed_companies {
        if !results.contains_key(&company) {
            violations.push(IntegrityViolation::MissingResult { company });
        }
    }

    for (&company, r) in results {
        if r.turn != outcome.turn {
            violations.push(IntegrityViolation::WrongTurn { company, expected: outcome.turn, actual: r.turn });
        }
        let Some(b) = &r.breakdown else {
            continue;
        };
        let sum = b.operations.loss_ratio + b.operations.expense_ratio;
        if b.operations.combined_ratio != sum || r.combined_ratio != sum {
            violations.push(IntegrityViolation::CombinedRatioMismatch { company, combined: r.combined_ratio, sum });
        }
        let expected = b.prior_capital + b.underwriting_profit + b.investment_return - b.withdrawals - b.expansion_spend;
        let tolerance = 1e-9 * expected.abs().max(1.0);
        if (r.ending_capital - expected).abs() > tolerance {
            violations.push(IntegrityViolation::CapitalRollForward { company, expected, actual: r.ending_capital });
        }
        if b.required_capital <= 0.0 {
            violations.push(IntegrityViolation::NonPositiveRequirement { company, required: b.required_capital });
        }
    }

    violations
}
