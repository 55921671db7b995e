//! Fold one company's stage outputs into its authoritative turn result.
//!
//! [`ResultsAggregator`] is the only component that writes company financial
//! state. A company with any missing input fails on its own; nothing partial
//! is written.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::CapitalConfig;
use crate::error::{ComputationError, ConfigurationError, DataError, UnitError};
use crate::investment::InvestmentResult;
use crate::market::{MarketResult, SegmentOutcome};
use crate::operations::OperationsResult;
use crate::persistence::Persistence;
use crate::types::{CompanyId, Segment, TurnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapitalStatus {
    Adequate,
    Watch,
    Insolvent,
}

/// Detailed inputs and intermediate figures behind a turn result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnBreakdown {
    pub market: Vec<MarketResult>,
    pub operations: OperationsResult,
    pub investment: InvestmentResult,
    pub prior_capital: f64,
    pub underwriting_profit: f64,
    pub investment_return: f64,
    pub withdrawals: f64,
    pub expansion_spend: f64,
    pub required_capital: f64,
}

/// Authoritative per-company outcome of one turn. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyTurnResult {
    pub company: CompanyId,
    pub turn: TurnId,
    pub ending_capital: f64,
    pub solvency_ratio: f64,
    pub combined_ratio: f64,
    pub capital_status: CapitalStatus,
    /// No premium was earned; the solvency ratio is measured against the capital floor.
    pub no_exposure: bool,
    /// Absent only on opening balances.
    pub breakdown: Option<Box<TurnBreakdown>>,
}

impl CompanyTurnResult {
    /// Opening balance recorded at turn 0, before any play.
    pub fn opening(company: CompanyId, capital: f64) -> Self {
        CompanyTurnResult {
            company,
            turn: TurnId(0),
            ending_capital: capital,
            solvency_ratio: 0.0,
            combined_ratio: 0.0,
            capital_status: CapitalStatus::Adequate,
            no_exposure: true,
            breakdown: None,
        }
    }
}

/// Everything the aggregator needs for one company. Any `None` fails the company.
#[derive(Debug, Clone, Default)]
pub struct AggregationInputs {
    pub market: Option<Vec<MarketResult>>,
    pub operations: Option<OperationsResult>,
    pub investment: Option<InvestmentResult>,
    pub prior: Option<CompanyTurnResult>,
    pub withdrawals: f64,
    pub expansion_spend: f64,
}

#[derive(Debug, Clone)]
pub struct ResultsAggregator {
    capital: CapitalConfig,
}

impl ResultsAggregator {
    /// The capital floor must be positive so the solvency denominator never reaches zero.
    pub fn new(capital: &CapitalConfig) -> Result<Self, ConfigurationError> {
        if !(capital.minimum_capital_floor > 0.0 && capital.minimum_capital_floor.is_finite()) {
            return Err(ConfigurationError::InvalidParameter {
                field: "capital.minimum_capital_floor",
                expected: "positive",
                value: capital.minimum_capital_floor,
            });
        }
        Ok(ResultsAggregator { capital: capital.clone() })
    }

    pub fn required_capital(&self, operations: &OperationsResult) -> f64 {
        let exposure_based = operations.premium_earned * self.capital.premium_capital_factor
            + operations.claims_reserved * self.capital.reserve_capital_factor;
        exposure_based.max(self.capital.minimum_capital_floor)
    }

    fn status(&self, ending_capital: f64, solvency_ratio: f64) -> CapitalStatus {
        if ending_capital <= 0.0 || solvency_ratio < 1.0 {
            CapitalStatus::Insolvent
        } else if solvency_ratio < self.capital.watch_threshold {
            CapitalStatus::Watch
        } else {
            CapitalStatus::Adequate
        }
    }

    /// Compute the new result without writing it.
    pub fn aggregate(
        &self,
        company: CompanyId,
        turn: TurnId,
        inputs: AggregationInputs,
    ) -> Result<CompanyTurnResult, UnitError> {
        let missing = |what| DataError::MissingUpstream { company, what };
        let market = inputs.market.ok_or_else(|| missing("market"))?;
        let operations = inputs.operations.ok_or_else(|| missing("operations"))?;
        let investment = inputs.investment.ok_or_else(|| missing("investment"))?;
        let prior = inputs.prior.ok_or_else(|| missing("prior company state"))?;

        let prior_capital = prior.ending_capital;
        let underwriting_profit = operations.underwriting_profit();
        let investment_return = investment.total_return();
        let ending_capital = ComputationError::check_finite(
            "ending capital",
            prior_capital + underwriting_profit + investment_return - inputs.withdrawals - inputs.expansion_spend,
        )?;

        let required_capital = self.required_capital(&operations);
        let solvency_ratio = ComputationError::check_finite("solvency ratio", ending_capital / required_capital)?;
        let capital_status = self.status(ending_capital, solvency_ratio);

        debug!(
            %company,
            %turn,
            prior_capital,
            ending_capital,
            solvency_ratio,
            combined_ratio = operations.combined_ratio,
            "company aggregated"
        );

        Ok(CompanyTurnResult {
            company,
            turn,
            ending_capital,
            solvency_ratio,
            combined_ratio: operations.combined_ratio,
            capital_status,
            no_exposure: operations.no_exposure,
            breakdown: Some(Box::new(TurnBreakdown {
                market,
                operations,
                investment,
                prior_capital,
                underwriting_profit,
                investment_return,
                withdrawals: inputs.withdrawals,
                expansion_spend: inputs.expansion_spend,
                required_capital,
            })),
        })
    }

    /// Aggregate and write in one step. Nothing is written on failure.
    pub fn commit(
        &self,
        store: &dyn Persistence,
        company: CompanyId,
        turn: TurnId,
        inputs: AggregationInputs,
    ) -> Result<CompanyTurnResult, UnitError> {
        let result = self.aggregate(company, turn, inputs)?;
        store
            .write_result(turn, &result)
            .map_err(|e| DataError::Storage { message: e.to_string() })?;
        Ok(result)
    }
}

/// Market-wide figures for one turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub total_demand: u64,
    pub total_premium: f64,
    pub total_claims: f64,
    pub total_investment_return: f64,
    pub total_capital: f64,
    /// Mean combined ratio across companies that wrote business.
    pub mean_combined_ratio: f64,
    pub catastrophe_segments: Vec<Segment>,
    pub insolvent_companies: usize,
    pub watch_companies: usize,
    /// HHI per segment, keyed by `STATE-line`.
    pub segment_concentration: BTreeMap<String, f64>,
}

impl TurnSummary {
    pub fn build<'a>(
        results: impl IntoIterator<Item = &'a CompanyTurnResult>,
        segments: impl IntoIterator<Item = &'a SegmentOutcome>,
        catastrophe_segments: Vec<Segment>,
    ) -> Self {
        let mut summary = TurnSummary { catastrophe_segments, ..TurnSummary::default() };

        for outcome in segments {
            summary.total_demand += outcome.total_demand;
            summary.segment_concentration.insert(outcome.segment.to_string(), outcome.concentration);
        }

        let mut exposed = 0usize;
        let mut combined_sum = 0.0;
        for result in results {
            summary.total_capital += result.ending_capital;
            match result.capital_status {
                CapitalStatus::Insolvent => summary.insolvent_companies += 1,
                CapitalStatus::Watch => summary.watch_companies += 1,
                CapitalStatus::Adequate => {}
            }
            if let Some(b) = &result.breakdown {
                summary.total_premium += b.operations.premium_earned;
                summary.total_claims += b.operations.claims_incurred;
                summary.total_investment_return += b.investment_return;
            }
            if !result.no_exposure {
                exposed += 1;
                combined_sum += result.combined_ratio;
            }
        }
        if exposed > 0 {
            summary.mean_combined_ratio = combined_sum / exposed as f64;
        }
        summary
    }
}
