use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::InvestmentConfig;
use crate::error::{ComputationError, DataError, UnitError};
use crate::random::standard_normal;
use crate::types::CompanyId;

/// Portfolio characteristics chosen by the company, each in [0, 100].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioProfile {
    pub risk: f64,
    pub duration: f64,
    pub liquidity: f64,
    pub credit: f64,
    pub diversification: f64,
}

impl Default for PortfolioProfile {
    fn default() -> Self {
        PortfolioProfile { risk: 30.0, duration: 40.0, liquidity: 60.0, credit: 30.0, diversification: 60.0 }
    }
}

impl PortfolioProfile {
    pub fn validate(&self, company: CompanyId) -> Result<(), DataError> {
        for (field, value) in [
            ("portfolio.risk", self.risk),
            ("portfolio.duration", self.duration),
            ("portfolio.liquidity", self.liquidity),
            ("portfolio.credit", self.credit),
            ("portfolio.diversification", self.diversification),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(DataError::InvalidDecision { company, field, expected: "within [0, 100]", value });
            }
        }
        Ok(())
    }
}

/// Weekly return model. PLACEHOLDER formulas sit behind this seam so a
/// validated model can replace them without touching the simulator.
pub trait ReturnModel: Send + Sync {
    /// Expected weekly return rate.
    fn expected_return(&self, profile: &PortfolioProfile) -> f64;

    /// Portion of the expected return paid as income (coupons, dividends).
    fn income_rate(&self, profile: &PortfolioProfile) -> f64;

    /// Standard deviation of the weekly return rate.
    fn dispersion(&self, profile: &PortfolioProfile) -> f64;
}

#[derive(Debug, Clone)]
pub struct PlaceholderReturns {
    config: InvestmentConfig,
}

impl PlaceholderReturns {
    pub fn new(config: &InvestmentConfig) -> Self {
        PlaceholderReturns { config: config.clone() }
    }
}

impl ReturnModel for PlaceholderReturns {
    fn expected_return(&self, p: &PortfolioProfile) -> f64 {
        self.income_rate(p) + self.config.risk_premium * p.risk / 100.0
    }

    fn income_rate(&self, p: &PortfolioProfile) -> f64 {
        let c = &self.config;
        c.base_rate + c.term_premium * p.duration / 100.0 + c.credit_spread * p.credit / 100.0
            - c.liquidity_cost * p.liquidity / 100.0
    }

    fn dispersion(&self, p: &PortfolioProfile) -> f64 {
        let c = &self.config;
        c.base_volatility * (p.risk / 100.0) * (1.0 - c.diversification_benefit * p.diversification / 100.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestmentResult {
    pub company: CompanyId,
    pub asset_base: f64,
    pub expected_return: f64,
    /// Realised weekly return rate after the variance draw.
    pub return_rate: f64,
    pub investment_income: f64,
    pub realized_gains: f64,
    pub unrealized_gains: f64,
}

impl InvestmentResult {
    pub fn total_return(&self) -> f64 {
        self.investment_income + self.realized_gains + self.unrealized_gains
    }
}

pub struct InvestmentSimulator<'a> {
    model: &'a dyn ReturnModel,
}

impl<'a> InvestmentSimulator<'a> {
    pub fn new(model: &'a dyn ReturnModel) -> Self {
        InvestmentSimulator { model }
    }

    /// Negative capital leaves nothing to invest; the result is all zeros.
    /// `rng` must be the company's investment stream.
    pub fn simulate(
        &self,
        company: CompanyId,
        capital: f64,
        profile: &PortfolioProfile,
        rng: &mut dyn RngCore,
    ) -> Result<InvestmentResult, UnitError> {
        profile.validate(company)?;
        let asset_base = ComputationError::check_finite("investable assets", capital)?.max(0.0);

        let expected_return = self.model.expected_return(profile);
        let z = standard_normal(rng);
        let return_rate =
            ComputationError::check_finite("return rate", expected_return + self.model.dispersion(profile) * z)?;

        let investment_income = asset_base * self.model.income_rate(profile);
        let gains = asset_base * return_rate - investment_income;
        let realized_gains = gains * profile.liquidity / 100.0;

        Ok(InvestmentResult {
            company,
            asset_base,
            expected_return,
            return_rate,
            investment_income,
            realized_gains,
            unrealized_gains: gains - realized_gains,
        })
    }
}
