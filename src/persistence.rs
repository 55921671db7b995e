use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::aggregator::CompanyTurnResult;
use crate::config::GameState;
use crate::error::DataError;
use crate::investment::PortfolioProfile;
use crate::market::PricingDecision;
use crate::types::{CompanyId, TurnId};

/// Everything one company submitted for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyDecisions {
    pub pricing: Vec<PricingDecision>,
    #[serde(default)]
    pub withdrawals: f64,
    #[serde(default)]
    pub expansion_spend: f64,
    #[serde(default)]
    pub portfolio: PortfolioProfile,
}

impl CompanyDecisions {
    /// Reject decisions the stages cannot use. Segments without a decision
    /// are simply not entered.
    pub fn validate(&self, company: CompanyId, game: &GameState) -> Result<(), DataError> {
        let mut seen = BTreeSet::new();
        for d in &self.pricing {
            if game.segment_params(&d.segment).is_none() {
                return Err(DataError::UnknownSegment { company, segment: d.segment.clone() });
            }
            if game.tier(&d.tier).is_none() {
                return Err(DataError::UnknownTier { company, tier: d.tier.clone() });
            }
            if !(d.price_multiplier > 0.0 && d.price_multiplier.is_finite()) {
                return Err(DataError::InvalidDecision {
                    company,
                    field: "price_multiplier",
                    expected: "positive",
                    value: d.price_multiplier,
                });
            }
            if !seen.insert(&d.segment) {
                return Err(DataError::DuplicateDecision { company, segment: d.segment.clone() });
            }
        }
        for (field, value) in [("withdrawals", self.withdrawals), ("expansion_spend", self.expansion_spend)] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(DataError::InvalidDecision { company, field, expected: "non-negative", value });
            }
        }
        self.portfolio.validate(company)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PersistenceError {
    /// The requested record does not exist.
    #[error("no {what} for {company} at {turn}")]
    NotFound {
        /// Kind of record.
        what: &'static str,
        /// Company the record belongs to.
        company: CompanyId,
        /// Turn the lookup was scoped to.
        turn: TurnId,
    },

    /// No game state was recorded for the turn.
    #[error("no game state for {turn}")]
    NoGameState {
        /// Turn without a game state.
        turn: TurnId,
    },

    /// A result already exists; committed results are never replaced.
    #[error("{company} already has a committed result for {turn}")]
    AlreadyCommitted {
        /// Company with the existing result.
        company: CompanyId,
        /// Turn of the existing result.
        turn: TurnId,
    },

    /// The backing store could not serve the request.
    #[error("store unavailable: {message}")]
    Unavailable {
        /// Backend description.
        message: String,
    },
}

impl PersistenceError {
    /// Map a read failure for `company` onto the unit-scoped error taxonomy.
    pub fn into_data_error(self, company: CompanyId) -> DataError {
        match self {
            PersistenceError::NotFound { what: "decisions", turn, .. } => DataError::MissingDecisions { company, turn },
            PersistenceError::NotFound { what: "company state", .. } => DataError::MissingCompanyState { company },
            other => DataError::Storage { message: other.to_string() },
        }
    }
}

/// Storage collaborator. Implementations must make `write_result` atomic per
/// company and insert-once per (company, turn).
pub trait Persistence: Send + Sync {
    fn get_game_state(&self, turn: TurnId) -> Result<GameState, PersistenceError>;

    fn get_decisions(&self, turn: TurnId, company: CompanyId) -> Result<CompanyDecisions, PersistenceError>;

    /// Latest committed result for `company` strictly before `turn`.
    fn get_company_state(&self, company: CompanyId, turn: TurnId) -> Result<CompanyTurnResult, PersistenceError>;

    fn has_result(&self, turn: TurnId, company: CompanyId) -> Result<bool, PersistenceError>;

    fn write_result(&self, turn: TurnId, result: &CompanyTurnResult) -> Result<(), PersistenceError>;
}

/// Process-local store for the CLI, benches and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    game_states: RwLock<BTreeMap<TurnId, GameState>>,
    decisions: RwLock<BTreeMap<(TurnId, CompanyId), CompanyDecisions>>,
    results: RwLock<BTreeMap<(CompanyId, TurnId), CompanyTurnResult>>,
}

fn poisoned<T>(_: T) -> PersistenceError {
    PersistenceError::Unavailable { message: "lock poisoned".to_string() }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_game_state(&self, turn: TurnId, game: GameState) -> Result<(), PersistenceError> {
        self.game_states.write().map_err(poisoned)?.insert(turn, game);
        Ok(())
    }

    pub fn put_decisions(
        &self,
        turn: TurnId,
        company: CompanyId,
        decisions: CompanyDecisions,
    ) -> Result<(), PersistenceError> {
        self.decisions.write().map_err(poisoned)?.insert((turn, company), decisions);
        Ok(())
    }

    /// Record a company's opening capital as its turn-0 result.
    pub fn seed_company(&self, company: CompanyId, capital: f64) -> Result<(), PersistenceError> {
        self.write_result(TurnId(0), &CompanyTurnResult::opening(company, capital))
    }

    pub fn results_for_turn(&self, turn: TurnId) -> Result<BTreeMap<CompanyId, CompanyTurnResult>, PersistenceError> {
        Ok(self
            .results
            .read()
            .map_err(poisoned)?
            .iter()
            .filter(|((_, t), _)| *t == turn)
            .map(|((c, _), r)| (*c, r.clone()))
            .collect())
    }
}

impl Persistence for InMemoryStore {
    fn get_game_state(&self, turn: TurnId) -> Result<GameState, PersistenceError> {
        self.game_states
            .read()
            .map_err(poisoned)?
            .get(&turn)
            .cloned()
            .ok_or(PersistenceError::NoGameState { turn })
    }

    fn get_decisions(&self, turn: TurnId, company: CompanyId) -> Result<CompanyDecisions, PersistenceError> {
        self.decisions
            .read()
            .map_err(poisoned)?
            .get(&(turn, company))
            .cloned()
            .ok_or(PersistenceError::NotFound { what: "decisions", company, turn })
    }

    fn get_company_state(&self, company: CompanyId, turn: TurnId) -> Result<CompanyTurnResult, PersistenceError> {
        self.results
            .read()
            .map_err(poisoned)?
            .range((company, TurnId(0))..(company, turn))
            .next_back()
            .map(|(_, r)| r.clone())
            .ok_or(PersistenceError::NotFound { what: "company state", company, turn })
    }

    fn has_result(&self, turn: TurnId, company: CompanyId) -> Result<bool, PersistenceError> {
        Ok(self.results.read().map_err(poisoned)?.contains_key(&(company, turn)))
    }

    fn write_result(&self, turn: TurnId, result: &CompanyTurnResult) -> Result<(), PersistenceError> {
        let mut results = self.results.write().map_err(poisoned)?;
        let key = (result.company, turn);
        if results.contains_key(&key) {
            return Err(PersistenceError::AlreadyCommitted { company: result.company, turn });
        }
        results.insert(key, result.clone());
        Ok(())
    }
}
