//! Error taxonomy for turn processing.
//!
//! Turn-scope failures ([`ConfigurationError`], [`EngineError`]) stop a run
//! before or while it executes. Unit-scope failures ([`UnitError`]) are
//! confined to one company or one segment: the engine records them, emits an
//! event, and carries on with every other unit.

use crate::types::{CompanyId, Segment, TurnId};

/// Invalid or missing parameters. Detected before any stage runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    /// The demand-model selector names no known model.
    #[error("unknown demand model `{name}`")]
    UnknownDemandModel {
        /// The selector that was supplied.
        name: String,
    },

    /// A segment parameter is out of its valid range.
    #[error("segment {segment}: {field} must be {expected}, got {value}")]
    InvalidSegment {
        /// The offending segment.
        segment: Segment,
        /// Name of the parameter.
        field: &'static str,
        /// Human-readable constraint.
        expected: &'static str,
        /// The value supplied.
        value: f64,
    },

    /// A scalar parameter outside its valid range.
    #[error("{field} must be {expected}, got {value}")]
    InvalidParameter {
        /// Name of the parameter.
        field: &'static str,
        /// Human-readable constraint.
        expected: &'static str,
        /// The value supplied.
        value: f64,
    },

    /// The same segment is configured twice.
    #[error("segment {segment} is configured more than once")]
    DuplicateSegment {
        /// The repeated segment.
        segment: Segment,
    },

    /// The worker pool could not be created.
    #[error("failed to build worker pool: {message}")]
    WorkerPool {
        /// Description from the pool builder.
        message: String,
    },
}

/// Missing or malformed inputs for one company or segment.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DataError {
    /// No decisions were submitted for the company this turn.
    #[error("no decisions recorded for {company} in {turn}")]
    MissingDecisions {
        /// Company without decisions.
        company: CompanyId,
        /// Turn being processed.
        turn: TurnId,
    },

    /// No prior financial state exists for the company.
    #[error("no prior state for {company}")]
    MissingCompanyState {
        /// Company without a prior result.
        company: CompanyId,
    },

    /// A decision names a segment that the game state does not define.
    #[error("{company} priced unknown segment {segment}")]
    UnknownSegment {
        /// Company that submitted the decision.
        company: CompanyId,
        /// The undefined segment.
        segment: Segment,
    },

    /// A company priced the same segment twice.
    #[error("{company} submitted more than one decision for {segment}")]
    DuplicateDecision {
        /// Company that submitted the decisions.
        company: CompanyId,
        /// The repeated segment.
        segment: Segment,
    },

    /// A decision names a product tier that the game state does not define.
    #[error("{company} selected unknown tier `{tier}`")]
    UnknownTier {
        /// Company that submitted the decision.
        company: CompanyId,
        /// The undefined tier name.
        tier: String,
    },

    /// A decision or portfolio field is outside its allowed range.
    #[error("{company}: {field} must be {expected}, got {value}")]
    InvalidDecision {
        /// Company that submitted the decision.
        company: CompanyId,
        /// Field name.
        field: &'static str,
        /// Human-readable constraint.
        expected: &'static str,
        /// The value supplied.
        value: f64,
    },

    /// An upstream stage result is absent at aggregation time.
    #[error("{company}: missing {what} result")]
    MissingUpstream {
        /// Company being aggregated.
        company: CompanyId,
        /// Which result was missing.
        what: &'static str,
    },

    /// The persistence collaborator failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description from the store.
        message: String,
    },
}

/// A numeric domain violation that no clamp covers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ComputationError {
    /// A computed quantity is NaN or infinite.
    #[error("{quantity} is not finite ({value})")]
    NonFinite {
        /// What was being computed.
        quantity: &'static str,
        /// The offending value.
        value: f64,
    },

    /// A quantity that must not be negative is negative.
    #[error("{quantity} is negative ({value})")]
    Negative {
        /// What was being computed.
        quantity: &'static str,
        /// The offending value.
        value: f64,
    },

    /// The demand model was called with prices it cannot evaluate.
    #[error("segment {segment}: non-positive price multiplier {value} from {company}")]
    NonPositivePrice {
        /// Segment being priced.
        segment: Segment,
        /// Company that supplied the price.
        company: CompanyId,
        /// The multiplier.
        value: f64,
    },

    /// The demand model was called with no pricing decisions.
    #[error("segment {segment}: demand requested with no pricing decisions")]
    EmptySegment {
        /// Segment being priced.
        segment: Segment,
    },
}

impl ComputationError {
    /// Reject NaN and infinities.
    pub fn check_finite(quantity: &'static str, value: f64) -> Result<f64, Self> {
        if value.is_finite() { Ok(value) } else { Err(ComputationError::NonFinite { quantity, value }) }
    }
}

/// A failure confined to one unit of work.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum UnitError {
    /// Inputs were missing or malformed.
    #[error(transparent)]
    Data(#[from] DataError),

    /// A numeric domain violation.
    #[error(transparent)]
    Computation(#[from] ComputationError),

    /// The company's segment failed in market simulation.
    #[error("segment {segment} failed: {reason}")]
    SegmentFailed {
        /// The failed segment.
        segment: Segment,
        /// Why it failed.
        reason: String,
    },

    /// The turn deadline passed before the unit finished.
    #[error("turn deadline exceeded before completion")]
    DeadlineExceeded,

    /// The unit's worker panicked.
    #[error("worker panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// Turn-scope failures returned from `process_weekly_turn`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration rejected before any stage ran.
    #[error("configuration error: {source}")]
    Configuration {
        /// The underlying configuration error.
        #[from]
        source: ConfigurationError,
    },

    /// Another run already owns the turn.
    #[error("{turn} is already being processed")]
    TurnInProgress {
        /// The busy turn.
        turn: TurnId,
    },
}
