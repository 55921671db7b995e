use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompanyId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TurnId(pub u64);

impl fmt::Display for CompanyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "company-{}", self.0)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// A market unit: one state × one line of business.
/// Segments are derived keys, never stored on their own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub state: String,
    pub line: String,
}

impl Segment {
    pub fn new(state: impl Into<String>, line: impl Into<String>) -> Self {
        Segment { state: state.into(), line: line.into() }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.state, self.line)
    }
}

/// Pipeline position of a turn. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    MarketSimulating,
    OperationsSimulating,
    Aggregating,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Completed | TurnStatus::Failed)
    }

    /// True while an engine run owns the turn.
    pub fn is_processing(self) -> bool {
        matches!(
            self,
            TurnStatus::MarketSimulating | TurnStatus::OperationsSimulating | TurnStatus::Aggregating
        )
    }
}

/// The stages a unit of work passes through. `Loading` covers the reads that
/// precede market simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Loading,
    Market,
    Operations,
    Aggregation,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Loading => "loading",
            Stage::Market => "market",
            Stage::Operations => "operations",
            Stage::Aggregation => "aggregation",
        };
        f.write_str(name)
    }
}

/// One weekly processing cycle. Created by an external scheduler; the engine
/// is the only writer of `status` while it processes the turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub sequence: u64,
    pub starts_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: TurnStatus,
}

impl Turn {
    /// A pending turn whose deadline is `window` after `starts_at`.
    pub fn pending(sequence: u64, starts_at: DateTime<Utc>, window: chrono::Duration) -> Self {
        Turn {
            id: TurnId(sequence),
            sequence,
            starts_at,
            deadline: starts_at + window,
            status: TurnStatus::Pending,
        }
    }
}
