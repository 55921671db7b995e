//! Weekly turn processing for a turn-based insurance market simulation.
//!
//! [`engine::WeeklySimulationEngine`] runs one turn through market, operations
//! and aggregation stages for every company, committing one result per
//! company to a [`persistence::Persistence`] store.

pub mod aggregator;
pub mod analysis;
pub mod config;
pub mod demand;
pub mod engine;
pub mod error;
pub mod events;
pub mod investment;
pub mod market;
pub mod operations;
pub mod perils;
pub mod persistence;
pub mod plugins;
pub mod random;
pub mod types;
