//! Extension points invoked at stage boundaries.
//!
//! Plugins see read-only views of a stage's outputs and may return side data
//! keyed by company. They cannot alter results or stop the pipeline: errors
//! and panics are caught and reported as failures alongside the side data.
//!
//! The enabled set is resolved per turn from [`GameState::plugins`] through
//! [`PluginRegistry::for_turn`] and dropped when the turn finishes. The engine
//! runs each hook through [`TurnPlugins::invoke_bounded`], so a plugin that
//! stalls costs at most one time limit and is not called again that turn.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

use crate::aggregator::{CapitalStatus, CompanyTurnResult};
use crate::config::GameState;
use crate::market::SegmentOutcome;
use crate::operations::OperationsResult;
use crate::types::{CompanyId, Segment, TurnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hook {
    /// Every segment has resolved or failed.
    MarketResolved,
    /// Every company's operations and investment have resolved or failed.
    OperationsResolved,
    /// Every company's result has been committed or failed.
    ResultsCommitted,
    TurnCompleted,
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hook::MarketResolved => "market_resolved",
            Hook::OperationsResolved => "operations_resolved",
            Hook::ResultsCommitted => "results_committed",
            Hook::TurnCompleted => "turn_completed",
        };
        f.write_str(name)
    }
}

/// Read view handed to plugins. Maps hold what exists at the hook; later
/// stages' maps are empty at earlier hooks.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub hook: Hook,
    pub turn: TurnId,
    pub game: &'a GameState,
    pub segments: &'a BTreeMap<Segment, SegmentOutcome>,
    pub operations: &'a BTreeMap<CompanyId, OperationsResult>,
    pub results: &'a BTreeMap<CompanyId, CompanyTurnResult>,
    pub failed: &'a BTreeSet<CompanyId>,
}

/// Owned copy of a hook's inputs, shared with plugin threads.
#[derive(Debug, Clone)]
pub struct HookView {
    pub hook: Hook,
    pub turn: TurnId,
    pub game: GameState,
    pub segments: BTreeMap<Segment, SegmentOutcome>,
    pub operations: BTreeMap<CompanyId, OperationsResult>,
    pub results: BTreeMap<CompanyId, CompanyTurnResult>,
    pub failed: BTreeSet<CompanyId>,
}

impl HookView {
    pub fn context(&self) -> HookContext<'_> {
        HookContext {
            hook: self.hook,
            turn: self.turn,
            game: &self.game,
            segments: &self.segments,
            operations: &self.operations,
            results: &self.results,
            failed: &self.failed,
        }
    }
}

/// Supplementary data produced by a plugin. Never feeds back into the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SideEffect {
    pub plugin: String,
    pub hook: Hook,
    /// `None` for market-wide data.
    pub company: Option<CompanyId>,
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PluginError {
    /// The plugin reported a failure.
    #[error("{message}")]
    Failed {
        /// Plugin-supplied description.
        message: String,
    },

    /// The plugin's configured parameters did not parse.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// Parser description.
        message: String,
    },

    /// The plugin panicked.
    #[error("panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },

    /// The plugin was still running when the hook's time limit ran out.
    #[error("no response within {after_ms}ms")]
    TimedOut {
        /// The limit that was applied.
        after_ms: u64,
    },
}

pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn on_hook(&self, ctx: &HookContext<'_>, params: &serde_json::Value) -> Result<Vec<SideEffect>, PluginError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginFailure {
    pub plugin: String,
    pub hook: Hook,
    pub error: PluginError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HookReport {
    pub side_effects: Vec<SideEffect>,
    pub failures: Vec<PluginFailure>,
}

/// What the engine consumes: an enable gate and a hook dispatcher that never fails.
pub trait PluginManager {
    fn is_enabled(&self, plugin: &str) -> bool;

    fn invoke_hook(&self, ctx: &HookContext<'_>) -> HookReport;
}

/// Registered plugins plus their default enablement. Built once and handed to the engine.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<(Arc<dyn Plugin>, bool)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `solvency_watch` and `market_concentration`, both on by default.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SolvencyWatch), true);
        registry.register(Arc::new(MarketConcentration), true);
        registry
    }

    /// A later registration under the same name replaces the earlier one.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>, enabled_by_default: bool) {
        self.plugins.retain(|(p, _)| p.name() != plugin.name());
        self.plugins.push((plugin, enabled_by_default));
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|(p, _)| p.name()).collect()
    }

    /// Resolve the enabled set for one turn. Game-state settings override defaults.
    pub fn for_turn(&self, game: &GameState) -> TurnPlugins {
        let mut active = Vec::new();
        let mut enabled = BTreeSet::new();
        for (plugin, default) in &self.plugins {
            let name = plugin.name();
            if game.plugin_enabled(name).unwrap_or(*default) {
                let params = game.plugins.get(name).map(|s| s.params.clone()).unwrap_or_default();
                enabled.insert(name.to_string());
                active.push((Arc::clone(plugin), params));
            }
        }
        TurnPlugins { active, enabled, stalled: BTreeSet::new() }
    }
}

/// The plugin set for a single turn run.
pub struct TurnPlugins {
    active: Vec<(Arc<dyn Plugin>, serde_json::Value)>,
    enabled: BTreeSet<String>,
    /// Timed out earlier this turn; skipped from then on.
    stalled: BTreeSet<String>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

pub(crate) fn describe_panic(payload: Box<dyn std::any::Any + Send>) -> String {
    panic_message(payload.as_ref())
}

fn run_plugin(
    plugin: &dyn Plugin,
    ctx: &HookContext<'_>,
    params: &serde_json::Value,
) -> Result<Vec<SideEffect>, PluginError> {
    catch_unwind(AssertUnwindSafe(|| plugin.on_hook(ctx, params)))
        .unwrap_or_else(|payload| Err(PluginError::Panicked { message: describe_panic(payload) }))
}

fn record(report: &mut HookReport, plugin: String, hook: Hook, outcome: Result<Vec<SideEffect>, PluginError>) {
    match outcome {
        Ok(effects) => report.side_effects.extend(effects),
        Err(error) => {
            warn!(%plugin, %hook, %error, "plugin hook failed");
            report.failures.push(PluginFailure { plugin, hook, error });
        }
    }
}

impl TurnPlugins {
    pub fn is_stalled(&self, plugin: &str) -> bool {
        self.stalled.contains(plugin)
    }

    /// Run each enabled plugin on its own thread and wait at most `limit` for
    /// all of them. Plugins still running at the limit are reported as
    /// [`PluginError::TimedOut`] and left to finish detached. Reports keep
    /// registration order whatever order the threads finish in.
    pub fn invoke_bounded(&mut self, view: Arc<HookView>, limit: Duration) -> HookReport {
        let hook = view.hook;
        let (tx, rx) = mpsc::channel();
        let mut pending = BTreeSet::new();
        let mut outcomes = BTreeMap::new();

        for (index, (plugin, params)) in self.active.iter().enumerate() {
            if !self.is_enabled(plugin.name()) || self.is_stalled(plugin.name()) {
                continue;
            }
            let (plugin, params, view, tx) = (Arc::clone(plugin), params.clone(), Arc::clone(&view), tx.clone());
            let spawned = thread::Builder::new().name(format!("turnsim-plugin-{index}")).spawn(move || {
                // The receiver is gone once the limit has passed.
                let _ = tx.send((index, run_plugin(plugin.as_ref(), &view.context(), &params)));
            });
            match spawned {
                Ok(_) => {
                    pending.insert(index);
                }
                Err(e) => {
                    let message = format!("hook thread not started: {e}");
                    outcomes.insert(index, Err(PluginError::Failed { message }));
                }
            }
        }
        drop(tx);

        let started = Instant::now();
        while !pending.is_empty() {
            match rx.recv_timeout(limit.saturating_sub(started.elapsed())) {
                Ok((index, outcome)) => {
                    pending.remove(&index);
                    outcomes.insert(index, outcome);
                }
                Err(_) => break,
            }
        }
        let after_ms = limit.as_millis() as u64;
        for index in pending {
            outcomes.insert(index, Err(PluginError::TimedOut { after_ms }));
        }

        let mut report = HookReport::default();
        for (index, outcome) in outcomes {
            let Some((plugin, _)) = self.active.get(index) else {
                continue;
            };
            let name = plugin.name().to_string();
            if matches!(outcome, Err(PluginError::TimedOut { .. })) {
                self.stalled.insert(name.clone());
            }
            record(&mut report, name, hook, outcome);
        }
        report
    }
}

impl PluginManager for TurnPlugins {
    fn is_enabled(&self, plugin: &str) -> bool {
        self.enabled.contains(plugin)
    }

    fn invoke_hook(&self, ctx: &HookContext<'_>) -> HookReport {
        let mut report = HookReport::default();
        for (plugin, params) in &self.active {
            if !self.is_enabled(plugin.name()) {
                continue;
            }
            record(&mut report, plugin.name().to_string(), ctx.hook, run_plugin(plugin.as_ref(), ctx, params));
        }
        report
    }
}

fn parse_params<T: DeserializeOwned + Default>(params: &serde_json::Value) -> Result<T, PluginError> {
    if params.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(params.clone()).map_err(|e| PluginError::InvalidParams { message: e.to_string() })
}

// ── solvency_watch ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SolvencyWatchParams {
    /// Defaults to the game's capital watch threshold.
    threshold: Option<f64>,
}

/// Flags every company whose committed solvency ratio is under a threshold.
#[derive(Debug, Default, Clone, Copy)]
pub struct SolvencyWatch;

impl Plugin for SolvencyWatch {
    fn name(&self) -> &str {
        "solvency_watch"
    }

    fn on_hook(&self, ctx: &HookContext<'_>, params: &serde_json::Value) -> Result<Vec<SideEffect>, PluginError> {
        if ctx.hook != Hook::ResultsCommitted {
            return Ok(vec![]);
        }
        let params: SolvencyWatchParams = parse_params(params)?;
        let threshold = params.threshold.unwrap_or(ctx.game.capital.watch_threshold);
        Ok(ctx
            .results
            .values()
            .filter(|r| r.solvency_ratio < threshold || r.capital_status == CapitalStatus::Insolvent)
            .map(|r| SideEffect {
                plugin: self.name().to_string(),
                hook: ctx.hook,
                company: Some(r.company),
                key: "solvency_alert".to_string(),
                value: json!({
                    "solvency_ratio": r.solvency_ratio,
                    "ending_capital": r.ending_capital,
                    "status": r.capital_status,
                    "threshold": threshold,
                }),
            })
            .collect())
    }
}

// ── market_concentration ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ConcentrationParams {
    /// HHI above which a segment is reported as concentrated.
    alert_above: f64,
}

impl Default for ConcentrationParams {
    fn default() -> Self {
        ConcentrationParams { alert_above: 0.25 }
    }
}

/// Reports the HHI of every resolved segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct MarketConcentration;

impl Plugin for MarketConcentration {
    fn name(&self) -> &str {
        "market_concentration"
    }

    fn on_hook(&self, ctx: &HookContext<'_>, params: &serde_json::Value) -> Result<Vec<SideEffect>, PluginError> {
        if ctx.hook != Hook::MarketResolved {
            return Ok(vec![]);
        }
        let params: ConcentrationParams = parse_params(params)?;
        Ok(ctx
            .segments
            .values()
            .map(|s| SideEffect {
                plugin: self.name().to_string(),
                hook: ctx.hook,
                company: None,
                key: format!("hhi:{}", s.segment),
                value: json!({
                    "hhi": s.concentration,
                    "competitors": s.results.len(),
                    "concentrated": s.concentration > params.alert_above,
                }),
            })
            .collect())
    }
}
