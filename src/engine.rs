//! Weekly turn orchestration.
//!
//! One coordinator (the thread calling [`WeeklySimulationEngine::process_weekly_turn`])
//! owns the turn: it alone updates [`Turn::status`], emits events and invokes
//! plugin hooks. Units of work run on a rayon pool sized by
//! [`EngineConfig::worker_limit`] and report back over a channel:
//!
//! * loading: one unit per company, reading its decisions and prior state
//! * market: one unit per segment that received at least one pricing decision
//! * operations: one unit per company, dispatched the moment its last segment resolves
//! * aggregation: one unit per company, dispatched the moment its operations resolve
//!
//! Unit failures are recorded against the company (or every company in a
//! failed segment) and never stop unrelated units. Companies that already
//! hold a committed result for the turn are skipped, but their decisions still
//! take part in market simulation so a resumed run reproduces the same shares.
//!
//! At the deadline the coordinator raises a cancel flag that queued units
//! check before doing any work, then waits for aggregation units already
//! writing so the outcome lists exactly the companies the store holds.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::aggregator::{AggregationInputs, CompanyTurnResult, ResultsAggregator, TurnSummary};
use crate::config::{EngineConfig, GameState};
use crate::demand::{DemandFunction, DemandModel};
use crate::error::{ConfigurationError, EngineError, UnitError};
use crate::events::{Event, EventKind, EventSink};
use crate::investment::{InvestmentResult, InvestmentSimulator, PlaceholderReturns, PortfolioProfile, ReturnModel};
use crate::market::{MarketResult, MarketSimulator, PricingDecision, SegmentOutcome};
use crate::operations::{OperationsResult, OperationsSimulator};
use crate::perils::{CatastropheHit, ClaimsModel, PlaceholderClaims};
use crate::persistence::{CompanyDecisions, Persistence};
use crate::plugins::{Hook, HookView, PluginRegistry, SideEffect, TurnPlugins, describe_panic};
use crate::random::{StreamKind, TurnSeed};
use crate::types::{CompanyId, Segment, Stage, Turn, TurnId, TurnStatus};

#[derive(Debug, Clone, PartialEq)]
pub struct CompanyFailure {
    pub company: CompanyId,
    pub stage: Stage,
    pub reason: UnitError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFailure {
    pub segment: Segment,
    pub companies: Vec<CompanyId>,
    pub reason: UnitError,
}

/// Why a run stopped before every unit finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnHalt {
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub turn: TurnId,
    pub status: TurnStatus,
    /// Committed by this run.
    pub completed_companies: Vec<CompanyId>,
    /// Already committed by an earlier run.
    pub skipped_companies: Vec<CompanyId>,
    pub failed_companies: Vec<CompanyFailure>,
    pub failed_segments: Vec<SegmentFailure>,
    /// Every segment resolved in this run, including those priced only by skipped companies.
    pub segments: BTreeMap<Segment, SegmentOutcome>,
    pub duration: Duration,
    pub summary: TurnSummary,
    pub side_effects: Vec<SideEffect>,
    pub halt: Option<TurnHalt>,
}

impl TurnOutcome {
    pub fn failed_ids(&self) -> BTreeSet<CompanyId> {
        self.failed_companies.iter().map(|f| f.company).collect()
    }
}

/// Builds a turn's claims model from its game state.
pub type ClaimsFactory = Box<dyn Fn(&GameState) -> Box<dyn ClaimsModel> + Send + Sync>;

/// Builds a turn's investment return model from its game state.
pub type ReturnsFactory = Box<dyn Fn(&GameState) -> Box<dyn ReturnModel> + Send + Sync>;

pub struct WeeklySimulationEngine {
    config: EngineConfig,
    demand_model: DemandModel,
    pool: rayon::ThreadPool,
    store: Arc<dyn Persistence>,
    plugins: PluginRegistry,
    events: Arc<dyn EventSink>,
    claims: ClaimsFactory,
    returns: ReturnsFactory,
    active: Mutex<BTreeSet<TurnId>>,
}

impl WeeklySimulationEngine {
    /// Resolves the demand model and builds the worker pool; both fail fast.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Persistence>,
        plugins: PluginRegistry,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ConfigurationError> {
        let demand_model = DemandModel::from_selector(&config.demand_model)?;
        if config.worker_limit == 0 {
            return Err(ConfigurationError::InvalidParameter {
                field: "worker_limit",
                expected: "at least 1",
                value: 0.0,
            });
        }
        if config.hook_timeout.is_zero() {
            return Err(ConfigurationError::InvalidParameter {
                field: "hook_timeout",
                expected: "greater than zero",
                value: 0.0,
            });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.worker_limit)
            .thread_name(|i| format!("turnsim-worker-{i}"))
            .build()
            .map_err(|e| ConfigurationError::WorkerPool { message: e.to_string() })?;
        Ok(WeeklySimulationEngine {
            config,
            demand_model,
            pool,
            store,
            plugins,
            events,
            claims: Box::new(|game: &GameState| -> Box<dyn ClaimsModel> {
                Box::new(PlaceholderClaims::new(&game.catastrophe, &game.claims))
            }),
            returns: Box::new(|game: &GameState| -> Box<dyn ReturnModel> {
                Box::new(PlaceholderReturns::new(&game.investment))
            }),
            active: Mutex::new(BTreeSet::new()),
        })
    }

    /// Replace the placeholder catastrophe and claims-noise model.
    pub fn with_claims_model<F>(mut self, factory: F) -> Self
    where
        F: Fn(&GameState) -> Box<dyn ClaimsModel> + Send + Sync + 'static,
    {
        self.claims = Box::new(factory);
        self
    }

    /// Replace the placeholder investment return model.
    pub fn with_return_model<F>(mut self, factory: F) -> Self
    where
        F: Fn(&GameState) -> Box<dyn ReturnModel> + Send + Sync + 'static,
    {
        self.returns = Box::new(factory);
        self
    }

    pub fn demand_model(&self) -> DemandModel {
        self.demand_model
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Run one turn to completion or to its deadline.
    ///
    /// Returns `Err` only when the run could not start: invalid configuration
    /// or a turn already being processed. Deadline expiry is reported through
    /// [`TurnOutcome::halt`] with status `Failed`; committed results stay and a
    /// later call resumes from them.
    pub fn process_weekly_turn(&self, turn: &mut Turn, game: &GameState) -> Result<TurnOutcome, EngineError> {
        if turn.status.is_processing() {
            return Err(EngineError::TurnInProgress { turn: turn.id });
        }
        let _claim = self.claim(turn.id)?;
        let shared = Arc::new(self.prepare(turn, game)?);

        let started = Instant::now();
        let until_deadline = (turn.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let deadline = started + self.config.turn_budget.min(until_deadline);

        info!(
            turn = %turn.id,
            companies = game.companies.len(),
            segments = game.segments.len(),
            model = self.demand_model.selector(),
            workers = self.config.worker_limit,
            "turn started"
        );
        turn.status = TurnStatus::MarketSimulating;

        let (tx, rx) = mpsc::channel();
        let mut run = TurnRun::new(self, shared, turn, tx, deadline);
        run.start();
        let expired = run.drive(&rx);
        Ok(run.finish(started, expired))
    }

    fn claim(&self, turn: TurnId) -> Result<TurnClaim<'_>, EngineError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !active.insert(turn) {
            return Err(EngineError::TurnInProgress { turn });
        }
        Ok(TurnClaim { engine: self, turn })
    }

    fn prepare(&self, turn: &Turn, game: &GameState) -> Result<Shared, ConfigurationError> {
        game.validate()?;
        let demand = game
            .segments
            .iter()
            .map(|p| self.demand_model.bind(p).map(|f| (p.segment.clone(), f)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        Ok(Shared {
            turn: turn.id,
            seed: TurnSeed::derive(game.seed, turn.sequence),
            demand,
            claims: (self.claims)(game),
            returns: (self.returns)(game),
            aggregator: ResultsAggregator::new(&game.capital)?,
            game: game.clone(),
            store: Arc::clone(&self.store),
            cancelled: AtomicBool::new(false),
        })
    }
}

/// Marks a turn as owned by a run; released on drop.
struct TurnClaim<'a> {
    engine: &'a WeeklySimulationEngine,
    turn: TurnId,
}

impl Drop for TurnClaim<'_> {
    fn drop(&mut self) {
        self.engine.active.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.turn);
    }
}

/// Read-only turn inputs shared with workers.
struct Shared {
    turn: TurnId,
    seed: TurnSeed,
    game: GameState,
    demand: BTreeMap<Segment, Box<dyn DemandFunction>>,
    claims: Box<dyn ClaimsModel>,
    returns: Box<dyn ReturnModel>,
    aggregator: ResultsAggregator,
    store: Arc<dyn Persistence>,
    /// Set at the deadline; units check it before starting work.
    cancelled: AtomicBool,
}

impl Shared {
    fn live(&self) -> Result<(), UnitError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(UnitError::DeadlineExceeded);
        }
        Ok(())
    }
}

enum Completion {
    Loaded {
        company: CompanyId,
        outcome: Result<Loaded, UnitError>,
    },
    Segment {
        segment: Segment,
        outcome: Result<(SegmentOutcome, Option<CatastropheHit>), UnitError>,
    },
    Operations {
        company: CompanyId,
        outcome: Result<(OperationsResult, InvestmentResult), UnitError>,
    },
    Committed {
        company: CompanyId,
        outcome: Result<CompanyTurnResult, UnitError>,
    },
}

enum Loaded {
    /// Committed earlier. Decisions are kept for market simulation when readable.
    Committed(Option<CompanyDecisions>),
    Ready { decisions: CompanyDecisions, prior: CompanyTurnResult },
}

fn load_company(shared: &Shared, company: CompanyId) -> Result<Loaded, UnitError> {
    shared.live()?;
    let store = shared.store.as_ref();
    let committed = store
        .has_result(shared.turn, company)
        .map_err(|e| e.into_data_error(company))?;
    let decisions = store
        .get_decisions(shared.turn, company)
        .map_err(|e| e.into_data_error(company))
        .and_then(|d| d.validate(company, &shared.game).map(|()| d));
    if committed {
        return Ok(Loaded::Committed(decisions.ok()));
    }
    let decisions = decisions?;
    let prior = store
        .get_company_state(company, shared.turn)
        .map_err(|e| e.into_data_error(company))?;
    Ok(Loaded::Ready { decisions, prior })
}

fn simulate_segment(
    shared: &Shared,
    segment: &Segment,
    decisions: &BTreeMap<CompanyId, PricingDecision>,
) -> Result<(SegmentOutcome, Option<CatastropheHit>), UnitError> {
    let params = shared.game.segment_params(segment);
    let demand = shared.demand.get(segment);
    shared.live()?;
    let (Some(params), Some(demand)) = (params, demand) else {
        return Err(UnitError::SegmentFailed { segment: segment.clone(), reason: "segment not configured".into() });
    };
    let mut rng = shared.seed.segment_stream(StreamKind::Catastrophe, segment);
    let hit = shared.claims.draw_catastrophe(segment, &mut rng);
    let outcome = MarketSimulator::new(params, &shared.game.tiers, demand.as_ref()).simulate(decisions)?;
    Ok((outcome, hit))
}

fn simulate_company(
    shared: &Shared,
    company: CompanyId,
    market: &[MarketResult],
    catastrophes: &BTreeMap<Segment, CatastropheHit>,
    portfolio: &PortfolioProfile,
    capital: f64,
) -> Result<(OperationsResult, InvestmentResult), UnitError> {
    shared.live()?;
    let mut claims_rng = shared.seed.company_stream(StreamKind::Claims, company);
    let operations = OperationsSimulator::new(&shared.game, shared.claims.as_ref()).simulate(
        company,
        market,
        catastrophes,
        &mut claims_rng,
    )?;
    let mut investment_rng = shared.seed.company_stream(StreamKind::Investment, company);
    let investment =
        InvestmentSimulator::new(shared.returns.as_ref()).simulate(company, capital, portfolio, &mut investment_rng)?;
    Ok((operations, investment))
}

fn commit_company(
    shared: &Shared,
    company: CompanyId,
    inputs: AggregationInputs,
) -> Result<CompanyTurnResult, UnitError> {
    shared.live()?;
    shared.aggregator.commit(shared.store.as_ref(), company, shared.turn, inputs)
}

fn guarded<T>(unit: impl FnOnce() -> Result<T, UnitError>) -> Result<T, UnitError> {
    catch_unwind(AssertUnwindSafe(unit))
        .unwrap_or_else(|payload| Err(UnitError::Panicked { message: describe_panic(payload) }))
}

/// Coordinator-side state for one company.
struct Progress {
    decisions: CompanyDecisions,
    prior: CompanyTurnResult,
    stage: Stage,
    pending_segments: usize,
    market: Vec<MarketResult>,
    catastrophes: BTreeMap<Segment, CatastropheHit>,
    operations: Option<OperationsResult>,
    investment: Option<InvestmentResult>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    started: bool,
    completed: bool,
    in_flight: usize,
    succeeded: usize,
    failed: usize,
}

struct TurnRun<'a> {
    engine: &'a WeeklySimulationEngine,
    shared: Arc<Shared>,
    turn: &'a mut Turn,
    plugins: TurnPlugins,
    tx: Sender<Completion>,
    deadline: Instant,
    /// Every company in the turn, deduplicated and ordered.
    roster: Vec<CompanyId>,
    companies: BTreeMap<CompanyId, Progress>,
    pricing: BTreeMap<Segment, BTreeMap<CompanyId, PricingDecision>>,
    members: BTreeMap<Segment, Vec<CompanyId>>,
    skipped: Vec<CompanyId>,
    completed: Vec<CompanyId>,
    failures: BTreeMap<CompanyId, CompanyFailure>,
    failed_segments: Vec<SegmentFailure>,
    segments: BTreeMap<Segment, SegmentOutcome>,
    operations: BTreeMap<CompanyId, OperationsResult>,
    results: BTreeMap<CompanyId, CompanyTurnResult>,
    catastrophes: Vec<Segment>,
    tally: BTreeMap<Stage, Tally>,
    side_effects: Vec<SideEffect>,
}

impl<'a> TurnRun<'a> {
    fn new(
        engine: &'a WeeklySimulationEngine,
        shared: Arc<Shared>,
        turn: &'a mut Turn,
        tx: Sender<Completion>,
        deadline: Instant,
    ) -> Self {
        let plugins = engine.plugins.for_turn(&shared.game);
        let roster: Vec<CompanyId> =
            shared.game.companies.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        TurnRun {
            engine,
            shared,
            turn,
            plugins,
            tx,
            deadline,
            roster,
            companies: BTreeMap::new(),
            pricing: BTreeMap::new(),
            members: BTreeMap::new(),
            skipped: Vec::new(),
            completed: Vec::new(),
            failures: BTreeMap::new(),
            failed_segments: Vec::new(),
            segments: BTreeMap::new(),
            operations: BTreeMap::new(),
            results: BTreeMap::new(),
            catastrophes: Vec::new(),
            tally: BTreeMap::new(),
            side_effects: Vec::new(),
        }
    }

    fn emit(&self, kind: EventKind) {
        self.engine.events.emit(Event::now(self.shared.turn, kind));
    }

    fn tally(&self, stage: Stage) -> Tally {
        self.tally.get(&stage).copied().unwrap_or_default()
    }

    fn start_stage(&mut self, stage: Stage) {
        let tally = self.tally.entry(stage).or_default();
        if !tally.started {
            tally.started = true;
            debug!(turn = %self.shared.turn, %stage, "stage started");
            self.emit(EventKind::StageStarted { stage });
        }
    }

    fn complete_stage(&mut self, stage: Stage) {
        self.start_stage(stage);
        let tally = self.tally.entry(stage).or_default();
        tally.completed = true;
        let (succeeded, failed) = (tally.succeeded, tally.failed);
        debug!(turn = %self.shared.turn, %stage, succeeded, failed, "stage completed");
        self.emit(EventKind::StageCompleted { stage, succeeded, failed });
    }

    fn begin_unit(&mut self, stage: Stage) {
        self.start_stage(stage);
        self.tally.entry(stage).or_default().in_flight += 1;
    }

    fn finish_unit(&mut self, stage: Stage, ok: bool) {
        let tally = self.tally.entry(stage).or_default();
        tally.in_flight = tally.in_flight.saturating_sub(1);
        if ok {
            tally.succeeded += 1;
        } else {
            tally.failed += 1;
        }
    }

    fn fail(&mut self, company: CompanyId, stage: Stage, reason: UnitError) {
        if self.failures.contains_key(&company) {
            return;
        }
        debug!(turn = %self.shared.turn, %company, %stage, %reason, "company failed");
        self.emit(EventKind::CompanyFailed { company, stage, reason: reason.to_string() });
        self.failures.insert(company, CompanyFailure { company, stage, reason });
    }

    /// Plugins get at most `hook_timeout`, and never more than the turn has left.
    fn invoke(&mut self, hook: Hook) {
        let view = Arc::new(HookView {
            hook,
            turn: self.shared.turn,
            game: self.shared.game.clone(),
            segments: self.segments.clone(),
            operations: self.operations.clone(),
            results: self.results.clone(),
            failed: self.failures.keys().copied().collect(),
        });
        let limit = self.engine.config.hook_timeout.min(self.deadline.saturating_duration_since(Instant::now()));
        let report = self.plugins.invoke_bounded(view, limit);
        for failure in report.failures {
            self.emit(EventKind::PluginFailed {
                plugin: failure.plugin,
                hook: failure.hook,
                reason: failure.error.to_string(),
            });
        }
        self.side_effects.extend(report.side_effects);
    }

    // ── loading ────────────────────────────────────────────────────────────────

    /// Announce the turn and dispatch one load unit per company. Nothing is
    /// dispatched once the deadline has passed; `drive` then expires the run.
    fn start(&mut self) {
        self.emit(EventKind::TurnStarted { companies: self.roster.len(), segments: self.shared.game.segments.len() });
        self.start_stage(Stage::Loading);
        if Instant::now() >= self.deadline {
            return;
        }
        for company in self.roster.clone() {
            self.begin_unit(Stage::Loading);
            self.spawn(move |shared| {
                let outcome = guarded(|| load_company(shared, company));
                Completion::Loaded { company, outcome }
            });
        }
        self.advance();
    }

    fn loaded(&mut self, company: CompanyId, loaded: Loaded) {
        match loaded {
            Loaded::Committed(decisions) => {
                self.skipped.push(company);
                self.emit(EventKind::CompanySkipped { company });
                if let Some(decisions) = decisions {
                    self.add_pricing(company, &decisions, false);
                }
            }
            Loaded::Ready { decisions, prior } => {
                self.add_pricing(company, &decisions, true);
                let pending_segments = decisions.pricing.len();
                self.companies.insert(
                    company,
                    Progress {
                        decisions,
                        prior,
                        stage: Stage::Market,
                        pending_segments,
                        market: Vec::new(),
                        catastrophes: BTreeMap::new(),
                        operations: None,
                        investment: None,
                    },
                );
            }
        }
    }

    fn add_pricing(&mut self, company: CompanyId, decisions: &CompanyDecisions, tracked: bool) {
        for d in &decisions.pricing {
            self.pricing.entry(d.segment.clone()).or_default().insert(company, d.clone());
            if tracked {
                self.members.entry(d.segment.clone()).or_default().push(company);
            }
        }
    }

    // ── dispatch ───────────────────────────────────────────────────────────────

    fn spawn(&self, job: impl FnOnce(&Shared) -> Completion + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        self.engine.pool.spawn(move || {
            // The receiver is gone once the coordinator has returned.
            let _ = tx.send(job(shared.as_ref()));
        });
    }

    fn dispatch_market(&mut self) {
        for (segment, decisions) in std::mem::take(&mut self.pricing) {
            self.begin_unit(Stage::Market);
            self.spawn(move |shared| {
                let outcome = guarded(|| simulate_segment(shared, &segment, &decisions));
                Completion::Segment { segment, outcome }
            });
        }
        let unpriced: Vec<CompanyId> =
            self.companies.iter().filter(|(_, p)| p.pending_segments == 0).map(|(&c, _)| c).collect();
        for company in unpriced {
            self.dispatch_operations(company);
        }
    }

    fn dispatch_operations(&mut self, company: CompanyId) {
        let Some(p) = self.companies.get_mut(&company) else {
            return;
        };
        p.stage = Stage::Operations;
        p.market.sort_by(|a, b| a.segment.cmp(&b.segment));
        let market = p.market.clone();
        let catastrophes = p.catastrophes.clone();
        let portfolio = p.decisions.portfolio.clone();
        let capital = p.prior.ending_capital;

        self.begin_unit(Stage::Operations);
        self.spawn(move |shared| {
            let outcome = guarded(|| simulate_company(shared, company, &market, &catastrophes, &portfolio, capital));
            Completion::Operations { company, outcome }
        });
    }

    fn dispatch_commit(&mut self, company: CompanyId) {
        let Some(p) = self.companies.get_mut(&company) else {
            return;
        };
        p.stage = Stage::Aggregation;
        let inputs = AggregationInputs {
            market: Some(p.market.clone()),
            operations: p.operations.take(),
            investment: p.investment.take(),
            prior: Some(p.prior.clone()),
            withdrawals: p.decisions.withdrawals,
            expansion_spend: p.decisions.expansion_spend,
        };

        self.begin_unit(Stage::Aggregation);
        self.spawn(move |shared| {
            let outcome = guarded(|| commit_company(shared, company, inputs));
            Completion::Committed { company, outcome }
        });
    }

    // ── completions ────────────────────────────────────────────────────────────

    fn handle(&mut self, completion: Completion) {
        match completion {
            Completion::Loaded { company, outcome: Ok(loaded) } => {
                self.finish_unit(Stage::Loading, true);
                self.loaded(company, loaded);
            }
            Completion::Loaded { company, outcome: Err(reason) } => {
                self.finish_unit(Stage::Loading, false);
                self.fail(company, Stage::Loading, reason);
            }
            Completion::Segment { segment, outcome: Ok((outcome, hit)) } => {
                self.finish_unit(Stage::Market, true);
                if hit.is_some() {
                    self.catastrophes.push(segment.clone());
                }
                let mut ready = Vec::new();
                for company in self.members.remove(&segment).unwrap_or_default() {
                    let Some(p) = self.companies.get_mut(&company) else {
                        continue;
                    };
                    if let Some(result) = outcome.results.get(&company) {
                        p.market.push(result.clone());
                    }
                    if let Some(hit) = &hit {
                        p.catastrophes.insert(segment.clone(), hit.clone());
                    }
                    p.pending_segments = p.pending_segments.saturating_sub(1);
                    if p.pending_segments == 0 && !self.failures.contains_key(&company) {
                        ready.push(company);
                    }
                }
                self.segments.insert(segment, outcome);
                for company in ready {
                    self.dispatch_operations(company);
                }
            }
            Completion::Segment { segment, outcome: Err(reason) } => {
                self.finish_unit(Stage::Market, false);
                let companies = self.members.remove(&segment).unwrap_or_default();
                warn!(turn = %self.shared.turn, %segment, %reason, companies = companies.len(), "segment failed");
                self.emit(EventKind::SegmentFailed {
                    segment: segment.clone(),
                    companies: companies.clone(),
                    reason: reason.to_string(),
                });
                for &company in &companies {
                    if let Some(p) = self.companies.get_mut(&company) {
                        p.pending_segments = p.pending_segments.saturating_sub(1);
                    }
                    let cause = UnitError::SegmentFailed { segment: segment.clone(), reason: reason.to_string() };
                    self.fail(company, Stage::Market, cause);
                }
                self.failed_segments.push(SegmentFailure { segment, companies, reason });
            }
            Completion::Operations { company, outcome: Ok((operations, investment)) } => {
                self.finish_unit(Stage::Operations, true);
                self.operations.insert(company, operations.clone());
                if let Some(p) = self.companies.get_mut(&company) {
                    p.operations = Some(operations);
                    p.investment = Some(investment);
                }
                self.dispatch_commit(company);
            }
            Completion::Operations { company, outcome: Err(reason) } => {
                self.finish_unit(Stage::Operations, false);
                self.fail(company, Stage::Operations, reason);
            }
            Completion::Committed { company, outcome: Ok(result) } => {
                self.finish_unit(Stage::Aggregation, true);
                self.completed.push(company);
                self.results.insert(company, result);
            }
            Completion::Committed { company, outcome: Err(reason) } => {
                self.finish_unit(Stage::Aggregation, false);
                self.fail(company, Stage::Aggregation, reason);
            }
        }
    }

    /// Close every stage whose units have all finished, in pipeline order.
    /// Market units go out once the last company has loaded.
    fn advance(&mut self) {
        let loading = self.tally(Stage::Loading);
        if !loading.completed {
            if loading.in_flight > 0 {
                return;
            }
            self.complete_stage(Stage::Loading);
            self.skipped.sort();
            self.dispatch_market();
        }
        let pipeline = [
            (Stage::Market, Hook::MarketResolved, TurnStatus::OperationsSimulating),
            (Stage::Operations, Hook::OperationsResolved, TurnStatus::Aggregating),
            (Stage::Aggregation, Hook::ResultsCommitted, TurnStatus::Aggregating),
        ];
        for (stage, hook, next) in pipeline {
            let tally = self.tally(stage);
            if tally.completed {
                continue;
            }
            if tally.in_flight > 0 {
                return;
            }
            self.complete_stage(stage);
            self.invoke(hook);
            self.turn.status = next;
        }
    }

    fn finished(&self) -> bool {
        self.tally(Stage::Aggregation).completed
    }

    /// Wait for completions until every stage closes or the deadline passes.
    /// Returns `true` on expiry.
    fn drive(&mut self, rx: &Receiver<Completion>) -> bool {
        while !self.finished() {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.expire(rx);
                return true;
            }
            // `self.tx` keeps the channel open, so only a timeout ends the wait.
            match rx.recv_timeout(remaining) {
                Ok(completion) => {
                    self.handle(completion);
                    self.advance();
                }
                Err(_) => {
                    self.expire(rx);
                    return true;
                }
            }
        }
        false
    }

    /// Cancel queued units, settle writes already in progress, then fail
    /// every company left without a result.
    fn expire(&mut self, rx: &Receiver<Completion>) {
        self.shared.cancelled.store(true, Ordering::Release);
        // Every aggregation unit reports back, either with its write or with
        // `DeadlineExceeded` from the cancel check.
        while self.tally(Stage::Aggregation).in_flight > 0 {
            match rx.recv() {
                Ok(completion @ Completion::Committed { .. }) => self.handle(completion),
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let unfinished: Vec<(CompanyId, Stage)> = self
            .roster
            .iter()
            .filter(|&&c| {
                !self.results.contains_key(&c) && !self.failures.contains_key(&c) && !self.skipped.contains(&c)
            })
            .map(|&c| (c, self.companies.get(&c).map_or(Stage::Loading, |p| p.stage)))
            .collect();
        warn!(turn = %self.shared.turn, unfinished = unfinished.len(), "turn deadline exceeded");
        for (company, stage) in unfinished {
            self.fail(company, stage, UnitError::DeadlineExceeded);
        }
    }

    fn finish(mut self, started: Instant, expired: bool) -> TurnOutcome {
        let duration = started.elapsed();
        let turn = self.shared.turn;
        let halt = if expired {
            self.turn.status = TurnStatus::Failed;
            self.emit(EventKind::TurnFailed {
                completed: self.completed.len(),
                failed: self.failures.len(),
                reason: UnitError::DeadlineExceeded.to_string(),
            });
            Some(TurnHalt::DeadlineExceeded)
        } else {
            self.invoke(Hook::TurnCompleted);
            self.turn.status = TurnStatus::Completed;
            self.emit(EventKind::TurnCompleted {
                completed: self.completed.len(),
                skipped: self.skipped.len(),
                failed: self.failures.len(),
                duration_ms: duration.as_millis() as u64,
            });
            None
        };

        let next = TurnId(turn.0 + 1);
        let resumed: BTreeMap<CompanyId, CompanyTurnResult> = self
            .skipped
            .iter()
            .filter_map(|&c| self.shared.store.get_company_state(c, next).ok())
            .filter(|r| r.turn == turn)
            .map(|r| (r.company, r))
            .collect();
        let summary = TurnSummary::build(
            self.results.values().chain(resumed.values()),
            self.segments.values(),
            std::mem::take(&mut self.catastrophes),
        );

        info!(
            %turn,
            status = ?self.turn.status,
            completed = self.completed.len(),
            skipped = self.skipped.len(),
            failed = self.failures.len(),
            elapsed_ms = duration.as_millis() as u64,
            "turn finished"
        );

        let mut completed = self.completed;
        completed.sort();
        TurnOutcome {
            turn,
            status: self.turn.status,
            completed_companies: completed,
            skipped_companies: self.skipped,
            failed_companies: self.failures.into_values().collect(),
            failed_segments: self.failed_segments,
            segments: self.segments,
            duration,
            summary,
            side_effects: self.side_effects,
            halt,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use rand::RngCore;

    use super::*;
    use crate::error::DataError;
    use crate::events::EventLog;
    use crate::persistence::{InMemoryStore, PersistenceError};
    use crate::plugins::{HookContext, Plugin, PluginError};

    const OPENING_CAPITAL: f64 = 5_000_000.0;

    fn game(companies: u64) -> GameState {
        let mut g = GameState::canonical();
        g.companies = (1..=companies).map(CompanyId).collect();
        g
    }

    fn pricing(state: &str, line: &str, tier: &str, m: f64) -> PricingDecision {
        PricingDecision { segment: Segment::new(state, line), tier: tier.into(), price_multiplier: m }
    }

    fn decisions(pricing: Vec<PricingDecision>) -> CompanyDecisions {
        CompanyDecisions { pricing, withdrawals: 0.0, expansion_spend: 0.0, portfolio: PortfolioProfile::default() }
    }

    fn price_everything(game: &GameState, m: f64) -> CompanyDecisions {
        decisions(game.segments.iter().map(|s| pricing(&s.segment.state, &s.segment.line, "standard", m)).collect())
    }

    fn seeded_store(game: &GameState, turn: TurnId) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new());
        for (i, &c) in game.companies.iter().enumerate() {
            store.seed_company(c, OPENING_CAPITAL).unwrap();
            store.put_decisions(turn, c, price_everything(game, 0.9 + 0.05 * i as f64)).unwrap();
        }
        store
    }

    fn engine_with(
        store: Arc<dyn Persistence>,
        config: EngineConfig,
        plugins: PluginRegistry,
    ) -> (WeeklySimulationEngine, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let engine = WeeklySimulationEngine::new(config, store, plugins, log.clone()).unwrap();
        (engine, log)
    }

    fn engine(store: Arc<dyn Persistence>) -> (WeeklySimulationEngine, Arc<EventLog>) {
        engine_with(store, EngineConfig::default(), PluginRegistry::with_builtins())
    }

    fn open_turn(sequence: u64) -> Turn {
        Turn::pending(sequence, Utc::now(), chrono::Duration::minutes(5))
    }

    // ── happy path ─────────────────────────────────────────────────────────────

    #[test]
    fn completes_every_company_and_closes_every_stage() {
        let g = game(6);
        let store = seeded_store(&g, TurnId(1));
        let (engine, log) = engine(store.clone());
        let mut turn = open_turn(1);

        let outcome = engine.process_weekly_turn(&mut turn, &g).unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(outcome.completed_companies, g.companies);
        assert!(outcome.failed_companies.is_empty());
        assert_eq!(outcome.halt, None);
        assert_eq!(store.results_for_turn(TurnId(1)).unwrap().len(), 6);

        let events = log.events();
        assert!(matches!(events.first().map(|e| &e.kind), Some(EventKind::TurnStarted { companies: 6, .. })));
        assert!(matches!(events.last().map(|e| &e.kind), Some(EventKind::TurnCompleted { completed: 6, .. })));
        let closed: Vec<Stage> = events
            .iter()
            .filter_map(|e| match e.kind {
                EventKind::StageCompleted { stage, .. } => Some(stage),
                _ => None,
            })
            .collect();
        assert_eq!(closed, vec![Stage::Loading, Stage::Market, Stage::Operations, Stage::Aggregation]);
    }

    #[test]
    fn stage_started_precedes_stage_completed() {
        let g = game(3);
        let store = seeded_store(&g, TurnId(1));
        let (engine, log) = engine(store);
        engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();

        let events = log.events();
        for stage in [Stage::Loading, Stage::Market, Stage::Operations, Stage::Aggregation] {
            let started = events.iter().position(|e| e.kind == EventKind::StageStarted { stage });
            let completed = events
                .iter()
                .position(|e| matches!(e.kind, EventKind::StageCompleted { stage: s, .. } if s == stage));
            assert!(started.is_some() && started < completed, "{stage}");
        }
    }

    #[test]
    fn segment_demand_is_conserved_under_both_models() {
        for model in ["constant_elasticity", "linear"] {
            let g = game(4);
            let store = seeded_store(&g, TurnId(1));
            let config = EngineConfig { demand_model: model.into(), ..EngineConfig::default() };
            let (engine, _) = engine_with(store.clone(), config, PluginRegistry::new());
            engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();

            let results = store.results_for_turn(TurnId(1)).unwrap();
            let mut served: BTreeMap<Segment, u64> = BTreeMap::new();
            for r in results.values() {
                for m in &r.breakdown.as_ref().unwrap().market {
                    *served.entry(m.segment.clone()).or_default() += m.demand_served;
                }
            }
            for s in &g.segments {
                assert!(served[&s.segment] as f64 <= s.base_demand, "{model} {}", s.segment);
            }
        }
    }

    #[test]
    fn next_turn_reads_prior_turn_capital() {
        let g = game(2);
        let store = seeded_store(&g, TurnId(1));
        for &c in &g.companies {
            store.put_decisions(TurnId(2), c, price_everything(&g, 1.0)).unwrap();
        }
        let (engine, _) = engine(store.clone());
        engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        engine.process_weekly_turn(&mut open_turn(2), &g).unwrap();

        let first = store.results_for_turn(TurnId(1)).unwrap();
        let second = store.results_for_turn(TurnId(2)).unwrap();
        for c in &g.companies {
            let prior = second[c].breakdown.as_ref().unwrap().prior_capital;
            assert_eq!(prior, first[c].ending_capital);
        }
    }

    #[test]
    fn ending_capital_rolls_forward_from_components() {
        let g = game(3);
        let store = seeded_store(&g, TurnId(1));
        let (engine, _) = engine(store.clone());
        engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        for r in store.results_for_turn(TurnId(1)).unwrap().values() {
            let b = r.breakdown.as_ref().unwrap();
            let expected =
                OPENING_CAPITAL + b.underwriting_profit + b.investment_return - b.withdrawals - b.expansion_spend;
            assert!((r.ending_capital - expected).abs() < 1e-6);
        }
    }

    // ── determinism & resume ──────────────────────────────────────────────────

    #[test]
    fn results_do_not_depend_on_worker_count() {
        let g = game(6);
        let run = |workers: usize| {
            let store = seeded_store(&g, TurnId(1));
            let config = EngineConfig { worker_limit: workers, ..EngineConfig::default() };
            let (engine, _) = engine_with(store.clone(), config, PluginRegistry::new());
            engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
            store.results_for_turn(TurnId(1)).unwrap()
        };
        assert_eq!(run(1), run(8));
    }

    #[test]
    fn rerun_skips_committed_companies_without_rewriting() {
        let g = game(6);
        let store = seeded_store(&g, TurnId(1));
        let (engine, log) = engine(store.clone());
        let mut turn = open_turn(1);

        let first = engine.process_weekly_turn(&mut turn, &g).unwrap();
        let committed = store.results_for_turn(TurnId(1)).unwrap();
        log.take();

        let second = engine.process_weekly_turn(&mut turn, &g).unwrap();
        assert_eq!(second.status, TurnStatus::Completed);
        assert!(second.completed_companies.is_empty());
        assert_eq!(second.skipped_companies, g.companies);
        assert!(second.failed_companies.is_empty());
        assert_eq!(store.results_for_turn(TurnId(1)).unwrap(), committed);
        assert_eq!(second.summary, first.summary);
        let skipped = log.events().iter().filter(|e| matches!(e.kind, EventKind::CompanySkipped { .. })).count();
        assert_eq!(skipped, 6);
    }

    #[test]
    fn partial_resume_reproduces_uninterrupted_results() {
        let g = game(4);
        let reference_store = seeded_store(&g, TurnId(1));
        let (reference, _) = engine(reference_store.clone());
        reference.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        let expected = reference_store.results_for_turn(TurnId(1)).unwrap();

        // Company 2's result survives from an interrupted run.
        let store = seeded_store(&g, TurnId(1));
        store.write_result(TurnId(1), &expected[&CompanyId(2)]).unwrap();
        let (engine, _) = engine(store.clone());
        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();

        assert_eq!(outcome.skipped_companies, vec![CompanyId(2)]);
        assert_eq!(store.results_for_turn(TurnId(1)).unwrap(), expected);
    }

    // ── isolation ─────────────────────────────────────────────────────────────

    #[test]
    fn missing_decisions_fail_only_that_company() {
        let g = game(4);
        let store = Arc::new(InMemoryStore::new());
        for &c in &g.companies {
            store.seed_company(c, OPENING_CAPITAL).unwrap();
            if c != CompanyId(3) {
                store.put_decisions(TurnId(1), c, price_everything(&g, 1.0)).unwrap();
            }
        }
        let (engine, _) = engine(store.clone());
        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.completed_companies, vec![CompanyId(1), CompanyId(2), CompanyId(4)]);
        assert_eq!(
            outcome.failed_companies,
            vec![CompanyFailure {
                company: CompanyId(3),
                stage: Stage::Loading,
                reason: UnitError::Data(DataError::MissingDecisions { company: CompanyId(3), turn: TurnId(1) }),
            }]
        );
        assert!(!store.has_result(TurnId(1), CompanyId(3)).unwrap());
    }

    #[test]
    fn missing_prior_state_fails_only_that_company() {
        let g = game(3);
        let store = Arc::new(InMemoryStore::new());
        for &c in &g.companies {
            if c != CompanyId(1) {
                store.seed_company(c, OPENING_CAPITAL).unwrap();
            }
            store.put_decisions(TurnId(1), c, price_everything(&g, 1.0)).unwrap();
        }
        let (engine, _) = engine(store);
        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert_eq!(outcome.failed_ids(), BTreeSet::from([CompanyId(1)]));
        assert!(matches!(
            outcome.failed_companies[0].reason,
            UnitError::Data(DataError::MissingCompanyState { .. })
        ));
        assert_eq!(outcome.completed_companies.len(), 2);
    }

    #[test]
    fn failed_segment_fails_its_companies_only() {
        let g = game(6);
        let store = Arc::new(InMemoryStore::new());
        for &c in &g.companies {
            store.seed_company(c, OPENING_CAPITAL).unwrap();
        }
        // company 1's FL-auto price overflows to infinity once the premium tier factor applies
        store
            .put_decisions(TurnId(1), CompanyId(1), decisions(vec![pricing("FL", "auto", "premium", f64::MAX)]))
            .unwrap();
        for c in 2..=4 {
            let d = decisions(vec![pricing("FL", "auto", "standard", 1.0), pricing("TX", "auto", "standard", 1.0)]);
            store.put_decisions(TurnId(1), CompanyId(c), d).unwrap();
        }
        store.put_decisions(TurnId(1), CompanyId(5), decisions(vec![pricing("TX", "auto", "basic", 0.9)])).unwrap();
        store.put_decisions(TurnId(1), CompanyId(6), decisions(vec![])).unwrap();

        let (engine, log) = engine(store.clone());
        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();

        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.failed_segments.len(), 1);
        assert_eq!(outcome.failed_segments[0].segment, Segment::new("FL", "auto"));
        assert_eq!(outcome.failed_ids(), (1..=4).map(CompanyId).collect());
        assert!(outcome.failed_companies.iter().all(|f| f.stage == Stage::Market));
        assert_eq!(outcome.completed_companies, vec![CompanyId(5), CompanyId(6)]);

        let results = store.results_for_turn(TurnId(1)).unwrap();
        assert!(results[&CompanyId(6)].no_exposure);
        assert!(!results[&CompanyId(5)].no_exposure);
        assert!(log.events().iter().any(|e| matches!(e.kind, EventKind::SegmentFailed { .. })));
    }

    #[test]
    fn catastrophe_multiplies_claims_in_every_hit_segment() {
        let mut g = game(3);
        g.catastrophe.probability = 1.0;
        g.catastrophe.severity_multiplier = 10.0;
        let store = seeded_store(&g, TurnId(1));
        let (engine, _) = engine(store.clone());
        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();

        assert_eq!(outcome.summary.catastrophe_segments.len(), g.segments.len());
        for r in store.results_for_turn(TurnId(1)).unwrap().values() {
            let ops = &r.breakdown.as_ref().unwrap().operations;
            assert!((ops.claims_incurred - ops.baseline_claims * 10.0).abs() < 1e-6);
            assert!(r.combined_ratio > 1.0, "combined ratio {}", r.combined_ratio);
        }
    }

    // ── deadline ──────────────────────────────────────────────────────────────

    #[test]
    fn expired_deadline_fails_turn_without_writes_and_resumes_cleanly() {
        let g = game(4);
        let store = seeded_store(&g, TurnId(1));
        let (engine, log) = engine(store.clone());
        let mut late = Turn::pending(1, Utc::now() - chrono::Duration::hours(1), chrono::Duration::minutes(5));

        let outcome = engine.process_weekly_turn(&mut late, &g).unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert_eq!(late.status, TurnStatus::Failed);
        assert_eq!(outcome.halt, Some(TurnHalt::DeadlineExceeded));
        assert!(outcome.completed_companies.is_empty());
        assert!(outcome.failed_companies.iter().all(|f| f.reason == UnitError::DeadlineExceeded));
        assert!(store.results_for_turn(TurnId(1)).unwrap().is_empty());
        assert!(matches!(log.events().last().map(|e| &e.kind), Some(EventKind::TurnFailed { .. })));

        let retry = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert_eq!(retry.status, TurnStatus::Completed);
        assert_eq!(retry.completed_companies.len(), 4);
    }

    struct SlowWrites {
        inner: InMemoryStore,
        delay: Duration,
    }

    impl Persistence for SlowWrites {
        fn get_game_state(&self, turn: TurnId) -> Result<GameState, PersistenceError> {
            self.inner.get_game_state(turn)
        }
        fn get_decisions(&self, turn: TurnId, company: CompanyId) -> Result<CompanyDecisions, PersistenceError> {
            self.inner.get_decisions(turn, company)
        }
        fn get_company_state(&self, company: CompanyId, turn: TurnId) -> Result<CompanyTurnResult, PersistenceError> {
            self.inner.get_company_state(company, turn)
        }
        fn has_result(&self, turn: TurnId, company: CompanyId) -> Result<bool, PersistenceError> {
            self.inner.has_result(turn, company)
        }
        fn write_result(&self, turn: TurnId, result: &CompanyTurnResult) -> Result<(), PersistenceError> {
            thread::sleep(self.delay);
            self.inner.write_result(turn, result)
        }
    }

    fn priced_inner(g: &GameState) -> InMemoryStore {
        let inner = InMemoryStore::new();
        for &c in &g.companies {
            inner.seed_company(c, OPENING_CAPITAL).unwrap();
            inner.put_decisions(TurnId(1), c, price_everything(g, 1.0)).unwrap();
        }
        inner
    }

    #[test]
    fn turn_budget_bounds_wall_clock_time() {
        let g = game(3);
        let store = Arc::new(SlowWrites { inner: priced_inner(&g), delay: Duration::from_millis(300) });
        let config =
            EngineConfig { turn_budget: Duration::from_millis(50), worker_limit: 1, ..EngineConfig::default() };
        let (engine, _) = engine_with(store.clone(), config, PluginRegistry::new());

        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        // one write in progress at the deadline, the queued ones cancelled
        assert!(outcome.duration < Duration::from_secs(2), "{:?}", outcome.duration);
        assert_eq!(outcome.completed_companies.len() + outcome.failed_companies.len(), 3);
        assert!(outcome.failed_companies.iter().all(|f| f.reason == UnitError::DeadlineExceeded));

        // nothing lands in the store after the run has returned
        thread::sleep(Duration::from_millis(500));
        let stored: Vec<CompanyId> = store.inner.results_for_turn(TurnId(1)).unwrap().into_keys().collect();
        assert_eq!(stored, outcome.completed_companies);
    }

    #[test]
    fn deadline_settles_commit_already_writing() {
        let g = game(1);
        let store = Arc::new(SlowWrites { inner: priced_inner(&g), delay: Duration::from_millis(400) });
        let config = EngineConfig { turn_budget: Duration::from_millis(100), ..EngineConfig::default() };
        let (engine, log) = engine_with(store.clone(), config, PluginRegistry::new());

        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert_eq!(outcome.completed_companies, vec![CompanyId(1)]);
        assert!(outcome.failed_companies.is_empty());
        assert!(store.inner.has_result(TurnId(1), CompanyId(1)).unwrap());
        assert!(matches!(
            log.events().last().map(|e| &e.kind),
            Some(EventKind::TurnFailed { completed: 1, failed: 0, .. })
        ));
    }

    struct SlowReads {
        inner: InMemoryStore,
        delay: Duration,
    }

    impl Persistence for SlowReads {
        fn get_game_state(&self, turn: TurnId) -> Result<GameState, PersistenceError> {
            self.inner.get_game_state(turn)
        }
        fn get_decisions(&self, turn: TurnId, company: CompanyId) -> Result<CompanyDecisions, PersistenceError> {
            thread::sleep(self.delay);
            self.inner.get_decisions(turn, company)
        }
        fn get_company_state(&self, company: CompanyId, turn: TurnId) -> Result<CompanyTurnResult, PersistenceError> {
            self.inner.get_company_state(company, turn)
        }
        fn has_result(&self, turn: TurnId, company: CompanyId) -> Result<bool, PersistenceError> {
            self.inner.has_result(turn, company)
        }
        fn write_result(&self, turn: TurnId, result: &CompanyTurnResult) -> Result<(), PersistenceError> {
            self.inner.write_result(turn, result)
        }
    }

    #[test]
    fn turn_budget_bounds_slow_loading() {
        let g = game(3);
        let store = Arc::new(SlowReads { inner: priced_inner(&g), delay: Duration::from_millis(300) });
        let config =
            EngineConfig { turn_budget: Duration::from_millis(50), worker_limit: 1, ..EngineConfig::default() };
        let (engine, log) = engine_with(store.clone(), config, PluginRegistry::new());

        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert!(outcome.duration < Duration::from_millis(250), "{:?}", outcome.duration);
        assert_eq!(outcome.status, TurnStatus::Failed);
        assert_eq!(outcome.failed_ids(), g.companies.iter().copied().collect());
        assert!(
            outcome
                .failed_companies
                .iter()
                .all(|f| f.stage == Stage::Loading && f.reason == UnitError::DeadlineExceeded)
        );
        assert!(!log.events().iter().any(|e| e.kind == EventKind::StageStarted { stage: Stage::Market }));

        thread::sleep(Duration::from_millis(400));
        assert!(store.inner.results_for_turn(TurnId(1)).unwrap().is_empty());
    }

    // ── readiness ─────────────────────────────────────────────────────────────

    /// Holds one segment's market unit back for a fixed delay.
    struct SlowCatastrophe {
        inner: PlaceholderClaims,
        slow: Segment,
        delay: Duration,
        released: Arc<Mutex<Option<Instant>>>,
    }

    impl ClaimsModel for SlowCatastrophe {
        fn draw_catastrophe(&self, segment: &Segment, rng: &mut dyn RngCore) -> Option<CatastropheHit> {
            if *segment == self.slow {
                thread::sleep(self.delay);
                *self.released.lock().unwrap() = Some(Instant::now());
            }
            self.inner.draw_catastrophe(segment, rng)
        }
        fn claims_noise(&self, rng: &mut dyn RngCore) -> f64 {
            self.inner.claims_noise(rng)
        }
    }

    struct TimedWrites {
        inner: InMemoryStore,
        written: Mutex<BTreeMap<CompanyId, Instant>>,
    }

    impl Persistence for TimedWrites {
        fn get_game_state(&self, turn: TurnId) -> Result<GameState, PersistenceError> {
            self.inner.get_game_state(turn)
        }
        fn get_decisions(&self, turn: TurnId, company: CompanyId) -> Result<CompanyDecisions, PersistenceError> {
            self.inner.get_decisions(turn, company)
        }
        fn get_company_state(&self, company: CompanyId, turn: TurnId) -> Result<CompanyTurnResult, PersistenceError> {
            self.inner.get_company_state(company, turn)
        }
        fn has_result(&self, turn: TurnId, company: CompanyId) -> Result<bool, PersistenceError> {
            self.inner.has_result(turn, company)
        }
        fn write_result(&self, turn: TurnId, result: &CompanyTurnResult) -> Result<(), PersistenceError> {
            self.inner.write_result(turn, result)?;
            self.written.lock().unwrap().insert(result.company, Instant::now());
            Ok(())
        }
    }

    #[test]
    fn company_commits_while_unrelated_segment_is_still_resolving() {
        let g = game(3);
        let inner = InMemoryStore::new();
        for &c in &g.companies {
            inner.seed_company(c, OPENING_CAPITAL).unwrap();
        }
        inner.put_decisions(TurnId(1), CompanyId(1), decisions(vec![pricing("FL", "auto", "standard", 1.0)])).unwrap();
        inner.put_decisions(TurnId(1), CompanyId(2), decisions(vec![pricing("FL", "auto", "basic", 0.9)])).unwrap();
        inner.put_decisions(TurnId(1), CompanyId(3), decisions(vec![pricing("TX", "auto", "standard", 1.0)])).unwrap();
        let store = Arc::new(TimedWrites { inner, written: Mutex::new(BTreeMap::new()) });

        let released = Arc::new(Mutex::new(None));
        let hold = Arc::clone(&released);
        let config = EngineConfig { worker_limit: 2, ..EngineConfig::default() };
        let (engine, log) = engine_with(store.clone(), config, PluginRegistry::new());
        let engine = engine.with_claims_model(move |game: &GameState| -> Box<dyn ClaimsModel> {
            Box::new(SlowCatastrophe {
                inner: PlaceholderClaims::new(&game.catastrophe, &game.claims),
                slow: Segment::new("FL", "auto"),
                delay: Duration::from_millis(300),
                released: Arc::clone(&hold),
            })
        });

        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.completed_companies, g.companies);

        let written = store.written.lock().unwrap().clone();
        let released = released.lock().unwrap().expect("slow segment resolved");
        assert!(written[&CompanyId(3)] < released, "company 3 waited on FL-auto");
        assert!(written[&CompanyId(1)] > released);

        let events = log.events();
        let aggregation_started =
            events.iter().position(|e| e.kind == EventKind::StageStarted { stage: Stage::Aggregation });
        let market_closed =
            events.iter().position(|e| matches!(e.kind, EventKind::StageCompleted { stage: Stage::Market, .. }));
        assert!(aggregation_started.is_some() && aggregation_started < market_closed);
    }

    struct NoReturns;

    impl ReturnModel for NoReturns {
        fn expected_return(&self, _: &PortfolioProfile) -> f64 {
            0.0
        }
        fn income_rate(&self, _: &PortfolioProfile) -> f64 {
            0.0
        }
        fn dispersion(&self, _: &PortfolioProfile) -> f64 {
            0.0
        }
    }

    #[test]
    fn injected_return_model_replaces_placeholder() {
        let g = game(2);
        let store = seeded_store(&g, TurnId(1));
        let (engine, _) = engine(store.clone());
        let engine = engine.with_return_model(|_: &GameState| -> Box<dyn ReturnModel> { Box::new(NoReturns) });
        engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        for r in store.results_for_turn(TurnId(1)).unwrap().values() {
            assert_eq!(r.breakdown.as_ref().unwrap().investment_return, 0.0);
        }
    }

    // ── plugins ───────────────────────────────────────────────────────────────

    struct Exploding;

    impl Plugin for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }
        fn on_hook(&self, _: &HookContext<'_>, _: &serde_json::Value) -> Result<Vec<SideEffect>, PluginError> {
            panic!("hook exploded")
        }
    }

    #[test]
    fn plugin_panics_are_reported_and_turn_completes() {
        let g = game(3);
        let store = seeded_store(&g, TurnId(1));
        let mut plugins = PluginRegistry::with_builtins();
        plugins.register(Arc::new(Exploding), true);
        let (engine, log) = engine_with(store, EngineConfig::default(), plugins);

        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.completed_companies.len(), 3);
        let plugin_failures = log
            .events()
            .iter()
            .filter(|e| matches!(&e.kind, EventKind::PluginFailed { plugin, .. } if plugin == "exploding"))
            .count();
        assert_eq!(plugin_failures, 4);
        assert!(outcome.side_effects.iter().any(|s| s.plugin == "market_concentration"));
    }

    struct Stalling;

    impl Plugin for Stalling {
        fn name(&self) -> &str {
            "stalling"
        }
        fn on_hook(&self, _: &HookContext<'_>, _: &serde_json::Value) -> Result<Vec<SideEffect>, PluginError> {
            thread::sleep(Duration::from_millis(500));
            Ok(vec![])
        }
    }

    fn stalling_registry() -> PluginRegistry {
        let mut plugins = PluginRegistry::with_builtins();
        plugins.register(Arc::new(Stalling), true);
        plugins
    }

    #[test]
    fn stalled_plugin_is_cut_off_and_turn_completes() {
        let g = game(3);
        let store = seeded_store(&g, TurnId(1));
        let config = EngineConfig { hook_timeout: Duration::from_millis(50), ..EngineConfig::default() };
        let (engine, log) = engine_with(store, config, stalling_registry());

        let started = Instant::now();
        let outcome = engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
        assert_eq!(outcome.status, TurnStatus::Completed);
        assert_eq!(outcome.completed_companies.len(), 3);

        let stalls: Vec<String> = log
            .events()
            .into_iter()
            .filter_map(|e| match e.kind {
                EventKind::PluginFailed { plugin, reason, .. } if plugin == "stalling" => Some(reason),
                _ => None,
            })
            .collect();
        assert_eq!(stalls, vec![PluginError::TimedOut { after_ms: 50 }.to_string()]);
        assert!(outcome.side_effects.iter().any(|s| s.plugin == "market_concentration"));
    }

    #[test]
    fn hooks_never_outlast_the_turn_budget() {
        let g = game(3);
        let store = seeded_store(&g, TurnId(1));
        let config = EngineConfig {
            turn_budget: Duration::from_millis(100),
            hook_timeout: Duration::from_secs(10),
            ..EngineConfig::default()
        };
        let (engine, log) = engine_with(store, config, stalling_registry());

        let started = Instant::now();
        engine.process_weekly_turn(&mut open_turn(1), &g).unwrap();
        assert!(started.elapsed() < Duration::from_millis(400), "{:?}", started.elapsed());
        assert!(
            log.events()
                .iter()
                .any(|e| matches!(&e.kind, EventKind::PluginFailed { plugin, .. } if plugin == "stalling"))
        );
    }

    // ── turn-scope errors ─────────────────────────────────────────────────────

    #[test]
    fn busy_turn_is_rejected() {
        let g = game(1);
        let (engine, _) = engine(seeded_store(&g, TurnId(1)));
        let mut turn = open_turn(1);
        turn.status = TurnStatus::OperationsSimulating;
        assert!(matches!(
            engine.process_weekly_turn(&mut turn, &g),
            Err(EngineError::TurnInProgress { turn: TurnId(1) })
        ));
    }

    #[test]
    fn invalid_game_state_fails_before_any_stage() {
        let mut g = game(2);
        g.segments[0].base_demand = 0.0;
        let (engine, log) = engine(seeded_store(&g, TurnId(1)));
        let mut turn = open_turn(1);
        let err = engine.process_weekly_turn(&mut turn, &g).unwrap_err();
        assert!(matches!(err, EngineError::Configuration { source: ConfigurationError::InvalidSegment { .. } }));
        assert_eq!(turn.status, TurnStatus::Pending);
        assert!(log.events().is_empty());
    }

    #[test]
    fn construction_rejects_bad_engine_config() {
        let store: Arc<dyn Persistence> = Arc::new(InMemoryStore::new());
        let sink: Arc<dyn EventSink> = Arc::new(EventLog::new());
        let unknown = EngineConfig { demand_model: "gravity".into(), ..EngineConfig::default() };
        assert!(matches!(
            WeeklySimulationEngine::new(unknown, store.clone(), PluginRegistry::new(), sink.clone()),
            Err(ConfigurationError::UnknownDemandModel { .. })
        ));
        let no_workers = EngineConfig { worker_limit: 0, ..EngineConfig::default() };
        assert!(WeeklySimulationEngine::new(no_workers, store.clone(), PluginRegistry::new(), sink.clone()).is_err());
        let no_hook_time = EngineConfig { hook_timeout: Duration::ZERO, ..EngineConfig::default() };
        assert!(matches!(
            WeeklySimulationEngine::new(no_hook_time, store, PluginRegistry::new(), sink),
            Err(ConfigurationError::InvalidParameter { field: "hook_timeout", .. })
        ));
    }
}
