use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnsim::analysis::{self, DistStats, IntegrityViolation, TurnDist, TurnStats};
use turnsim::config::{EngineConfig, GameState};
use turnsim::engine::WeeklySimulationEngine;
use turnsim::events::{EventLog, EventSink, Fanout, TracingSink, write_ndjson};
use turnsim::market::PricingDecision;
use turnsim::persistence::{CompanyDecisions, InMemoryStore, Persistence};
use turnsim::plugins::PluginRegistry;
use turnsim::types::{Turn, TurnId, TurnStatus};

type BoxError = Box<dyn Error + Send + Sync>;

const STARTING_CAPITAL: f64 = 2_000_000.0;

struct Args {
    seed: Option<u64>,
    turns: u64,
    scenario: Option<String>,
    output: String,
    workers: Option<usize>,
    demand_model: Option<String>,
    runs: Option<u64>,
    quiet: bool,
}

fn value<T: FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, String> {
    args.get(i).and_then(|s| s.parse().ok()).ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut out = Args {
        seed: None,
        turns: 10,
        scenario: None,
        output: "events.ndjson".to_string(),
        workers: None,
        demand_model: None,
        runs: None,
        quiet: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--seed" => {
                i += 1;
                out.seed = Some(value(&args, i, "--seed")?);
            }
            "--turns" => {
                i += 1;
                out.turns = value(&args, i, "--turns")?;
            }
            "--scenario" => {
                i += 1;
                out.scenario = Some(value(&args, i, "--scenario")?);
            }
            "--output" => {
                i += 1;
                out.output = value(&args, i, "--output")?;
            }
            "--workers" => {
                i += 1;
                out.workers = Some(value(&args, i, "--workers")?);
            }
            "--demand-model" => {
                i += 1;
                out.demand_model = Some(value(&args, i, "--demand-model")?);
            }
            "--runs" => {
                i += 1;
                out.runs = Some(value(&args, i, "--runs")?);
            }
            "--quiet" => out.quiet = true,
            other => return Err(format!("unknown argument `{other}`")),
        }
        i += 1;
    }
    Ok(out)
}

fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!(
                "usage: turnsim [--turns N] [--seed S] [--scenario game.json] [--output events.ndjson] \
                 [--workers N] [--demand-model constant_elasticity|linear] [--runs N] [--quiet]"
            );
            return ExitCode::from(2);
        }
    };

    let default_level = if args.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<(), BoxError> {
    let mut game = match &args.scenario {
        Some(path) => serde_json::from_reader(File::open(path)?)?,
        None => GameState::canonical(),
    };
    if let Some(seed) = args.seed {
        game.seed = seed;
    }
    game.validate()?;

    let mut engine_config = EngineConfig::default();
    if let Some(w) = args.workers {
        engine_config.worker_limit = w;
    }
    if let Some(m) = &args.demand_model {
        engine_config.demand_model = m.clone();
    }

    if let Some(n) = args.runs {
        let start_seed = game.seed;
        let all_stats: Vec<Vec<TurnStats>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut game = game.clone();
                game.seed = run_seed(start_seed, i);
                let sink: Arc<dyn EventSink> = Arc::new(EventLog::new());
                play(&game, &engine_config, args.turns, sink).map(|run| run.stats)
            })
            .collect::<Result<_, _>>()?;

        if !args.quiet {
            if n < 2 {
                eprintln!("Warning: Distribution requires >= 2 runs");
            } else {
                print_distributions(&analysis::analyse_distributions(&all_stats), n);
            }
        }
        return Ok(());
    }

    let log = Arc::new(EventLog::new());
    let sink: Arc<dyn EventSink> = Arc::new(Fanout::new(vec![log.clone() as Arc<dyn EventSink>, Arc::new(TracingSink)]));
    let played = play(&game, &engine_config, args.turns, sink)?;

    let events = log.take();
    write_ndjson(&events, BufWriter::new(File::create(&args.output)?))?;
    info!(events = events.len(), path = %args.output, "event stream written");

    if !args.quiet {
        print_turns(&played.stats);
        print_violations(&played.violations);
    }
    Ok(())
}

/// Seed for the `i`th run; wraps so any `--seed` works with any `--runs`.
fn run_seed(start: u64, i: u64) -> u64 {
    start.wrapping_add(i)
}

struct GameRun {
    stats: Vec<TurnStats>,
    violations: Vec<(u64, IntegrityViolation)>,
}

/// Play `turns` consecutive turns against a fresh in-memory store.
fn play(game: &GameState, config: &EngineConfig, turns: u64, events: Arc<dyn EventSink>) -> Result<GameRun, BoxError> {
    let store = Arc::new(InMemoryStore::new());
    for &company in &game.companies {
        store.seed_company(company, STARTING_CAPITAL)?;
    }
    let engine = WeeklySimulationEngine::new(config.clone(), store.clone(), PluginRegistry::with_builtins(), events)?;

    let mut rng = ChaCha20Rng::seed_from_u64(game.seed);
    rng.set_stream(u64::MAX);

    let mut run = GameRun { stats: Vec::new(), violations: Vec::new() };
    for sequence in 1..=turns {
        let turn_id = TurnId(sequence);
        store.put_game_state(turn_id, game.clone())?;
        for &company in &game.companies {
            store.put_decisions(turn_id, company, scripted_decisions(game, &mut rng))?;
        }

        let state = store.get_game_state(turn_id)?;
        let mut turn = Turn::pending(sequence, Utc::now(), chrono::Duration::days(7));
        let outcome = engine.process_weekly_turn(&mut turn, &state)?;

        let results = store.results_for_turn(turn_id)?;
        run.violations
            .extend(analysis::verify_turn(&state, &outcome, &results).into_iter().map(|v| (sequence, v)));
        run.stats.push(TurnStats::from_outcome(&outcome));

        if turn.status == TurnStatus::Failed {
            warn!(turn = sequence, "turn failed; stopping");
            break;
        }
    }
    Ok(run)
}

/// A fixed player policy: every company prices every segment near the
/// reference with a random tier, and keeps its default portfolio.
fn scripted_decisions(game: &GameState, rng: &mut ChaCha20Rng) -> CompanyDecisions {
    let pricing = game
        .segments
        .iter()
        .filter_map(|s| {
            let tier = game.tiers.get(rng.random_range(0..game.tiers.len().max(1)))?;
            Some(PricingDecision {
                segment: s.segment.clone(),
                tier: tier.name.clone(),
                price_multiplier: rng.random_range(0.85..1.15),
            })
        })
        .collect();
    CompanyDecisions {
        pricing,
        withdrawals: 0.0,
        expansion_spend: rng.random_range(0.0..5_000.0),
        portfolio: Default::default(),
    }
}

const PER_MILLION: f64 = 1_000_000.0;

fn print_turns(stats: &[TurnStats]) {
    println!("\n=== Turn table ===");
    println!(
        "{:>4} | {:>9} | {:>10} | {:>10} | {:>7} | {:>7} | {:>10} | {:>5} | {:>6} | {:>6} | {:>6} | {:>7}",
        "Turn", "Demand", "Premium(M)", "Claims(M)", "LossR%", "CombR%", "Capital(M)", "Cats#", "HHI", "Watch#", "Insol#", "Failed#"
    );
    println!("{}", "-".repeat(118));
    for s in stats {
        println!(
            "{:>4} | {:>9} | {:>10.3} | {:>10.3} | {:>6.1}% | {:>6.1}% | {:>10.3} | {:>5} | {:>6.3} | {:>6} | {:>6} | {:>7}",
            s.turn,
            s.total_demand,
            s.total_premium / PER_MILLION,
            s.total_claims / PER_MILLION,
            s.loss_ratio() * 100.0,
            s.mean_combined_ratio * 100.0,
            s.total_capital / PER_MILLION,
            s.cat_segments,
            s.mean_hhi,
            s.watch_count,
            s.insolvent_count,
            s.failed_count,
        );
    }
}

fn print_violations(violations: &[(u64, IntegrityViolation)]) {
    println!("\n=== Integrity checks ===");
    if violations.is_empty() {
        println!("  All turns: PASS");
        return;
    }
    println!("  {} violation(s):", violations.len());
    for (turn, v) in violations {
        println!("    turn {turn}: {v}");
    }
}

fn print_dist_section<F>(title: &str, dists: &[TurnDist], scale: f64, extract: F)
where
    F: Fn(&TurnDist) -> &DistStats,
{
    println!("\n--- {title} ---");
    println!(
        "{:>4} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7} | {:>7}",
        "Turn", "min", "p5", "p25", "p50", "p75", "p95", "max", "mean", "stddev"
    );
    for td in dists {
        let ds = extract(td);
        println!(
            "{:>4} | {:>7.2} | {:>7.2} | {:>7.2} | {:>7.2} | {:>7.2} | {:>7.2} | {:>7.2} | {:>7.2} | {:>7.2}",
            td.turn,
            ds.min * scale,
            ds.p5 * scale,
            ds.p25 * scale,
            ds.p50 * scale,
            ds.p75 * scale,
            ds.p95 * scale,
            ds.max * scale,
            ds.mean * scale,
            ds.std_dev * scale,
        );
    }
}

fn print_distributions(dists: &[TurnDist], n_runs: u64) {
    println!("\n=== Multi-Run Distribution (N={n_runs} runs) ===");

    print_dist_section("LossR%", dists, 100.0, |td| &td.loss_ratio);
    print_dist_section("CombR%", dists, 100.0, |td| &td.combined_ratio);
    print_dist_section("Capital (M)", dists, 1.0, |td| &td.total_capital_m);
    print_dist_section("HHI", dists, 1.0, |td| &td.mean_hhi);

    println!("\n--- Discrete Counts (p50 | max) ---");
    println!("{:>4} | {:>8} | {:>8} | {:>9} | {:>9}", "Turn", "Cats p50", "Cats max", "Insol p50", "Insol max");
    for td in dists {
        println!(
            "{:>4} | {:>8} | {:>8} | {:>9} | {:>9}",
            td.turn, td.cat_segments.p50, td.cat_segments.max, td.insolvents.p50, td.insolvents.max,
        );
    }
}
