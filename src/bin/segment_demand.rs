//! Prints demand curves for a segment under each demand model.
//!
//! One company sweeps its price multiplier while a competitor holds the
//! reference price, both on equal attractiveness.
//!
//! Usage: segment_demand [SEGMENT] [--competitors N]
//! where SEGMENT is `STATE-LINE` (default: every canonical segment).

use std::collections::BTreeMap;
use std::process::ExitCode;

use turnsim::config::{GameState, SegmentParams};
use turnsim::demand::{CompetitorContext, DemandModel, Offer};
use turnsim::types::CompanyId;

const MODELS: [DemandModel; 2] = [DemandModel::ConstantElasticity, DemandModel::Linear];
const STEPS: [f64; 9] = [0.6, 0.7, 0.8, 0.9, 1.0, 1.1, 1.2, 1.4, 1.6];

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut wanted: Option<String> = None;
    let mut competitors = 1usize;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--competitors" => {
                i += 1;
                match args.get(i).and_then(|s| s.parse().ok()) {
                    Some(n) => competitors = n,
                    None => {
                        eprintln!("error: --competitors requires a count");
                        return ExitCode::from(2);
                    }
                }
            }
            other => wanted = Some(other.to_string()),
        }
        i += 1;
    }

    let game = GameState::canonical();
    let segments: Vec<&SegmentParams> = game
        .segments
        .iter()
        .filter(|p| wanted.as_deref().is_none_or(|w| p.segment.to_string() == w))
        .collect();
    if segments.is_empty() {
        eprintln!("error: no segment named {}", wanted.unwrap_or_default());
        return ExitCode::FAILURE;
    }

    for params in segments {
        println!(
            "\n=== {} (base demand {:.0}, elasticity {}, intensity {}) ===",
            params.segment, params.base_demand, params.price_elasticity, params.competitive_intensity
        );
        print!("{:>6}", "Price");
        for model in MODELS {
            print!(" | {:>20} | {:>7}", model.selector(), "Share%");
        }
        println!();

        for price in STEPS {
            print!("{price:>6.2}");
            for model in MODELS {
                match curve_point(model, params, price, competitors) {
                    Ok((demand, share)) => print!(" | {demand:>20.1} | {:>6.1}%", share * 100.0),
                    Err(e) => print!(" | {:>30}", format!("error: {e}")),
                }
            }
            println!();
        }
    }
    ExitCode::SUCCESS
}

/// Demand and share of company 1 quoting `price` against `competitors` at 1.0.
fn curve_point(
    model: DemandModel,
    params: &SegmentParams,
    price: f64,
    competitors: usize,
) -> Result<(f64, f64), Box<dyn std::error::Error>> {
    let function = model.bind(params)?;
    let mut offers = BTreeMap::new();
    offers.insert(CompanyId(1), Offer { relative_price: price, attractiveness: 1.0 });
    for c in 0..competitors {
        offers.insert(CompanyId(c as u64 + 2), Offer { relative_price: 1.0, attractiveness: 1.0 });
    }
    let outcome = function.calculate_demand(&offers, &CompetitorContext::from_offers(&offers))?;
    let own = outcome.demand_by_company.get(&CompanyId(1)).copied().unwrap_or(0.0);
    let total = outcome.total();
    Ok((own, if total > 0.0 { own / total } else { 0.0 }))
}
