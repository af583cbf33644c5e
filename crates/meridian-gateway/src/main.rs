//! Meridian gateway
//!
//! Loads every configured platform's schema document into one registry and
//! prints the execution plan for a query, so schema refreshes and planner
//! decisions can be inspected without running fetches.

use clap::Parser;
use meridian_planner::Planner;
use meridian_registry::Registry;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

mod catalog;
mod cli;
mod config;
mod logging;

use cli::Args;
use config::Config;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    config.apply_logging_env();
    logging::init();

    info!(
        config = %args.config.display(),
        platforms = config.platforms.len(),
        aliases = config.aliases.len(),
        max_in_flight = config.execution.max_in_flight,
        fetch_timeout_ms = config.execution.fetch_timeout_ms,
        "Starting Meridian gateway"
    );

    let registry = Arc::new(Registry::with_aliases(config.aliases.clone()));
    catalog::load_platforms(&registry, &config).await;

    if let Some(platform) = &args.deregister {
        let changed = registry.deregister(platform)?;
        let dangling = registry.dangling_edges();
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "deregistered": platform,
                "changed_types": changed,
                "dangling_edges": dangling,
            }))?
        );
    }

    if args.dump {
        println!("{}", serde_json::to_string_pretty(&registry.snapshot())?);
    }

    if let Some(request) = args.request() {
        let planner = Planner::new(Arc::clone(&registry), config.planner.clone());
        let plan = planner.plan(&request)?;
        info!(
            root_type = %plan.root_type,
            steps = plan.steps.len(),
            platforms = ?plan.platforms(),
            "Plan ready"
        );
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "fingerprint": plan.fingerprint(),
                "plan": plan,
            }))?
        );
    }

    Ok(())
}
