use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use chemflow::common::config::AppConfig;
use chemflow::common::setup::setup_logging;
use chemflow::server::bootstrap::{offline_context, run_server};
use chemflow::server::dispatch::BackendKind;
use chemflow::server::service::CompareQuery;
use chemflow::server::validator::SimulationRequest;
use chemflow::simcost::ranker::recommended_row;

#[cfg(feature = "jemalloc")]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about)]
struct RootOptions {
    /// Path to a TOML configuration file
    #[arg(long, global = true, env = "CHEMFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Enables debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Runs the HTTP API together with the status monitor and budget checks
    Serve(ServeOpts),
    /// Estimates the cost of a simulation request stored in a JSON file
    Estimate(RequestOpts),
    /// Ranks the benchmarked instances of a model setup by price-performance
    Compare(CompareOpts),
    /// Checks a simulation request stored in a JSON file
    Validate(RequestOpts),
}

#[derive(Parser)]
struct ServeOpts {
    /// Address of the HTTP API
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Compute backend that runs the simulations
    #[arg(long, value_enum)]
    backend: Option<BackendKind>,
}

#[derive(Parser)]
struct RequestOpts {
    /// JSON file with the simulation request
    request: PathBuf,
}

#[derive(Parser)]
struct CompareOpts {
    /// GC_CLASSIC or GCHP
    #[arg(long)]
    simulation_type: Option<String>,

    #[arg(long)]
    resolution: String,

    /// Processor used as the baseline of the relative columns
    #[arg(long)]
    processor_type: Option<String>,

    #[arg(long)]
    instance_size: Option<String>,
}

fn read_request(path: &Path) -> anyhow::Result<SimulationRequest> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read request {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Cannot parse request {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn command_serve(mut config: AppConfig, opts: ServeOpts) -> anyhow::Result<()> {
    if let Some(bind) = opts.bind {
        config.server.bind = bind;
    }
    if let Some(backend) = opts.backend {
        config.dispatch.backend = backend;
    }
    run_server(config).await
}

fn command_estimate(config: AppConfig, opts: RequestOpts) -> anyhow::Result<()> {
    let ctx = offline_context(config)?;
    let request = read_request(&opts.request)?;
    print_json(&ctx.service.estimate(&request)?)
}

fn command_compare(config: AppConfig, opts: CompareOpts) -> anyhow::Result<()> {
    let ctx = offline_context(config)?;
    let rows = ctx.service.compare(&CompareQuery {
        simulation_type: opts.simulation_type,
        resolution: Some(opts.resolution),
        processor_type: opts.processor_type,
        instance_size: opts.instance_size,
    })?;
    match recommended_row(&rows) {
        Some(row) => log::info!(
            "Recommended: {} on {} (${:.2} per simulated day)",
            row.processor_type,
            row.instance_type,
            row.cost_per_sim_day
        ),
        None => log::warn!("No benchmark matches the requested model setup"),
    }
    print_json(&rows)
}

fn command_validate(config: AppConfig, opts: RequestOpts) -> anyhow::Result<()> {
    let ctx = offline_context(config)?;
    let request = read_request(&opts.request)?;
    match ctx.service.validator().validate("cli", &request, 0) {
        Ok(validated) => print_json(&validated.sizing),
        Err(violations) => {
            for violation in &violations {
                log::error!("{}: {}", violation.field, violation.reason);
            }
            anyhow::bail!("Request is invalid ({} problems)", violations.len())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = RootOptions::parse();
    setup_logging(opts.verbose);

    let config = AppConfig::load_or_default(opts.config.as_deref())?;
    match opts.subcmd {
        SubCommand::Serve(serve) => command_serve(config, serve).await,
        SubCommand::Estimate(request) => command_estimate(config, request),
        SubCommand::Compare(compare) => command_compare(config, compare),
        SubCommand::Validate(request) => command_validate(config, request),
    }
}
