use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use tokio::signal;
use tracing::{error, info, warn};

use advisor_api::{AdvisorApi, InProcApi, StaticPricing};
use advisor_scheduler::FirstFitLauncher;
use advisor_sim::{
    AdviceGenerationMode, ClusterSnapshot, ScalingAdviceRequest, ScalingAdviceResponse, ScalingConstraint,
    ScoringStrategy, SimConfig,
};

#[derive(Parser, Debug)]
#[command(name = "advisorctl", version, about = "Scale-out advice by simulation")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Mode { Incremental, AllAtOnce }

impl From<Mode> for AdviceGenerationMode {
    fn from(m: Mode) -> Self {
        match m {
            Mode::Incremental => AdviceGenerationMode::Incremental,
            Mode::AllAtOnce => AdviceGenerationMode::AllAtOnce,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Scoring { LeastWaste, LeastCost }

impl From<Scoring> for ScoringStrategy {
    fn from(s: Scoring) -> Self {
        match s {
            Scoring::LeastWaste => ScoringStrategy::LeastWaste,
            Scoring::LeastCost => ScoringStrategy::LeastCost,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Simulate node additions and print the scale-out plan
    Plan {
        /// Cluster snapshot (YAML or JSON): nodes, pods, priorityClasses, runtimeClasses
        #[arg(long = "snapshot")]
        snapshot: PathBuf,
        /// Scaling constraint (YAML or JSON): nodePools with templates and zones
        #[arg(long = "constraint")]
        constraint: PathBuf,
        /// How plans are streamed back
        #[arg(long = "mode", value_enum, default_value_t = Mode::Incremental)]
        mode: Mode,
        /// How candidate nodes are ranked
        #[arg(long = "scoring", value_enum, default_value_t = Scoring::LeastWaste)]
        scoring: Scoring,
        /// Price table for least-cost scoring: [{region, instanceType, hourlyPrice}]
        #[arg(long = "pricing")]
        pricing: Option<PathBuf>,
        /// Request deadline; defaults to ADVISOR_PLAN_TIMEOUT_SECS
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        /// Request id (generated when empty)
        #[arg(long = "id", default_value = "")]
        id: String,
        #[arg(long = "correlation-id", default_value = "")]
        correlation_id: String,
        /// Bound on concurrently running embedded schedulers
        #[arg(long = "max-parallel", env = "ADVISOR_MAX_PARALLEL_SIMULATIONS")]
        max_parallel: Option<usize>,
    },
    /// Load a snapshot and print per-kind counts and pending pods
    Inspect {
        #[arg(long = "snapshot")]
        snapshot: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("ADVISOR_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ADVISOR_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ADVISOR_METRICS_ADDR; expected host:port");
        }
    }
}

/// `.json` files are read as JSON, everything else as YAML.
fn parse_input<T: DeserializeOwned>(path: &Path, raw: &str) -> Result<T> {
    let is_json = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("json")).unwrap_or(false);
    if is_json {
        serde_json::from_str(raw).with_context(|| format!("parsing {} as JSON", path.display()))
    } else {
        serde_yaml::from_str(raw).with_context(|| format!("parsing {} as YAML", path.display()))
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_input(path, &raw)
}

fn render_plan(resp: &ScalingAdviceResponse) -> String {
    let mut out = format!("request {} (correlation {})\n", resp.request_id, resp.correlation_id);
    out.push_str(&format!("{:<16} {:<16} {:<14} {:<12} {:>7} {:>6}\n", "POOL", "TEMPLATE", "INSTANCE", "ZONE", "CURRENT", "DELTA"));
    for item in resp.plan.items.iter() {
        let p = &item.placement;
        out.push_str(&format!(
            "{:<16} {:<16} {:<14} {:<12} {:>7} {:>+6}\n",
            p.node_pool_name, p.node_template_name, p.instance_type, p.zone, item.current_replicas, item.delta
        ));
    }
    if !resp.plan.unsatisfied_pods.is_empty() {
        let names: Vec<String> = resp.plan.unsatisfied_pods.iter().map(|k| k.to_string()).collect();
        out.push_str(&format!("unsatisfied: {}\n", names.join(", ")));
    }
    for d in resp.diagnostics.iter() {
        out.push_str(&format!("group {}: {} pass(es), winners [{}]", d.key, d.passes, d.winners.join(", ")));
        if !d.skipped_at_quota.is_empty() {
            out.push_str(&format!(", at quota [{}]", d.skipped_at_quota.join(", ")));
        }
        out.push('\n');
    }
    out
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Plan { snapshot, constraint, mode, scoring, pricing, timeout_secs, id, correlation_id, max_parallel } => {
            let mut cfg = SimConfig::from_env();
            if let Some(n) = max_parallel.filter(|n| *n > 0) {
                cfg.max_parallel_simulations = n;
            }
            let req = ScalingAdviceRequest {
                id,
                correlation_id,
                constraint: load::<ScalingConstraint>(&constraint)?,
                snapshot: load::<ClusterSnapshot>(&snapshot)?,
                mode: mode.into(),
                scoring: scoring.into(),
                timeout: timeout_secs.map(Duration::from_secs),
            };
            let mut api = InProcApi::new(Arc::new(FirstFitLauncher), cfg);
            if let Some(path) = pricing {
                let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
                api = api.with_pricing(Arc::new(StaticPricing::from_json(&raw)?));
            }
            info!(snapshot = %snapshot.display(), constraint = %constraint.display(), "plan invoked");

            let stream = api.plan(req).await?;
            let token = stream.cancel.token();
            let mut rx = stream.rx;
            let mut failed = false;
            loop {
                let item = tokio::select! {
                    item = rx.recv() => item,
                    _ = signal::ctrl_c(), if !token.is_cancelled() => {
                        warn!("interrupt; cancelling plan");
                        token.cancel();
                        continue;
                    }
                };
                let Some(item) = item else { break };
                match item {
                    Ok(resp) => match cli.output {
                        Output::Human => print!("{}", render_plan(&resp)),
                        Output::Json => println!("{}", serde_json::to_string_pretty(&resp)?),
                    },
                    Err(e) => {
                        error!(error = %e, "plan failed");
                        eprintln!("plan error: {}", e);
                        failed = true;
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Inspect { snapshot } => {
            let snap: ClusterSnapshot = load(&snapshot)?;
            let api = InProcApi::new(Arc::new(FirstFitLauncher), SimConfig::from_env());
            let summary = api.inspect(snap).await?;
            match cli.output {
                Output::Human => {
                    println!("{:<24} {:>8} {:>8}", "KIND", "OBJECTS", "VERSION");
                    for k in summary.kinds.iter().filter(|k| k.objects > 0) {
                        println!("{:<24} {:>8} {:>8}", k.kind, k.objects, k.resource_version);
                    }
                    println!("unscheduled pods: {}", summary.unscheduled.len());
                    for name in summary.unscheduled.iter() {
                        println!("  {}", name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
            }
        }
    }
    Ok(())
}
