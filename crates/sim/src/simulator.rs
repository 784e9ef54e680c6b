//! Plan orchestration: groups in priority order, passes within a group,
//! winner carried forward, plans streamed back to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use advisor_scheduler::{BoundedLauncher, SchedulerLauncher};
use advisor_view::{View, ViewAccess};

use crate::config::SimConfig;
use crate::error::{SimError, SimResult};
use crate::group::{create_simulation_groups, SimulationGroup};
use crate::plan::create_scale_out_plan;
use crate::pricing::PricingAccess;
use crate::scorer::{scorer_for, select, NodeScore, NodeScorer};
use crate::simulation::SimulationArgs;
use crate::types::{
    AdviceGenerationMode, GroupDiagnostics, NodePlacement, PodResourceInfo, ScaleOutPlan, ScalingAdviceRequest,
    ScalingAdviceResponse,
};

const RESULT_BUFFER: usize = 16;

pub type PlanStream = mpsc::Receiver<SimResult<ScalingAdviceResponse>>;

pub struct Simulator {
    launcher: Arc<dyn SchedulerLauncher>,
    pricing: Option<Arc<dyn PricingAccess>>,
    cfg: SimConfig,
}

impl Simulator {
    /// `launcher` is bounded to `cfg.max_parallel_simulations` running
    /// instances across every request served by this simulator.
    pub fn new(launcher: Arc<dyn SchedulerLauncher>, cfg: SimConfig) -> Self {
        let launcher = Arc::new(BoundedLauncher::new(launcher, cfg.max_parallel_simulations));
        Self { launcher, pricing: None, cfg }
    }

    pub fn with_pricing(mut self, pricing: Arc<dyn PricingAccess>) -> Self {
        self.pricing = Some(pricing);
        self
    }

    pub fn config(&self) -> &SimConfig {
        &self.cfg
    }

    /// Start planning in the background. The stream yields one response per
    /// group that produced winners (incremental) or a single response
    /// (all-at-once), or ends with exactly one error. It always closes.
    /// Must be called inside a Tokio runtime.
    pub fn plan(&self, req: ScalingAdviceRequest, cancel: CancellationToken) -> PlanStream {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let launcher = Arc::clone(&self.launcher);
        let pricing = self.pricing.clone();
        let cfg = self.cfg.clone();
        tokio::spawn(async move {
            let t0 = Instant::now();
            let request_id = req.id.clone();
            let outcome = execute(req, cfg, launcher, pricing, cancel, &tx).await;
            let label = match &outcome {
                Ok(()) => "ok",
                Err(e) => e.category(),
            };
            counter!("plan_requests_total", 1u64, "outcome" => label);
            histogram!("plan_ms", t0.elapsed().as_secs_f64() * 1000.0);
            match outcome {
                Ok(()) => info!(request = %request_id, took_ms = %t0.elapsed().as_millis(), "sim: plan finished"),
                Err(e) => {
                    warn!(request = %request_id, error = %e, "sim: plan failed");
                    // The receiver may already be gone; nothing is left to tell.
                    let _ = tx.send(Err(e)).await;
                }
            }
        });
        rx
    }
}

async fn execute(
    req: ScalingAdviceRequest,
    cfg: SimConfig,
    launcher: Arc<dyn SchedulerLauncher>,
    pricing: Option<Arc<dyn PricingAccess>>,
    cancel: CancellationToken,
    tx: &mpsc::Sender<SimResult<ScalingAdviceResponse>>,
) -> SimResult<()> {
    let ctx = format!("request {} (correlation {})", req.id, req.correlation_id);
    req.validate().map_err(|e| e.context(&ctx))?;
    let scorer = scorer_for(req.scoring, pricing).map_err(|e| e.context(&ctx))?;
    let timeout = req.timeout.unwrap_or(cfg.plan_timeout);

    let work = cancel.child_token();
    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(SimError::Cancelled(ctx.clone())),
        r = tokio::time::timeout(timeout, run_groups(&req, &cfg, launcher, scorer, &work, tx)) => {
            r.unwrap_or_else(|_| Err(SimError::Timeout(format!("{} after {:?}", ctx, timeout))))
        }
    };
    work.cancel();
    outcome.map_err(|e| match e {
        SimError::Cancelled(_) | SimError::Timeout(_) => e,
        e => e.context(&ctx),
    })
}

struct PlanState {
    existing: BTreeMap<NodePlacement, i32>,
    pool_nodes: BTreeMap<String, u32>,
    emitted: BTreeMap<NodePlacement, i32>,
    winners: Vec<NodeScore>,
    leftover: Vec<PodResourceInfo>,
    diagnostics: Vec<GroupDiagnostics>,
}

impl PlanState {
    fn pools_at_quota(&self, req: &ScalingAdviceRequest) -> BTreeSet<String> {
        req.constraint
            .node_pools
            .iter()
            .filter(|p| p.quota.is_some_and(|q| self.pool_nodes.get(&p.name).copied().unwrap_or(0) >= q))
            .map(|p| p.name.clone())
            .collect()
    }

    fn response(&self, req: &ScalingAdviceRequest, plan: ScaleOutPlan) -> ScalingAdviceResponse {
        ScalingAdviceResponse {
            request_id: req.id.clone(),
            correlation_id: req.correlation_id.clone(),
            plan,
            diagnostics: self.diagnostics.clone(),
        }
    }
}

async fn run_groups(
    req: &ScalingAdviceRequest,
    cfg: &SimConfig,
    launcher: Arc<dyn SchedulerLauncher>,
    scorer: Arc<dyn NodeScorer>,
    ctx: &CancellationToken,
    tx: &mpsc::Sender<SimResult<ScalingAdviceResponse>>,
) -> SimResult<()> {
    let access = ViewAccess::new(&format!("{}/base", req.id), cfg.view.clone());
    let base = access.base_view();
    let loaded = base.load_objects(req.snapshot.to_objects()).await.map_err(|e| SimError::store("loading snapshot", e))?;

    let existing = req.snapshot.existing_node_counts();
    let mut pool_nodes = BTreeMap::new();
    for (p, n) in existing.iter() {
        *pool_nodes.entry(p.node_pool_name.clone()).or_insert(0u32) += (*n).max(0) as u32;
    }
    let leftover = pending_pods(&base).await?;
    let mut state =
        PlanState { existing, pool_nodes, emitted: BTreeMap::new(), winners: Vec::new(), leftover, diagnostics: Vec::new() };

    let args = SimulationArgs {
        launcher,
        run_counter: Arc::new(AtomicU64::new(0)),
        poll_interval: cfg.poll_interval,
        max_unchanged_polls: cfg.max_unchanged_polls,
    };
    let mut groups = create_simulation_groups(&req.constraint, &args);
    info!(
        request = %req.id,
        objects = loaded,
        groups = groups.len(),
        pending = state.leftover.len(),
        scorer = scorer.name(),
        "sim: planning"
    );

    let mut next_view = base;
    for (gi, group) in groups.iter_mut().enumerate() {
        if state.leftover.is_empty() {
            break;
        }
        let found = run_group(req, gi, group, &access, &scorer, &mut next_view, &mut state, ctx).await?;
        if req.mode == AdviceGenerationMode::Incremental && !found.is_empty() {
            let current: BTreeMap<NodePlacement, i32> = state
                .existing
                .iter()
                .map(|(p, n)| (p.clone(), *n))
                .chain(state.emitted.iter().map(|(p, n)| (p.clone(), *n)))
                .fold(BTreeMap::new(), |mut acc, (p, n)| {
                    *acc.entry(p).or_insert(0) += n;
                    acc
                });
            let plan = create_scale_out_plan(found.iter().map(|w| &w.placement), &current, &state.leftover);
            for item in plan.items.iter() {
                *state.emitted.entry(item.placement.clone()).or_insert(0) += item.delta;
            }
            send(tx, state.response(req, plan)).await?;
        }
        state.winners.extend(found);
    }

    if state.winners.is_empty() {
        return Err(SimError::NoScalingAdvice(format!("no group produced a winning node for {} pods", state.leftover.len())));
    }
    if req.mode == AdviceGenerationMode::AllAtOnce {
        let plan = create_scale_out_plan(state.winners.iter().map(|w| &w.placement), &state.existing, &state.leftover);
        send(tx, state.response(req, plan)).await?;
    }
    Ok(())
}

/// Repeat passes over one group until it stops producing winners, its pools
/// reach quota or no pod is left. Returns the group's winners in pass order.
#[allow(clippy::too_many_arguments)]
async fn run_group(
    req: &ScalingAdviceRequest,
    gi: usize,
    group: &mut SimulationGroup,
    access: &ViewAccess,
    scorer: &Arc<dyn NodeScorer>,
    next_view: &mut Arc<View>,
    state: &mut PlanState,
    ctx: &CancellationToken,
) -> SimResult<Vec<NodeScore>> {
    let mut diag = GroupDiagnostics { key: group.key(), passes: 0, winners: Vec::new(), skipped_at_quota: Vec::new() };
    let mut skipped = BTreeSet::new();
    let mut found = Vec::new();
    loop {
        if ctx.is_cancelled() {
            return Err(SimError::Cancelled(format!("group {} before pass {}", group.key(), diag.passes + 1)));
        }
        let at_quota = state.pools_at_quota(req);
        for sim in group.simulations().iter().filter(|s| at_quota.contains(&s.pool().name)) {
            skipped.insert(sim.name().to_string());
        }
        if group.simulations().iter().all(|s| at_quota.contains(&s.pool().name)) {
            debug!(group = %group.key(), "sim: every pool of the group is at quota");
            break;
        }

        diag.passes += 1;
        let prefix = format!("{}/g{}/p{}/", req.id, gi, diag.passes);
        let base = Arc::clone(next_view);
        let ran = group
            .run(ctx, &at_quota, |name| {
                let sandbox = format!("{}{}", prefix, name);
                let base = Arc::clone(&base);
                async move { access.sandbox_over(&sandbox, &base).await.map_err(|e| SimError::store(sandbox, e)) }
            })
            .await;
        access.discard_prefixed(&prefix);
        group.reset();
        let results = ran?;

        let scores = results.iter().map(|r| scorer.compute(r)).collect::<SimResult<Vec<_>>>()?;
        let winner = match pick_winner(scores) {
            Ok(w) => w,
            Err(SimError::NoWinningScore(msg)) => {
                debug!(group = %group.key(), pass = diag.passes, %msg, "sim: pass ended without a winner");
                break;
            }
            Err(e) => return Err(e),
        };
        info!(
            group = %group.key(),
            pass = diag.passes,
            winner = %winner.simulation,
            score = winner.value,
            on_node = winner.node_pods,
            leftover = winner.unscheduled.len(),
            "sim: pass winner"
        );
        winner
            .view
            .event_sink()
            .reset()
            .await
            .map_err(|e| SimError::store(format!("resetting events of {}", winner.view.name()), e))?;
        *next_view = Arc::clone(&winner.view);
        *state.pool_nodes.entry(winner.placement.node_pool_name.clone()).or_insert(0) += 1;
        state.leftover = pending_pods(&winner.view).await?;
        diag.winners.push(winner.simulation.clone());
        found.push(winner);
        if state.leftover.is_empty() {
            break;
        }
    }
    diag.skipped_at_quota = skipped.into_iter().collect();
    state.diagnostics.push(diag);
    Ok(found)
}

// The view is authoritative: a bind can land after tracking stabilized but
// before the scheduler was closed.
async fn pending_pods(view: &View) -> SimResult<Vec<PodResourceInfo>> {
    view.unscheduled_pods()
        .await
        .map_err(|e| SimError::store(format!("listing unscheduled pods of {}", view.name()), e))?
        .iter()
        .map(PodResourceInfo::from_pod)
        .collect()
}

fn pick_winner(scores: Vec<NodeScore>) -> SimResult<NodeScore> {
    let total = scores.len();
    select(scores).ok_or_else(|| SimError::NoWinningScore(format!("none of {} candidates placed a pod", total)))
}

async fn send(tx: &mpsc::Sender<SimResult<ScalingAdviceResponse>>, resp: ScalingAdviceResponse) -> SimResult<()> {
    tx.send(Ok(resp)).await.map_err(|_| SimError::Cancelled("plan stream receiver dropped".into()))
}
