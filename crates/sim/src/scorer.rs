//! Candidate scoring and per-pass winner selection.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::warn;

use advisor_core::resources::{CPU, MEMORY, PODS};
use advisor_core::ResourceVector;
use advisor_view::View;

use crate::error::{SimError, SimResult};
use crate::pricing::PricingAccess;
use crate::simulation::SimulationResult;
use crate::types::{NodePlacement, NodeResourceInfo, PodResourceInfo, ScoringStrategy, SimGroupKey};

const MILLI_PER_CORE: f64 = 1000.0;
const MILLI_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0 * 1000.0;
const CPU_WEIGHT: f64 = 1.0;
const MEMORY_WEIGHT: f64 = 0.125;

/// Weighted size of a resource vector: cpu cores, memory GiB and whole units
/// of any other resource. Pod slots do not count.
pub fn weighted_units(v: &ResourceVector) -> f64 {
    v.iter()
        .map(|(name, milli)| match name {
            CPU => milli as f64 / MILLI_PER_CORE * CPU_WEIGHT,
            MEMORY => milli as f64 / MILLI_PER_GIB * MEMORY_WEIGHT,
            PODS => 0.0,
            _ => milli as f64 / 1000.0,
        })
        .sum()
}

#[derive(Debug, Clone)]
pub struct NodeScore {
    pub simulation: String,
    pub key: SimGroupKey,
    pub placement: NodePlacement,
    pub node: NodeResourceInfo,
    /// Lower is better.
    pub value: f64,
    pub node_pods: usize,
    /// Pods placed anywhere during the run.
    pub scheduled_pods: usize,
    pub unscheduled: Vec<PodResourceInfo>,
    pub view: Arc<View>,
}

impl NodeScore {
    /// A score counts only if the candidate node took at least one pod.
    pub fn usable(&self) -> bool {
        self.node_pods > 0 && self.value.is_finite()
    }

    fn new(r: &SimulationResult, value: f64) -> Self {
        Self {
            simulation: r.name.clone(),
            key: r.key,
            placement: r.placement.clone(),
            node: r.node.clone(),
            value,
            node_pods: r.node_pods.len(),
            scheduled_pods: r.node_pods.len() + r.other_assignments.iter().map(|a| a.pods.len()).sum::<usize>(),
            unscheduled: r.leftover.clone(),
            view: Arc::clone(&r.view),
        }
    }
}

pub trait NodeScorer: Send + Sync {
    fn name(&self) -> &'static str;
    fn compute(&self, result: &SimulationResult) -> SimResult<NodeScore>;
}

fn placed_on_node(r: &SimulationResult) -> ResourceVector {
    let mut used = ResourceVector::new();
    for p in r.node_pods.iter() {
        used.add(&p.requests);
    }
    used
}

/// Prefers the candidate that leaves the least allocatable capacity unused.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastWaste;

impl NodeScorer for LeastWaste {
    fn name(&self) -> &'static str {
        "least-waste"
    }

    fn compute(&self, r: &SimulationResult) -> SimResult<NodeScore> {
        let unused = r.node.allocatable.saturating_sub(&placed_on_node(r));
        Ok(NodeScore::new(r, weighted_units(&unused)))
    }
}

/// Prefers the candidate with the lowest hourly price per weighted unit of
/// resources placed on it.
pub struct LeastCost {
    pricing: Arc<dyn PricingAccess>,
}

impl LeastCost {
    pub fn new(pricing: Arc<dyn PricingAccess>) -> Self {
        Self { pricing }
    }
}

impl NodeScorer for LeastCost {
    fn name(&self) -> &'static str {
        "least-cost"
    }

    fn compute(&self, r: &SimulationResult) -> SimResult<NodeScore> {
        let Some(price) = self.pricing.get_info(&r.placement.region, &r.placement.instance_type) else {
            warn!(simulation = %r.name, region = %r.placement.region, instance_type = %r.placement.instance_type, "sim: no price; candidate unusable");
            return Ok(NodeScore::new(r, f64::INFINITY));
        };
        let placed = weighted_units(&placed_on_node(r));
        let value = if placed > 0.0 { price.hourly_price / placed } else { f64::INFINITY };
        Ok(NodeScore::new(r, value))
    }
}

pub fn scorer_for(strategy: ScoringStrategy, pricing: Option<Arc<dyn PricingAccess>>) -> SimResult<Arc<dyn NodeScorer>> {
    match (strategy, pricing) {
        (ScoringStrategy::LeastWaste, _) => Ok(Arc::new(LeastWaste)),
        (ScoringStrategy::LeastCost, Some(p)) => Ok(Arc::new(LeastCost::new(p))),
        (ScoringStrategy::LeastCost, None) => {
            Err(SimError::Validation("least-cost scoring needs pricing data".into()))
        }
    }
}

fn rank(a: &NodeScore, b: &NodeScore) -> Ordering {
    a.value
        .total_cmp(&b.value)
        .then_with(|| b.scheduled_pods.cmp(&a.scheduled_pods))
        .then_with(|| a.key.cmp(&b.key))
        .then_with(|| a.simulation.cmp(&b.simulation))
}

/// Best usable score of one pass, or `None` when nothing usable was produced.
pub fn select(scores: Vec<NodeScore>) -> Option<NodeScore> {
    scores.into_iter().filter(NodeScore::usable).min_by(rank)
}
