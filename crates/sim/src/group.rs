//! Simulations sharing one priority key, run concurrently per pass.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;

use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SimResult;
use crate::simulation::{Simulation, SimulationArgs, SimulationResult, SimulationState};
use crate::types::{ScalingConstraint, SimGroupKey};

pub struct SimulationGroup {
    key: SimGroupKey,
    simulations: Vec<Simulation>,
}

impl SimulationGroup {
    pub fn new(key: SimGroupKey) -> Self {
        Self { key, simulations: Vec::new() }
    }

    pub fn key(&self) -> SimGroupKey {
        self.key
    }

    pub fn push(&mut self, sim: Simulation) {
        self.simulations.push(sim);
    }

    pub fn simulations(&self) -> &[Simulation] {
        &self.simulations
    }

    pub fn len(&self) -> usize {
        self.simulations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.simulations.is_empty()
    }

    /// Run every member whose pool is not in `skip_pools`, each against the
    /// view `get_view` returns for its name. The first failure cancels the
    /// remaining members and is returned.
    pub async fn run<F, Fut>(
        &mut self,
        ctx: &CancellationToken,
        skip_pools: &BTreeSet<String>,
        get_view: F,
    ) -> SimResult<Vec<SimulationResult>>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = SimResult<Arc<advisor_view::View>>>,
    {
        let key = self.key;
        let group_ctx = ctx.child_token();
        let get_view = &get_view;
        let runs = self.simulations.iter_mut().filter(|s| !skip_pools.contains(&s.pool().name)).map(|sim| {
            let ctx = group_ctx.clone();
            async move {
                let view = get_view(sim.name().to_string()).await?;
                sim.run(&ctx, view).await.map_err(|e| e.context(&format!("group {}", key)))
            }
        });
        let outcome = try_join_all(runs).await;
        if outcome.is_err() {
            group_ctx.cancel();
        }
        outcome?;
        let results = self
            .simulations
            .iter()
            .filter(|s| s.state() == SimulationState::Success)
            .map(Simulation::result)
            .collect::<SimResult<Vec<_>>>()?;
        debug!(group = %key, ran = results.len(), "sim: group pass finished");
        Ok(results)
    }

    /// Prepare every member for the next pass.
    pub fn reset(&mut self) {
        for sim in self.simulations.iter_mut() {
            sim.reset();
        }
    }
}

/// One simulation per (pool, template, zone), grouped by
/// `(pool priority, template priority)` in ascending order.
pub fn create_simulation_groups(constraint: &ScalingConstraint, args: &SimulationArgs) -> Vec<SimulationGroup> {
    let mut groups: BTreeMap<SimGroupKey, SimulationGroup> = BTreeMap::new();
    for pool in constraint.node_pools.iter() {
        let pool = Arc::new(pool.clone());
        for template in pool.node_templates.iter() {
            let key = SimGroupKey { pool_priority: pool.priority, template_priority: template.priority };
            for zone in pool.zones.iter() {
                groups
                    .entry(key)
                    .or_insert_with(|| SimulationGroup::new(key))
                    .push(Simulation::new(Arc::clone(&pool), template, zone, args.clone()));
            }
        }
    }
    groups.into_values().collect()
}
