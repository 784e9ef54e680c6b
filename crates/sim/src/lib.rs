//! Scale-out planning by simulation: candidate nodes are tried in sandbox
//! views, scored, and the winners aggregated into a plan.

#![forbid(unsafe_code)]

mod config;
mod error;
mod group;
mod plan;
mod pricing;
mod scorer;
mod simulation;
mod simulator;
pub mod types;

pub use config::SimConfig;
pub use error::{SimError, SimResult};
pub use group::{create_simulation_groups, SimulationGroup};
pub use plan::create_scale_out_plan;
pub use pricing::{PriceInfo, PricingAccess, StaticPricing};
pub use scorer::{scorer_for, select, weighted_units, LeastCost, LeastWaste, NodeScore, NodeScorer};
pub use simulation::{Simulation, SimulationArgs, SimulationResult, SimulationState, SimulationStatus};
pub use simulator::{PlanStream, Simulator};
pub use types::{
    AdviceGenerationMode, ClusterSnapshot, GroupDiagnostics, NodePlacement, NodePool, NodeResourceInfo, NodeTemplate,
    PodResourceInfo, ScaleOutItem, ScaleOutPlan, ScalingAdviceRequest, ScalingAdviceResponse, ScalingConstraint,
    ScoringStrategy, SimGroupKey,
};
