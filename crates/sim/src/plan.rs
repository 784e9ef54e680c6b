//! Aggregation of winning placements into a scale-out plan.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{NodePlacement, PodResourceInfo, ScaleOutItem, ScaleOutPlan};

/// Count winners per placement and turn each count into a delta against the
/// existing node count of that placement. Output is ordered by placement, so
/// equal inputs always give equal plans.
pub fn create_scale_out_plan<'a>(
    winners: impl IntoIterator<Item = &'a NodePlacement>,
    existing: &BTreeMap<NodePlacement, i32>,
    unsatisfied: &[PodResourceInfo],
) -> ScaleOutPlan {
    let mut deltas: BTreeMap<&NodePlacement, i32> = BTreeMap::new();
    for placement in winners {
        *deltas.entry(placement).or_insert(0) += 1;
    }
    let items = deltas
        .into_iter()
        .map(|(placement, delta)| ScaleOutItem {
            placement: placement.clone(),
            current_replicas: existing.get(placement).copied().unwrap_or(0),
            delta,
        })
        .collect();
    let unsatisfied_pods = unsatisfied.iter().map(|p| p.key.clone()).collect::<BTreeSet<_>>().into_iter().collect();
    ScaleOutPlan { items, unsatisfied_pods }
}

#[cfg(test)]
mod tests {
    use super::*;
    use advisor_core::{ObjectKey, ResourceVector};

    fn placement(pool: &str, zone: &str) -> NodePlacement {
        NodePlacement {
            node_pool_name: pool.into(),
            node_template_name: "t".into(),
            instance_type: "m5.large".into(),
            region: "r".into(),
            zone: zone.into(),
        }
    }

    fn pod(name: &str) -> PodResourceInfo {
        PodResourceInfo { key: ObjectKey::new("default", name), requests: ResourceVector::new() }
    }

    #[test]
    fn winners_collapse_into_deltas() {
        let a = placement("p", "a");
        let b = placement("p", "b");
        let existing = BTreeMap::from([(a.clone(), 2)]);
        let plan = create_scale_out_plan([&b, &a, &a], &existing, &[pod("x")]);
        assert_eq!(plan.items.len(), 2);
        assert_eq!(plan.items[0], ScaleOutItem { placement: a, current_replicas: 2, delta: 2 });
        assert_eq!(plan.items[1], ScaleOutItem { placement: b, current_replicas: 0, delta: 1 });
        assert_eq!(plan.unsatisfied_pods, vec![ObjectKey::new("default", "x")]);
    }

    #[test]
    fn same_input_same_plan() {
        let a = placement("p", "a");
        let b = placement("q", "b");
        let existing = BTreeMap::from([(b.clone(), 1)]);
        let leftover = [pod("z"), pod("y"), pod("z")];
        let first = create_scale_out_plan([&a, &b, &a], &existing, &leftover);
        let second = create_scale_out_plan([&a, &b, &a], &existing, &leftover);
        assert_eq!(first, second);
        assert_eq!(first.unsatisfied_pods.len(), 2);
    }

    #[test]
    fn no_winners_no_items() {
        let plan = create_scale_out_plan(std::iter::empty(), &BTreeMap::new(), &[]);
        assert_eq!(plan, ScaleOutPlan::default());
    }
}
