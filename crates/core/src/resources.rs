//! Resource quantities in milli-units and pod request aggregation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const PODS: &str = "pods";

/// Parse a Kubernetes quantity (`250m`, `1.5`, `512Mi`, `2G`, `1e3`) into
/// milli-units, rounding up like the API server does.
pub fn parse_quantity_milli(q: &str) -> StoreResult<i64> {
    let q = q.trim();
    if q.is_empty() {
        return Err(StoreError::Validation("empty quantity".into()));
    }
    let split = q
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(q.len());
    let (num, suffix) = q.split_at(split);
    let base: f64 = num
        .parse()
        .map_err(|_| StoreError::Validation(format!("invalid quantity: {}", q)))?;
    let milli_per_unit: f64 = match suffix {
        "" => 1e3,
        "m" => 1.0,
        "k" => 1e6,
        "M" => 1e9,
        "G" => 1e12,
        "T" => 1e15,
        "P" => 1e18,
        "E" => 1e21,
        "Ki" => 1024.0 * 1e3,
        "Mi" => 1024f64.powi(2) * 1e3,
        "Gi" => 1024f64.powi(3) * 1e3,
        "Ti" => 1024f64.powi(4) * 1e3,
        "Pi" => 1024f64.powi(5) * 1e3,
        "Ei" => 1024f64.powi(6) * 1e3,
        s if s.starts_with('e') || s.starts_with('E') => {
            let exp: i32 = s[1..]
                .parse()
                .map_err(|_| StoreError::Validation(format!("invalid quantity exponent: {}", q)))?;
            10f64.powi(exp) * 1e3
        }
        _ => return Err(StoreError::Validation(format!("invalid quantity suffix: {}", q))),
    };
    // Absorb binary float noise before rounding up.
    let milli = (base * milli_per_unit - 1e-6).ceil();
    if !milli.is_finite() || milli.abs() > i64::MAX as f64 {
        return Err(StoreError::Validation(format!("quantity out of range: {}", q)));
    }
    Ok(milli as i64)
}

/// Render milli-units back to a quantity: `cpu` keeps milli precision, other
/// resources are printed as whole units when exact.
pub fn format_quantity(resource: &str, milli: i64) -> Quantity {
    if resource != CPU && milli % 1000 == 0 {
        Quantity((milli / 1000).to_string())
    } else {
        Quantity(format!("{}m", milli))
    }
}

/// Named resource amounts in milli-units.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector(pub BTreeMap<String, i64>);

impl ResourceVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list(list: Option<&BTreeMap<String, Quantity>>) -> StoreResult<Self> {
        let mut out = Self::new();
        if let Some(list) = list {
            for (name, q) in list {
                out.0.insert(name.clone(), parse_quantity_milli(&q.0)?);
            }
        }
        Ok(out)
    }

    pub fn to_list(&self) -> BTreeMap<String, Quantity> {
        self.0.iter().map(|(k, v)| (k.clone(), format_quantity(k, *v))).collect()
    }

    pub fn with(mut self, name: &str, milli: i64) -> Self {
        self.0.insert(name.to_string(), milli);
        self
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn add(&mut self, other: &ResourceVector) {
        for (k, v) in other.0.iter() {
            *self.0.entry(k.clone()).or_insert(0) += *v;
        }
    }

    /// Subtract `other`, clamping each resource at zero.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        let mut out = self.clone();
        for (k, v) in other.0.iter() {
            let e = out.0.entry(k.clone()).or_insert(0);
            *e = (*e - *v).max(0);
        }
        out
    }

    /// Element-wise maximum.
    pub fn max_with(&mut self, other: &ResourceVector) {
        for (k, v) in other.0.iter() {
            let e = self.0.entry(k.clone()).or_insert(0);
            *e = (*e).max(*v);
        }
    }

    /// True when every positive request in `self` fits into `available`.
    pub fn fits_within(&self, available: &ResourceVector) -> bool {
        self.0.iter().all(|(k, v)| *v <= 0 || *v <= available.get(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Effective scheduling request of a pod: containers summed, init containers
/// maxed, overhead added, plus one `pods` slot.
pub fn pod_requests(pod: &Pod) -> StoreResult<ResourceVector> {
    let mut total = ResourceVector::new();
    if let Some(spec) = pod.spec.as_ref() {
        for c in spec.containers.iter() {
            let req = c.resources.as_ref().and_then(|r| r.requests.as_ref());
            total.add(&ResourceVector::from_list(req)?);
        }
        if let Some(inits) = spec.init_containers.as_ref() {
            for c in inits.iter() {
                let req = c.resources.as_ref().and_then(|r| r.requests.as_ref());
                total.max_with(&ResourceVector::from_list(req)?);
            }
        }
        total.add(&ResourceVector::from_list(spec.overhead.as_ref())?);
    }
    total.add(&ResourceVector::new().with(PODS, 1000));
    Ok(total)
}
