//! Instance pricing lookup for cost-based scoring.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceInfo {
    pub region: String,
    pub instance_type: String,
    pub hourly_price: f64,
}

pub trait PricingAccess: Send + Sync {
    fn get_info(&self, region: &str, instance_type: &str) -> Option<PriceInfo>;
}

/// Fixed price table keyed by (region, instance type).
#[derive(Debug, Clone, Default)]
pub struct StaticPricing {
    prices: FxHashMap<(String, String), PriceInfo>,
}

impl StaticPricing {
    pub fn from_infos(infos: Vec<PriceInfo>) -> SimResult<Self> {
        let mut prices = FxHashMap::default();
        for info in infos {
            if !info.hourly_price.is_finite() || info.hourly_price < 0.0 {
                return Err(SimError::Validation(format!(
                    "price for {}/{} must be a non-negative number",
                    info.region, info.instance_type
                )));
            }
            prices.insert((info.region.clone(), info.instance_type.clone()), info);
        }
        Ok(Self { prices })
    }

    /// Parse `[{"region": .., "instanceType": .., "hourlyPrice": ..}]`.
    pub fn from_json(raw: &str) -> SimResult<Self> {
        let infos: Vec<PriceInfo> =
            serde_json::from_str(raw).map_err(|e| SimError::Validation(format!("pricing data: {}", e)))?;
        Self::from_infos(infos)
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

impl PricingAccess for StaticPricing {
    fn get_info(&self, region: &str, instance_type: &str) -> Option<PriceInfo> {
        self.prices.get(&(region.to_string(), instance_type.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_region_and_type() {
        let p = StaticPricing::from_json(
            r#"[{"region":"eu-west-1","instanceType":"m5.large","hourlyPrice":0.096},
                {"region":"us-east-1","instanceType":"m5.large","hourlyPrice":0.107}]"#,
        )
        .unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.get_info("us-east-1", "m5.large").map(|i| i.hourly_price), Some(0.107));
        assert!(p.get_info("us-east-1", "m5.xlarge").is_none());
    }

    #[test]
    fn negative_prices_are_rejected() {
        let err = StaticPricing::from_json(r#"[{"region":"r","instanceType":"t","hourlyPrice":-1}]"#).unwrap_err();
        assert_eq!(err.category(), "validation");
    }
}
