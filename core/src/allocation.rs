//! Child waybill deduplication rules.
//!
//! A child waybill is identified by a subset of four dimensions. The rule in
//! force decides which subset, and [`AllocationKey::dedup_key`] renders the
//! canonical key that is both looked up and stored under a unique index, so a
//! lookup and an insert can never disagree about the rule.

use crate::types::{ConsigneeId, FarmId, MasterWaybillId, ProductId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Which dimensions identify a child waybill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DedupRule {
    /// One child per farm.
    Farm,
    /// One child per farm and master waybill.
    FarmWaybill,
    /// One child per farm, master waybill and consignee.
    FarmWaybillConsignee,
    /// One child per farm, master waybill and product.
    FarmWaybillProduct,
    /// One child per farm, master waybill, consignee and product.
    #[default]
    FarmWaybillConsigneeProduct,
}

impl DedupRule {
    /// Configuration/storage tag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Farm => "farm",
            Self::FarmWaybill => "farm_waybill",
            Self::FarmWaybillConsignee => "farm_waybill_consignee",
            Self::FarmWaybillProduct => "farm_waybill_product",
            Self::FarmWaybillConsigneeProduct => "farm_waybill_consignee_product",
        }
    }

    const fn uses_waybill(self) -> bool {
        !matches!(self, Self::Farm)
    }

    const fn uses_consignee(self) -> bool {
        matches!(
            self,
            Self::FarmWaybillConsignee | Self::FarmWaybillConsigneeProduct
        )
    }

    const fn uses_product(self) -> bool {
        matches!(
            self,
            Self::FarmWaybillProduct | Self::FarmWaybillConsigneeProduct
        )
    }
}

impl fmt::Display for DedupRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown dedup rule name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown dedup rule '{0}'")]
pub struct UnknownDedupRule(pub String);

impl FromStr for DedupRule {
    type Err = UnknownDedupRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "farm" => Ok(Self::Farm),
            "farm_waybill" => Ok(Self::FarmWaybill),
            "farm_waybill_consignee" => Ok(Self::FarmWaybillConsignee),
            "farm_waybill_product" => Ok(Self::FarmWaybillProduct),
            "farm_waybill_consignee_product" => Ok(Self::FarmWaybillConsigneeProduct),
            other => Err(UnknownDedupRule(other.to_string())),
        }
    }
}

/// The four candidate dimensions of an allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocationKey {
    /// Shipping farm.
    pub farm_id: FarmId,
    /// Master waybill of the target coordination record.
    pub master_waybill_id: MasterWaybillId,
    /// Receiving consignee.
    pub consignee_id: ConsigneeId,
    /// Product.
    pub product_id: ProductId,
}

impl AllocationKey {
    /// Canonical key under `rule`: the rule tag followed by the selected
    /// dimensions, e.g. `farm_waybill:f7:w12`.
    #[must_use]
    pub fn dedup_key(&self, rule: DedupRule) -> String {
        let mut key = format!("{}:f{}", rule.as_str(), self.farm_id);
        if rule.uses_waybill() {
            key.push_str(&format!(":w{}", self.master_waybill_id));
        }
        if rule.uses_consignee() {
            key.push_str(&format!(":c{}", self.consignee_id));
        }
        if rule.uses_product() {
            key.push_str(&format!(":p{}", self.product_id));
        }
        key
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn key(farm: i64, waybill: i64, consignee: i64, product: i64) -> AllocationKey {
        AllocationKey {
            farm_id: FarmId::new(farm),
            master_waybill_id: MasterWaybillId::new(waybill),
            consignee_id: ConsigneeId::new(consignee),
            product_id: ProductId::new(product),
        }
    }

    #[test]
    fn renders_selected_dimensions() {
        let k = key(7, 12, 3, 9);
        assert_eq!(k.dedup_key(DedupRule::Farm), "farm:f7");
        assert_eq!(k.dedup_key(DedupRule::FarmWaybill), "farm_waybill:f7:w12");
        assert_eq!(
            k.dedup_key(DedupRule::FarmWaybillConsignee),
            "farm_waybill_consignee:f7:w12:c3"
        );
        assert_eq!(
            k.dedup_key(DedupRule::FarmWaybillProduct),
            "farm_waybill_product:f7:w12:p9"
        );
        assert_eq!(
            k.dedup_key(DedupRule::default()),
            "farm_waybill_consignee_product:f7:w12:c3:p9"
        );
    }

    #[test]
    fn ignored_dimensions_collapse() {
        let a = key(7, 12, 3, 9);
        let b = key(7, 12, 4, 10);
        assert_eq!(
            a.dedup_key(DedupRule::FarmWaybill),
            b.dedup_key(DedupRule::FarmWaybill)
        );
        assert_ne!(
            a.dedup_key(DedupRule::FarmWaybillConsignee),
            b.dedup_key(DedupRule::FarmWaybillConsignee)
        );
    }

    #[test]
    fn parses_rule_names() {
        for rule in [
            DedupRule::Farm,
            DedupRule::FarmWaybill,
            DedupRule::FarmWaybillConsignee,
            DedupRule::FarmWaybillProduct,
            DedupRule::FarmWaybillConsigneeProduct,
        ] {
            assert_eq!(rule.as_str().parse::<DedupRule>().unwrap(), rule);
        }
        assert!("by_color".parse::<DedupRule>().is_err());
    }
}
