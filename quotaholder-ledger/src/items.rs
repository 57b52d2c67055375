//! Request and response items of the ledger calls.
//!
//! Request items reject unknown fields so that a call payload decodes into
//! exactly one canonical form.

use chrono::{DateTime, Utc};
use quotaholder_core::id::Serial;
use quotaholder_core::objects::{Holding, Policy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntity {
    pub entity: String,
    pub owner: String,
    pub key: String,
    pub ownerkey: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetEntityKey {
    pub entity: String,
    pub key: String,
    pub newkey: String,
}

/// An entity name with the key that unlocks it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityKey {
    pub entity: String,
    pub key: String,
}

impl EntityKey {
    pub fn new(entity: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub entity: String,
    pub owner: String,
}

/// Named limits, the input of `set_limits` and output of `get_limits`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyLimits {
    pub policy: String,
    pub quantity: Option<i64>,
    pub capacity: Option<i64>,
    pub import_limit: Option<i64>,
    pub export_limit: Option<i64>,
}

impl PolicyLimits {
    pub fn to_policy(&self) -> Policy {
        Policy::new(
            self.policy.clone(),
            self.quantity,
            self.capacity,
            self.import_limit,
            self.export_limit,
        )
    }
}

impl From<Policy> for PolicyLimits {
    fn from(policy: Policy) -> Self {
        Self {
            policy: policy.name,
            quantity: policy.quantity,
            capacity: policy.capacity,
            import_limit: policy.import_limit,
            export_limit: policy.export_limit,
        }
    }
}

/// A holding address with the key of its entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HoldingKey {
    pub entity: String,
    pub resource: String,
    pub key: String,
}

impl HoldingKey {
    pub fn new(
        entity: impl Into<String>,
        resource: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            resource: resource.into(),
            key: key.into(),
        }
    }
}

/// Settled view of a holding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingInfo {
    pub entity: String,
    pub resource: String,
    pub policy: String,
    pub imported: i64,
    pub exported: i64,
    pub returned: i64,
    pub released: i64,
    pub flags: u32,
}

impl From<&Holding> for HoldingInfo {
    fn from(h: &Holding) -> Self {
        Self {
            entity: h.entity.clone(),
            resource: h.resource.clone(),
            policy: h.policy.clone(),
            imported: h.imported,
            exported: h.exported,
            returned: h.returned,
            released: h.released,
            flags: h.flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetHolding {
    pub entity: String,
    pub resource: String,
    pub key: String,
    pub policy: String,
    #[serde(default)]
    pub flags: u32,
}

/// Holding and policy combined
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaInfo {
    pub entity: String,
    pub resource: String,
    pub quantity: Option<i64>,
    pub capacity: Option<i64>,
    pub import_limit: Option<i64>,
    pub export_limit: Option<i64>,
    pub imported: i64,
    pub exported: i64,
    pub returned: i64,
    pub released: i64,
    pub flags: u32,
}

impl QuotaInfo {
    pub fn new(h: &Holding, p: &Policy) -> Self {
        Self {
            entity: h.entity.clone(),
            resource: h.resource.clone(),
            quantity: p.quantity,
            capacity: p.capacity,
            import_limit: p.import_limit,
            export_limit: p.export_limit,
            imported: h.imported,
            exported: h.exported,
            returned: h.returned,
            released: h.released,
            flags: h.flags,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetQuota {
    pub entity: String,
    pub resource: String,
    pub key: String,
    pub quantity: Option<i64>,
    pub capacity: Option<i64>,
    pub import_limit: Option<i64>,
    pub export_limit: Option<i64>,
    #[serde(default)]
    pub flags: u32,
}

/// Signed deltas applied to the limits of a holding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddQuota {
    pub entity: String,
    pub resource: String,
    pub key: String,
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub capacity: i64,
    #[serde(default)]
    pub import_limit: i64,
    #[serde(default)]
    pub export_limit: i64,
}

/// One requested leg: `holder` supplies `quantity` of `resource`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionRequest {
    pub holder: String,
    pub resource: String,
    pub quantity: i64,
}

impl ProvisionRequest {
    pub fn new(holder: impl Into<String>, resource: impl Into<String>, quantity: i64) -> Self {
        Self {
            holder: holder.into(),
            resource: resource.into(),
            quantity,
        }
    }
}

/// Everything `issue_commission` needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommissionIssue {
    pub clientkey: String,
    pub target: String,
    pub key: String,
    pub owner: String,
    pub ownerkey: String,
    #[serde(default)]
    pub name: String,
    pub provisions: Vec<ProvisionRequest>,
}

/// A pending commission with its legs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionInfo {
    pub serial: Serial,
    pub target: String,
    pub clientkey: String,
    pub name: String,
    pub issue_time: DateTime<Utc>,
    pub provisions: Vec<ProvisionRequest>,
}

/// Outcome of `resolve_pending_commissions`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub accepted: Vec<Serial>,
    pub rejected: Vec<Serial>,
}

/// Holding the caller wants to see in the timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimelineFilter {
    pub entity: String,
    pub resource: String,
    pub key: String,
}

impl TimelineFilter {
    pub fn new(
        entity: impl Into<String>,
        resource: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            entity: entity.into(),
            resource: resource.into(),
            key: key.into(),
        }
    }
}
