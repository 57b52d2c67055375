pub mod commission;
pub mod config;
pub mod items;
pub mod ledger;
pub mod timeline;

// Re-export the main types for convenience
pub use config::LedgerConfig;
pub use items::{
    AddQuota, CommissionInfo, CommissionIssue, CreateEntity, EntityInfo, EntityKey,
    HoldingInfo, HoldingKey, PolicyLimits, ProvisionRequest, QuotaInfo, Resolution,
    SetEntityKey, SetHolding, SetQuota, TimelineFilter,
};
pub use ledger::QuotaHolder;
