use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QuotaError;
use crate::id::Serial;

/// Current time truncated to microseconds, the precision every backend keeps
pub fn timestamp_now() -> DateTime<Utc> {
    timestamp_from_micros(Utc::now().timestamp_micros()).unwrap_or_else(Utc::now)
}

/// Rebuild a UTC timestamp from microseconds since the epoch
pub fn timestamp_from_micros(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000);
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

/// A named, key-protected node of the ownership forest
///
/// The root entity has no stored owner; it owns itself by definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,

    /// Parent entity, `None` only for the root
    pub owner: Option<String>,

    /// Capability token required by every mutating call on this entity
    pub key: String,
}

impl Entity {
    pub fn new(name: impl Into<String>, owner: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: Some(owner.into()),
            key: key.into(),
        }
    }

    /// Create the distinguished root entity
    pub fn root(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: None,
            key: key.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.owner.is_none()
    }

    /// Name of the owning entity; the root answers with its own name
    pub fn owner_name(&self) -> &str {
        self.owner.as_deref().unwrap_or(&self.name)
    }

    pub fn key_matches(&self, key: &str) -> bool {
        self.key == key
    }
}

/// A set of quota limits shared by reference across holdings.
///
/// `None` in any field means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    pub quantity: Option<i64>,
    pub capacity: Option<i64>,
    pub import_limit: Option<i64>,
    pub export_limit: Option<i64>,
}

impl Policy {
    pub fn new(
        name: impl Into<String>,
        quantity: Option<i64>,
        capacity: Option<i64>,
        import_limit: Option<i64>,
        export_limit: Option<i64>,
    ) -> Self {
        Self {
            name: name.into(),
            quantity,
            capacity,
            import_limit,
            export_limit,
        }
    }

    /// A policy that bounds nothing
    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, None, None, None, None)
    }

    /// Capacity and both limits must be non-negative when bounded.
    /// Quantity is signed and may be negative.
    pub fn validate(&self) -> Result<(), QuotaError> {
        let checks = [
            ("capacity", self.capacity),
            ("import_limit", self.import_limit),
            ("export_limit", self.export_limit),
        ];
        for (field, value) in checks {
            if let Some(v) = value {
                if v < 0 {
                    return Err(QuotaError::InvalidData(format!(
                        "policy {}: negative {} {}",
                        self.name, field, v
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Per-(entity, resource) counter set.
///
/// The `*ing` counters are amounts reserved by open commissions; the others
/// are settled amounts. All counters are non-negative at rest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub entity: String,
    pub resource: String,
    pub policy: String,
    pub flags: u32,
    pub imported: i64,
    pub importing: i64,
    pub exported: i64,
    pub exporting: i64,
    pub returned: i64,
    pub returning: i64,
    pub released: i64,
    pub releasing: i64,
}

impl Holding {
    pub fn new(
        entity: impl Into<String>,
        resource: impl Into<String>,
        policy: impl Into<String>,
        flags: u32,
    ) -> Self {
        Self {
            entity: entity.into(),
            resource: resource.into(),
            policy: policy.into(),
            flags,
            imported: 0,
            importing: 0,
            exported: 0,
            exporting: 0,
            returned: 0,
            returning: 0,
            released: 0,
            releasing: 0,
        }
    }

    /// `entity.resource`, the form used in messages
    pub fn label(&self) -> String {
        format!("{}.{}", self.entity, self.resource)
    }

    /// All eight counters in declaration order
    pub fn counters(&self) -> [i64; 8] {
        [
            self.imported,
            self.importing,
            self.exported,
            self.exporting,
            self.returned,
            self.returning,
            self.released,
            self.releasing,
        ]
    }

    /// True when no counter carries any amount
    pub fn is_idle(&self) -> bool {
        self.counters().iter().all(|c| *c == 0)
    }

    /// Zero the settled counters, keeping in-flight reservations intact
    pub fn reset_settled(&mut self) {
        self.imported = 0;
        self.exported = 0;
        self.returned = 0;
        self.released = 0;
    }

    pub fn check_non_negative(&self) -> Result<(), QuotaError> {
        if self.counters().iter().any(|c| *c < 0) {
            return Err(QuotaError::Corrupted(format!(
                "holding {} has a negative counter: {:?}",
                self.label(),
                self.counters()
            )));
        }
        Ok(())
    }

    /// Freeze this holding together with the limits it currently sees
    pub fn snapshot(&self, policy: &Policy) -> HoldingSnapshot {
        HoldingSnapshot {
            policy: policy.clone(),
            flags: self.flags,
            imported: self.imported,
            importing: self.importing,
            exported: self.exported,
            exporting: self.exporting,
            returned: self.returned,
            returning: self.returning,
            released: self.released,
            releasing: self.releasing,
        }
    }
}

/// Before-state of one side of a provision, as recorded in the provision log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoldingSnapshot {
    pub policy: Policy,
    pub flags: u32,
    pub imported: i64,
    pub importing: i64,
    pub exported: i64,
    pub exporting: i64,
    pub returned: i64,
    pub returning: i64,
    pub released: i64,
    pub releasing: i64,
}

/// A provisional multi-leg transfer awaiting accept or reject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commission {
    pub serial: Serial,

    /// Target entity every provision settles into
    pub entity: String,

    /// Opaque identifier of the client that owns this commission
    pub clientkey: String,

    pub name: String,
    pub issue_time: DateTime<Utc>,
}

/// One reservation leg of a commission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provision {
    pub serial: Serial,

    /// Source entity of the leg
    pub entity: String,

    pub resource: String,

    /// Non-negative for an export leg, negative for a release leg
    pub quantity: i64,
}

/// How a commission was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResolutionKind {
    Accept,
    Reject,
}

impl ResolutionKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            ResolutionKind::Accept => "ACCEPT:",
            ResolutionKind::Reject => "REJECT:",
        }
    }

    /// Build the reason string stored in the provision log
    pub fn tag(&self, reason: &str) -> String {
        format!("{}{}", self.prefix(), reason)
    }
}

/// Immutable record of one provision at the moment its commission was resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionLog {
    /// Position in the log; assigned by the store on append
    pub id: u64,
    pub serial: Serial,
    pub name: String,
    pub source: String,
    pub target: String,
    pub resource: String,
    pub issue_time: DateTime<Utc>,
    pub log_time: DateTime<Utc>,
    pub delta_quantity: i64,
    pub source_state: HoldingSnapshot,
    pub target_state: HoldingSnapshot,

    /// `ACCEPT:` or `REJECT:` followed by the caller's reason
    pub reason: String,
}

impl ProvisionLog {
    pub fn resolution(&self) -> Option<ResolutionKind> {
        if self.reason.starts_with(ResolutionKind::Accept.prefix()) {
            Some(ResolutionKind::Accept)
        } else if self.reason.starts_with(ResolutionKind::Reject.prefix()) {
            Some(ResolutionKind::Reject)
        } else {
            None
        }
    }
}

/// Status of a commission tracked by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControllerStatus {
    Undertaken,
    Complete,
    Failing,
}

impl ControllerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerStatus::Undertaken => "undertaken",
            ControllerStatus::Complete => "complete",
            ControllerStatus::Failing => "failing",
        }
    }

    pub fn parse(value: &str) -> Result<Self, QuotaError> {
        match value {
            "undertaken" => Ok(ControllerStatus::Undertaken),
            "complete" => Ok(ControllerStatus::Complete),
            "failing" => Ok(ControllerStatus::Failing),
            other => Err(QuotaError::Corrupted(format!(
                "unknown controller status {:?}",
                other
            ))),
        }
    }
}

/// Controller-side record of a commission being driven to a physical outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerCommission {
    pub serial: Serial,
    pub clientkey: String,

    /// Encoded target description; only the physical driver interprets it
    pub physical_description: Vec<u8>,

    pub status: ControllerStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_owns_itself() {
        let root = Entity::root("system", "secret");
        assert!(root.is_root());
        assert_eq!(root.owner_name(), "system");

        let alice = Entity::new("alice", "system", "k1");
        assert!(!alice.is_root());
        assert_eq!(alice.owner_name(), "system");
        assert!(alice.key_matches("k1"));
        assert!(!alice.key_matches("k2"));
    }

    #[test]
    fn test_policy_validation() {
        let policy = Policy::new("p", Some(-5), Some(10), None, Some(3));
        assert!(policy.validate().is_ok());

        let policy = Policy::new("p", Some(5), Some(-1), None, None);
        assert!(matches!(policy.validate(), Err(QuotaError::InvalidData(_))));
    }

    #[test]
    fn test_holding_reset_keeps_reservations() {
        let mut holding = Holding::new("alice", "cpu", "p", 0);
        holding.imported = 4;
        holding.importing = 2;
        holding.released = 1;
        holding.reset_settled();

        assert_eq!(holding.imported, 0);
        assert_eq!(holding.released, 0);
        assert_eq!(holding.importing, 2);
        assert!(!holding.is_idle());
    }

    #[test]
    fn test_resolution_prefix() {
        assert_eq!(ResolutionKind::Accept.tag("done"), "ACCEPT:done");
        assert_eq!(ResolutionKind::Reject.tag(""), "REJECT:");
    }

    #[test]
    fn test_timestamp_micro_roundtrip() {
        let now = timestamp_now();
        let back = timestamp_from_micros(now.timestamp_micros()).unwrap();
        assert_eq!(now, back);
    }

    #[test]
    fn test_controller_status_names() {
        for status in [
            ControllerStatus::Undertaken,
            ControllerStatus::Complete,
            ControllerStatus::Failing,
        ] {
            assert_eq!(ControllerStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(ControllerStatus::parse("retired").is_err());
    }
}
