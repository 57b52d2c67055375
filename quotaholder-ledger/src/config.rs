use serde::{Deserialize, Serialize};

/// Settings of a [`crate::QuotaHolder`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// Name of the root entity, created on open when missing
    pub root_entity: String,

    /// Key the root entity is created with
    pub root_key: String,

    /// Provision log entries read per storage round trip by `get_timeline`
    pub timeline_chunk: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            root_entity: "system".to_string(),
            root_key: String::new(),
            timeline_chunk: 65536,
        }
    }
}
