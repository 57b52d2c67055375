use quotaholder_core::id::Serial;
use quotaholder_ledger::items::CommissionIssue;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// A request routed through the controller instead of executed directly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionSpec {
    /// Name of the controllable call
    pub call: String,

    /// The reservation the request needs in the ledger
    pub issue: CommissionIssue,

    /// Call arguments the physical driver derives its target from
    pub arguments: serde_json::Value,
}

/// Driver for one kind of physical resource
///
/// The controller never interprets descriptions or states; it only stores
/// descriptions (encoded) and asks the driver how a state relates to one.
/// Every method must be safe to repeat: a poll may be retried after a crash.
pub trait Physical: Send + Sync {
    /// What the resource should look like once provisioned
    type Description: Serialize + DeserializeOwned + Debug;

    /// What the resource looks like now
    type State: Debug;

    /// Derive the target description of a request
    fn derive_description(&self, spec: &CommissionSpec) -> anyhow::Result<Self::Description>;

    /// Start building the resource for a commission
    fn initiate_commission(&self, serial: Serial, description: &Self::Description)
        -> anyhow::Result<()>;

    /// Current state of the resource, `None` when nothing exists yet
    fn get_current_state(
        &self,
        serial: Serial,
        description: &Self::Description,
    ) -> anyhow::Result<Option<Self::State>>;

    /// Whether the state satisfies the description
    fn complies(&self, state: &Self::State, description: &Self::Description) -> bool;

    /// Whether the description can still be reached from the state
    fn attainable(&self, state: &Self::State, description: &Self::Description) -> bool;

    /// Push a commission that is under way one step further
    fn continue_commission(&self, serial: Serial, description: &Self::Description)
        -> anyhow::Result<()>;

    /// Release whatever the driver holds for a commission once it is finalized
    fn end_commission(&self, serial: Serial, description: &Self::Description) -> anyhow::Result<()>;
}
