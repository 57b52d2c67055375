use crate::controller::Controller;
use crate::physical::{CommissionSpec, Physical};
use crate::quotaholder_api::{decode, encode, split_context, QuotaholderCallpoint};
use quotaholder_core::error::{ErrorResponse, QuotaError};
use quotaholder_core::locks::ControllerLockManager;
use quotaholder_ledger::{CommissionIssue, QuotaHolder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Declared shape of a call's output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueSchema {
    Nothing,
    Bool,
    Integer { bits: u8 },
    Text,
    List(Box<ValueSchema>),
    Record,
    Nullable(Box<ValueSchema>),
}

impl ValueSchema {
    /// The output every controllable call must declare: an optional serial
    pub fn serial_handle() -> Self {
        ValueSchema::Nullable(Box::new(ValueSchema::Integer { bits: 63 }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSignature {
    pub name: &'static str,
    pub output: ValueSchema,
}

impl CallSignature {
    pub fn new(name: &'static str, output: ValueSchema) -> Self {
        Self { name, output }
    }
}

/// A named set of calls taking and returning JSON values
pub trait Callpoint: Send + Sync {
    /// Every call this callpoint serves, with its declared output
    fn api_spec(&self) -> Vec<CallSignature>;

    /// Execute `call`; failures come back in wire form
    fn make_call(&self, call: &str, args: Value) -> Result<Value, ErrorResponse>;
}

/// Arguments of a controllable call
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ControlledCall {
    issue: CommissionIssue,
    #[serde(default)]
    arguments: Value,
}

/// Routes controllable calls through the controller saga.
///
/// A controllable call is not executed directly; it is undertaken as a
/// commission and answers with the serial to poll. Other calls pass
/// through to the inner callpoint.
pub struct ControlledCallpoint<P: Physical, L: ControllerLockManager> {
    controller: Arc<Controller<P, L>>,
    inner: Box<dyn Callpoint>,
    controllable: HashSet<String>,
}

impl<P: Physical, L: ControllerLockManager> fmt::Debug for ControlledCallpoint<P, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlledCallpoint")
            .field("controller", &self.controller)
            .field("controllable", &self.controllable)
            .finish()
    }
}

impl<P: Physical, L: ControllerLockManager> ControlledCallpoint<P, L> {
    pub fn new(controller: Arc<Controller<P, L>>, inner: Box<dyn Callpoint>) -> Self {
        Self {
            controller,
            inner,
            controllable: HashSet::new(),
        }
    }

    /// Route `call` through the controller from now on.
    ///
    /// The inner callpoint must declare the call with an optional 63-bit
    /// integer output, the shape of a serial handle.
    pub fn register_controllable(&mut self, call: &str) -> Result<(), QuotaError> {
        let signature = self
            .inner
            .api_spec()
            .into_iter()
            .find(|s| s.name == call)
            .ok_or_else(|| QuotaError::InvalidData(format!("no such call {}", call)))?;
        if signature.output != ValueSchema::serial_handle() {
            return Err(QuotaError::InvalidData(format!(
                "{} returns {:?}, not a serial handle",
                call, signature.output
            )));
        }
        self.controllable.insert(call.to_string());
        log::debug!("{} is now controllable", call);
        Ok(())
    }

    pub fn is_controllable(&self, call: &str) -> bool {
        self.controllable.contains(call)
    }

    pub fn controller(&self) -> &Arc<Controller<P, L>> {
        &self.controller
    }
}

impl<P: Physical, L: ControllerLockManager> Callpoint for ControlledCallpoint<P, L> {
    fn api_spec(&self) -> Vec<CallSignature> {
        self.inner.api_spec()
    }

    fn make_call(&self, call: &str, args: Value) -> Result<Value, ErrorResponse> {
        if !self.is_controllable(call) {
            return self.inner.make_call(call, args);
        }
        let (_, args) = split_context(call, args)?;
        let ControlledCall { issue, arguments } = decode(call, args)?;
        let spec = CommissionSpec {
            call: call.to_string(),
            issue,
            arguments,
        };
        let serial = self
            .controller
            .undertake_commission(spec)
            .map_err(|e| e.to_response())?;
        encode(call, &serial)
    }
}

/// Builds a callpoint serving one API over a ledger
pub type CallpointConstructor = fn(Arc<QuotaHolder>) -> Box<dyn Callpoint>;

fn quotaholder_callpoint(ledger: Arc<QuotaHolder>) -> Box<dyn Callpoint> {
    Box::new(QuotaholderCallpoint::new(ledger))
}

const CALLPOINTS: &[(&str, CallpointConstructor)] = &[("quotaholder", quotaholder_callpoint)];

/// Constructor of the callpoint serving `api`, if one is compiled in
pub fn callpoint_constructor(api: &str) -> Option<CallpointConstructor> {
    CALLPOINTS
        .iter()
        .find(|(name, _)| *name == api)
        .map(|(_, constructor)| *constructor)
}

/// Names of every compiled-in API
pub fn callpoint_names() -> Vec<&'static str> {
    CALLPOINTS.iter().map(|(name, _)| *name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_physical::{MockPhysical, MockState};
    use quotaholder_core::error::ErrorKind;
    use quotaholder_core::id::Serial;
    use quotaholder_ledger::{CreateEntity, SetQuota};
    use quotaholder_storage_impl::InMemoryLockManager;
    use serde_json::json;

    /// An application API with one controllable call and one plain call
    struct VolumeApi;

    impl Callpoint for VolumeApi {
        fn api_spec(&self) -> Vec<CallSignature> {
            vec![
                CallSignature::new("create_volume", ValueSchema::serial_handle()),
                CallSignature::new("ping", ValueSchema::Text),
                CallSignature::new("count_volumes", ValueSchema::Integer { bits: 63 }),
            ]
        }

        fn make_call(&self, call: &str, _args: Value) -> Result<Value, ErrorResponse> {
            match call {
                "ping" => Ok(json!("pong")),
                other => Err(ErrorResponse::new(
                    ErrorKind::InvalidDataError,
                    format!("{} executed directly", other),
                )),
            }
        }
    }

    fn ledger() -> Arc<QuotaHolder> {
        let holder = QuotaHolder::in_memory().unwrap();
        holder
            .create_entity(vec![CreateEntity {
                entity: "alice".to_string(),
                owner: "system".to_string(),
                key: "k1".to_string(),
                ownerkey: String::new(),
            }])
            .unwrap();
        holder
            .set_quota(vec![SetQuota {
                entity: "system".to_string(),
                resource: "disk".to_string(),
                key: String::new(),
                quantity: Some(100),
                capacity: None,
                import_limit: None,
                export_limit: None,
                flags: 0,
            }])
            .unwrap();
        holder
            .set_quota(vec![SetQuota {
                entity: "alice".to_string(),
                resource: "disk".to_string(),
                key: "k1".to_string(),
                quantity: Some(0),
                capacity: Some(100),
                import_limit: None,
                export_limit: None,
                flags: 0,
            }])
            .unwrap();
        Arc::new(holder)
    }

    fn controlled() -> ControlledCallpoint<MockPhysical, InMemoryLockManager> {
        let physical = MockPhysical::with_states(vec![None, Some(MockState::building(20))]);
        let controller = Controller::new(ledger(), physical, InMemoryLockManager::new(), "api");
        ControlledCallpoint::new(Arc::new(controller), Box::new(VolumeApi))
    }

    fn volume_args(size: i64) -> Value {
        json!({
            "context": { "request_id": "r-1" },
            "issue": {
                "clientkey": "volumes",
                "target": "alice",
                "key": "k1",
                "owner": "system",
                "ownerkey": "",
                "provisions": [{ "holder": "system", "resource": "disk", "quantity": size }],
            },
            "arguments": { "size": size },
        })
    }

    #[test]
    fn test_registration_checks_output_schema() {
        let mut cp = controlled();
        assert!(cp.register_controllable("create_volume").is_ok());
        assert!(cp.is_controllable("create_volume"));

        let err = cp.register_controllable("count_volumes").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDataError);
        let err = cp.register_controllable("ping").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDataError);
        let err = cp.register_controllable("delete_volume").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidDataError);
        assert!(!cp.is_controllable("count_volumes"));
    }

    #[test]
    fn test_controllable_call_is_undertaken() {
        let mut cp = controlled();
        cp.register_controllable("create_volume").unwrap();

        let handle = cp.make_call("create_volume", volume_args(20)).unwrap();
        assert_eq!(handle, json!(1));

        let serial = Serial::FIRST;
        let controller = cp.controller();
        assert_eq!(controller.pending_controller_commissions().unwrap(), vec![serial]);
        assert_eq!(
            controller.ledger().get_pending_commissions("volumes").unwrap(),
            vec![serial]
        );
    }

    #[test]
    fn test_other_calls_pass_through() {
        let mut cp = controlled();
        cp.register_controllable("create_volume").unwrap();
        assert_eq!(cp.make_call("ping", json!({})).unwrap(), json!("pong"));

        // Not registered, so executed directly by the inner callpoint
        let cp = controlled();
        let err = cp.make_call("create_volume", volume_args(20)).unwrap_err();
        assert!(err.args[0].contains("executed directly"));
    }

    #[test]
    fn test_controlled_failures_in_wire_form() {
        let mut cp = controlled();
        cp.register_controllable("create_volume").unwrap();

        let err = cp.make_call("create_volume", volume_args(500)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoQuantityError);

        let err = cp
            .make_call("create_volume", json!({ "arguments": { "size": 1 } }))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidDataError);
    }

    #[test]
    fn test_registry_resolves_quotaholder() {
        assert_eq!(callpoint_names(), vec!["quotaholder"]);
        assert!(callpoint_constructor("nova").is_none());

        let constructor = callpoint_constructor("quotaholder").unwrap();
        let cp = constructor(Arc::new(QuotaHolder::in_memory().unwrap()));
        let entities = cp
            .make_call("list_entities", json!({ "entity": "system", "key": "" }))
            .unwrap();
        assert!(entities.as_array().is_some());
    }
}
