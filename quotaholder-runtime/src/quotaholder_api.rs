//! Name-based dispatch of every ledger call.
//!
//! Arguments arrive as a JSON object of named fields plus an optional
//! `context` object. Batched calls take their items under `items`.

use crate::callpoint::{CallSignature, Callpoint, ValueSchema};
use chrono::{DateTime, Utc};
use quotaholder_core::error::{ErrorKind, ErrorResponse, QuotaError};
use quotaholder_core::id::Serial;
use quotaholder_ledger::{
    AddQuota, CommissionIssue, CreateEntity, EntityKey, HoldingKey, PolicyLimits, QuotaHolder,
    SetEntityKey, SetHolding, SetQuota, TimelineFilter,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Batch<T> {
    items: Vec<T>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Resolve {
    clientkey: String,
    serials: Vec<Serial>,
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Client {
    clientkey: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResolvePending {
    clientkey: String,
    max_serial: Serial,
    #[serde(default)]
    accept_set: Vec<Serial>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct CommissionRef {
    clientkey: String,
    serial: Serial,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Timeline {
    after: DateTime<Utc>,
    before: DateTime<Utc>,
    filters: Vec<TimelineFilter>,
}

#[derive(Serialize)]
struct Holdings<H, R> {
    holdings: H,
    rejected: R,
}

/// Separate the caller context from the call's own arguments
pub(crate) fn split_context(
    call: &str,
    args: Value,
) -> Result<(Map<String, Value>, Value), ErrorResponse> {
    let mut fields = match args {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        other => {
            return Err(invalid(call, format!("arguments must be an object, got {}", other)));
        }
    };
    let context = match fields.remove("context") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(context)) => context,
        Some(other) => {
            return Err(invalid(call, format!("context must be an object, got {}", other)));
        }
    };
    Ok((context, Value::Object(fields)))
}

pub(crate) fn decode<T: DeserializeOwned>(call: &str, args: Value) -> Result<T, ErrorResponse> {
    serde_json::from_value(args).map_err(|e| invalid(call, e))
}

pub(crate) fn encode<T: Serialize>(call: &str, value: &T) -> Result<Value, ErrorResponse> {
    serde_json::to_value(value).map_err(|e| {
        ErrorResponse::new(ErrorKind::CorruptedError, format!("{}: unencodable output: {}", call, e))
    })
}

fn invalid(call: &str, reason: impl std::fmt::Display) -> ErrorResponse {
    ErrorResponse::new(ErrorKind::InvalidDataError, format!("{}: {}", call, reason))
}

fn refused(err: QuotaError) -> ErrorResponse {
    ErrorResponse::from(&err)
}

/// Every ledger call, reachable by name
pub struct QuotaholderCallpoint {
    ledger: Arc<QuotaHolder>,
}

impl QuotaholderCallpoint {
    pub fn new(ledger: Arc<QuotaHolder>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<QuotaHolder> {
        &self.ledger
    }

    fn dispatch(&self, call: &str, args: Value) -> Result<Value, ErrorResponse> {
        let ledger = &self.ledger;
        match call {
            "create_entity" => {
                let Batch::<CreateEntity> { items } = decode(call, args)?;
                encode(call, &ledger.create_entity(items).map_err(refused)?)
            }
            "set_entity_key" => {
                let Batch::<SetEntityKey> { items } = decode(call, args)?;
                encode(call, &ledger.set_entity_key(items).map_err(refused)?)
            }
            "list_entities" => {
                let item: EntityKey = decode(call, args)?;
                encode(call, &ledger.list_entities(&item).map_err(refused)?)
            }
            "get_entity" => {
                let Batch::<EntityKey> { items } = decode(call, args)?;
                encode(call, &ledger.get_entity(items).map_err(refused)?)
            }
            "release_entity" => {
                let Batch::<EntityKey> { items } = decode(call, args)?;
                encode(call, &ledger.release_entity(items).map_err(refused)?)
            }
            "get_limits" => {
                let Batch::<String> { items } = decode(call, args)?;
                encode(call, &ledger.get_limits(items).map_err(refused)?)
            }
            "set_limits" => {
                let Batch::<PolicyLimits> { items } = decode(call, args)?;
                encode(call, &ledger.set_limits(items).map_err(refused)?)
            }
            "get_holding" => {
                let Batch::<HoldingKey> { items } = decode(call, args)?;
                encode(call, &ledger.get_holding(items).map_err(refused)?)
            }
            "set_holding" => {
                let Batch::<SetHolding> { items } = decode(call, args)?;
                encode(call, &ledger.set_holding(items).map_err(refused)?)
            }
            "list_resources" => {
                let item: EntityKey = decode(call, args)?;
                encode(call, &ledger.list_resources(&item).map_err(refused)?)
            }
            "list_holdings" => {
                let Batch::<EntityKey> { items } = decode(call, args)?;
                let (holdings, rejected) = ledger.list_holdings(items).map_err(refused)?;
                encode(call, &Holdings { holdings, rejected })
            }
            "get_quota" => {
                let Batch::<HoldingKey> { items } = decode(call, args)?;
                encode(call, &ledger.get_quota(items).map_err(refused)?)
            }
            "set_quota" => {
                let Batch::<SetQuota> { items } = decode(call, args)?;
                encode(call, &ledger.set_quota(items).map_err(refused)?)
            }
            "add_quota" => {
                let Batch::<AddQuota> { items } = decode(call, args)?;
                encode(call, &ledger.add_quota(items).map_err(refused)?)
            }
            "reset_holding" => {
                let Batch::<HoldingKey> { items } = decode(call, args)?;
                encode(call, &ledger.reset_holding(items).map_err(refused)?)
            }
            "release_holding" => {
                let Batch::<HoldingKey> { items } = decode(call, args)?;
                encode(call, &ledger.release_holding(items).map_err(refused)?)
            }
            "issue_commission" => {
                let issue: CommissionIssue = decode(call, args)?;
                encode(call, &ledger.issue_commission(issue).map_err(refused)?)
            }
            "accept_commission" => {
                let r: Resolve = decode(call, args)?;
                let skipped = ledger
                    .accept_commission(&r.clientkey, &r.serials, &r.reason)
                    .map_err(refused)?;
                encode(call, &skipped)
            }
            "reject_commission" => {
                let r: Resolve = decode(call, args)?;
                let skipped = ledger
                    .reject_commission(&r.clientkey, &r.serials, &r.reason)
                    .map_err(refused)?;
                encode(call, &skipped)
            }
            "get_pending_commissions" => {
                let c: Client = decode(call, args)?;
                encode(call, &ledger.get_pending_commissions(&c.clientkey).map_err(refused)?)
            }
            "resolve_pending_commissions" => {
                let r: ResolvePending = decode(call, args)?;
                let resolution = ledger
                    .resolve_pending_commissions(&r.clientkey, r.max_serial, &r.accept_set)
                    .map_err(refused)?;
                encode(call, &resolution)
            }
            "get_commission" => {
                let c: CommissionRef = decode(call, args)?;
                encode(call, &ledger.get_commission(&c.clientkey, c.serial).map_err(refused)?)
            }
            "get_timeline" => {
                let t: Timeline = decode(call, args)?;
                let timeline = ledger
                    .get_timeline(t.after, t.before, &t.filters)
                    .map_err(refused)?;
                encode(call, &timeline)
            }
            other => Err(invalid(other, "no such call")),
        }
    }
}

impl Callpoint for QuotaholderCallpoint {
    fn api_spec(&self) -> Vec<CallSignature> {
        use ValueSchema::*;
        let rejected = || List(Box::new(Record));
        let records = || List(Box::new(Record));
        let names = || List(Box::new(Text));
        let serial = || Integer { bits: 63 };
        vec![
            CallSignature::new("create_entity", rejected()),
            CallSignature::new("set_entity_key", rejected()),
            CallSignature::new("list_entities", names()),
            CallSignature::new("get_entity", records()),
            CallSignature::new("release_entity", rejected()),
            CallSignature::new("get_limits", records()),
            CallSignature::new("set_limits", rejected()),
            CallSignature::new("get_holding", records()),
            CallSignature::new("set_holding", rejected()),
            CallSignature::new("list_resources", names()),
            CallSignature::new("list_holdings", Record),
            CallSignature::new("get_quota", records()),
            CallSignature::new("set_quota", rejected()),
            CallSignature::new("add_quota", rejected()),
            CallSignature::new("reset_holding", rejected()),
            CallSignature::new("release_holding", rejected()),
            CallSignature::new("issue_commission", serial()),
            CallSignature::new("accept_commission", List(Box::new(serial()))),
            CallSignature::new("reject_commission", List(Box::new(serial()))),
            CallSignature::new("get_pending_commissions", List(Box::new(serial()))),
            CallSignature::new("resolve_pending_commissions", Record),
            CallSignature::new("get_commission", Nullable(Box::new(Record))),
            CallSignature::new("get_timeline", records()),
        ]
    }

    fn make_call(&self, call: &str, args: Value) -> Result<Value, ErrorResponse> {
        let (context, args) = split_context(call, args)?;
        if !context.is_empty() {
            log::debug!("{} called with context {:?}", call, context.keys().collect::<Vec<_>>());
        }
        let result = self.dispatch(call, args);
        if let Err(err) = &result {
            log::debug!("{} failed: {}", call, err);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn callpoint() -> QuotaholderCallpoint {
        let callpoint = QuotaholderCallpoint::new(Arc::new(QuotaHolder::in_memory().unwrap()));
        let rejected = callpoint
            .make_call(
                "create_entity",
                json!({
                    "context": { "user": "admin" },
                    "items": [{ "entity": "alice", "owner": "system", "key": "k1", "ownerkey": "" }],
                }),
            )
            .unwrap();
        assert_eq!(rejected, json!([]));
        let rejected = callpoint
            .make_call(
                "set_quota",
                json!({ "items": [
                    { "entity": "system", "resource": "cpu", "key": "",
                      "quantity": 100, "capacity": null, "import_limit": null, "export_limit": null },
                    { "entity": "alice", "resource": "cpu", "key": "k1",
                      "quantity": 0, "capacity": 100, "import_limit": null, "export_limit": null },
                ]}),
            )
            .unwrap();
        assert_eq!(rejected, json!([]));
        callpoint
    }

    fn issue(quantity: i64) -> Value {
        json!({
            "clientkey": "client-1",
            "target": "alice",
            "key": "k1",
            "owner": "system",
            "ownerkey": "",
            "provisions": [{ "holder": "system", "resource": "cpu", "quantity": quantity }],
        })
    }

    #[test]
    fn test_commission_round_trip() {
        let cp = callpoint();
        let serial = cp.make_call("issue_commission", issue(10)).unwrap();
        assert_eq!(serial, json!(1));

        let pending = cp
            .make_call("get_pending_commissions", json!({ "clientkey": "client-1" }))
            .unwrap();
        assert_eq!(pending, json!([1]));

        let skipped = cp
            .make_call(
                "accept_commission",
                json!({ "clientkey": "client-1", "serials": [1, 7] }),
            )
            .unwrap();
        assert_eq!(skipped, json!([7]));

        let quota = cp
            .make_call(
                "get_quota",
                json!({ "items": [{ "entity": "alice", "resource": "cpu", "key": "k1" }] }),
            )
            .unwrap();
        assert_eq!(quota[0]["imported"], json!(10));
    }

    #[test]
    fn test_ledger_errors_keep_their_kind() {
        let cp = callpoint();
        let err = cp.make_call("issue_commission", issue(1_000)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoQuantityError);

        let mut bad_key = issue(1);
        bad_key["key"] = json!("wrong");
        let err = cp.make_call("issue_commission", bad_key).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidKeyError);
    }

    #[test]
    fn test_malformed_input_is_invalid_data() {
        let cp = callpoint();

        let mut extra = issue(1);
        extra["surprise"] = json!(true);
        let err = cp.make_call("issue_commission", extra).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidDataError);

        let err = cp.make_call("get_entity", json!([1, 2])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidDataError);

        let err = cp
            .make_call("get_entity", json!({ "context": 3, "items": [] }))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidDataError);

        let err = cp.make_call("drop_tables", json!({})).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidDataError);
    }

    #[test]
    fn test_list_holdings_reports_rejected_items() {
        let cp = callpoint();
        let out = cp
            .make_call(
                "list_holdings",
                json!({ "items": [
                    { "entity": "alice", "key": "k1" },
                    { "entity": "alice", "key": "nope" },
                ]}),
            )
            .unwrap();
        assert_eq!(out["holdings"].as_array().unwrap().len(), 1);
        assert_eq!(out["rejected"], json!([{ "entity": "alice", "key": "nope" }]));
    }

    #[test]
    fn test_timeline_call() {
        let cp = callpoint();
        cp.make_call("issue_commission", issue(5)).unwrap();
        cp.make_call(
            "accept_commission",
            json!({ "clientkey": "client-1", "serials": [1], "reason": "done" }),
        )
        .unwrap();

        let now = Utc::now();
        let timeline = cp
            .make_call(
                "get_timeline",
                json!({
                    "after": now - chrono::Duration::hours(1),
                    "before": now + chrono::Duration::hours(1),
                    "filters": [{ "entity": "alice", "resource": "cpu", "key": "k1" }],
                }),
            )
            .unwrap();
        let entries = timeline.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["delta_quantity"], json!(5));
    }

    #[test]
    fn test_every_declared_call_dispatches() {
        let cp = callpoint();
        for signature in cp.api_spec() {
            // Empty arguments never reach "no such call"
            let err = cp.make_call(signature.name, json!({})).err();
            if let Some(err) = err {
                assert!(
                    !err.args.iter().any(|a| a.contains("no such call")),
                    "{} is declared but not dispatched",
                    signature.name
                );
            }
        }
    }
}
