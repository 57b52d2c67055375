//! The commission protocol: issue reserves, accept settles, reject releases.

use crate::items::{CommissionInfo, CommissionIssue, ProvisionRequest, Resolution};
use crate::ledger::{create_child, policy_of, QuotaHolder};
use quotaholder_core::error::QuotaError;
use quotaholder_core::id::{validate_name, Serial};
use quotaholder_core::objects::{
    timestamp_now, Commission, Provision, ProvisionLog, ResolutionKind,
};
use quotaholder_core::quota::{check_source, check_target, reserve, settle, unreserve};
use quotaholder_storage_impl::{Sequence, StorageTransaction};

fn call_name(kind: ResolutionKind) -> &'static str {
    match kind {
        ResolutionKind::Accept => "accept_commission",
        ResolutionKind::Reject => "reject_commission",
    }
}

impl QuotaHolder {
    /// Reserve every leg of a commission and return its serial.
    ///
    /// The target entity is created under `owner` when it does not exist yet.
    /// Any failing leg aborts the whole commission.
    pub fn issue_commission(&self, issue: CommissionIssue) -> Result<Serial, QuotaError> {
        let serial = self.transact("issue_commission", |tx| {
            match tx.get_entity(&issue.target)? {
                Some(target) if !target.key_matches(&issue.key) => {
                    return Err(QuotaError::InvalidKey(format!(
                        "bad key for entity {}",
                        issue.target
                    )));
                }
                Some(_) => {}
                None => {
                    create_child(tx, &issue.target, &issue.owner, &issue.ownerkey, &issue.key)?;
                    log::debug!("created commission target {}", issue.target);
                }
            }

            let value = tx.next_value(Sequence::CommissionSerial)?;
            let serial = Serial::new(value).map_err(|_| {
                QuotaError::Corrupted(format!("commission serial {} out of range", value))
            })?;

            tx.put_commission(&Commission {
                serial,
                entity: issue.target.clone(),
                clientkey: issue.clientkey.clone(),
                name: issue.name.clone(),
                issue_time: timestamp_now(),
            })?;
            for leg in &issue.provisions {
                reserve_leg(tx, serial, &issue.target, leg)?;
            }
            Ok(serial)
        })?;

        log::info!(
            "issued {} for {} ({} provisions)",
            serial,
            issue.clientkey,
            issue.provisions.len()
        );
        Ok(serial)
    }

    /// Settle commissions. Returns the serials that were skipped because
    /// they are not pending for `clientkey`.
    pub fn accept_commission(
        &self,
        clientkey: &str,
        serials: &[Serial],
        reason: &str,
    ) -> Result<Vec<Serial>, QuotaError> {
        self.resolve_all(clientkey, serials, reason, ResolutionKind::Accept)
    }

    /// Release the reservations of commissions. Returns the skipped serials.
    pub fn reject_commission(
        &self,
        clientkey: &str,
        serials: &[Serial],
        reason: &str,
    ) -> Result<Vec<Serial>, QuotaError> {
        self.resolve_all(clientkey, serials, reason, ResolutionKind::Reject)
    }

    /// Unresolved serials of a client, ascending
    pub fn get_pending_commissions(&self, clientkey: &str) -> Result<Vec<Serial>, QuotaError> {
        self.transact("get_pending_commissions", |tx| {
            Ok(tx.pending_serials(clientkey)?)
        })
    }

    /// Reconcile a client's pending commissions after a restart.
    ///
    /// Walks the pending serials in order up to `max_serial`, accepting those
    /// in `accept_set` and rejecting the rest.
    pub fn resolve_pending_commissions(
        &self,
        clientkey: &str,
        max_serial: Serial,
        accept_set: &[Serial],
    ) -> Result<Resolution, QuotaError> {
        let mut resolution = Resolution::default();
        for serial in self.get_pending_commissions(clientkey)? {
            if serial > max_serial {
                break;
            }
            if accept_set.contains(&serial) {
                if self.resolve_one(clientkey, serial, "", ResolutionKind::Accept)? {
                    resolution.accepted.push(serial);
                }
            } else if self.resolve_one(clientkey, serial, "", ResolutionKind::Reject)? {
                resolution.rejected.push(serial);
            }
        }

        log::info!(
            "resolved pending commissions of {}: {} accepted, {} rejected",
            clientkey,
            resolution.accepted.len(),
            resolution.rejected.len()
        );
        Ok(resolution)
    }

    /// A pending commission with its provisions, if `clientkey` owns it
    pub fn get_commission(
        &self,
        clientkey: &str,
        serial: Serial,
    ) -> Result<Option<CommissionInfo>, QuotaError> {
        self.transact("get_commission", |tx| {
            let commission = match tx.get_commission(serial)? {
                Some(c) if c.clientkey == clientkey => c,
                _ => return Ok(None),
            };
            let provisions = tx
                .provisions_for(serial)?
                .into_iter()
                .map(|p| ProvisionRequest::new(p.entity, p.resource, p.quantity))
                .collect();
            Ok(Some(CommissionInfo {
                serial,
                target: commission.entity,
                clientkey: commission.clientkey,
                name: commission.name,
                issue_time: commission.issue_time,
                provisions,
            }))
        })
    }

    fn resolve_all(
        &self,
        clientkey: &str,
        serials: &[Serial],
        reason: &str,
        kind: ResolutionKind,
    ) -> Result<Vec<Serial>, QuotaError> {
        let mut skipped = Vec::new();
        for &serial in serials {
            if !self.resolve_one(clientkey, serial, reason, kind)? {
                skipped.push(serial);
            }
        }
        Ok(skipped)
    }

    /// Resolve one serial in its own transaction; false when it was skipped
    fn resolve_one(
        &self,
        clientkey: &str,
        serial: Serial,
        reason: &str,
        kind: ResolutionKind,
    ) -> Result<bool, QuotaError> {
        let call = call_name(kind);
        let resolved = self.transact(call, |tx| {
            let commission = match tx.get_commission(serial)? {
                Some(c) if c.clientkey == clientkey => c,
                Some(c) => {
                    log::warn!("{}: {} belongs to client {}", call, serial, c.clientkey);
                    return Ok(false);
                }
                None => {
                    log::warn!("{}: {} is not pending", call, serial);
                    return Ok(false);
                }
            };

            let log_time = timestamp_now();
            for provision in tx.provisions_for(serial)? {
                let entry = resolve_leg(tx, &commission, &provision, kind)?;
                tx.append_provision_log(&ProvisionLog {
                    log_time,
                    reason: kind.tag(reason),
                    ..entry
                })?;
            }
            tx.delete_provisions(serial)?;
            tx.delete_commission(serial)?;
            Ok(true)
        })?;

        if resolved {
            log::info!("{}: {} resolved for {}", call, serial, clientkey);
        }
        Ok(resolved)
    }
}

/// Check and book one requested leg against the source and target holdings
fn reserve_leg(
    tx: &mut dyn StorageTransaction,
    serial: Serial,
    target: &str,
    leg: &ProvisionRequest,
) -> Result<(), QuotaError> {
    validate_name("entity", &leg.holder)?;
    validate_name("resource", &leg.resource)?;
    if leg.holder == target {
        return Err(QuotaError::InvalidData(format!(
            "provision of {} from {} into itself",
            leg.resource, target
        )));
    }

    let mut h = tx.get_holding(&leg.holder, &leg.resource)?.ok_or_else(|| {
        QuotaError::NoQuantity(format!("no holding {}.{}", leg.holder, leg.resource))
    })?;
    let mut th = tx.get_holding(target, &leg.resource)?.ok_or_else(|| {
        QuotaError::NoCapacity(format!("no holding {}.{}", target, leg.resource))
    })?;
    let source_policy = policy_of(tx, &h)?;
    let target_policy = policy_of(tx, &th)?;

    check_source(&h, &source_policy, leg.quantity)?;
    check_target(&th, &target_policy, leg.quantity)?;
    reserve(&mut h, &mut th, leg.quantity)?;

    tx.put_holding(&h)?;
    tx.put_holding(&th)?;
    tx.put_provision(&Provision {
        serial,
        entity: leg.holder.clone(),
        resource: leg.resource.clone(),
        quantity: leg.quantity,
    })?;
    Ok(())
}

/// Settle or release one provision, returning its log entry with the before-state
fn resolve_leg(
    tx: &mut dyn StorageTransaction,
    commission: &Commission,
    provision: &Provision,
    kind: ResolutionKind,
) -> Result<ProvisionLog, QuotaError> {
    let missing = |entity: &str| {
        QuotaError::Corrupted(format!(
            "{} provision refers to missing holding {}.{}",
            commission.serial, entity, provision.resource
        ))
    };
    let mut h = tx
        .get_holding(&provision.entity, &provision.resource)?
        .ok_or_else(|| missing(&provision.entity))?;
    let mut th = tx
        .get_holding(&commission.entity, &provision.resource)?
        .ok_or_else(|| missing(&commission.entity))?;
    let source_policy = policy_of(tx, &h)?;
    let target_policy = policy_of(tx, &th)?;

    let entry = ProvisionLog {
        id: 0,
        serial: commission.serial,
        name: commission.name.clone(),
        source: provision.entity.clone(),
        target: commission.entity.clone(),
        resource: provision.resource.clone(),
        issue_time: commission.issue_time,
        log_time: commission.issue_time,
        delta_quantity: provision.quantity,
        source_state: h.snapshot(&source_policy),
        target_state: th.snapshot(&target_policy),
        reason: String::new(),
    };

    match kind {
        ResolutionKind::Accept => settle(&mut h, &mut th, provision.quantity)?,
        ResolutionKind::Reject => unreserve(&mut h, &mut th, provision.quantity)?,
    }
    tx.put_holding(&h)?;
    tx.put_holding(&th)?;
    Ok(entry)
}
