//! Quota arithmetic guarding every reservation.
//!
//! A provision leg moves `quantity` from a source holding `h` into a target
//! holding `th`. Non-negative quantities are export legs; negative ones are
//! release legs returning previously transferred amounts. Both kinds go
//! through the same four checks, the negative quantity relaxing them.

use crate::error::QuotaError;
use crate::objects::{Holding, Policy};

/// Direction of a provision leg
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegKind {
    Export,
    Release,
}

impl LegKind {
    pub fn of(quantity: i64) -> Self {
        if quantity < 0 {
            LegKind::Release
        } else {
            LegKind::Export
        }
    }
}

/// Quantity the holding can still hand out, `None` when unbounded
pub fn available_quantity(h: &Holding, policy: &Policy) -> Option<i128> {
    policy.quantity.map(|q| {
        q as i128 + h.imported as i128 + h.returned as i128
            - h.exporting as i128
            - h.releasing as i128
    })
}

/// Capacity the holding can still take in, `None` when unbounded
pub fn available_capacity(h: &Holding, policy: &Policy) -> Option<i128> {
    policy.capacity.map(|c| {
        c as i128 + h.exported as i128 + h.released as i128
            - h.importing as i128
            - h.returning as i128
    })
}

/// Checks the source side of a leg: export limit, then available quantity.
pub fn check_source(h: &Holding, policy: &Policy, quantity: i64) -> Result<(), QuotaError> {
    if let Some(limit) = policy.export_limit {
        if h.exporting as i128 + quantity as i128 > limit as i128 {
            return Err(QuotaError::ExportLimit(format!(
                "{}: exporting {} + {} exceeds export limit {}",
                h.label(),
                h.exporting,
                quantity,
                limit
            )));
        }
    }
    if let Some(available) = available_quantity(h, policy) {
        if available - (quantity as i128) < 0 {
            return Err(QuotaError::NoQuantity(format!(
                "{}: {} available, {} requested",
                h.label(),
                available,
                quantity
            )));
        }
    }
    Ok(())
}

/// Checks the target side of a leg: import limit, then available capacity.
pub fn check_target(th: &Holding, policy: &Policy, quantity: i64) -> Result<(), QuotaError> {
    if let Some(limit) = policy.import_limit {
        if th.importing as i128 + quantity as i128 > limit as i128 {
            return Err(QuotaError::ImportLimit(format!(
                "{}: importing {} + {} exceeds import limit {}",
                th.label(),
                th.importing,
                quantity,
                limit
            )));
        }
    }
    if let Some(capacity) = available_capacity(th, policy) {
        if capacity - (quantity as i128) < 0 {
            return Err(QuotaError::NoCapacity(format!(
                "{}: {} capacity left, {} requested",
                th.label(),
                capacity,
                quantity
            )));
        }
    }
    Ok(())
}

fn shift(counter: &mut i64, delta: i64, what: &str) -> Result<(), QuotaError> {
    *counter = counter
        .checked_add(delta)
        .ok_or_else(|| QuotaError::InvalidData(format!("{} overflows", what)))?;
    Ok(())
}

/// Books the reservation of a checked leg.
pub fn reserve(h: &mut Holding, th: &mut Holding, quantity: i64) -> Result<(), QuotaError> {
    match LegKind::of(quantity) {
        LegKind::Export => {
            shift(&mut h.exporting, quantity, "exporting")?;
            shift(&mut th.importing, quantity, "importing")?;
        }
        LegKind::Release => {
            let amount = quantity
                .checked_neg()
                .ok_or_else(|| QuotaError::InvalidData("quantity overflows".to_string()))?;
            shift(&mut h.returning, amount, "returning")?;
            shift(&mut th.releasing, amount, "releasing")?;
        }
    }
    Ok(())
}

/// Moves a reserved leg into the settled counters (commission accepted).
pub fn settle(h: &mut Holding, th: &mut Holding, quantity: i64) -> Result<(), QuotaError> {
    match LegKind::of(quantity) {
        LegKind::Export => {
            shift(&mut h.exporting, -quantity, "exporting")?;
            shift(&mut h.exported, quantity, "exported")?;
            shift(&mut th.importing, -quantity, "importing")?;
            shift(&mut th.imported, quantity, "imported")?;
        }
        LegKind::Release => {
            shift(&mut h.returning, quantity, "returning")?;
            shift(&mut h.returned, -quantity, "returned")?;
            shift(&mut th.releasing, quantity, "releasing")?;
            shift(&mut th.released, -quantity, "released")?;
        }
    }
    h.check_non_negative()?;
    th.check_non_negative()
}

/// Undoes the reservation of a leg (commission rejected).
pub fn unreserve(h: &mut Holding, th: &mut Holding, quantity: i64) -> Result<(), QuotaError> {
    match LegKind::of(quantity) {
        LegKind::Export => {
            shift(&mut h.exporting, -quantity, "exporting")?;
            shift(&mut th.importing, -quantity, "importing")?;
        }
        LegKind::Release => {
            shift(&mut h.returning, quantity, "returning")?;
            shift(&mut th.releasing, quantity, "releasing")?;
        }
    }
    h.check_non_negative()?;
    th.check_non_negative()
}

/// Adds a signed delta to a limit; unbounded stays unbounded.
pub fn add_limit(value: Option<i64>, delta: i64, what: &str) -> Result<Option<i64>, QuotaError> {
    match value {
        None => Ok(None),
        Some(v) => v
            .checked_add(delta)
            .map(Some)
            .ok_or_else(|| QuotaError::InvalidData(format!("{} overflows", what))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Holding, Policy, Holding, Policy) {
        let h = Holding::new("system", "cpu", "sys", 0);
        let hp = Policy::new("sys", Some(100), None, None, Some(50));
        let th = Holding::new("alice", "cpu", "alice", 0);
        let tp = Policy::new("alice", Some(0), Some(40), Some(30), None);
        (h, hp, th, tp)
    }

    #[test]
    fn test_export_leg_checks_in_order() {
        let (h, hp, th, tp) = pair();

        assert!(check_source(&h, &hp, 50).is_ok());
        assert!(matches!(check_source(&h, &hp, 51), Err(QuotaError::ExportLimit(_))));

        let tight = Policy::new("sys", Some(10), None, None, None);
        assert!(matches!(check_source(&h, &tight, 11), Err(QuotaError::NoQuantity(_))));

        assert!(check_target(&th, &tp, 30).is_ok());
        assert!(matches!(check_target(&th, &tp, 31), Err(QuotaError::ImportLimit(_))));

        let small = Policy::new("alice", Some(0), Some(5), None, None);
        assert!(matches!(check_target(&th, &small, 6), Err(QuotaError::NoCapacity(_))));
    }

    #[test]
    fn test_reserve_settle_moves_exact_quantity() {
        let (mut h, _, mut th, _) = pair();

        reserve(&mut h, &mut th, 10).unwrap();
        assert_eq!(h.exporting, 10);
        assert_eq!(th.importing, 10);

        settle(&mut h, &mut th, 10).unwrap();
        assert_eq!(h.exporting, 0);
        assert_eq!(h.exported, 10);
        assert_eq!(th.importing, 0);
        assert_eq!(th.imported, 10);
    }

    #[test]
    fn test_release_leg_counters() {
        let (mut h, hp, mut th, tp) = pair();
        th.imported = 10;
        h.exported = 10;

        // alice hands 4 back to system: source is alice, target is system
        check_source(&th, &tp, -4).unwrap();
        check_target(&h, &hp, -4).unwrap();
        reserve(&mut th, &mut h, -4).unwrap();
        assert_eq!(th.returning, 4);
        assert_eq!(h.releasing, 4);

        settle(&mut th, &mut h, -4).unwrap();
        assert_eq!(th.returning, 0);
        assert_eq!(th.returned, 4);
        assert_eq!(h.releasing, 0);
        assert_eq!(h.released, 4);
    }

    #[test]
    fn test_unreserve_restores_counters() {
        let (mut h, _, mut th, _) = pair();
        let (before_h, before_th) = (h.clone(), th.clone());

        reserve(&mut h, &mut th, 7).unwrap();
        unreserve(&mut h, &mut th, 7).unwrap();
        assert_eq!(h, before_h);
        assert_eq!(th, before_th);

        reserve(&mut h, &mut th, -3).unwrap();
        unreserve(&mut h, &mut th, -3).unwrap();
        assert_eq!(h, before_h);
        assert_eq!(th, before_th);
    }

    #[test]
    fn test_settle_without_reservation_is_corruption() {
        let (mut h, _, mut th, _) = pair();
        assert!(matches!(settle(&mut h, &mut th, 5), Err(QuotaError::Corrupted(_))));
    }

    #[test]
    fn test_unbounded_policies_never_refuse() {
        let h = Holding::new("system", "cpu", "u", 0);
        let policy = Policy::unbounded("u");
        assert!(check_source(&h, &policy, i64::MAX).is_ok());
        assert!(check_target(&h, &policy, i64::MAX).is_ok());
        assert_eq!(available_quantity(&h, &policy), None);
    }

    #[test]
    fn test_add_limit() {
        assert_eq!(add_limit(None, 5, "capacity").unwrap(), None);
        assert_eq!(add_limit(Some(3), -2, "capacity").unwrap(), Some(1));
        assert!(add_limit(Some(i64::MAX), 1, "capacity").is_err());
    }
}
