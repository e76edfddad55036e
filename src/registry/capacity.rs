use crate::core::{EntityId, EntityRecord, OwnerId};
use std::collections::HashMap;

/// Per-owner cap on parked vehicles.
///
/// Never refuses a park: when the owner is at the cap, the vehicle saved
/// longest ago makes room. Driven vehicles do not count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    max_per_owner: usize,
}

impl CapacityPolicy {
    pub fn new(max_per_owner: usize) -> Self {
        Self {
            max_per_owner: max_per_owner.max(1),
        }
    }

    pub fn max_per_owner(&self) -> usize {
        self.max_per_owner
    }

    /// Ids to evict so that `owner` stays within the cap once `incoming` is
    /// stored, oldest `(saved_at, id)` first.
    pub fn select_evictions(
        &self,
        records: &HashMap<EntityId, EntityRecord>,
        owner: &OwnerId,
        incoming: &EntityId,
    ) -> Vec<EntityId> {
        let mut parked = records
            .values()
            .filter(|r| &r.owner_id == owner && !r.being_used && &r.id != incoming)
            .map(|r| (r.saved_at, r.id.clone()))
            .collect::<Vec<_>>();

        if parked.len() < self.max_per_owner {
            return Vec::new();
        }

        parked.sort();
        let excess = parked.len() + 1 - self.max_per_owner;
        parked.into_iter().take(excess).map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn parked(plate: &str, owner: &str, minutes: i64) -> EntityRecord {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        EntityRecord::new(EntityId::parse(plate).unwrap(), owner, "issi")
            .saved_at(base + Duration::minutes(minutes))
    }

    fn table(records: Vec<EntityRecord>) -> HashMap<EntityId, EntityRecord> {
        records.into_iter().map(|r| (r.id.clone(), r)).collect()
    }

    #[test]
    fn test_under_cap_evicts_nothing() {
        let policy = CapacityPolicy::new(3);
        let records = table(vec![parked("A1", "o", 0), parked("A2", "o", 1)]);
        let incoming = EntityId::parse("A3").unwrap();
        assert!(policy.select_evictions(&records, &"o".into(), &incoming).is_empty());
    }

    #[test]
    fn test_at_cap_evicts_oldest() {
        let policy = CapacityPolicy::new(2);
        let records = table(vec![parked("NEW", "o", 5), parked("OLD", "o", 1)]);
        let incoming = EntityId::parse("A3").unwrap();
        assert_eq!(
            policy.select_evictions(&records, &"o".into(), &incoming),
            vec![EntityId::parse("OLD").unwrap()]
        );
    }

    #[test]
    fn test_reparking_same_id_is_not_counted() {
        let policy = CapacityPolicy::new(2);
        let records = table(vec![parked("A1", "o", 0), parked("A2", "o", 1)]);
        let incoming = EntityId::parse("A2").unwrap();
        assert!(policy.select_evictions(&records, &"o".into(), &incoming).is_empty());
    }

    #[test]
    fn test_driven_and_foreign_records_ignored() {
        let policy = CapacityPolicy::new(1);
        let records = table(vec![
            parked("MINE", "o", 0).in_use(true),
            parked("THEIRS", "other", 0),
        ]);
        let incoming = EntityId::parse("A3").unwrap();
        assert!(policy.select_evictions(&records, &"o".into(), &incoming).is_empty());
    }

    #[test]
    fn test_tie_broken_by_id() {
        let policy = CapacityPolicy::new(2);
        let records = table(vec![parked("BBB", "o", 0), parked("AAA", "o", 0)]);
        let incoming = EntityId::parse("CCC").unwrap();
        assert_eq!(
            policy.select_evictions(&records, &"o".into(), &incoming),
            vec![EntityId::parse("AAA").unwrap()]
        );
    }

    #[test]
    fn test_over_cap_after_shrink_evicts_down_to_cap() {
        let policy = CapacityPolicy::new(2);
        let records = table(vec![
            parked("A1", "o", 0),
            parked("A2", "o", 1),
            parked("A3", "o", 2),
            parked("A4", "o", 3),
        ]);
        let incoming = EntityId::parse("A5").unwrap();
        let evicted = policy.select_evictions(&records, &"o".into(), &incoming);
        assert_eq!(evicted.len(), 3);
        assert_eq!(evicted[0], EntityId::parse("A1").unwrap());
    }
}
