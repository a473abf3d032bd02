//! Pure set reconciliation between a remote snapshot and the local store.

use std::collections::{BTreeMap, HashMap};

use invsync_core::{normalize_identifier, InventoryRecord, RawRecord, TrackedField};
use serde::Serialize;

use crate::error::CompareError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
    pub field: TrackedField,
    pub old: Option<String>,
    pub new: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangedRecord {
    pub identifier: String,
    pub remote: RawRecord,
    pub previous: InventoryRecord,
    /// Every differing tracked field, in tracked-field order.
    pub field_changes: Vec<FieldChange>,
}

impl ChangedRecord {
    /// The first differing field; what a one-line display shows.
    pub fn headline(&self) -> Option<&FieldChange> {
        self.field_changes.first()
    }

    pub fn price_change(&self) -> Option<&FieldChange> {
        self.field_changes.iter().find(|c| c.field == TrackedField::Price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewRecord {
    pub remote: RawRecord,
    pub reactivated: bool,
    /// The archived local record when `reactivated`.
    pub previous: Option<InventoryRecord>,
}

impl NewRecord {
    pub fn identifier(&self) -> &str {
        &self.remote.identifier
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiffResult {
    pub matched: Vec<String>,
    pub changed: Vec<ChangedRecord>,
    pub new_remote: Vec<NewRecord>,
    pub gone_local: Vec<InventoryRecord>,
    /// Distinct remote identifiers after last-seen-wins collapsing.
    pub remote_count: usize,
    pub local_active_count: usize,
    /// Remote records dropped for a blank identifier.
    pub dropped_blank: usize,
}

impl DiffResult {
    pub fn has_drift(&self) -> bool {
        !(self.changed.is_empty() && self.new_remote.is_empty() && self.gone_local.is_empty())
    }

    pub fn reactivated_count(&self) -> usize {
        self.new_remote.iter().filter(|n| n.reactivated).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "Remote: {} | Local: {} | Matched: {} | New: {} | Gone: {} | Changed: {}",
            self.remote_count,
            self.local_active_count,
            self.matched.len(),
            self.new_remote.len(),
            self.gone_local.len(),
            self.changed.len()
        )
    }
}

/// Tracked fields whose remote value is known and differs from the local one.
pub fn field_changes(remote: &RawRecord, local: &InventoryRecord) -> Vec<FieldChange> {
    let remote_price = remote.normalized_price();
    TrackedField::ALL
        .iter()
        .filter_map(|&field| {
            let new = field.value_of(remote_price, &remote.attributes)?;
            let old = field.value_of(local.price, &local.attributes);
            (old.as_deref() != Some(new.as_str())).then_some(FieldChange {
                field,
                old,
                new: Some(new),
            })
        })
        .collect()
}

/// Classifies every identifier of `remote ∪ active(local)` into exactly one partition.
///
/// `local` is the whole store (archived records included); archived records only serve to
/// flag reactivations and never land in `gone_local`.
pub fn compare(remote: Vec<RawRecord>, local: &[InventoryRecord]) -> Result<DiffResult, CompareError> {
    let mut by_id: HashMap<&str, &InventoryRecord> = HashMap::with_capacity(local.len());
    for record in local {
        if by_id.insert(record.identifier.as_str(), record).is_some() {
            return Err(CompareError::DuplicateLocal {
                identifier: record.identifier.clone(),
            });
        }
    }

    let mut dropped_blank = 0;
    let mut latest: BTreeMap<String, RawRecord> = BTreeMap::new();
    for mut raw in remote {
        let identifier = normalize_identifier(&raw.identifier);
        if identifier.is_empty() {
            dropped_blank += 1;
            continue;
        }
        raw.identifier = identifier.clone();
        latest.insert(identifier, raw);
    }
    if latest.is_empty() {
        return Err(CompareError::EmptySnapshot);
    }

    let mut diff = DiffResult {
        remote_count: latest.len(),
        local_active_count: local.iter().filter(|r| r.active).count(),
        dropped_blank,
        ..DiffResult::default()
    };

    for (identifier, raw) in latest.iter() {
        match by_id.get(identifier.as_str()) {
            Some(existing) if existing.active => {
                let changes = field_changes(raw, existing);
                if changes.is_empty() {
                    diff.matched.push(identifier.clone());
                } else {
                    diff.changed.push(ChangedRecord {
                        identifier: identifier.clone(),
                        remote: raw.clone(),
                        previous: (*existing).clone(),
                        field_changes: changes,
                    });
                }
            }
            Some(archived) => diff.new_remote.push(NewRecord {
                remote: raw.clone(),
                reactivated: true,
                previous: Some((*archived).clone()),
            }),
            None => diff.new_remote.push(NewRecord {
                remote: raw.clone(),
                reactivated: false,
                previous: None,
            }),
        }
    }

    diff.gone_local = local
        .iter()
        .filter(|r| r.active && !latest.contains_key(&r.identifier))
        .cloned()
        .collect();

    Ok(diff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use invsync_core::Price;
    use std::collections::HashSet;

    fn local(identifier: &str, amount: f64) -> InventoryRecord {
        InventoryRecord::from_raw(&RawRecord::new(identifier).with_price(amount), Utc::now())
    }

    fn archived(identifier: &str, amount: f64) -> InventoryRecord {
        let mut record = local(identifier, amount);
        record.active = false;
        record
    }

    #[test]
    fn price_drop_and_new_listing() {
        let diff = compare(
            vec![
                RawRecord::new("VIN123").with_price(18_500.0),
                RawRecord::new("VIN456").with_price(15_000.0),
            ],
            &[local("VIN123", 20_000.0)],
        )
        .unwrap();

        assert!(diff.matched.is_empty());
        assert_eq!(diff.changed.len(), 1);
        let change = diff.changed[0].headline().unwrap();
        assert_eq!(change.field, TrackedField::Price);
        assert_eq!(change.old.as_deref(), Some("20000"));
        assert_eq!(change.new.as_deref(), Some("18500"));
        assert_eq!(diff.new_remote.len(), 1);
        assert_eq!(diff.new_remote[0].identifier(), "VIN456");
        assert!(!diff.new_remote[0].reactivated);
        assert!(diff.gone_local.is_empty());
    }

    #[test]
    fn identical_snapshots_have_no_drift() {
        let diff = compare(
            vec![RawRecord::new("A").with_price(1.0), RawRecord::new("B").with_price(2.0)],
            &[local("A", 1.0), local("B", 2.0)],
        )
        .unwrap();
        assert!(!diff.has_drift());
        assert_eq!(diff.matched, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(
            diff.summary(),
            "Remote: 2 | Local: 2 | Matched: 2 | New: 0 | Gone: 0 | Changed: 0"
        );
    }

    #[test]
    fn missing_remote_marks_gone_but_archived_stay_out() {
        let diff = compare(
            vec![RawRecord::new("VIN1").with_price(10.0)],
            &[local("VIN1", 10.0), local("VIN789", 5.0), archived("VIN000", 3.0)],
        )
        .unwrap();
        let gone: Vec<_> = diff.gone_local.iter().map(|r| r.identifier.as_str()).collect();
        assert_eq!(gone, vec!["VIN789"]);
        assert_eq!(diff.local_active_count, 2);
    }

    #[test]
    fn archived_record_reappearing_is_reactivated() {
        let diff = compare(vec![RawRecord::new("VIN9").with_price(9.0)], &[archived("VIN9", 9.0)]).unwrap();
        assert!(diff.changed.is_empty());
        assert_eq!(diff.new_remote.len(), 1);
        assert!(diff.new_remote[0].reactivated);
        assert_eq!(diff.new_remote[0].previous.as_ref().unwrap().price, Some(Price::from_cents(900)));
    }

    #[test]
    fn unknown_remote_values_are_not_changes() {
        let mut known = local("VIN1", 100.0);
        known.attributes.make = Some("Ford".into());
        let mut remote = RawRecord::new("VIN1");
        remote.attributes.mileage = Some(1200);

        let diff = compare(vec![remote], &[known]).unwrap();
        assert_eq!(diff.changed.len(), 1);
        let fields: Vec<_> = diff.changed[0].field_changes.iter().map(|c| c.field).collect();
        assert_eq!(fields, vec![TrackedField::Mileage]);
        assert!(diff.changed[0].price_change().is_none());
    }

    #[test]
    fn all_differing_fields_are_reported_in_order() {
        let mut known = local("VIN1", 100.0);
        known.attributes.model = Some("Civic".into());
        known.attributes.year = Some(2019);
        let mut remote = RawRecord::new("VIN1").with_price(95.0);
        remote.attributes.model = Some("Accord".into());
        remote.attributes.year = Some(2020);

        let diff = compare(vec![remote], &[known]).unwrap();
        let fields: Vec<_> = diff.changed[0].field_changes.iter().map(|c| c.field).collect();
        assert_eq!(fields, vec![TrackedField::Price, TrackedField::Year, TrackedField::Model]);
    }

    #[test]
    fn duplicates_collapse_last_seen_wins_and_identifiers_normalize() {
        let diff = compare(
            vec![
                RawRecord::new(" vin1 ").with_price(10.0),
                RawRecord::new("VIN1").with_price(12.0),
                RawRecord::new("   "),
            ],
            &[local("VIN1", 12.0)],
        )
        .unwrap();
        assert_eq!(diff.matched, vec!["VIN1".to_string()]);
        assert_eq!(diff.remote_count, 1);
        assert_eq!(diff.dropped_blank, 1);
    }

    #[test]
    fn malformed_pairings_are_rejected() {
        assert_eq!(compare(vec![], &[local("A", 1.0)]), Err(CompareError::EmptySnapshot));
        assert_eq!(compare(vec![RawRecord::new(" ")], &[]), Err(CompareError::EmptySnapshot));
        assert_eq!(
            compare(vec![RawRecord::new("A")], &[local("A", 1.0), local("A", 2.0)]),
            Err(CompareError::DuplicateLocal { identifier: "A".into() })
        );
    }

    #[test]
    fn partitions_are_exhaustive_and_disjoint() {
        let locals = vec![
            local("A", 1.0),
            local("B", 2.0),
            local("C", 3.0),
            archived("D", 4.0),
            local("E", 5.0),
        ];
        let remote = vec![
            RawRecord::new("A").with_price(1.0),
            RawRecord::new("B").with_price(2.5),
            RawRecord::new("D").with_price(4.0),
            RawRecord::new("F").with_price(6.0),
            RawRecord::new("E"),
        ];
        let diff = compare(remote, &locals).unwrap();

        let mut seen = HashSet::new();
        let all = diff
            .matched
            .iter()
            .map(String::as_str)
            .chain(diff.changed.iter().map(|c| c.identifier.as_str()))
            .chain(diff.new_remote.iter().map(|n| n.identifier()))
            .chain(diff.gone_local.iter().map(|r| r.identifier.as_str()));
        for identifier in all {
            assert!(seen.insert(identifier.to_string()), "{identifier} in two partitions");
        }
        let expected: HashSet<String> = ["A", "B", "C", "D", "E", "F"].iter().map(|s| s.to_string()).collect();
        assert_eq!(seen, expected);
    }
}
