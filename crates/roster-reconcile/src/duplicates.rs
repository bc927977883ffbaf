//! Duplicate-email detection and deterministic primary selection.

use std::collections::HashMap;

use roster_core::{DuplicateKey, MembershipRecord};

/// Active records sharing one (organization, normalized email) key.
#[derive(Debug, Clone)]
pub struct DuplicateSet<'a> {
    pub key: DuplicateKey,
    pub primary: &'a MembershipRecord,
    /// Every other active member; the ones dedupe deactivates.
    pub duplicates: Vec<&'a MembershipRecord>,
}

impl DuplicateSet<'_> {
    pub fn member_count(&self) -> usize {
        self.duplicates.len() + 1
    }
}

/// Group active records by key. Inactive records never collide: a retired
/// membership must not outrank a re-invited one.
pub fn group_by_key(records: &[MembershipRecord]) -> HashMap<DuplicateKey, Vec<&MembershipRecord>> {
    let mut groups: HashMap<DuplicateKey, Vec<&MembershipRecord>> = HashMap::new();
    for record in records.iter().filter(|r| r.active) {
        if let Some(key) = record.duplicate_key() {
            groups.entry(key).or_default().push(record);
        }
    }
    groups
}

/// Sort a group into resolution order; the first element is the primary.
pub fn resolve(mut members: Vec<&MembershipRecord>) -> Vec<&MembershipRecord> {
    members.sort_by(|a, b| a.resolution_cmp(b));
    members
}

/// Every key held by more than one active record, ordered by key.
pub fn find_duplicate_sets(records: &[MembershipRecord]) -> Vec<DuplicateSet<'_>> {
    let mut sets: Vec<DuplicateSet<'_>> = group_by_key(records)
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|(key, members)| {
            let mut ordered = resolve(members).into_iter();
            let primary = ordered.next()?;
            Some(DuplicateSet {
                key,
                primary,
                duplicates: ordered.collect(),
            })
        })
        .collect();
    sets.sort_by(|a, b| a.key.cmp(&b.key));
    sets
}
