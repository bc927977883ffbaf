//! In-process `RecordStore` with failure injection, used by tests and
//! offline rehearsals of a fix run.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use roster_core::{DocumentPath, MembershipRecord, MirrorRecord, Mutation, WriteKind};
use tokio::sync::Mutex;

use crate::{RecordStore, StoreError, MAX_WRITES_PER_COMMIT};

type MirrorKey = (String, String);

#[derive(Debug, Default)]
struct MemoryState {
    members: BTreeMap<String, MembershipRecord>,
    mirrors: BTreeMap<MirrorKey, MirrorRecord>,
    failing_lookups: HashSet<MirrorKey>,
    failing_writes: HashSet<DocumentPath>,
    offline: bool,
    unauthenticated: bool,
    commit_sizes: Vec<usize>,
    lookups: usize,
    clock: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_members(members: impl IntoIterator<Item = MembershipRecord>) -> Self {
        let state = MemoryState {
            members: members.into_iter().map(|m| (m.id.clone(), m)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn insert_member(&self, record: MembershipRecord) {
        self.state.lock().await.members.insert(record.id.clone(), record);
    }

    pub async fn insert_mirror(&self, organization_id: &str, user_id: &str, mirror: MirrorRecord) {
        self.state
            .lock()
            .await
            .mirrors
            .insert((organization_id.to_string(), user_id.to_string()), mirror);
    }

    pub async fn member(&self, id: &str) -> Option<MembershipRecord> {
        self.state.lock().await.members.get(id).cloned()
    }

    pub async fn members(&self) -> Vec<MembershipRecord> {
        self.state.lock().await.members.values().cloned().collect()
    }

    pub async fn mirror(&self, organization_id: &str, user_id: &str) -> Option<MirrorRecord> {
        self.state
            .lock()
            .await
            .mirrors
            .get(&(organization_id.to_string(), user_id.to_string()))
            .cloned()
    }

    pub async fn mirror_count(&self) -> usize {
        self.state.lock().await.mirrors.len()
    }

    /// Sizes of every successful commit, in order.
    pub async fn commit_sizes(&self) -> Vec<usize> {
        self.state.lock().await.commit_sizes.clone()
    }

    pub async fn lookup_count(&self) -> usize {
        self.state.lock().await.lookups
    }

    /// Make lookups of one mirror fail with a permission error.
    pub async fn fail_lookup(&self, organization_id: &str, user_id: &str) {
        self.state
            .lock()
            .await
            .failing_lookups
            .insert((organization_id.to_string(), user_id.to_string()));
    }

    /// Reject any commit that touches `path`.
    pub async fn fail_writes_to(&self, path: DocumentPath) {
        self.state.lock().await.failing_writes.insert(path);
    }

    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    pub async fn revoke_credentials(&self) {
        self.state.lock().await.unauthenticated = true;
    }

    /// Pin the time used to resolve server timestamps.
    pub async fn freeze_clock(&self, at: DateTime<Utc>) {
        self.state.lock().await.clock = Some(at);
    }
}

impl MemoryState {
    fn guard(&self) -> Result<(), StoreError> {
        if self.unauthenticated {
            return Err(StoreError::Unauthenticated("credentials revoked".into()));
        }
        if self.offline {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }

    fn check(&self, write: &Mutation) -> Result<(), StoreError> {
        if self.failing_writes.contains(&write.path) {
            return Err(StoreError::Rejected(format!(
                "injected failure for {:?}",
                write.path
            )));
        }
        let exists = match &write.path {
            DocumentPath::Member { id } => self.members.contains_key(id),
            DocumentPath::Mirror {
                organization_id,
                user_id,
            } => self
                .mirrors
                .contains_key(&(organization_id.clone(), user_id.clone())),
        };
        match (write.kind, exists, &write.path) {
            (WriteKind::Create, _, DocumentPath::Member { id }) => Err(StoreError::Rejected(
                format!("member {id} cannot be created by reconciliation"),
            )),
            (WriteKind::Create, true, path) => {
                Err(StoreError::Rejected(format!("{path:?} already exists")))
            }
            (WriteKind::Update, false, path) => {
                Err(StoreError::Rejected(format!("{path:?} does not exist")))
            }
            _ => Ok(()),
        }
    }

    fn apply(&mut self, write: &Mutation, now: DateTime<Utc>) {
        match &write.path {
            DocumentPath::Member { id } => {
                if let Some(record) = self.members.get_mut(id) {
                    record.apply(write, now);
                }
            }
            DocumentPath::Mirror {
                organization_id,
                user_id,
            } => {
                let key = (organization_id.clone(), user_id.clone());
                match write.kind {
                    WriteKind::Create => {
                        self.mirrors.insert(key, MirrorRecord::from_create(write, now));
                    }
                    WriteKind::Update => {
                        if let Some(mirror) = self.mirrors.get_mut(&key) {
                            mirror.apply(write, now);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn list_members(&self) -> Result<Vec<MembershipRecord>, StoreError> {
        let state = self.state.lock().await;
        state.guard()?;
        Ok(state.members.values().cloned().collect())
    }

    async fn get_mirror(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> Result<Option<MirrorRecord>, StoreError> {
        let mut state = self.state.lock().await;
        state.guard()?;
        state.lookups += 1;
        let key = (organization_id.to_string(), user_id.to_string());
        if state.failing_lookups.contains(&key) {
            return Err(StoreError::HttpStatus {
                status: 403,
                url: format!("memory://organizations/{organization_id}/members/{user_id}"),
                body: "PERMISSION_DENIED".into(),
            });
        }
        Ok(state.mirrors.get(&key).cloned())
    }

    /// All-or-nothing, like a real batched commit.
    async fn commit(&self, writes: &[Mutation]) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.guard()?;
        if writes.len() > MAX_WRITES_PER_COMMIT {
            return Err(StoreError::Rejected(format!(
                "{} writes exceed the per-commit limit",
                writes.len()
            )));
        }
        for write in writes {
            state.check(write)?;
        }
        let now = state.clock.unwrap_or_else(Utc::now);
        for write in writes {
            state.apply(write, now);
        }
        state.commit_sizes.push(writes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::{fields, FieldValue, Role};

    #[tokio::test]
    async fn commits_are_atomic() {
        let store = MemoryStore::with_members([MembershipRecord::new("m1", Role::Legacy)]);
        let good = Mutation::update(DocumentPath::Member { id: "m1".into() })
            .set(fields::ROLE, FieldValue::Text("technician".into()));
        let bad = Mutation::update(DocumentPath::Member { id: "ghost".into() })
            .set(fields::ROLE, FieldValue::Text("technician".into()));

        assert!(store.commit(&[good.clone(), bad]).await.is_err());
        assert_eq!(store.member("m1").await.unwrap().role, Role::Legacy);
        assert!(store.commit_sizes().await.is_empty());

        store.commit(&[good]).await.unwrap();
        assert_eq!(store.member("m1").await.unwrap().role, Role::Technician);
        assert_eq!(store.commit_sizes().await, vec![1]);
    }

    #[tokio::test]
    async fn mirrors_are_created_once_and_never_over_a_live_document() {
        let store = MemoryStore::new();
        let path = DocumentPath::Mirror {
            organization_id: "org1".into(),
            user_id: "u1".into(),
        };
        let create = Mutation::create(path.clone())
            .set(fields::ROLE, FieldValue::Text("admin".into()))
            .set(fields::ACTIVE, FieldValue::Flag(true))
            .touch(fields::CREATED_AT);

        store.commit(&[create.clone()]).await.unwrap();
        let mirror = store.mirror("org1", "u1").await.unwrap();
        assert_eq!(mirror.role, Role::Admin);
        assert_eq!(mirror.active, Some(true));
        assert!(mirror.created_at.is_some());

        let err = store.commit(&[create]).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn injected_lookup_failures_are_not_fatal() {
        let store = MemoryStore::new();
        store.fail_lookup("org1", "u1").await;
        let err = store.get_mirror("org1", "u1").await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(store.get_mirror("org1", "u2").await.unwrap(), None);
        assert_eq!(store.lookup_count().await, 2);
    }
}
