//! Typed membership model shared by the audit and fix jobs.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "roster-core";

/// Role value written by older clients before the role set was fixed.
pub const LEGACY_ROLE: &str = "member";

/// Collection holding the per-organization authorization mirrors.
pub const MIRROR_ROOT: &str = "organizations";
pub const MIRROR_COLLECTION: &str = "members";

/// Document field names as stored.
pub mod fields {
    pub const ORGANIZATION_ID: &str = "organizationId";
    pub const USER_ID: &str = "userId";
    pub const EMAIL: &str = "email";
    pub const ROLE: &str = "role";
    pub const VIEWER_PERMISSIONS: &str = "viewerPermissions";
    pub const ACTIVE: &str = "active";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
    pub const DUPLICATE_OF: &str = "duplicateOf";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Owner,
    Admin,
    Technician,
    Freelance,
    Viewer,
    /// The pre-migration `"member"` value.
    Legacy,
    /// Anything else, including an absent role (empty string).
    Unrecognized(String),
}

impl Role {
    /// Role the legacy value maps onto during repair.
    pub const LEGACY_REPLACEMENT: Role = Role::Technician;

    pub fn parse(raw: &str) -> Self {
        match raw {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            "technician" => Self::Technician,
            "freelance" => Self::Freelance,
            "viewer" => Self::Viewer,
            LEGACY_ROLE => Self::Legacy,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Technician => "technician",
            Self::Freelance => "freelance",
            Self::Viewer => "viewer",
            Self::Legacy => LEGACY_ROLE,
            Self::Unrecognized(raw) => raw,
        }
    }

    pub fn is_allowed(&self) -> bool {
        !matches!(self, Self::Legacy | Self::Unrecognized(_))
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized(raw) if raw.is_empty() => f.write_str("<none>"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A stored timestamp. Values that cannot be read as an instant are kept
/// verbatim: they still count as present and are never overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordTime {
    Instant(DateTime<Utc>),
    Opaque(String),
}

impl RecordTime {
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Instant(at) => Some(*at),
            Self::Opaque(_) => None,
        }
    }
}

impl fmt::Display for RecordTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant(at) => write!(f, "{}", at.to_rfc3339()),
            Self::Opaque(raw) => write!(f, "{raw:?}"),
        }
    }
}

/// Lower-cased, trimmed email used for uniqueness checks.
pub fn normalize_email(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Grouping key for duplicate detection: organization + normalized email.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DuplicateKey {
    pub organization_id: String,
    pub email: String,
}

impl fmt::Display for DuplicateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.organization_id, self.email)
    }
}

/// One membership document from the primary collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipRecord {
    pub id: String,
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub viewer_permissions: Vec<String>,
    pub active: bool,
    pub created_at: Option<RecordTime>,
    pub updated_at: Option<RecordTime>,
    pub duplicate_of: Option<String>,
}

impl MembershipRecord {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            organization_id: None,
            user_id: None,
            email: None,
            role,
            viewer_permissions: Vec::new(),
            active: true,
            created_at: None,
            updated_at: None,
            duplicate_of: None,
        }
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization_id.as_deref().filter(|v| !v.is_empty())
    }

    pub fn account(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|v| !v.is_empty())
    }

    pub fn duplicate_key(&self) -> Option<DuplicateKey> {
        let organization_id = self.organization()?;
        let email = normalize_email(self.email.as_deref()?);
        if email.is_empty() {
            return None;
        }
        Some(DuplicateKey {
            organization_id: organization_id.to_string(),
            email,
        })
    }

    /// Mirror document this record must be reflected in, if it is linked to an account.
    pub fn mirror_path(&self) -> Option<DocumentPath> {
        Some(DocumentPath::Mirror {
            organization_id: self.organization()?.to_string(),
            user_id: self.account()?.to_string(),
        })
    }

    pub fn member_path(&self) -> DocumentPath {
        DocumentPath::Member {
            id: self.id.clone(),
        }
    }

    /// Ordering used to pick the primary of a duplicate set: earliest
    /// `createdAt` first (absent or unreadable sorts last), then `id`.
    pub fn resolution_cmp(&self, other: &Self) -> Ordering {
        let a = self.created_at.as_ref().and_then(RecordTime::instant);
        let b = other.created_at.as_ref().and_then(RecordTime::instant);
        let by_time = match (a, b) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_time.then_with(|| self.id.cmp(&other.id))
    }

    /// Short human label for report lines.
    pub fn label(&self) -> String {
        format!(
            "{} (org={}, email={}, role={})",
            self.id,
            self.organization().unwrap_or("<none>"),
            self.email.as_deref().unwrap_or("<none>"),
            self.role
        )
    }

    /// Fold a planned write into the in-memory snapshot.
    pub fn apply(&mut self, mutation: &Mutation, now: DateTime<Utc>) {
        for (name, value) in &mutation.fields {
            match (name.as_str(), value) {
                (fields::ROLE, FieldValue::Text(role)) => self.role = Role::parse(role),
                (fields::VIEWER_PERMISSIONS, FieldValue::List(items)) => {
                    self.viewer_permissions = items.clone()
                }
                (fields::ACTIVE, FieldValue::Flag(flag)) => self.active = *flag,
                (fields::DUPLICATE_OF, FieldValue::Text(id)) => self.duplicate_of = Some(id.clone()),
                (fields::CREATED_AT, value) => self.created_at = value.as_time(now),
                (fields::UPDATED_AT, value) => self.updated_at = value.as_time(now),
                _ => {}
            }
        }
    }
}

/// Authorization-layer copy of a membership, keyed by organization + account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRecord {
    pub role: Role,
    /// `None` when the stored document has no boolean `active` field.
    pub active: Option<bool>,
    pub created_at: Option<RecordTime>,
    pub updated_at: Option<RecordTime>,
}

impl MirrorRecord {
    /// Build a mirror from a create mutation.
    pub fn from_create(mutation: &Mutation, now: DateTime<Utc>) -> Self {
        let mut mirror = Self {
            role: Role::Unrecognized(String::new()),
            active: None,
            created_at: None,
            updated_at: None,
        };
        mirror.apply(mutation, now);
        mirror
    }

    pub fn apply(&mut self, mutation: &Mutation, now: DateTime<Utc>) {
        for (name, value) in &mutation.fields {
            match (name.as_str(), value) {
                (fields::ROLE, FieldValue::Text(role)) => self.role = Role::parse(role),
                (fields::ACTIVE, FieldValue::Flag(flag)) => self.active = Some(*flag),
                (fields::CREATED_AT, value) => self.created_at = value.as_time(now),
                (fields::UPDATED_AT, value) => self.updated_at = value.as_time(now),
                _ => {}
            }
        }
    }
}

/// Store location of a document, independent of the backend's naming scheme.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentPath {
    Member { id: String },
    Mirror {
        organization_id: String,
        user_id: String,
    },
}

impl DocumentPath {
    /// Path segments below the database root.
    pub fn segments<'a>(&'a self, member_collection: &'a str) -> Vec<&'a str> {
        match self {
            Self::Member { id } => vec![member_collection, id.as_str()],
            Self::Mirror {
                organization_id,
                user_id,
            } => vec![
                MIRROR_ROOT,
                organization_id.as_str(),
                MIRROR_COLLECTION,
                user_id.as_str(),
            ],
        }
    }

    pub fn relative(&self, member_collection: &str) -> String {
        self.segments(member_collection).join("/")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Flag(bool),
    List(Vec<String>),
    /// Resolved by the store at commit time.
    ServerTimestamp,
}

impl FieldValue {
    fn as_time(&self, now: DateTime<Utc>) -> Option<RecordTime> {
        match self {
            Self::ServerTimestamp => Some(RecordTime::Instant(now)),
            Self::Text(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map(|at| RecordTime::Instant(at.with_timezone(&Utc)))
                    .unwrap_or_else(|_| RecordTime::Opaque(raw.clone())),
            ),
            Self::Flag(_) | Self::List(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Flag(flag) => write!(f, "{flag}"),
            Self::List(items) => write!(f, "{items:?}"),
            Self::ServerTimestamp => f.write_str("<server time>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Document must not exist yet.
    Create,
    /// Document must already exist; only the listed fields change.
    Update,
}

/// Minimal field-level write planned by the repair planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mutation {
    pub path: DocumentPath,
    pub kind: WriteKind,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Mutation {
    pub fn create(path: DocumentPath) -> Self {
        Self {
            path,
            kind: WriteKind::Create,
            fields: BTreeMap::new(),
        }
    }

    pub fn update(path: DocumentPath) -> Self {
        Self {
            path,
            kind: WriteKind::Update,
            fields: BTreeMap::new(),
        }
    }

    pub fn set(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    /// Stamp a field with the store's commit time.
    pub fn touch(self, name: &str) -> Self {
        self.set(name, FieldValue::ServerTimestamp)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn describe(&self) -> String {
        self.fields
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
