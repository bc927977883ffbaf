//! Per-record anomaly classification. Pure and deterministic.

use std::fmt;

use roster_core::{MembershipRecord, Role};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AnomalyKind {
    LegacyRole,
    InvalidRole,
    MissingOrganization,
    MissingCreatedAt,
    MissingUpdatedAt,
    ViewerPermissionsOnNonViewer,
    FreelanceWithPermissions,
    DuplicateEmail,
    MirrorMissing,
    MirrorRoleMismatch,
    MirrorActiveMismatch,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 11] = [
        AnomalyKind::LegacyRole,
        AnomalyKind::InvalidRole,
        AnomalyKind::MissingOrganization,
        AnomalyKind::MissingCreatedAt,
        AnomalyKind::MissingUpdatedAt,
        AnomalyKind::ViewerPermissionsOnNonViewer,
        AnomalyKind::FreelanceWithPermissions,
        AnomalyKind::DuplicateEmail,
        AnomalyKind::MirrorMissing,
        AnomalyKind::MirrorRoleMismatch,
        AnomalyKind::MirrorActiveMismatch,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::LegacyRole => "legacy-role",
            Self::InvalidRole => "invalid-role",
            Self::MissingOrganization => "missing-organization",
            Self::MissingCreatedAt => "missing-created-at",
            Self::MissingUpdatedAt => "missing-updated-at",
            Self::ViewerPermissionsOnNonViewer => "viewer-permissions-on-non-viewer",
            Self::FreelanceWithPermissions => "freelance-with-permissions",
            Self::DuplicateEmail => "duplicate-email",
            Self::MirrorMissing => "mirror-missing",
            Self::MirrorRoleMismatch => "mirror-role-mismatch",
            Self::MirrorActiveMismatch => "mirror-active-mismatch",
        }
    }

    /// Which fix category repairs this anomaly, if any.
    pub fn remedy(self) -> &'static str {
        match self {
            Self::LegacyRole => "fix --roles",
            Self::MissingCreatedAt | Self::MissingUpdatedAt => "fix --timestamps",
            Self::ViewerPermissionsOnNonViewer | Self::FreelanceWithPermissions => {
                "fix --viewer-permissions"
            }
            Self::DuplicateEmail => "fix --dedupe-emails",
            Self::MirrorMissing | Self::MirrorRoleMismatch | Self::MirrorActiveMismatch => {
                "fix --mirrors"
            }
            Self::InvalidRole | Self::MissingOrganization => "manual review",
        }
    }
}

impl fmt::Display for AnomalyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Every record-local anomaly of `record`, in `AnomalyKind` order.
pub fn classify(record: &MembershipRecord) -> Vec<AnomalyKind> {
    let mut found = Vec::new();

    match &record.role {
        Role::Legacy => found.push(AnomalyKind::LegacyRole),
        role if !role.is_allowed() => found.push(AnomalyKind::InvalidRole),
        _ => {}
    }
    if record.organization().is_none() {
        found.push(AnomalyKind::MissingOrganization);
    }
    if record.created_at.is_none() {
        found.push(AnomalyKind::MissingCreatedAt);
    }
    if record.updated_at.is_none() {
        found.push(AnomalyKind::MissingUpdatedAt);
    }
    if !record.viewer_permissions.is_empty() {
        if record.role != Role::Viewer {
            found.push(AnomalyKind::ViewerPermissionsOnNonViewer);
        }
        if record.role == Role::Freelance {
            found.push(AnomalyKind::FreelanceWithPermissions);
        }
    }

    found
}

/// One-line explanation of why `record` falls into `kind`.
pub fn explain(kind: AnomalyKind, record: &MembershipRecord) -> String {
    match kind {
        AnomalyKind::LegacyRole | AnomalyKind::InvalidRole => {
            format!("role {}", record.role)
        }
        AnomalyKind::ViewerPermissionsOnNonViewer | AnomalyKind::FreelanceWithPermissions => {
            format!(
                "role {} carries viewerPermissions {:?}",
                record.role, record.viewer_permissions
            )
        }
        other => other.label().replace('-', " "),
    }
}
