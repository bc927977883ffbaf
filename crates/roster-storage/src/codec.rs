//! Firestore REST document <-> typed record conversion.
//!
//! Loosely-typed stored values are normalized here, once, so the engine only
//! ever sees `MembershipRecord` / `MirrorRecord`.

use chrono::{DateTime, TimeZone, Utc};
use roster_core::{fields, FieldValue, MembershipRecord, MirrorRecord, Mutation, RecordTime, Role, WriteKind};
use serde_json::{json, Map, Value as JsonValue};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("document has no name")]
    MissingName,
    #[error("document name {0} has no id segment")]
    BadName(String),
}

type Fields = Map<String, JsonValue>;

/// Trailing path segment of a document resource name.
pub fn document_id(doc: &JsonValue) -> Result<String, CodecError> {
    let name = doc
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or(CodecError::MissingName)?;
    name.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| CodecError::BadName(name.to_string()))
}

fn document_fields(doc: &JsonValue) -> Fields {
    doc.get("fields")
        .and_then(JsonValue::as_object)
        .cloned()
        .unwrap_or_default()
}

pub fn decode_member(doc: &JsonValue) -> Result<MembershipRecord, CodecError> {
    let id = document_id(doc)?;
    let stored = document_fields(doc);
    Ok(MembershipRecord {
        id,
        organization_id: string_field(&stored, fields::ORGANIZATION_ID),
        user_id: string_field(&stored, fields::USER_ID),
        email: string_field(&stored, fields::EMAIL),
        role: role_field(&stored, fields::ROLE),
        viewer_permissions: string_list_field(&stored, fields::VIEWER_PERMISSIONS),
        // Only an explicit `false` deactivates a member.
        active: bool_field(&stored, fields::ACTIVE) != Some(false),
        created_at: time_field(&stored, fields::CREATED_AT),
        updated_at: time_field(&stored, fields::UPDATED_AT),
        duplicate_of: string_field(&stored, fields::DUPLICATE_OF),
    })
}

pub fn decode_mirror(doc: &JsonValue) -> MirrorRecord {
    let stored = document_fields(doc);
    MirrorRecord {
        role: role_field(&stored, fields::ROLE),
        active: bool_field(&stored, fields::ACTIVE),
        created_at: time_field(&stored, fields::CREATED_AT),
        updated_at: time_field(&stored, fields::UPDATED_AT),
    }
}

fn string_field(stored: &Fields, name: &str) -> Option<String> {
    let value = stored.get(name)?;
    if let Some(text) = value.get("stringValue").and_then(JsonValue::as_str) {
        return Some(text.to_string());
    }
    value
        .get("integerValue")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

fn bool_field(stored: &Fields, name: &str) -> Option<bool> {
    stored.get(name)?.get("booleanValue")?.as_bool()
}

fn role_field(stored: &Fields, name: &str) -> Role {
    match stored.get(name) {
        Some(value) => match value.get("stringValue").and_then(JsonValue::as_str) {
            Some(text) => Role::parse(text),
            None if value.get("nullValue").is_some() => Role::Unrecognized(String::new()),
            None => Role::Unrecognized(value.to_string()),
        },
        None => Role::Unrecognized(String::new()),
    }
}

fn string_list_field(stored: &Fields, name: &str) -> Vec<String> {
    stored
        .get(name)
        .and_then(|v| v.get("arrayValue"))
        .and_then(|v| v.get("values"))
        .and_then(JsonValue::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.get("stringValue").and_then(JsonValue::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Reads native timestamps, RFC 3339 strings, epoch milliseconds and
/// serialized `{_seconds, _nanoseconds}` maps. Empty/zero/null values count as
/// absent.
fn time_field(stored: &Fields, name: &str) -> Option<RecordTime> {
    let value = stored.get(name)?;
    if let Some(raw) = value.get("timestampValue").and_then(JsonValue::as_str) {
        return Some(parse_time_text(raw));
    }
    if let Some(raw) = value.get("stringValue").and_then(JsonValue::as_str) {
        return (!raw.is_empty()).then(|| parse_time_text(raw));
    }
    if let Some(raw) = value.get("integerValue").and_then(JsonValue::as_str) {
        return match raw.parse::<i64>() {
            Ok(0) => None,
            Ok(millis) => Some(millis_to_time(millis, raw)),
            Err(_) => Some(RecordTime::Opaque(raw.to_string())),
        };
    }
    if let Some(raw) = value.get("doubleValue").and_then(JsonValue::as_f64) {
        return (raw != 0.0).then(|| millis_to_time(raw as i64, &raw.to_string()));
    }
    if let Some(map) = value.get("mapValue").and_then(|m| m.get("fields")) {
        let seconds = map
            .get("_seconds")
            .or_else(|| map.get("seconds"))
            .and_then(|s| s.get("integerValue"))
            .and_then(JsonValue::as_str)
            .and_then(|s| s.parse::<i64>().ok());
        return Some(match seconds.and_then(|s| Utc.timestamp_opt(s, 0).single()) {
            Some(at) => RecordTime::Instant(at),
            None => RecordTime::Opaque(value.to_string()),
        });
    }
    if value.get("nullValue").is_some() || value.get("booleanValue") == Some(&JsonValue::Bool(false)) {
        return None;
    }
    Some(RecordTime::Opaque(value.to_string()))
}

fn parse_time_text(raw: &str) -> RecordTime {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| RecordTime::Instant(at.with_timezone(&Utc)))
        .unwrap_or_else(|_| RecordTime::Opaque(raw.to_string()))
}

fn millis_to_time(millis: i64, raw: &str) -> RecordTime {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(RecordTime::Instant)
        .unwrap_or_else(|| RecordTime::Opaque(raw.to_string()))
}

fn encode_value(value: &FieldValue) -> Option<JsonValue> {
    match value {
        FieldValue::Text(text) => Some(json!({ "stringValue": text })),
        FieldValue::Flag(flag) => Some(json!({ "booleanValue": flag })),
        FieldValue::List(items) if items.is_empty() => Some(json!({ "arrayValue": {} })),
        FieldValue::List(items) => Some(json!({
            "arrayValue": {
                "values": items.iter().map(|i| json!({ "stringValue": i })).collect::<Vec<_>>()
            }
        })),
        FieldValue::ServerTimestamp => None,
    }
}

/// Encode a planned mutation as a `Write` for the `documents:commit` endpoint.
///
/// Server timestamps become field transforms. Updates carry an update mask
/// and an `exists: true` precondition; creates carry `exists: false`.
pub fn encode_write(mutation: &Mutation, documents_root: &str, member_collection: &str) -> JsonValue {
    let name = format!(
        "{}/{}",
        documents_root.trim_end_matches('/'),
        mutation.path.relative(member_collection)
    );

    let mut values = Map::new();
    let mut transforms = Vec::new();
    for (field, value) in &mutation.fields {
        match encode_value(value) {
            Some(encoded) => {
                values.insert(field.clone(), encoded);
            }
            None => transforms.push(json!({
                "fieldPath": field,
                "setToServerValue": "REQUEST_TIME",
            })),
        }
    }

    let mut write = json!({
        "update": { "name": name, "fields": values },
    });
    let exists = match mutation.kind {
        WriteKind::Create => false,
        WriteKind::Update => {
            let mask: Vec<&String> = mutation
                .fields
                .iter()
                .filter(|(_, v)| !matches!(v, FieldValue::ServerTimestamp))
                .map(|(k, _)| k)
                .collect();
            write["updateMask"] = json!({ "fieldPaths": mask });
            true
        }
    };
    write["currentDocument"] = json!({ "exists": exists });
    if !transforms.is_empty() {
        write["updateTransforms"] = JsonValue::Array(transforms);
    }
    write
}

#[cfg(test)]
mod tests {
    use super::*;
    use roster_core::DocumentPath;

    #[test]
    fn decodes_a_member_document_with_loose_values() {
        let doc = json!({
            "name": "projects/p/databases/(default)/documents/organizationMembers/abc",
            "fields": {
                "organizationId": { "stringValue": "org1" },
                "email": { "stringValue": "A@X.com" },
                "role": { "stringValue": "member" },
                "viewerPermissions": { "arrayValue": { "values": [{ "stringValue": "reports" }] } },
                "createdAt": { "integerValue": "1700000000000" },
                "updatedAt": { "stringValue": "" }
            }
        });
        let record = decode_member(&doc).unwrap();
        assert_eq!(record.id, "abc");
        assert_eq!(record.role, Role::Legacy);
        assert_eq!(record.viewer_permissions, vec!["reports".to_string()]);
        assert!(record.active);
        assert!(record.user_id.is_none());
        assert_eq!(
            record.created_at.and_then(|t| t.instant()).map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn only_explicit_false_deactivates() {
        let doc = |active: JsonValue| {
            json!({ "name": "x/m1", "fields": { "active": active } })
        };
        assert!(!decode_member(&doc(json!({ "booleanValue": false }))).unwrap().active);
        assert!(decode_member(&doc(json!({ "stringValue": "false" }))).unwrap().active);
        assert!(decode_member(&doc(json!({ "nullValue": null }))).unwrap().active);
    }

    #[test]
    fn unreadable_timestamps_are_kept_verbatim() {
        let doc = json!({
            "name": "x/m1",
            "fields": { "createdAt": { "stringValue": "last tuesday" } }
        });
        let record = decode_member(&doc).unwrap();
        assert_eq!(record.created_at, Some(RecordTime::Opaque("last tuesday".into())));
    }

    #[test]
    fn missing_role_is_unrecognized() {
        let record = decode_member(&json!({ "name": "x/m1" })).unwrap();
        assert_eq!(record.role, Role::Unrecognized(String::new()));
        assert!(decode_member(&json!({ "fields": {} })).is_err());
    }

    #[test]
    fn mirror_without_active_flag_decodes_as_unknown() {
        let mirror = decode_mirror(&json!({
            "name": "x/u1",
            "fields": { "role": { "stringValue": "admin" } }
        }));
        assert_eq!(mirror.role, Role::Admin);
        assert_eq!(mirror.active, None);
    }

    #[test]
    fn update_writes_mask_plain_fields_and_transform_timestamps() {
        let mutation = Mutation::update(DocumentPath::Member { id: "m1".into() })
            .set(fields::VIEWER_PERMISSIONS, FieldValue::List(vec![]))
            .touch(fields::UPDATED_AT);
        let write = encode_write(&mutation, "projects/p/databases/(default)/documents", "organizationMembers");

        assert_eq!(
            write["update"]["name"],
            "projects/p/databases/(default)/documents/organizationMembers/m1"
        );
        assert_eq!(write["updateMask"]["fieldPaths"], json!(["viewerPermissions"]));
        assert_eq!(write["updateTransforms"][0]["fieldPath"], "updatedAt");
        assert_eq!(write["currentDocument"]["exists"], true);
    }

    #[test]
    fn create_writes_require_absence_and_have_no_mask() {
        let mutation = Mutation::create(DocumentPath::Mirror {
            organization_id: "org1".into(),
            user_id: "u1".into(),
        })
        .set(fields::ROLE, FieldValue::Text("admin".into()))
        .set(fields::ACTIVE, FieldValue::Flag(true))
        .touch(fields::CREATED_AT)
        .touch(fields::UPDATED_AT);
        let write = encode_write(&mutation, "projects/p/databases/(default)/documents/", "organizationMembers");

        assert_eq!(
            write["update"]["name"],
            "projects/p/databases/(default)/documents/organizations/org1/members/u1"
        );
        assert!(write.get("updateMask").is_none());
        assert_eq!(write["currentDocument"]["exists"], false);
        assert_eq!(write["update"]["fields"]["role"]["stringValue"], "admin");
        assert_eq!(write["updateTransforms"].as_array().map(Vec::len), Some(2));
    }
}
