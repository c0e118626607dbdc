//! Context pack and snapshot shapes, validation and size caps
//!
//! A pack is what one source returns for one user. Packs are validated and
//! truncated to [`PackLimits`] before they ever reach the merge engine, so
//! everything downstream can assume bounded input.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Only packs with this major schema version are accepted
pub const SUPPORTED_MAJOR_VERSION: u64 = 1;

/// Schema version of the merged snapshot shape
pub const SNAPSHOT_SCHEMA_VERSION: &str = "1.0";

/// Joins a list category and a source id in namespaced merge keys; pack
/// categories may not contain it
pub const NAMESPACE_SEPARATOR: char = ':';

/// Size caps applied to packs and to merged snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PackLimits {
    /// Maximum serialized size of `facts` in bytes
    pub facts_max_bytes: usize,
    /// Maximum entries per `recents` category
    pub recents_max_count: usize,
    /// Maximum ids per `pointers` category
    pub pointers_max_per_category: usize,
    /// Largest response body read from a source; bigger bodies are rejected
    pub body_max_bytes: usize,
}

impl Default for PackLimits {
    fn default() -> Self {
        Self {
            facts_max_bytes: 8 * 1024,
            recents_max_count: 50,
            pointers_max_per_category: 100,
            body_max_bytes: 1024 * 1024,
        }
    }
}

/// A validated pack from one source for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPack {
    pub source_id: String,
    /// Source-local version or freshness tag, if the source published one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub facts: BTreeMap<String, Value>,
    #[serde(default)]
    pub recents: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub pointers: BTreeMap<String, Vec<String>>,
}

/// A pack that passed validation, with what the fetcher needs for the next request
#[derive(Debug, Clone)]
pub struct ParsedPack {
    pub pack: ContextPack,
    /// Incremental cursor advertised by the source
    pub cursor: Option<String>,
    /// Whether any cap was applied
    pub truncated: bool,
}

/// Why a response body was not accepted as a pack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackRejection {
    /// Major schema version other than [`SUPPORTED_MAJOR_VERSION`]
    SchemaUnsupported(String),
    /// Malformed JSON or missing required fields
    Invalid(String),
}

impl std::fmt::Display for PackRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaUnsupported(v) => write!(f, "unsupported schema version {v}"),
            Self::Invalid(reason) => write!(f, "invalid context pack: {reason}"),
        }
    }
}

/// Response body of the pull endpoint, before validation
#[derive(Debug, Deserialize)]
struct PackResponse {
    schema_version: Option<String>,
    generated_at: Option<String>,
    #[serde(default)]
    sources: Option<Map<String, Value>>,
    #[serde(default)]
    facts: Option<Map<String, Value>>,
    #[serde(default)]
    recents: Option<Map<String, Value>>,
    #[serde(default)]
    pointers: Option<Map<String, Value>>,
}

/// Parse and validate a pull response body
///
/// # Errors
///
/// Returns a [`PackRejection`] if the body is not a usable pack
pub fn parse_pack(
    source_id: &str,
    body: &[u8],
    limits: &PackLimits,
) -> std::result::Result<ParsedPack, PackRejection> {
    let response: PackResponse =
        serde_json::from_slice(body).map_err(|e| PackRejection::Invalid(e.to_string()))?;

    let schema_version = response
        .schema_version
        .ok_or_else(|| PackRejection::Invalid("missing schema_version".to_string()))?;
    let major = schema_version
        .split('.')
        .next()
        .and_then(|m| m.trim().parse::<u64>().ok())
        .ok_or_else(|| PackRejection::Invalid(format!("malformed schema_version {schema_version:?}")))?;
    if major != SUPPORTED_MAJOR_VERSION {
        return Err(PackRejection::SchemaUnsupported(schema_version));
    }

    let generated_at = response
        .generated_at
        .ok_or_else(|| PackRejection::Invalid("missing generated_at".to_string()))?;
    let generated_at = DateTime::parse_from_rfc3339(&generated_at)
        .map_err(|e| PackRejection::Invalid(format!("generated_at: {e}")))?
        .with_timezone(&Utc);

    let (version, cursor) = source_info(source_id, response.sources.as_ref());

    let mut recents = BTreeMap::new();
    for (category, value) in response.recents.unwrap_or_default() {
        check_category("recents", &category)?;
        let entries = match value {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => vec![other],
        };
        recents.insert(category, entries);
    }

    let mut pointers = BTreeMap::new();
    for (category, value) in response.pointers.unwrap_or_default() {
        check_category("pointers", &category)?;
        let ids = match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(PackRejection::Invalid(format!(
                        "pointers.{category} contains a non-id value: {other}"
                    ))),
                })
                .collect::<std::result::Result<Vec<_>, _>>()?,
            Value::Null => Vec::new(),
            _ => {
                return Err(PackRejection::Invalid(format!(
                    "pointers.{category} must be a list"
                )));
            }
        };
        pointers.insert(category, ids);
    }

    let mut pack = ContextPack {
        source_id: source_id.to_string(),
        version,
        schema_version,
        generated_at,
        facts: response.facts.unwrap_or_default().into_iter().collect(),
        recents,
        pointers,
    };
    let truncated = limits.apply(&mut pack);

    Ok(ParsedPack {
        pack,
        cursor,
        truncated,
    })
}

/// Category names are non-empty and free of [`NAMESPACE_SEPARATOR`]
fn check_category(section: &str, category: &str) -> std::result::Result<(), PackRejection> {
    if category.is_empty() || category.contains(NAMESPACE_SEPARATOR) {
        return Err(PackRejection::Invalid(format!(
            "{section} category {category:?} must be non-empty without {NAMESPACE_SEPARATOR:?}"
        )));
    }
    Ok(())
}

/// Version tag and first cursor from the `sources` block
///
/// The entry keyed by our own source id is preferred for the version tag.
fn source_info(
    source_id: &str,
    sources: Option<&Map<String, Value>>,
) -> (Option<String>, Option<String>) {
    let Some(sources) = sources else {
        return (None, None);
    };

    let string_field = |info: &Value, field: &str| {
        info.get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let version = sources
        .get(source_id)
        .or_else(|| sources.values().next())
        .and_then(|info| string_field(info, "version").or_else(|| string_field(info, "etag")));

    let cursor = sources.values().find_map(|info| string_field(info, "cursor"));

    (version, cursor)
}

impl PackLimits {
    /// Truncate a pack in place; returns whether anything was dropped by a cap
    pub fn apply(&self, pack: &mut ContextPack) -> bool {
        let mut truncated = self.cap_facts(&mut pack.facts);

        for entries in pack.recents.values_mut() {
            *entries = dedup_values(std::mem::take(entries));
            if entries.len() > self.recents_max_count {
                entries.truncate(self.recents_max_count);
                truncated = true;
            }
        }

        for ids in pack.pointers.values_mut() {
            *ids = dedup_ids(std::mem::take(ids));
            if ids.len() > self.pointers_max_per_category {
                ids.truncate(self.pointers_max_per_category);
                truncated = true;
            }
        }

        truncated
    }

    /// Keep facts in key order until the byte cap would be exceeded
    pub fn cap_facts(&self, facts: &mut BTreeMap<String, Value>) -> bool {
        if serialized_len(facts) <= self.facts_max_bytes {
            return false;
        }

        // "{}" plus one comma between entries
        let mut size = 2;
        let mut keep = 0;
        for (key, value) in facts.iter() {
            let entry = serialized_len(key) + 1 + serialized_len(value);
            let separator = usize::from(keep > 0);
            if size + separator + entry > self.facts_max_bytes {
                break;
            }
            size += separator + entry;
            keep += 1;
        }

        let dropped: Vec<String> = facts.keys().skip(keep).cloned().collect();
        for key in dropped {
            facts.remove(&key);
        }
        true
    }
}

fn serialized_len<T: Serialize + ?Sized>(value: &T) -> usize {
    serde_json::to_vec(value).map_or(0, |v| v.len())
}

/// Stable reference of a recents entry: its `id`, or its canonical JSON
#[must_use]
pub fn dedup_key(entry: &Value) -> String {
    match entry.get("id") {
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => canonical_json(entry),
    }
}

/// JSON text with object keys sorted at every level
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Drop entries whose [`dedup_key`] was already seen, keeping first occurrences
#[must_use]
pub fn dedup_values(entries: Vec<Value>) -> Vec<Value> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|entry| seen.insert(dedup_key(entry)))
        .collect()
}

fn dedup_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// A source that contributed to a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributingSource {
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl From<&ContextPack> for ContributingSource {
    fn from(pack: &ContextPack) -> Self {
        Self {
            source_id: pack.source_id.clone(),
            version: pack.version.clone(),
            generated_at: pack.generated_at,
        }
    }
}

/// The merged payload handed to the chat consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedPayload {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub facts: BTreeMap<String, Value>,
    pub recents: BTreeMap<String, Vec<Value>>,
    pub pointers: BTreeMap<String, Vec<String>>,
    pub sources: Vec<ContributingSource>,
}

impl MergedPayload {
    /// SHA-256 of the canonical serialization
    #[must_use]
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self).unwrap_or_default());
        hex::encode(hasher.finalize())
    }
}

/// Merged result for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub user_id: String,
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub payload: MergedPayload,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl ContextSnapshot {
    /// Wrap a merged payload, computing its hash
    #[must_use]
    pub fn new(user_id: &str, payload: MergedPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            schema_version: payload.schema_version.clone(),
            generated_at: payload.generated_at,
            content_hash: payload.content_hash(),
            payload,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn body(value: &Value) -> Vec<u8> {
        serde_json::to_vec(value).unwrap()
    }

    #[test]
    fn test_parse_valid_pack() {
        let raw = json!({
            "schema_version": "1.0",
            "generated_at": "2026-03-01T12:00:00Z",
            "audience": "conversa",
            "subject": {"type": "user", "id": "user-1"},
            "sources": {"linden-api": {"source_id": "linden-api", "version": "v7", "cursor": "c-42"}},
            "facts": {"locale": "es-ES"},
            "recents": {"top_entities": [{"id": "x"}, {"id": "y"}]},
            "pointers": {"docs": ["d1", 2]}
        });

        let parsed = parse_pack("linden-api", &body(&raw), &PackLimits::default()).unwrap();
        assert!(!parsed.truncated);
        assert_eq!(parsed.cursor.as_deref(), Some("c-42"));
        assert_eq!(parsed.pack.version.as_deref(), Some("v7"));
        assert_eq!(parsed.pack.facts["locale"], json!("es-ES"));
        assert_eq!(parsed.pack.recents["top_entities"].len(), 2);
        assert_eq!(parsed.pack.pointers["docs"], vec!["d1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_parse_rejections() {
        let limits = PackLimits::default();

        let err = parse_pack("a1", b"not json", &limits).unwrap_err();
        assert!(matches!(err, PackRejection::Invalid(_)));

        let missing = json!({"generated_at": "2026-03-01T12:00:00Z"});
        let err = parse_pack("a1", &body(&missing), &limits).unwrap_err();
        assert!(matches!(err, PackRejection::Invalid(_)));

        let no_time = json!({"schema_version": "1.0"});
        let err = parse_pack("a1", &body(&no_time), &limits).unwrap_err();
        assert!(matches!(err, PackRejection::Invalid(_)));

        let future = json!({"schema_version": "2.0", "generated_at": "2026-03-01T12:00:00Z"});
        let err = parse_pack("a1", &body(&future), &limits).unwrap_err();
        assert_eq!(err, PackRejection::SchemaUnsupported("2.0".to_string()));

        let bad_pointer = json!({
            "schema_version": "1",
            "generated_at": "2026-03-01T12:00:00Z",
            "pointers": {"docs": [{"nested": true}]}
        });
        let err = parse_pack("a1", &body(&bad_pointer), &limits).unwrap_err();
        assert!(matches!(err, PackRejection::Invalid(_)));
    }

    #[test]
    fn test_category_names_cannot_mimic_namespaced_keys() {
        let limits = PackLimits::default();

        let recents = json!({
            "schema_version": "1.0",
            "generated_at": "2026-03-01T12:00:00Z",
            "recents": {"top:source-b": [{"id": "x"}]}
        });
        let err = parse_pack("a1", &body(&recents), &limits).unwrap_err();
        assert!(matches!(err, PackRejection::Invalid(_)));

        let pointers = json!({
            "schema_version": "1.0",
            "generated_at": "2026-03-01T12:00:00Z",
            "pointers": {"": ["d1"]}
        });
        let err = parse_pack("a1", &body(&pointers), &limits).unwrap_err();
        assert!(matches!(err, PackRejection::Invalid(_)));
    }

    #[test]
    fn test_caps_truncate_deterministically() {
        let limits = PackLimits {
            facts_max_bytes: 24,
            recents_max_count: 2,
            pointers_max_per_category: 1,
            ..PackLimits::default()
        };
        let raw = json!({
            "schema_version": "1.0",
            "generated_at": "2026-03-01T12:00:00Z",
            "facts": {"b": "bbbb", "a": "aaaa", "c": "cccc"},
            "recents": {"top": [{"id": "1"}, {"id": "1"}, {"id": "2"}, {"id": "3"}]},
            "pointers": {"docs": ["d1", "d1", "d2"]}
        });

        let parsed = parse_pack("a1", &body(&raw), &limits).unwrap();
        assert!(parsed.truncated);

        // {"a":"aaaa","b":"bbbb"} is 23 bytes; adding "c" would exceed 24
        let keys: Vec<_> = parsed.pack.facts.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
        assert!(serialized_len(&parsed.pack.facts) <= limits.facts_max_bytes);

        let ids: Vec<_> = parsed.pack.recents["top"].iter().map(dedup_key).collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
        assert_eq!(parsed.pack.pointers["docs"], vec!["d1".to_string()]);
    }

    #[test]
    fn test_dedup_without_id_uses_canonical_json() {
        let entries = vec![json!({"name": "a", "kind": 1}), json!({"kind": 1, "name": "a"}), json!("x")];
        let deduped = dedup_values(entries);
        assert_eq!(deduped.len(), 2);
    }

    #[test]
    fn test_snapshot_hash_tracks_content() {
        let payload = MergedPayload {
            schema_version: SNAPSHOT_SCHEMA_VERSION.to_string(),
            generated_at: "2026-03-01T12:00:00Z".parse().unwrap(),
            facts: BTreeMap::from([("locale".to_string(), json!("es-ES"))]),
            recents: BTreeMap::new(),
            pointers: BTreeMap::new(),
            sources: vec![],
        };
        let a = ContextSnapshot::new("user-1", payload.clone(), Utc::now());
        let b = ContextSnapshot::new("user-1", payload.clone(), Utc::now());
        assert_eq!(a.content_hash, b.content_hash);

        let mut changed = payload;
        changed.facts.insert("tz".to_string(), json!("Europe/Madrid"));
        let c = ContextSnapshot::new("user-1", changed, Utc::now());
        assert_ne!(a.content_hash, c.content_hash);
    }
}
