//! Manifest records and their index projection.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};

/// Index document key. Produced by `KeyGenerator`; opaque everywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    /// Wrap a key read back from an index backend.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One parsed manifest, alive only during a single crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRecord {
    /// Package name (manifest file stem)
    pub name: String,

    pub version: String,

    pub description: Option<String>,

    pub homepage: Option<String>,

    pub license: Option<String>,

    /// Path of the manifest inside the bucket, `/`-separated
    pub path: String,

    /// Time of the latest commit touching the file
    pub last_modified: DateTime<Utc>,

    pub bucket_id: String,
}

impl ManifestRecord {
    /// Parse manifest JSON read from `path`.
    ///
    /// Fails with [`AppError::Parse`] when the content is not a JSON object or
    /// has no usable `version`.
    pub fn parse(
        bucket_id: &str,
        path: &str,
        content: &[u8],
        last_modified: DateTime<Utc>,
    ) -> Result<Self> {
        let content = content.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(content);
        let json: Value = serde_json::from_slice(content).map_err(|e| AppError::parse(path, e))?;
        let obj = json
            .as_object()
            .ok_or_else(|| AppError::parse(path, "manifest is not a JSON object"))?;

        let version = obj
            .get("version")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| AppError::parse(path, "missing version"))?;

        let name = path
            .rsplit('/')
            .next()
            .and_then(|file| file.strip_suffix(".json"))
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| AppError::parse(path, "not a .json manifest path"))?;

        Ok(Self {
            name: name.to_string(),
            version: version.to_string(),
            description: obj.get("description").and_then(text_field),
            homepage: obj.get("homepage").and_then(text_field),
            license: obj.get("license").and_then(license_field),
            path: path.to_string(),
            last_modified,
            bucket_id: bucket_id.to_string(),
        })
    }
}

/// Strings, or arrays of strings joined by spaces (older manifests).
fn text_field(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .collect::<Vec<_>>()
            .join(" "),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

/// `"MIT"` or `{ "identifier": "MIT", "url": "..." }`.
fn license_field(value: &Value) -> Option<String> {
    match value {
        Value::Object(obj) => obj.get("identifier").and_then(text_field),
        other => text_field(other),
    }
}

/// Searchable projection of a manifest, as stored in the external index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub key: Key,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub homepage: Option<String>,
    pub license: Option<String>,
    pub bucket_id: String,
    pub source_path: String,
    pub last_modified: DateTime<Utc>,
}

impl IndexDocument {
    pub fn from_record(key: Key, record: ManifestRecord) -> Self {
        Self {
            key,
            name: record.name,
            version: record.version,
            description: record.description,
            homepage: record.homepage,
            license: record.license,
            bucket_id: record.bucket_id,
            source_path: record.path,
            last_modified: record.last_modified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_full_manifest() {
        let json = br#"{
            "version": "1.2.3",
            "description": "An app",
            "homepage": "https://example.com",
            "license": { "identifier": "MIT", "url": "https://example.com/LICENSE" }
        }"#;
        let record = ManifestRecord::parse("a/b", "bucket/app.json", json, ts()).unwrap();
        assert_eq!(record.name, "app");
        assert_eq!(record.version, "1.2.3");
        assert_eq!(record.description.as_deref(), Some("An app"));
        assert_eq!(record.license.as_deref(), Some("MIT"));
        assert_eq!(record.last_modified, ts());
        assert_eq!(record.bucket_id, "a/b");
    }

    #[test]
    fn test_parse_array_description_and_bom() {
        let json = b"\xEF\xBB\xBF{\"version\":\"2\",\"description\":[\"Line one\",\"line two\"],\"license\":\"GPL-3.0\"}";
        let record = ManifestRecord::parse("a/b", "tool.json", json, ts()).unwrap();
        assert_eq!(record.description.as_deref(), Some("Line one line two"));
        assert_eq!(record.license.as_deref(), Some("GPL-3.0"));
        assert!(record.homepage.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            ManifestRecord::parse("a/b", "x.json", b"{ not json", ts()),
            Err(AppError::Parse { .. })
        ));
        assert!(matches!(
            ManifestRecord::parse("a/b", "x.json", b"[1, 2]", ts()),
            Err(AppError::Parse { .. })
        ));
        assert!(matches!(
            ManifestRecord::parse("a/b", "x.json", br#"{"version": "  "}"#, ts()),
            Err(AppError::Parse { .. })
        ));
    }

    #[test]
    fn test_document_wire_names() {
        let record =
            ManifestRecord::parse("a/b", "bucket/app.json", br#"{"version":"1"}"#, ts()).unwrap();
        let doc = IndexDocument::from_record(Key::new("k1"), record);
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["key"], "k1");
        assert_eq!(json["bucketId"], "a/b");
        assert_eq!(json["sourcePath"], "bucket/app.json");
        assert!(json.get("lastModified").is_some());
    }
}
