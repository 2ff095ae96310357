//! Index manifest records stored next to the logs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix of manifest object keys.
pub const MANIFEST_PREFIX: &str = "manifest_";

/// A snapshot of the adjacent indexer's outputs, stored as
/// `manifest_<execution_key>.json`. The garbage collector retains the two
/// most recent execution keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub indexes: BTreeMap<String, String>,
    pub execution_key: u64,
}

impl Manifest {
    pub fn new(execution_key: u64, indexes: BTreeMap<String, String>) -> Self {
        Manifest {
            created_at: Utc::now(),
            indexes,
            execution_key,
        }
    }

    /// Object key of this manifest.
    pub fn file_name(&self) -> String {
        format!("{}{}.json", MANIFEST_PREFIX, self.execution_key)
    }
}

/// Parse the execution key out of a manifest object key. Returns `None` for
/// keys that do not match the `manifest_<n>.json` template.
pub fn parse_execution_key(name: &str) -> Option<u64> {
    name.strip_prefix(MANIFEST_PREFIX)?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut indexes = BTreeMap::new();
        indexes.insert("mono".to_string(), "index/mono.idx".to_string());
        let manifest = Manifest::new(42, indexes);

        let encoded = serde_json::to_string(&manifest).unwrap();
        let decoded: Manifest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, manifest);
    }

    #[test]
    fn test_wire_field_names() {
        let manifest = Manifest::new(7, BTreeMap::new());
        let value = serde_json::to_value(&manifest).unwrap();
        assert!(value.get("CreatedAt").is_some());
        assert!(value.get("Indexes").is_some());
        assert_eq!(value.get("ExecutionKey").unwrap(), 7);
    }

    #[test]
    fn test_parse_execution_key() {
        assert_eq!(parse_execution_key("manifest_3.json"), Some(3));
        assert_eq!(parse_execution_key("manifest_x.json"), None);
        assert_eq!(parse_execution_key("logs/1/2.log"), None);
    }
}
