//! Append-only, versioned artifact store owned by a single run.
//!
//! Every [`put`](ArtifactStore::put) appends a new version; nothing is ever
//! overwritten. `get` returns the latest version while `history` keeps the
//! full audit trail. Only the orchestrator writes, so `put` is crate-private.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use strata_types::{Result, StrataError};

/// Where an artifact version came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    /// Supplied by the caller when the run started.
    External,
    /// Produced by an agent (or a gate) during the `entry`-th run of `layer`.
    Layer {
        layer: String,
        entry: u32,
        agent: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    /// 1-based version number for this name.
    pub version: u32,
    /// Run-wide write sequence number.
    pub sequence: u64,
    pub content: serde_json::Value,
    pub provenance: Provenance,
    /// Cost of the invocation that produced this version.
    pub cost: f64,
    pub produced_at: chrono::DateTime<chrono::Utc>,
}

/// Lightweight reference returned by `put`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHandle {
    pub name: String,
    pub version: u32,
    pub sequence: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactStore {
    versions: BTreeMap<String, Vec<Artifact>>,
    next_sequence: u64,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn put(
        &mut self,
        name: impl Into<String>,
        content: serde_json::Value,
        provenance: Provenance,
        cost: f64,
    ) -> ArtifactHandle {
        let name = name.into();
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        let versions = self.versions.entry(name.clone()).or_default();
        let version = versions.len() as u32 + 1;
        tracing::debug!(artifact = %name, version, sequence, "Artifact stored");
        versions.push(Artifact {
            name: name.clone(),
            version,
            sequence,
            content,
            provenance,
            cost,
            produced_at: chrono::Utc::now(),
        });
        ArtifactHandle {
            name,
            version,
            sequence,
        }
    }

    /// Content of the latest version of `name`.
    pub fn get(&self, name: &str) -> Result<&serde_json::Value> {
        self.latest(name)
            .map(|a| &a.content)
            .ok_or_else(|| StrataError::ArtifactNotFound {
                name: name.to_string(),
            })
    }

    pub fn latest(&self, name: &str) -> Option<&Artifact> {
        self.versions.get(name).and_then(|v| v.last())
    }

    /// Every version of `name`, oldest first. Empty when never written.
    pub fn history(&self, name: &str) -> &[Artifact] {
        self.versions.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.versions.contains_key(name)
    }

    /// Artifact names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    /// Latest content of every artifact.
    pub fn snapshot(&self) -> HashMap<String, serde_json::Value> {
        self.versions
            .iter()
            .filter_map(|(name, v)| v.last().map(|a| (name.clone(), a.content.clone())))
            .collect()
    }

    /// Total number of versions written.
    pub fn len(&self) -> usize {
        self.next_sequence as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_sequence == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn produced_by(layer: &str, entry: u32) -> Provenance {
        Provenance::Layer {
            layer: layer.into(),
            entry,
            agent: "writer".into(),
        }
    }

    #[test]
    fn get_missing_is_not_found() {
        let store = ArtifactStore::new();
        match store.get("code") {
            Err(StrataError::ArtifactNotFound { name }) => assert_eq!(name, "code"),
            other => panic!("Expected ArtifactNotFound, got: {other:?}"),
        }
        assert!(store.history("code").is_empty());
        assert!(store.is_empty());
    }

    #[test]
    fn put_appends_versions_and_get_returns_latest() {
        let mut store = ArtifactStore::new();
        let first = store.put("code", json!("v1"), produced_by("generate", 1), 0.5);
        let second = store.put("code", json!("v2"), produced_by("generate", 2), 0.7);

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert!(second.sequence > first.sequence);
        assert_eq!(store.get("code").unwrap(), &json!("v2"));

        let history = store.history("code");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, json!("v1"));
        assert_eq!(history[1].content, json!("v2"));
        assert_eq!(history[0].provenance, produced_by("generate", 1));
        assert_eq!(history[1].cost, 0.7);
    }

    #[test]
    fn sequence_is_global_across_names() {
        let mut store = ArtifactStore::new();
        store.put("brief", json!("spec"), Provenance::External, 0.0);
        let h = store.put("code", json!("x"), produced_by("generate", 1), 0.0);
        assert_eq!(h.sequence, 2);
        assert_eq!(h.version, 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn snapshot_and_names_reflect_latest() {
        let mut store = ArtifactStore::new();
        store.put("b", json!(1), Provenance::External, 0.0);
        store.put("a", json!(2), Provenance::External, 0.0);
        store.put("b", json!(3), Provenance::External, 0.0);

        assert_eq!(store.names().collect::<Vec<_>>(), vec!["a", "b"]);
        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap["b"], json!(3));
    }

    #[test]
    fn store_serializes_with_provenance_tags() {
        let mut store = ArtifactStore::new();
        store.put("code", json!("x"), produced_by("generate", 1), 0.1);
        let value = serde_json::to_value(&store).unwrap();
        assert_eq!(
            value["versions"]["code"][0]["provenance"]["source"],
            json!("layer")
        );
    }
}
