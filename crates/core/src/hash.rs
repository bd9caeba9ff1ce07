//! Canonical content hashing for JSON objects.
//!
//! The digest is taken over a normalized form: object keys sorted, no
//! insignificant whitespace, and a fixed set of volatile subtrees removed.
//! Both sides of a sync compute it independently, so re-serialization never
//! causes a spurious mismatch.

use std::fmt::Write;

use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::{SyncResult, LAST_APPLIED_ANNOTATION};

/// Subtrees excluded from the checksum, as key paths from the root.
pub const DEFAULT_IGNORED_PATHS: &[&[&str]] = &[
    // Pod.status.conditions[].lastProbeTime flips between null and absent
    &["status", "conditions"],
    &["metadata", "managedFields"],
    &["metadata", "annotations", LAST_APPLIED_ANNOTATION],
];

#[derive(Debug, Clone)]
pub struct CanonicalHasher {
    ignored: Vec<Vec<String>>,
}

impl Default for CanonicalHasher {
    fn default() -> Self {
        Self::with_ignored_paths(DEFAULT_IGNORED_PATHS.iter().map(|p| p.iter().map(|s| s.to_string()).collect()))
    }
}

impl CanonicalHasher {
    pub fn with_ignored_paths(paths: impl IntoIterator<Item = Vec<String>>) -> Self {
        Self { ignored: paths.into_iter().filter(|p| !p.is_empty()).collect() }
    }

    /// Lowercase hex SHA-256 of the canonical form. Fails if `object` is not valid JSON.
    pub fn hash(&self, object: &[u8]) -> SyncResult<String> {
        let value: Json = serde_json::from_slice(object)?;
        Ok(self.hash_value(&value))
    }

    pub fn hash_value(&self, value: &Json) -> String {
        let mut pruned = value.clone();
        for path in &self.ignored {
            remove_path(&mut pruned, path);
        }
        let mut canonical = String::new();
        write_canonical(&pruned, &mut canonical);
        let digest = Sha256::digest(canonical.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(&mut out, "{byte:02x}");
        }
        out
    }
}

/// Checksum with the default ignored paths.
pub fn canonical_hash(object: &[u8]) -> SyncResult<String> {
    CanonicalHasher::default().hash(object)
}

fn remove_path(value: &mut Json, path: &[String]) {
    let Some((last, parents)) = path.split_last() else { return };
    let mut cur = value;
    for seg in parents {
        match cur.get_mut(seg.as_str()) {
            Some(next) => cur = next,
            None => return,
        }
    }
    if let Some(obj) = cur.as_object_mut() {
        obj.remove(last.as_str());
    }
}

// Keys are sorted here explicitly so the form does not depend on serde_json's map feature flags.
fn write_canonical(value: &Json, out: &mut String) {
    match value {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 { out.push(','); }
                out.push_str(&Json::String(k.clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Json::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 { out.push(','); }
                write_canonical(v, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
