//! JSON merge patches (RFC 7386): creation as a diff between two full
//! objects, and application to a base object.
//!
//! Merge patches cannot express "set this key to null"; a key whose value is
//! null in the modified object is removed on apply.

use serde_json::{Map, Value as Json};

use crate::{SyncError, SyncResult};

/// Merge patch turning `original` into `modified`.
pub fn create_merge_patch(original: &[u8], modified: &[u8]) -> SyncResult<Vec<u8>> {
    let original: Json = serde_json::from_slice(original)?;
    let modified: Json = serde_json::from_slice(modified)?;
    Ok(serde_json::to_vec(&merge_diff(&original, &modified))?)
}

/// Apply `patch` to `original`. Invalid input on either side is a patch-apply error.
pub fn apply_merge_patch(original: &[u8], patch: &[u8]) -> SyncResult<Vec<u8>> {
    let mut doc: Json = serde_json::from_slice(original).map_err(|e| SyncError::PatchApply(format!("invalid document: {}", e)))?;
    let patch: Json = serde_json::from_slice(patch).map_err(|e| SyncError::PatchApply(format!("invalid patch: {}", e)))?;
    json_patch::merge(&mut doc, &patch);
    Ok(serde_json::to_vec(&doc)?)
}

pub fn merge_diff(original: &Json, modified: &Json) -> Json {
    match (original, modified) {
        (Json::Object(orig), Json::Object(modi)) => {
            let mut patch = Map::new();
            for (k, mv) in modi {
                match orig.get(k) {
                    Some(ov) if ov == mv => {}
                    Some(ov) if ov.is_object() && mv.is_object() => {
                        patch.insert(k.clone(), merge_diff(ov, mv));
                    }
                    _ => {
                        patch.insert(k.clone(), mv.clone());
                    }
                }
            }
            for k in orig.keys() {
                if !modi.contains_key(k) {
                    patch.insert(k.clone(), Json::Null);
                }
            }
            Json::Object(patch)
        }
        _ => modified.clone(),
    }
}
