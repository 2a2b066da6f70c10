//! JSON merge patches between object model snapshots.
//!
//! Objects are compared key by key, everything else (scalars and arrays) is
//! replaced as a whole. A key that disappeared is sent as `null`.

use serde_json::{Map, Value};

/// Sparse patch turning `old` into `new`, or `None` when nothing changed.
pub fn diff(old: &Value, new: &Value) -> Option<Value> {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            let mut patch = Map::new();
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) => {
                        if let Some(child) = diff(old_value, new_value) {
                            patch.insert(key.clone(), child);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if old == new => None,
        _ => Some(new.clone()),
    }
}

/// Apply a merge patch in place. `null` removes a key.
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Remove object keys holding `null`, recursively.
pub fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_diff_only_lists_changes() {
        let old = json!({"state": {"status": "idle", "currentTool": 0}, "fans": [1, 2], "gone": 1});
        let new = json!({"state": {"status": "busy", "currentTool": 0}, "fans": [1, 2], "added": true});
        let patch = diff(&old, &new).unwrap();
        assert_eq!(patch, json!({"state": {"status": "busy"}, "added": true, "gone": null}));
        assert_eq!(diff(&new, &new), None);
    }

    #[test]
    fn test_arrays_are_replaced() {
        let old = json!({"heaters": [{"current": 20}, {"current": 21}]});
        let new = json!({"heaters": [{"current": 20}]});
        let patch = diff(&old, &new).unwrap();
        assert_eq!(patch, json!({"heaters": [{"current": 20}]}));
    }

    #[test]
    fn test_merge_reconstructs_new_document() {
        let old = json!({"a": {"b": 1, "c": [1]}, "d": "x"});
        let new = json!({"a": {"b": 2, "c": [1, 2]}, "e": {"f": false}});
        let mut copy = old.clone();
        merge(&mut copy, &diff(&old, &new).unwrap());
        assert_eq!(copy, new);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut doc = json!({"state": {"status": "idle"}, "job": {"layer": 3}});
        let patch = json!({"state": {"status": "processing"}, "job": {"layer": null}, "new": [1]});
        merge(&mut doc, &patch);
        let once = doc.clone();
        merge(&mut doc, &patch);
        assert_eq!(doc, once);
        assert_eq!(doc, json!({"state": {"status": "processing"}, "job": {}, "new": [1]}));
    }

    #[test]
    fn test_strip_nulls() {
        let mut value = json!({"a": null, "b": {"c": null, "d": 1}, "e": [{"f": null}]});
        strip_nulls(&mut value);
        assert_eq!(value, json!({"b": {"d": 1}, "e": [{}]}));
    }
}
