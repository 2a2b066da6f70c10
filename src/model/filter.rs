// src/model/filter.rs - Field path filters for subscriptions
use serde_json::{Map, Value};

/// Selects part of the document, e.g. `state/status`, `heat/heaters/*/current`
/// or `job/**`. Segments may be separated by `/` or `.`; `*` matches one level
/// and `**` everything below.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathFilter {
    segments: Vec<String>,
}

impl PathFilter {
    pub fn parse(path: &str) -> Self {
        let segments = path
            .split(['/', '.'])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        Self { segments }
    }

    /// Part of `value` matched by this filter.
    pub fn extract(&self, value: &Value) -> Option<Value> {
        extract(value, &self.segments)
    }
}

fn extract(value: &Value, segments: &[String]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    if first == "**" {
        return Some(value.clone());
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                if first == "*" || first == key {
                    if let Some(selected) = extract(child, rest) {
                        out.insert(key.clone(), selected);
                    }
                }
            }
            (!out.is_empty()).then_some(Value::Object(out))
        }
        Value::Array(items) => {
            if first == "*" {
                let selected: Vec<Value> = items
                    .iter()
                    .map(|item| extract(item, rest).unwrap_or_else(|| Value::Object(Map::new())))
                    .collect();
                return Some(Value::Array(selected));
            }
            let index: usize = first.parse().ok()?;
            let selected = extract(items.get(index)?, rest)?;
            let mut out = vec![Value::Object(Map::new()); index];
            out.push(selected);
            Some(Value::Array(out))
        }
        _ => None,
    }
}

/// Deep union of two filtered documents; arrays are combined element-wise.
fn union(target: &mut Value, other: Value) {
    match (target, other) {
        (Value::Object(a), Value::Object(b)) => {
            for (key, value) in b {
                match a.get_mut(&key) {
                    Some(existing) => union(existing, value),
                    None => {
                        a.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for (i, value) in b.into_iter().enumerate() {
                match a.get_mut(i) {
                    Some(existing) => union(existing, value),
                    None => a.push(value),
                }
            }
        }
        (target, other) => *target = other,
    }
}

/// Apply a set of filters to a document. An empty set selects everything.
pub fn apply_filters(doc: &Value, filters: &[PathFilter]) -> Value {
    if filters.is_empty() {
        return doc.clone();
    }
    let mut out = Value::Object(Map::new());
    for filter in filters {
        if let Some(selected) = filter.extract(doc) {
            union(&mut out, selected);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "state": {"status": "idle", "currentTool": 0},
            "heat": {"heaters": [{"current": 20, "active": 0}, {"current": 60, "active": 60}]},
            "job": {"layer": 2, "file": {"fileName": "a.g"}}
        })
    }

    #[test]
    fn test_simple_path() {
        let out = apply_filters(&doc(), &[PathFilter::parse("state/status")]);
        assert_eq!(out, json!({"state": {"status": "idle"}}));
    }

    #[test]
    fn test_wildcards_and_dots() {
        let filters = [PathFilter::parse("heat.heaters.*.current"), PathFilter::parse("job/**")];
        let out = apply_filters(&doc(), &filters);
        assert_eq!(
            out,
            json!({
                "heat": {"heaters": [{"current": 20}, {"current": 60}]},
                "job": {"layer": 2, "file": {"fileName": "a.g"}}
            })
        );
    }

    #[test]
    fn test_overlapping_filters_are_combined() {
        let filters = [PathFilter::parse("heat/heaters/*/current"), PathFilter::parse("heat/heaters/1/active")];
        let out = apply_filters(&doc(), &filters);
        assert_eq!(out, json!({"heat": {"heaters": [{"current": 20}, {"current": 60, "active": 60}]}}));
    }

    #[test]
    fn test_no_filter_selects_all_and_missing_path_selects_nothing() {
        assert_eq!(apply_filters(&doc(), &[]), doc());
        assert_eq!(apply_filters(&doc(), &[PathFilter::parse("spindles")]), json!({}));
    }
}
