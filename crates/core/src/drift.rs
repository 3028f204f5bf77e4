//! Structural comparison of a desired resource body against the live object.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Paths where the live object departs from the desired body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drift {
    /// Desired fields absent from the live object.
    pub missing: Vec<String>,
    /// Desired fields present with a different value.
    pub changed: Vec<String>,
}

impl Drift {
    pub fn is_compatible(&self) -> bool { self.missing.is_empty() && self.changed.is_empty() }

    /// Short human reason, first few paths only.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.changed.is_empty() { parts.push(format!("changed: {}", head(&self.changed))); }
        if !self.missing.is_empty() { parts.push(format!("missing: {}", head(&self.missing))); }
        parts.join("; ")
    }
}

fn head(paths: &[String]) -> String {
    const SHOWN: usize = 3;
    let mut s = paths.iter().take(SHOWN).cloned().collect::<Vec<_>>().join(", ");
    if paths.len() > SHOWN { s.push_str(&format!(" (+{} more)", paths.len() - SHOWN)); }
    s
}

/// Subset comparison: every leaf of `desired` must equal the same path in `live`.
/// Fields only the live object carries (server defaults, status) are ignored.
pub fn drift(desired: &Json, live: &Json) -> Drift {
    fn walk(path: &str, a: &Json, b: &Json, out: &mut Drift) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    let p = if path.is_empty() { k.clone() } else { format!("{}.{}", path, k) };
                    match bo.get(k) {
                        Some(bv) => { if av != bv { walk(&p, av, bv, out); } }
                        None => out.missing.push(p),
                    }
                }
            }
            (Json::Array(aa), Json::Array(bb)) => {
                if aa.len() != bb.len() {
                    out.changed.push(path.to_string());
                    return;
                }
                for (i, (av, bv)) in aa.iter().zip(bb.iter()).enumerate() {
                    if av != bv { walk(&format!("{}[{}]", path, i), av, bv, out); }
                }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { out.changed.push(path.to_string()); } }
        }
    }
    let mut out = Drift::default();
    walk("", desired, live, &mut out);
    out
}

/// Drop server-populated fields before comparing or printing a live object.
pub fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
            obj.remove("resourceVersion");
            obj.remove("generation");
            obj.remove("creationTimestamp");
            obj.remove("uid");
        }
    }
    if let Some(obj) = v.as_object_mut() { obj.remove("status"); }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_defaults_do_not_count_as_drift() {
        let desired = json!({"spec": {"resources": {"requests": {"storage": "10Gi"}}}});
        let live = json!({
            "spec": {"resources": {"requests": {"storage": "10Gi"}}, "volumeMode": "Filesystem"},
            "status": {"phase": "Bound"}
        });
        assert!(drift(&desired, &live).is_compatible());
    }

    #[test]
    fn changed_and_missing_paths_are_reported() {
        let desired = json!({"a": 1, "b": {"x": 1, "y": 2}, "c": [1, 2]});
        let live = json!({"a": 2, "b": {"x": 1}, "c": [1, 3]});
        let d = drift(&desired, &live);
        assert_eq!(d.changed, vec!["a".to_string(), "c[1]".to_string()]);
        assert_eq!(d.missing, vec!["b.y".to_string()]);
        assert!(!d.is_compatible());
        assert!(d.describe().contains("b.y"));
    }

    #[test]
    fn array_length_change_is_one_change() {
        let d = drift(&json!({"ports": [1, 2]}), &json!({"ports": [1]}));
        assert_eq!(d.changed, vec!["ports".to_string()]);
    }

    #[test]
    fn strip_server_fields_prunes_metadata_and_status() {
        let v = json!({
            "metadata": {"name": "x", "managedFields": [], "resourceVersion": "1", "uid": "u"},
            "status": {"phase": "Bound"},
            "spec": {}
        });
        let s = strip_server_fields(v);
        let meta = s["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(s.get("status").is_none());
    }
}
