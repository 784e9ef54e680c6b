//! JSON merge patch (RFC 7386) and strategic merge patch over raw documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use advisor_core::{StoreError, StoreResult};

const DIRECTIVE: &str = "$patch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchKind {
    Merge,
    Strategic,
}

impl PatchKind {
    pub fn content_type(self) -> &'static str {
        match self {
            PatchKind::Merge => "application/merge-patch+json",
            PatchKind::Strategic => "application/strategic-merge-patch+json",
        }
    }
}

impl std::str::FromStr for PatchKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" | "application/merge-patch+json" => Ok(Self::Merge),
            "strategic" | "application/strategic-merge-patch+json" => Ok(Self::Strategic),
            other => Err(StoreError::BadPatch(format!("unsupported patch type {}", other))),
        }
    }
}

// List fields merged element-wise, keyed by the named member.
fn merge_key(field: &str) -> Option<&'static str> {
    match field {
        "containers" | "initContainers" | "ephemeralContainers" | "env" | "volumes" | "volumeMounts"
        | "imagePullSecrets" => Some("name"),
        "conditions" => Some("type"),
        "taints" => Some("key"),
        "ports" => Some("containerPort"),
        _ => None,
    }
}

/// Apply `patch` to `current` and return the patched document.
pub fn apply_patch(kind: PatchKind, current: &Json, patch: &Json) -> StoreResult<Json> {
    if !patch.is_object() {
        return Err(StoreError::BadPatch("patch body must be a JSON object".into()));
    }
    let mut out = current.clone();
    match kind {
        PatchKind::Merge => merge(&mut out, patch),
        PatchKind::Strategic => strategic(&mut out, patch)?,
    }
    Ok(out)
}

/// Apply only the `status` stanza of `patch`; everything else in it is ignored.
pub fn apply_status_patch(kind: PatchKind, current: &Json, patch: &Json) -> StoreResult<Json> {
    let status = patch
        .as_object()
        .ok_or_else(|| StoreError::BadPatch("patch body must be a JSON object".into()))?
        .get("status")
        .cloned()
        .unwrap_or(Json::Null);
    let mut narrowed = Map::new();
    if !status.is_null() {
        narrowed.insert("status".into(), status);
    }
    apply_patch(kind, current, &Json::Object(narrowed))
}

/// Reject patches that rename or re-type the object.
pub fn check_identity(before: &Json, after: &Json) -> StoreResult<()> {
    let paths: [&[&str]; 4] = [&["kind"], &["apiVersion"], &["metadata", "name"], &["metadata", "namespace"]];
    for path in paths {
        let a = pointer(before, path);
        let b = pointer(after, path);
        if a != b {
            return Err(StoreError::Unprocessable(format!(
                "field {} is immutable ({} -> {})",
                path.join("."),
                a.map(|v| v.to_string()).unwrap_or_else(|| "null".into()),
                b.map(|v| v.to_string()).unwrap_or_else(|| "null".into()),
            )));
        }
    }
    Ok(())
}

fn pointer<'a>(v: &'a Json, path: &[&str]) -> Option<&'a Json> {
    path.iter().try_fold(v, |cur, k| cur.get(*k)).filter(|v| !v.is_null())
}

fn merge(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(t) = target {
        for (k, v) in p {
            if v.is_null() {
                t.remove(k);
            } else {
                merge(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

fn directive(v: &Json) -> Option<&str> {
    v.get(DIRECTIVE).and_then(|d| d.as_str())
}

fn without_directives(v: &Json) -> Json {
    match v {
        Json::Object(m) => Json::Object(
            m.iter()
                .filter(|(k, _)| k.as_str() != DIRECTIVE)
                .map(|(k, v)| (k.clone(), without_directives(v)))
                .collect(),
        ),
        Json::Array(a) => Json::Array(a.iter().map(without_directives).collect()),
        other => other.clone(),
    }
}

fn strategic(target: &mut Json, patch: &Json) -> StoreResult<()> {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return Ok(());
    };
    match directive(patch) {
        Some("replace") => {
            *target = without_directives(patch);
            return Ok(());
        }
        Some("delete") => {
            *target = Json::Null;
            return Ok(());
        }
        Some("merge") | None => {}
        Some(other) => return Err(StoreError::BadPatch(format!("unknown $patch directive {}", other))),
    }
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    let Json::Object(t) = target else { return Ok(()) };
    for (k, v) in p {
        if k == DIRECTIVE {
            continue;
        }
        if v.is_null() || directive(v) == Some("delete") {
            t.remove(k);
            continue;
        }
        let merged = match (merge_key(k), v, t.get_mut(k)) {
            (Some(mk), Json::Array(items), Some(Json::Array(cur))) => {
                merge_list(cur, items, mk)?;
                true
            }
            (_, Json::Object(_), Some(cur)) if cur.is_object() => {
                strategic(cur, v)?;
                true
            }
            _ => false,
        };
        if !merged {
            t.insert(k.clone(), without_directives(v));
        }
    }
    Ok(())
}

fn merge_list(cur: &mut Vec<Json>, items: &[Json], key: &str) -> StoreResult<()> {
    for item in items {
        let Some(id) = item.get(key).filter(|v| !v.is_null()) else {
            return Err(StoreError::BadPatch(format!("list element is missing merge key {}", key)));
        };
        let pos = cur.iter().position(|c| c.get(key) == Some(id));
        match (pos, directive(item)) {
            (Some(i), Some("delete")) => {
                cur.remove(i);
            }
            (None, Some("delete")) => {}
            (Some(i), _) => strategic(&mut cur[i], item)?,
            (None, _) => cur.push(without_directives(item)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_patch_replaces_lists_and_removes_nulls() {
        let cur = json!({ "metadata": { "labels": { "a": "1", "b": "2" } }, "spec": { "taints": [{ "key": "x" }] } });
        let patch = json!({ "metadata": { "labels": { "a": null, "c": "3" } }, "spec": { "taints": [] } });
        let out = apply_patch(PatchKind::Merge, &cur, &patch).unwrap();
        assert_eq!(out["metadata"]["labels"], json!({ "b": "2", "c": "3" }));
        assert_eq!(out["spec"]["taints"], json!([]));
    }

    #[test]
    fn strategic_merges_lists_by_key() {
        let cur = json!({ "spec": { "containers": [
            { "name": "app", "image": "app:1", "env": [{ "name": "A", "value": "1" }] },
            { "name": "side", "image": "side:1" }
        ] } });
        let patch = json!({ "spec": { "containers": [
            { "name": "app", "image": "app:2", "env": [{ "name": "B", "value": "2" }] },
            { "name": "side", "$patch": "delete" },
            { "name": "new", "image": "new:1" }
        ] } });
        let out = apply_patch(PatchKind::Strategic, &cur, &patch).unwrap();
        let cs = out["spec"]["containers"].as_array().unwrap();
        assert_eq!(cs.len(), 2);
        assert_eq!(cs[0]["image"], "app:2");
        assert_eq!(cs[0]["env"].as_array().unwrap().len(), 2);
        assert_eq!(cs[1]["name"], "new");
        assert!(cs[1].get("$patch").is_none());
    }

    #[test]
    fn strategic_replace_directive_and_unknown_directive() {
        let cur = json!({ "metadata": { "labels": { "a": "1" } } });
        let patch = json!({ "metadata": { "labels": { "$patch": "replace", "z": "9" } } });
        let out = apply_patch(PatchKind::Strategic, &cur, &patch).unwrap();
        assert_eq!(out["metadata"]["labels"], json!({ "z": "9" }));

        let bad = json!({ "metadata": { "$patch": "explode" } });
        assert!(matches!(apply_patch(PatchKind::Strategic, &cur, &bad), Err(StoreError::BadPatch(_))));
    }

    #[test]
    fn non_object_patch_is_bad() {
        assert!(matches!(apply_patch(PatchKind::Merge, &json!({}), &json!([1])), Err(StoreError::BadPatch(_))));
    }

    #[test]
    fn status_patch_ignores_spec() {
        let cur = json!({ "spec": { "nodeName": "" }, "status": { "phase": "Pending" } });
        let patch = json!({ "spec": { "nodeName": "n1" }, "status": { "phase": "Running" } });
        let out = apply_status_patch(PatchKind::Merge, &cur, &patch).unwrap();
        assert_eq!(out["spec"]["nodeName"], "");
        assert_eq!(out["status"]["phase"], "Running");
    }

    #[test]
    fn identity_changes_are_unprocessable() {
        let before = json!({ "kind": "Pod", "metadata": { "name": "a", "namespace": "ns" } });
        let renamed = json!({ "kind": "Pod", "metadata": { "name": "b", "namespace": "ns" } });
        assert!(matches!(check_identity(&before, &renamed), Err(StoreError::Unprocessable(_))));
        assert!(check_identity(&before, &before).is_ok());
    }
}
