//! Patch bodies sent through [`crate::ClusterClient::patch`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// A single structural field operation addressed by JSON pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: String, value: Json },
    Remove { path: String },
}

impl PatchOp {
    pub fn path(&self) -> &str {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Remove { path } => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchBody {
    /// JSON merge patch (RFC 7386).
    Merge(Json),
    /// Field operations; only the addressed fields are touched.
    Fields(Vec<PatchOp>),
}

impl PatchBody {
    /// Equivalent merge patch: `add` sets the value, `remove` sets null.
    pub fn to_merge(&self) -> Json {
        match self {
            PatchBody::Merge(v) => v.clone(),
            PatchBody::Fields(ops) => {
                let mut root = Json::Object(Map::new());
                for op in ops {
                    let value = match op {
                        PatchOp::Add { value, .. } => value.clone(),
                        PatchOp::Remove { .. } => Json::Null,
                    };
                    let segments = parse_pointer(op.path());
                    let Some((last, parents)) = segments.split_last() else { continue };
                    let mut cur = &mut root;
                    for seg in parents {
                        if !cur.is_object() {
                            *cur = Json::Object(Map::new());
                        }
                        cur = match cur {
                            Json::Object(m) => m.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new())),
                            _ => unreachable!("parent was just made an object"),
                        };
                    }
                    if !cur.is_object() {
                        *cur = Json::Object(Map::new());
                    }
                    if let Json::Object(m) = cur {
                        m.insert(last.clone(), value);
                    }
                }
                root
            }
        }
    }
}

/// Build a JSON pointer from raw segments, escaping `~` and `/`.
pub fn pointer(segments: &[&str]) -> String {
    let mut out = String::new();
    for s in segments {
        out.push('/');
        out.push_str(&s.replace('~', "~0").replace('/', "~1"));
    }
    out
}

fn parse_pointer(ptr: &str) -> Vec<String> {
    ptr.split('/')
        .skip(1)
        .map(|s| s.replace("~1", "/").replace("~0", "~"))
        .collect()
}

/// Apply a JSON merge patch to `target` in place.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(patch_obj) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(t) = target {
        for (k, v) in patch_obj {
            if v.is_null() {
                t.remove(k);
            } else {
                merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn pointer_escapes_label_keys() {
        assert_eq!(
            pointer(&["metadata", "labels", "app.kubernetes.io/name"]),
            "/metadata/labels/app.kubernetes.io~1name"
        );
    }

    #[test]
    fn field_ops_become_merge_patch() {
        let body = PatchBody::Fields(vec![
            PatchOp::Add { path: pointer(&["spec", "template", "metadata", "labels", "a/b"]), value: json!("1") },
            PatchOp::Remove { path: pointer(&["spec", "template", "metadata", "labels", "c"]) },
        ]);
        assert_eq!(
            body.to_merge(),
            json!({"spec": {"template": {"metadata": {"labels": {"a/b": "1", "c": null}}}}})
        );
    }

    #[test]
    fn merge_patch_adds_and_removes() {
        let mut doc = json!({"metadata": {"labels": {"keep": "1", "drop": "2"}}, "spec": {"replicas": 1}});
        merge_patch(&mut doc, &json!({"metadata": {"labels": {"drop": null, "new": "3"}}, "spec": {"replicas": 4}}));
        assert_eq!(doc, json!({"metadata": {"labels": {"keep": "1", "new": "3"}}, "spec": {"replicas": 4}}));
    }

    #[test]
    fn ops_serialize_as_json_patch() {
        let op = PatchOp::Add { path: "/metadata/labels/x".into(), value: json!("y") };
        assert_eq!(serde_json::to_value(&op).unwrap(), json!({"op": "add", "path": "/metadata/labels/x", "value": "y"}));
    }
}
