//! Path templates over manifest documents.
//!
//! A template is written as dotted segments: `a.b` descends into field `b`,
//! `b[]` visits every object element of the sequence at `b`, and the last
//! segment names the string field to read or rewrite. A final segment of the
//! form `name?kind=deployment` only applies when the sibling `kind` field
//! equals `deployment` (ignoring case).

use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Field(String),
    Each(String),
    Leaf(String),
    LeafIf { field: String, when: String, equals: String },
}

pub fn compile(template: &str) -> Vec<Step> {
    let segments: Vec<&str> = template.split('.').collect();
    let Some((last, parents)) = segments.split_last() else { return Vec::new() };
    let mut steps: Vec<Step> = parents
        .iter()
        .map(|s| match s.strip_suffix("[]") {
            Some(f) => Step::Each(f.to_string()),
            None => Step::Field(s.to_string()),
        })
        .collect();
    let leaf = match last.split_once('?').and_then(|(f, g)| g.split_once('=').map(|(w, e)| (f, w, e))) {
        Some((field, when, equals)) => {
            Step::LeafIf { field: field.to_string(), when: when.to_string(), equals: equals.to_string() }
        }
        None => Step::Leaf(last.to_string()),
    };
    steps.push(leaf);
    steps
}

fn guard_holds(node: &Json, when: &str, equals: &str) -> bool {
    node.get(when).and_then(|v| v.as_str()).map(|v| v.eq_ignore_ascii_case(equals)).unwrap_or(false)
}

/// Rewrite every leaf equal to `from` into `to`; returns the number of rewrites.
/// Wrong shapes and missing fields are skipped.
pub(crate) fn rewrite(node: &mut Json, steps: &[Step], from: &str, to: &str) -> usize {
    match steps.split_first() {
        None => 0,
        Some((Step::Field(f), rest)) => node.get_mut(f.as_str()).map(|n| rewrite(n, rest, from, to)).unwrap_or(0),
        Some((Step::Each(f), rest)) => match node.get_mut(f.as_str()) {
            Some(Json::Array(items)) => {
                items.iter_mut().filter(|i| i.is_object()).map(|i| rewrite(i, rest, from, to)).sum()
            }
            _ => 0,
        },
        Some((Step::Leaf(f), _)) => replace_leaf(node, f, from, to),
        Some((Step::LeafIf { field, when, equals }, _)) => {
            if guard_holds(node, when, equals) {
                replace_leaf(node, field, from, to)
            } else {
                0
            }
        }
    }
}

fn replace_leaf(node: &mut Json, field: &str, from: &str, to: &str) -> usize {
    match node.get_mut(field) {
        Some(v) if v.as_str() == Some(from) => {
            *v = Json::String(to.to_string());
            1
        }
        _ => 0,
    }
}

/// Collect every string leaf the template reaches, in document order.
pub(crate) fn collect<'a>(node: &'a Json, steps: &[Step], out: &mut Vec<&'a str>) {
    match steps.split_first() {
        None => {}
        Some((Step::Field(f), rest)) => {
            if let Some(n) = node.get(f.as_str()) {
                collect(n, rest, out);
            }
        }
        Some((Step::Each(f), rest)) => {
            if let Some(Json::Array(items)) = node.get(f.as_str()) {
                for i in items.iter().filter(|i| i.is_object()) {
                    collect(i, rest, out);
                }
            }
        }
        Some((Step::Leaf(f), _)) => out.extend(node.get(f.as_str()).and_then(|v| v.as_str())),
        Some((Step::LeafIf { field, when, equals }, _)) => {
            if guard_holds(node, when, equals) {
                out.extend(node.get(field.as_str()).and_then(|v| v.as_str()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compiles_each_and_guard() {
        assert_eq!(
            compile("spec.containers[].image"),
            vec![Step::Field("spec".into()), Step::Each("containers".into()), Step::Leaf("image".into())]
        );
        assert_eq!(
            compile("spec.scaleTargetRef.name?kind=deployment").last(),
            Some(&Step::LeafIf { field: "name".into(), when: "kind".into(), equals: "deployment".into() })
        );
    }

    #[test]
    fn rewrite_skips_wrong_shapes() {
        let mut doc = json!({"spec": {"containers": [
            {"image": "nginx"},
            "not-an-object",
            {"image": 7},
            {"name": "no-image"},
            {"image": "nginx"}
        ]}});
        let n = rewrite(&mut doc, &compile("spec.containers[].image"), "nginx", "nginx:1.25");
        assert_eq!(n, 2);
        assert_eq!(doc["spec"]["containers"][4]["image"], json!("nginx:1.25"));
        assert_eq!(doc["spec"]["containers"][2]["image"], json!(7));

        let mut scalar = json!({"spec": {"containers": "oops"}});
        assert_eq!(rewrite(&mut scalar, &compile("spec.containers[].image"), "nginx", "x"), 0);
    }

    #[test]
    fn collect_walks_nested_sequences() {
        let doc = json!({"spec": {"volumes": [
            {"projected": {"sources": [{"configMap": {"name": "a"}}, {"secret": {"name": "s"}}, {"configMap": {"name": "b"}}]}}
        ]}});
        let mut out = Vec::new();
        collect(&doc, &compile("spec.volumes[].projected.sources[].configMap.name"), &mut out);
        assert_eq!(out, vec!["a", "b"]);
    }
}
