use serde_json::Value as Json;
use spindle_core::manifest::string_map;
use spindle_core::{kinds, Error, Manifest, Result};
use spindle_kubehub::{pointer, PatchOp};

use crate::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Attach,
    Detach,
}

/// Where the selector labels live for `kind`: the pod template's labels for
/// controllers, the object's own labels for a Pod.
pub fn labels_path(kind: &str) -> Result<Vec<&'static str>> {
    if kind.eq_ignore_ascii_case("Pod") {
        return Ok(vec!["metadata", "labels"]);
    }
    match kinds::pod_template_path(kind) {
        Some(path) => {
            let mut p = path.to_vec();
            p.extend(["metadata", "labels"]);
            Ok(p)
        }
        None => Err(Error::Validation(format!("kind {} does not support load balancers", kind))),
    }
}

fn current_labels(m: &Manifest, path: &[&str]) -> Selector {
    string_map(m.pointer(&pointer(path)))
}

/// Add the selector to the target's labels. The two key sets must be
/// disjoint; on overlap the target is left untouched.
pub fn attach(m: &mut Manifest, selector: &Selector) -> Result<()> {
    if selector.is_empty() {
        return Err(Error::Invariant(format!("cannot attach an empty selector to {}", m.describe())));
    }
    let path = labels_path(m.kind())?;
    let existing = current_labels(m, &path);
    let overlap: Vec<&str> = selector.keys().filter(|k| existing.contains_key(*k)).map(String::as_str).collect();
    if !overlap.is_empty() {
        return Err(Error::Invariant(format!(
            "{} already has labels {:?} from the load balancer selector",
            m.describe(),
            overlap
        )));
    }
    let labels = m.map_at_mut(&path);
    for (k, v) in selector {
        labels.insert(k.clone(), Json::String(v.clone()));
    }
    Ok(())
}

/// Remove the selector's keys from the target's labels, whatever their values.
pub fn detach(m: &mut Manifest, selector: &Selector) -> Result<()> {
    if selector.is_empty() {
        return Ok(());
    }
    let path = labels_path(m.kind())?;
    if let Some(Json::Object(labels)) = m.pointer_mut(&pointer(&path)) {
        for k in selector.keys() {
            labels.remove(k);
        }
    }
    Ok(())
}

/// Field operations performing [`attach`] or [`detach`] on a live object.
pub fn patch_ops(kind: &str, selector: &Selector, mode: Mode) -> Result<Vec<PatchOp>> {
    let base = labels_path(kind)?;
    Ok(selector
        .iter()
        .map(|(k, v)| {
            let mut p = base.clone();
            p.push(k.as_str());
            let path = pointer(&p);
            match mode {
                Mode::Attach => PatchOp::Add { path, value: Json::String(v.clone()) },
                Mode::Detach => PatchOp::Remove { path },
            }
        })
        .collect())
}
