//! List flattening and priority ordering of a manifest batch.

use std::collections::BTreeMap;

use serde_json::Value as Json;
use tracing::debug;

use crate::{kinds, Manifest, Result};

/// Replace every `List` manifest with its `items`. Only one level is
/// expanded: a `List` inside a list's items is kept as a manifest.
pub fn flatten_lists(manifests: Vec<Manifest>) -> Result<Vec<Manifest>> {
    let mut out = Vec::with_capacity(manifests.len());
    for m in manifests {
        if !kinds::is_list(m.kind()) {
            out.push(m);
            continue;
        }
        let items = match m.into_value() {
            Json::Object(mut obj) => match obj.remove("items") {
                Some(Json::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        debug!(items = items.len(), "flattening list manifest");
        for item in items {
            out.push(Manifest::new(item)?);
        }
    }
    Ok(out)
}

/// Stable partition into ascending priority buckets; manifests sharing a
/// priority keep their input order.
pub fn sort_by_priority(manifests: Vec<Manifest>) -> Vec<Manifest> {
    let mut buckets: BTreeMap<u32, Vec<Manifest>> = BTreeMap::new();
    for m in manifests {
        buckets.entry(kinds::priority(m.kind())).or_default().push(m);
    }
    buckets.into_values().flatten().collect()
}
