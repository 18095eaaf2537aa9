//! Manifest document: a Kubernetes resource held as a JSON object and mutated
//! in place by each pipeline stage.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Json", into = "Json")]
pub struct Manifest(Json);

impl TryFrom<Json> for Manifest {
    type Error = Error;

    fn try_from(v: Json) -> Result<Self> {
        Manifest::new(v)
    }
}

impl From<Manifest> for Json {
    fn from(m: Manifest) -> Self {
        m.0
    }
}

impl Manifest {
    pub fn new(v: Json) -> Result<Self> {
        if !v.is_object() {
            return Err(Error::Validation(format!("manifest must be an object, got {}", type_name(&v))));
        }
        Ok(Self(v))
    }

    pub fn as_value(&self) -> &Json {
        &self.0
    }

    pub fn into_value(self) -> Json {
        self.0
    }

    fn root(&self) -> &Map<String, Json> {
        match &self.0 {
            Json::Object(m) => m,
            _ => unreachable!("Manifest always wraps an object"),
        }
    }

    fn root_mut(&mut self) -> &mut Map<String, Json> {
        match &mut self.0 {
            Json::Object(m) => m,
            _ => unreachable!("Manifest always wraps an object"),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Json> {
        self.root().get(key)
    }

    /// JSON-pointer lookup (`/spec/template/metadata`).
    pub fn pointer(&self, ptr: &str) -> Option<&Json> {
        self.0.pointer(ptr)
    }

    pub fn pointer_mut(&mut self, ptr: &str) -> Option<&mut Json> {
        self.0.pointer_mut(ptr)
    }

    /// Mutable access to the object at `path`, creating (or replacing
    /// non-object values with) empty objects along the way.
    pub fn map_at_mut(&mut self, path: &[&str]) -> &mut Map<String, Json> {
        let mut cur = self.root_mut();
        for seg in path {
            let slot = cur.entry(*seg).or_insert_with(|| Json::Object(Map::new()));
            if !slot.is_object() {
                *slot = Json::Object(Map::new());
            }
            cur = match slot {
                Json::Object(m) => m,
                _ => unreachable!("slot was just made an object"),
            };
        }
        cur
    }

    pub fn kind(&self) -> &str {
        self.get("kind").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("")
    }

    fn meta_str(&self, key: &str) -> Option<&str> {
        self.get("metadata").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn name(&self) -> &str {
        self.meta_str("name").unwrap_or("")
    }

    pub fn set_name(&mut self, name: &str) {
        self.map_at_mut(&["metadata"]).insert("name".into(), Json::String(name.to_string()));
    }

    /// Namespace, treating an empty string as unset.
    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace").filter(|s| !s.is_empty())
    }

    pub fn set_namespace(&mut self, ns: Option<&str>) {
        let meta = self.map_at_mut(&["metadata"]);
        match ns {
            Some(ns) => {
                meta.insert("namespace".into(), Json::String(ns.to_string()));
            }
            None => {
                meta.remove("namespace");
            }
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.meta_str("uid")
    }

    /// Raw creationTimestamp string; empty when the object was never created.
    pub fn creation_timestamp(&self) -> &str {
        self.meta_str("creationTimestamp").unwrap_or("")
    }

    pub fn generation(&self) -> Option<i64> {
        self.get("metadata").and_then(|m| m.get("generation")).and_then(|v| v.as_i64())
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.pointer("/metadata/labels").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.pointer("/metadata/annotations").and_then(|m| m.get(key)).and_then(|v| v.as_str())
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        string_map(self.pointer("/metadata/labels"))
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        string_map(self.pointer("/metadata/annotations"))
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.map_at_mut(&["metadata", "labels"]).insert(key.to_string(), Json::String(value.to_string()));
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.map_at_mut(&["metadata", "annotations"]).insert(key.to_string(), Json::String(value.to_string()));
    }

    /// UIDs listed in `metadata.ownerReferences`.
    pub fn owner_uids(&self) -> Vec<&str> {
        self.pointer("/metadata/ownerReferences")
            .and_then(|v| v.as_array())
            .map(|refs| refs.iter().filter_map(|r| r.get("uid").and_then(|u| u.as_str())).collect())
            .unwrap_or_default()
    }

    /// Human identity used in error context and logs: `Deployment app in ns`.
    pub fn describe(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{} {} in {}", self.kind(), self.name(), ns),
            None => format!("{} {}", self.kind(), self.name()),
        }
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Collect the string-valued entries of a JSON object.
pub fn string_map(v: Option<&Json>) -> BTreeMap<String, String> {
    v.and_then(|m| m.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

fn type_name(v: &Json) -> &'static str {
    match v {
        Json::Null => "null",
        Json::Bool(_) => "bool",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}
