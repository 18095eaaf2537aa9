//! Configurable status rules for kinds without a built-in.
//!
//! File format (YAML or JSON):
//!
//! ```yaml
//! Certificate:
//!   statusChecks:
//!   - fieldPath: conditions.0.status
//!     comparedValue: "True"
//!     operator: EQ
//! ```

use std::collections::BTreeMap;

use anyhow::Context;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::warn;

use crate::{StatusResult, StatusRule};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCheck {
    /// Dot path under `status`.
    pub field_path: String,
    pub compared_value: Json,
    pub operator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KindRules {
    #[serde(default)]
    status_checks: Vec<StatusCheck>,
}

#[derive(Debug, Clone, Default)]
pub struct CustomKindRules {
    by_kind: FxHashMap<String, Vec<StatusCheck>>,
}

impl CustomKindRules {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading status rules {}", path))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing status rules {}", path))
    }

    /// YAML is a superset of JSON, so either form parses here.
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let parsed: BTreeMap<String, KindRules> = serde_yaml::from_str(raw)?;
        Ok(Self {
            by_kind: parsed.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v.status_checks)).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    pub fn checks(&self, kind: &str) -> &[StatusCheck] {
        self.by_kind.get(&kind.to_ascii_lowercase()).map(Vec::as_slice).unwrap_or(&[])
    }
}

fn walk<'a>(status: &'a Json, path: &str) -> Option<&'a Json> {
    let path = path.strip_prefix("status.").unwrap_or(path);
    path.split('.').try_fold(status, |cur, seg| match cur {
        Json::Object(m) => m.get(seg),
        Json::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn render(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl StatusRule for CustomKindRules {
    fn status(&self, doc: &Json) -> StatusResult {
        let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or("");
        let Some(status) = doc.get("status") else {
            return StatusResult::default();
        };
        for check in self.checks(kind) {
            let Some(observed) = walk(status, &check.field_path) else { continue };
            let equal = render(observed) == render(&check.compared_value);
            let violated = match check.operator.as_str() {
                "EQ" => !equal,
                "NE" => equal,
                other => {
                    warn!(kind = %kind, operator = %other, "unknown status check operator; treating as passing");
                    false
                }
            };
            if violated {
                let msg = format!("Field status.{} was {}", check.field_path, render(observed));
                return StatusResult::default().unstable(msg.clone()).failed(msg);
            }
        }
        StatusResult::default()
    }
}
