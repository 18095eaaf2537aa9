//! Spindle core types: manifest documents, annotation keys, kind tables and
//! the error taxonomy shared by every pipeline stage.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod error;
pub mod kinds;
pub mod manifest;
pub mod order;

pub use error::{Error, Result};
pub use manifest::Manifest;

pub mod prelude {
    pub use super::annotations::{self, cluster_key, lower_first};
    pub use super::kinds;
    pub use super::order::{flatten_lists, sort_by_priority};
    pub use super::{Error, Manifest, Result};
}
