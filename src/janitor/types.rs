//! Types used by the janitor.

use serde::Deserialize;

/// A server or flexible IP as listed by `scw ... list -o json`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub(super) struct TaggedResource {
    pub(super) id: String,
    pub(super) zone: String,
    #[serde(default)]
    pub(super) tags: Vec<String>,
}
