//! Domain payloads the dispatch layer inspects. Fields it does not inspect
//! ride along untouched in `extra`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Neuron metadata as exchanged with the persistence service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neuron {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub owner_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<i64>,
    #[serde(default)]
    pub readers: BTreeSet<String>,
    #[serde(default)]
    pub writers: BTreeSet<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Neuron {
    pub fn new(owner_key: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            owner_key: owner_key.into(),
            workspace_id: None,
            readers: BTreeSet::new(),
            writers: BTreeSet::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_owned_by(&self, user: &str) -> bool {
        self.owner_key == user
    }

    /// Makes `user` the owner and grants them read and write access.
    pub fn transfer_to(&mut self, user: &str) {
        self.owner_key = user.to_string();
        self.readers.insert(user.to_string());
        self.writers.insert(user.to_string());
    }

    pub fn id_label(&self) -> String {
        self.id.map_or_else(|| "new".to_string(), |id| id.to_string())
    }
}

/// Typed pointer to an indexable document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub object_class: String,
    pub object_id: i64,
}

impl Reference {
    pub fn new(object_class: impl Into<String>, object_id: i64) -> Self {
        Self {
            object_class: object_class.into(),
            object_id,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.object_class, self.object_id)
    }
}
