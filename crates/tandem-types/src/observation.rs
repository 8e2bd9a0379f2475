use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Raw text fields gathered from one or more observation sources, prior to
/// normalization. A `BTreeMap` keeps merge order deterministic for tests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawObservation(pub BTreeMap<String, String>);

impl RawObservation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Last-writer-wins merge used by the composite adapter: `other`'s keys
    /// overwrite `self`'s on collision.
    pub fn merge_from(&mut self, other: RawObservation) {
        self.0.extend(other.0);
    }
}

/// Size-capped, safety-validated observation handed to a `RunProvider`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedObservation {
    pub timestamp: i64,
    pub state: BTreeMap<String, String>,
    pub events: Vec<String>,
}
