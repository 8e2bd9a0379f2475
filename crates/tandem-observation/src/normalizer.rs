use std::collections::BTreeMap;

use serde_json::Value;
use tandem_types::{Clock, NormalizedObservation, RawObservation};
use thiserror::Error;

/// Forbidden keys that must never appear in a raw observation or any nested
/// JSON payload carried inside it. These are not meaningful for Rust's own
/// map types, which have no prototype chain to pollute, but untrusted input
/// may be re-serialized or handed to something that does.
const FORBIDDEN_KEYS: [&str; 3] = ["__proto__", "prototype", "constructor"];

const MAX_NESTING_DEPTH: usize = 50;

pub const RESERVED_EVENTS_KEY: &str = "events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerLimits {
    pub max_input_length: usize,
    pub max_event_length: usize,
    pub max_events: usize,
    pub max_total_state_length: usize,
}

impl Default for NormalizerLimits {
    fn default() -> Self {
        Self {
            max_input_length: 10_000,
            max_event_length: 500,
            max_events: 50,
            max_total_state_length: 50_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("forbidden key {0:?} present in raw observation")]
    ForbiddenKey(String),
    #[error("raw observation exceeds maximum nesting depth of {MAX_NESTING_DEPTH}")]
    TooDeeplyNested,
    #[error("field {0:?} exceeds max_input_length")]
    InputFieldTooLong(String),
    #[error("total state length exceeds max_total_state_length")]
    TotalStateTooLong,
    #[error("event at index {0} exceeds max_event_length")]
    EventTooLong(usize),
}

/// Normalizes a [`RawObservation`] into a size-capped, safety-validated
/// [`NormalizedObservation`]. Pure aside from the clock read for the
/// timestamp.
pub struct Normalizer {
    limits: NormalizerLimits,
}

impl Normalizer {
    pub fn new(limits: NormalizerLimits) -> Self {
        Self { limits }
    }

    pub fn normalize(
        &self,
        raw: &RawObservation,
        clock: &dyn Clock,
    ) -> Result<NormalizedObservation, NormalizeError> {
        for key in raw.0.keys() {
            if FORBIDDEN_KEYS.contains(&key.as_str()) {
                return Err(NormalizeError::ForbiddenKey(key.clone()));
            }
        }

        let mut state = BTreeMap::new();
        let mut total_len = 0usize;
        let mut events_raw: Option<&str> = None;

        for (key, value) in raw.0.iter() {
            if key == RESERVED_EVENTS_KEY {
                events_raw = Some(value.as_str());
                continue;
            }
            if value.len() > self.limits.max_input_length {
                return Err(NormalizeError::InputFieldTooLong(key.clone()));
            }
            total_len += value.len();
            state.insert(key.clone(), value.clone());
        }

        if total_len > self.limits.max_total_state_length {
            return Err(NormalizeError::TotalStateTooLong);
        }

        let events = match events_raw {
            Some(raw_events) => self.parse_events(raw_events)?,
            None => Vec::new(),
        };

        Ok(NormalizedObservation {
            timestamp: clock.now_ms(),
            state,
            events,
        })
    }

    fn parse_events(&self, raw: &str) -> Result<Vec<String>, NormalizeError> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(_) => return Ok(Vec::new()),
        };

        if json_depth(&value) > MAX_NESTING_DEPTH {
            return Err(NormalizeError::TooDeeplyNested);
        }

        let Value::Array(items) = value else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            if events.len() >= self.limits.max_events {
                break;
            }
            let Some(text) = stringify_event_element(&item) else {
                tracing::debug!(index = i, "dropping non-string event element");
                continue;
            };
            if text.len() > self.limits.max_event_length {
                return Err(NormalizeError::EventTooLong(i));
            }
            events.push(text);
        }

        Ok(events)
    }
}

/// Strings, numbers, and bools coerce via canonical string conversion;
/// objects and arrays are dropped (not string-coercible per the rule).
fn stringify_event_element(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

fn json_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(json_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(json_depth).max().unwrap_or(0),
        _ => 0,
    }
}
