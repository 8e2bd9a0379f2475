//! Observation assembly for the Tandem agent runtime: a composite fan-in
//! adapter over multiple text sources feeding a size/safety-capped
//! normalizer. Kept separate from `tandem-orchestrator` since both the
//! executor and any upstream glue code construct these independently of
//! scheduling.

mod composite;
mod normalizer;

pub use composite::{AllSourcesFailed, CompositeObservationAdapter, ObservationSource};
pub use normalizer::{NormalizeError, Normalizer, NormalizerLimits, RESERVED_EVENTS_KEY};
