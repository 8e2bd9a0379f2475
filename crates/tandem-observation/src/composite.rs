use std::time::Duration;

use async_trait::async_trait;
use tandem_types::RawObservation;

/// One observation source. Implementations wrap whatever upstream
/// collaborator (memory, world model, goal stack...) actually produces text;
/// the runtime only ever sees the `RawObservation` it returns.
#[async_trait]
pub trait ObservationSource: Send + Sync {
    /// Short, stable label used in logs when a source fails or times out.
    fn name(&self) -> &str;

    async fn get_observations(&self) -> anyhow::Result<RawObservation>;
}

/// Fan-in over an ordered sequence of sources. Invokes each in order and
/// merges results with last-writer-wins on colliding keys. A source that
/// fails or times out is logged and skipped; the composite only fails if
/// every source failed and none produced output.
pub struct CompositeObservationAdapter {
    sources: Vec<Box<dyn ObservationSource>>,
    per_source_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
#[error("all {0} observation sources failed")]
pub struct AllSourcesFailed(pub usize);

impl CompositeObservationAdapter {
    pub fn new(sources: Vec<Box<dyn ObservationSource>>, per_source_timeout: Duration) -> Self {
        Self {
            sources,
            per_source_timeout,
        }
    }

    pub async fn get_observations(&self) -> Result<RawObservation, AllSourcesFailed> {
        let mut merged = RawObservation::new();
        let mut any_succeeded = false;

        for source in &self.sources {
            match tokio::time::timeout(self.per_source_timeout, source.get_observations()).await {
                Ok(Ok(raw)) => {
                    any_succeeded = true;
                    merged.merge_from(raw);
                }
                Ok(Err(err)) => {
                    tracing::warn!(source = source.name(), error = %err, "observation source failed");
                }
                Err(_) => {
                    tracing::warn!(
                        source = source.name(),
                        timeout_ms = self.per_source_timeout.as_millis() as u64,
                        "observation source timed out"
                    );
                }
            }
        }

        if !any_succeeded && !self.sources.is_empty() {
            return Err(AllSourcesFailed(self.sources.len()));
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FixedSource {
        name: &'static str,
        pairs: Vec<(&'static str, &'static str)>,
    }

    #[async_trait]
    impl ObservationSource for FixedSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn get_observations(&self) -> anyhow::Result<RawObservation> {
            let mut raw = RawObservation::new();
            for (k, v) in &self.pairs {
                raw.insert(*k, *v);
            }
            Ok(raw)
        }
    }

    struct FailingSource;

    #[async_trait]
    impl ObservationSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get_observations(&self) -> anyhow::Result<RawObservation> {
            anyhow::bail!("boom")
        }
    }

    struct HangingSource;

    #[async_trait]
    impl ObservationSource for HangingSource {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn get_observations(&self) -> anyhow::Result<RawObservation> {
            futures_never_resolves().await
        }
    }

    async fn futures_never_resolves() -> anyhow::Result<RawObservation> {
        std::future::pending().await
    }

    #[tokio::test]
    async fn merges_sources_last_writer_wins() {
        let adapter = CompositeObservationAdapter::new(
            vec![
                Box::new(FixedSource {
                    name: "first",
                    pairs: vec![("mood", "curious"), ("phase", "idle")],
                }),
                Box::new(FixedSource {
                    name: "second",
                    pairs: vec![("phase", "active")],
                }),
            ],
            Duration::from_millis(100),
        );

        let merged = adapter.get_observations().await.unwrap();
        assert_eq!(merged.0.get("mood").unwrap(), "curious");
        assert_eq!(merged.0.get("phase").unwrap(), "active");
    }

    #[tokio::test]
    async fn skips_failing_source_and_keeps_partial_results() {
        let adapter = CompositeObservationAdapter::new(
            vec![
                Box::new(FailingSource),
                Box::new(FixedSource {
                    name: "ok",
                    pairs: vec![("mood", "curious")],
                }),
            ],
            Duration::from_millis(100),
        );

        let merged = adapter.get_observations().await.unwrap();
        assert_eq!(merged.0.get("mood").unwrap(), "curious");
    }

    #[tokio::test]
    async fn times_out_hanging_source_without_blocking_others() {
        let adapter = CompositeObservationAdapter::new(
            vec![
                Box::new(HangingSource),
                Box::new(FixedSource {
                    name: "ok",
                    pairs: vec![("mood", "curious")],
                }),
            ],
            Duration::from_millis(20),
        );

        let merged = adapter.get_observations().await.unwrap();
        assert_eq!(merged.0.get("mood").unwrap(), "curious");
    }

    #[tokio::test]
    async fn fails_only_when_every_source_fails() {
        let adapter = CompositeObservationAdapter::new(
            vec![Box::new(FailingSource), Box::new(FailingSource)],
            Duration::from_millis(100),
        );

        let err = adapter.get_observations().await.unwrap_err();
        assert_eq!(err.0, 2);
    }

    #[tokio::test]
    async fn invocation_order_is_preserved() {
        let order = Arc::new(AtomicUsize::new(0));

        struct OrderTrackingSource {
            order: Arc<AtomicUsize>,
            expected: usize,
        }

        #[async_trait]
        impl ObservationSource for OrderTrackingSource {
            fn name(&self) -> &str {
                "order"
            }
            async fn get_observations(&self) -> anyhow::Result<RawObservation> {
                let seen = self.order.fetch_add(1, Ordering::SeqCst);
                assert_eq!(seen, self.expected);
                Ok(RawObservation::new())
            }
        }

        let adapter = CompositeObservationAdapter::new(
            vec![
                Box::new(OrderTrackingSource {
                    order: order.clone(),
                    expected: 0,
                }),
                Box::new(OrderTrackingSource {
                    order: order.clone(),
                    expected: 1,
                }),
            ],
            Duration::from_millis(100),
        );

        adapter.get_observations().await.unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 2);
    }
}
