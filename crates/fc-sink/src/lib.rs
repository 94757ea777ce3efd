//! The four-operation sink contract and the supervisor-owned sink registry.
//!
//! The original keeps this as a process-wide global map mutated by a package
//! init function; here the registry is an owned value the Supervisor builds
//! in `New` and injects into consumer tasks, per REDESIGN FLAGS.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use fc_common::{ChangeEvent, SyncConfig};

/// Every backend adapter implements this. `filter_field` has a default
/// implementation backed by `sync_config()`'s allow-list; adapters only need
/// to override it if their backend has a cheaper way to project fields.
#[async_trait]
pub trait Sink: Send + Sync {
    fn sync_config(&self) -> &SyncConfig;

    async fn init_client(&self) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;

    fn filter_field(
        &self,
        collection: &str,
        document: &mut serde_json::Map<String, serde_json::Value>,
    ) {
        let cfg = self.sync_config();
        document.retain(|k, _| cfg.field_allowed(collection, k));
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()>;
}

/// Sync-key -> sink map. Mutated only at quiescent points (construction,
/// disconnect); read concurrently by every consumer task.
#[derive(Clone, Default)]
pub struct SinkRegistry {
    sinks: Arc<DashMap<String, Arc<dyn Sink>>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sync_key: String, sink: Arc<dyn Sink>) {
        self.sinks.insert(sync_key, sink);
    }

    pub fn get(&self, sync_key: &str) -> Option<Arc<dyn Sink>> {
        self.sinks.get(sync_key).map(|entry| entry.value().clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.sinks.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Calls `Disconnect` on every registered sink, logging but not propagating
    /// failures, then empties the registry.
    pub async fn disconnect_all(&self) {
        let keys = self.keys();
        for key in keys {
            if let Some((_, sink)) = self.sinks.remove(&key) {
                if let Err(e) = sink.disconnect().await {
                    tracing::warn!(sync_key = %key, error = %e, "sink disconnect failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DummySink {
        cfg: SyncConfig,
        disconnects: AtomicUsize,
    }

    #[async_trait]
    impl Sink for DummySink {
        fn sync_config(&self) -> &SyncConfig {
            &self.cfg
        }

        async fn init_client(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn handle_data(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn cfg() -> SyncConfig {
        SyncConfig {
            enable: true,
            sink_type: fc_common::SinkType::File,
            destination_uri: None,
            source_db: "a".into(),
            destination_db: "b".into(),
            collections: std::collections::HashMap::from([("c".to_string(), "d".to_string())]),
            collection_field: std::collections::HashMap::from([(
                "c".to_string(),
                vec!["keep".to_string()],
            )]),
        }
    }

    #[tokio::test]
    async fn register_and_get_round_trip() {
        let registry = SinkRegistry::new();
        let sink = Arc::new(DummySink {
            cfg: cfg(),
            disconnects: AtomicUsize::new(0),
        });
        registry.register("key1".into(), sink.clone());
        assert!(registry.get("key1").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn disconnect_all_calls_every_sink_and_empties_registry() {
        let registry = SinkRegistry::new();
        let sink = Arc::new(DummySink {
            cfg: cfg(),
            disconnects: AtomicUsize::new(0),
        });
        registry.register("key1".into(), sink.clone());
        registry.disconnect_all().await;
        assert_eq!(sink.disconnects.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn default_filter_field_drops_unlisted_keys() {
        let sink = DummySink {
            cfg: cfg(),
            disconnects: AtomicUsize::new(0),
        };
        let mut doc = serde_json::Map::new();
        doc.insert("keep".into(), serde_json::json!(1));
        doc.insert("drop".into(), serde_json::json!(2));
        sink.filter_field("c", &mut doc);
        assert!(doc.contains_key("keep"));
        assert!(!doc.contains_key("drop"));
    }
}
