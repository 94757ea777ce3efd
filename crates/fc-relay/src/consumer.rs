//! Consumer: one task per sync key, draining the hand-off channel and
//! dispatching each event to the sink registered under that key.

use fc_common::ChangeEvent;
use fc_sink::Sink;
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;

pub struct Consumer {
    sync_key: String,
    rx: Receiver<ChangeEvent>,
    sink: Arc<dyn Sink>,
}

impl Consumer {
    pub fn new(sync_key: String, rx: Receiver<ChangeEvent>, sink: Arc<dyn Sink>) -> Self {
        Self { sync_key, rx, sink }
    }

    /// Runs until the channel closes (the producer side dropped, which only
    /// happens at shutdown). `filter_field` then `handle_data`; both errors
    /// are logged, neither halts the loop — a failing sink never blocks
    /// other sync keys, each of which has its own consumer task.
    pub async fn run(mut self) {
        while let Some(mut event) = self.rx.recv().await {
            if let Err(e) = event.parsed_operation() {
                tracing::debug!(
                    sync_key = %self.sync_key,
                    operation = %event.operation,
                    error = %e,
                    "dropping event with unrecognized operation, resume token already advanced"
                );
                continue;
            }

            let collection = event.namespace.coll.clone();
            self.sink.filter_field(&collection, &mut event.document);

            match self.sink.handle_data(&event).await {
                Ok(()) => {
                    metrics::counter!("relay_events_dispatched_total", "sync_key" => self.sync_key.clone())
                        .increment(1);
                }
                Err(e) => {
                    metrics::counter!("relay_sink_errors_total", "sync_key" => self.sync_key.clone())
                        .increment(1);
                    tracing::warn!(
                        sync_key = %self.sync_key,
                        error = %e,
                        "sink dispatch failed, event lost for this sink"
                    );
                }
            }
        }
        tracing::info!(sync_key = %self.sync_key, "consumer channel closed, exiting");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fc_common::{DocumentKey, Namespace, SinkType, SyncConfig};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingSink {
        cfg: SyncConfig,
        handled: AtomicUsize,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn sync_config(&self) -> &SyncConfig {
            &self.cfg
        }
        async fn init_client(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn handle_data(&self, _event: &ChangeEvent) -> anyhow::Result<()> {
            if std::mem::replace(&mut *self.fail_next.lock().unwrap(), false) {
                anyhow::bail!("synthetic failure");
            }
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn cfg() -> SyncConfig {
        SyncConfig {
            enable: true,
            sink_type: SinkType::File,
            destination_uri: None,
            source_db: "a".into(),
            destination_db: "b".into(),
            collections: HashMap::from([("c".to_string(), "d".to_string())]),
            collection_field: HashMap::from([("c".to_string(), vec!["keep".to_string()])]),
        }
    }

    fn event() -> ChangeEvent {
        ChangeEvent {
            id: vec![1],
            operation: "insert".into(),
            namespace: Namespace {
                db: "a".into(),
                coll: "c".into(),
            },
            document_key: Some(DocumentKey {
                id: bson::oid::ObjectId::new(),
            }),
            document: serde_json::Map::from_iter([
                ("keep".to_string(), serde_json::json!(1)),
                ("drop".to_string(), serde_json::json!(2)),
            ]),
            new_collection_name: None,
            updates: None,
            cluster_time: None,
            transaction: None,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn filters_before_dispatch_and_keeps_running_after_sink_error() {
        let sink = Arc::new(RecordingSink {
            cfg: cfg(),
            handled: AtomicUsize::new(0),
            fail_next: Mutex::new(true),
        });
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let consumer = Consumer::new("key".into(), rx, sink.clone());
        let handle = tokio::spawn(consumer.run());

        tx.send(event()).await.unwrap();
        tx.send(event()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // First event's HandleData failed (synthetic), second succeeded.
        assert_eq!(sink.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drops_unrecognized_operations_without_dispatching() {
        let sink = Arc::new(RecordingSink {
            cfg: cfg(),
            handled: AtomicUsize::new(0),
            fail_next: Mutex::new(false),
        });
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        let consumer = Consumer::new("key".into(), rx, sink.clone());
        let handle = tokio::spawn(consumer.run());

        let mut rename_event = event();
        rename_event.operation = "rename".into();
        rename_event.document_key = None;
        tx.send(rename_event).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(sink.handled.load(Ordering::SeqCst), 0);
    }
}
