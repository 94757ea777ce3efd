//! Program Supervisor: builds the pipeline graph from configuration, starts
//! producers/consumers, and orchestrates shutdown.
//!
//! Configuration reload is a full `Stop` + `New` + `Run` cycle driven by the
//! external watcher (§4.6); this crate never attempts live reconfiguration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fc_common::{RelayError, Result, SyncConfig};
use fc_config::Config;
use fc_resume::ResumeStore;
use fc_sink::SinkRegistry;
use mongodb::Client;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::consumer::Consumer;
use crate::producer::Producer;

const MIN_SOURCE_VERSION: f32 = 3.6;
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(3);
const RESUME_SNAPSHOT_PATH: &str = "./last_event_ids.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unstarted,
    Running,
    Stopping,
    Terminated,
}

/// Owns every long-lived resource: the source client, the resume store, the
/// sink registry, and every background task. Producers own their cursors;
/// sinks own their backend clients; channels belong exclusively here.
pub struct Supervisor {
    cfg: Config,
    source_client: Client,
    resume_store: Arc<ResumeStore>,
    registry: SinkRegistry,
    snapshot_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    state: State,
}

impl Supervisor {
    /// Opens the source client, constructs and registers a sink per enabled
    /// `SyncConfig`, and loads the resume-token snapshot from disk
    /// (best-effort — a missing or corrupt file is a cold start, not fatal).
    pub async fn new(cfg: Config) -> Result<Self> {
        let source_client = Client::with_uri_str(&cfg.mongo.source_uri)
            .await
            .map_err(|e| RelayError::Config(format!("failed to connect to source: {e}")))?;

        let registry = SinkRegistry::new();
        for sync in cfg.enabled_syncs() {
            let sync_key = sync.sync_key();
            match fc_sinks::build_sink(sync.clone()) {
                Ok(sink) => registry.register(sync_key, sink),
                Err(e) => {
                    // Per spec: construction errors are logged, but the pipeline for
                    // this key is still wired — its consumer will fail every dispatch
                    // until reconfiguration fixes the underlying problem.
                    tracing::error!(sync_key = %sync_key, error = %e, "sink construction failed");
                }
            }
        }

        let resume_store = Arc::new(ResumeStore::new());
        let snapshot_path = PathBuf::from(RESUME_SNAPSHOT_PATH);
        resume_store.load_from_file(&snapshot_path);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            cfg,
            source_client,
            resume_store,
            registry,
            snapshot_path,
            shutdown_tx,
            tasks: Vec::new(),
            state: State::Unstarted,
        })
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(
        cfg: Config,
        source_client: Client,
        snapshot_path: PathBuf,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            registry: SinkRegistry::new(),
            resume_store: Arc::new(ResumeStore::new()),
            cfg,
            source_client,
            snapshot_path,
            shutdown_tx,
            tasks: Vec::new(),
            state: State::Unstarted,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Rejects source versions below the change-stream floor, starts the
    /// periodic snapshot ticker, then wires one producer/consumer/channel
    /// triple per enabled sync key.
    pub async fn run(&mut self) -> Result<()> {
        if self.cfg.mongo.source_version < MIN_SOURCE_VERSION {
            return Err(RelayError::SourceUnsupported(format!(
                "source version {} is below the minimum {} required for change streams",
                self.cfg.mongo.source_version, MIN_SOURCE_VERSION
            )));
        }

        self.state = State::Running;
        let snapshot_ticker = self.spawn_snapshot_ticker();
        self.tasks.push(snapshot_ticker);

        for sync in self.cfg.enabled_syncs().cloned().collect::<Vec<_>>() {
            let sync_key = sync.sync_key();
            let Some(sink) = self.registry.get(&sync_key) else {
                continue;
            };
            if let Err(e) = sink.init_client().await {
                tracing::error!(sync_key = %sync_key, error = %e, "sink init_client failed, pipeline will fail every dispatch");
            }

            let (tx, rx) = tokio::sync::mpsc::channel(1);

            let consumer = Consumer::new(sync_key.clone(), rx, sink);
            self.tasks.push(tokio::spawn(consumer.run()));

            let producer = Producer::new(
                sync_key,
                sync,
                self.source_client.clone(),
                self.cfg.mongo.source_version,
                self.resume_store.clone(),
                tx,
            );
            self.tasks.push(tokio::spawn(producer.run()));
        }

        Ok(())
    }

    fn spawn_snapshot_ticker(&self) -> JoinHandle<()> {
        let resume_store = self.resume_store.clone();
        let path = self.snapshot_path.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        write_snapshot(&resume_store, &path);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// Signals the snapshot ticker to stop, writes a final resume-token
    /// snapshot, drains for up to `SHUTDOWN_DRAIN` to let in-flight events
    /// reach their sinks, then disconnects every sink. Errors at every step
    /// are logged; shutdown always completes.
    pub async fn stop(mut self) {
        self.state = State::Stopping;
        let _ = self.shutdown_tx.send(());

        write_snapshot(&self.resume_store, &self.snapshot_path);

        tokio::time::sleep(SHUTDOWN_DRAIN).await;

        self.registry.disconnect_all().await;

        for task in self.tasks.drain(..) {
            task.abort();
        }

        self.state = State::Terminated;
    }
}

fn write_snapshot(resume_store: &ResumeStore, path: &Path) {
    if let Err(e) = resume_store.save_to_file(path) {
        tracing::warn!(error = %e, path = %path.display(), "failed to write resume snapshot, will retry next tick");
    } else {
        metrics::counter!("relay_resume_snapshots_written_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fc_config::MongoConfig;
    use std::collections::HashMap;

    fn test_config(source_version: f32) -> Config {
        Config {
            debug: false,
            mongo: MongoConfig {
                source_uri: "mongodb://localhost:27017".into(),
                source_version,
            },
            sync: vec![SyncConfig {
                enable: true,
                sink_type: fc_common::SinkType::File,
                destination_uri: None,
                source_db: "users".into(),
                destination_db: "archive".into(),
                collections: HashMap::from([("people".to_string(), "people".to_string())]),
                collection_field: HashMap::new(),
            }],
        }
    }

    #[tokio::test]
    async fn run_rejects_source_versions_below_3_6() {
        // `with_uri_str` only parses and validates the URI; it does not connect.
        let client = Client::with_uri_str("mongodb://localhost:27017").await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor =
            Supervisor::new_for_test(test_config(3.4), client, dir.path().join("last_event_ids.json"));
        let err = supervisor.run().await.unwrap_err();
        assert!(matches!(err, RelayError::SourceUnsupported(_)));
    }
}
