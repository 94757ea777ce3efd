//! Producer: tails one sync key's source collections and feeds its channel.
//!
//! Unlike the teacher's `MongoStreamWatcher` (which retries forever with
//! exponential backoff around a dropped cursor), this producer exits its
//! loop on cursor closure or error and does not reconnect — the Program
//! Supervisor is the only thing that restarts a pipeline, via a full
//! `Stop`+`New`+`Run` cycle (see §4.4, §9 "no in-loop reconnect").

use std::sync::Arc;
use std::time::Duration;

use fc_common::{ChangeEvent, SyncConfig};
use fc_resume::ResumeStore;
use mongodb::bson::{self, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, ResumeToken};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Client, Collection};
use tokio::sync::mpsc::Sender;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
const MULTI_CURSOR_SOURCE_VERSION: f32 = 4.0;

pub struct Producer {
    sync_key: String,
    cfg: SyncConfig,
    source_client: Client,
    source_version: f32,
    resume_store: Arc<ResumeStore>,
    tx: Sender<ChangeEvent>,
}

impl Producer {
    pub fn new(
        sync_key: String,
        cfg: SyncConfig,
        source_client: Client,
        source_version: f32,
        resume_store: Arc<ResumeStore>,
        tx: Sender<ChangeEvent>,
    ) -> Self {
        Self {
            sync_key,
            cfg,
            source_client,
            source_version,
            resume_store,
            tx,
        }
    }

    /// Runs until the underlying cursor(s) close or error. Does not return an
    /// error: every failure is logged and causes an early but clean exit.
    pub async fn run(self) {
        if self.source_version >= MULTI_CURSOR_SOURCE_VERSION {
            self.run_database_scope().await;
        } else {
            self.run_per_collection().await;
        }
    }

    async fn run_database_scope(&self) {
        let db = self.source_client.database(&self.cfg.source_db);
        let resume_token = self.resume_store.get(&self.sync_key);
        let opts = build_options(resume_token);

        let stream = match tokio::time::timeout(SUBSCRIBE_TIMEOUT, db.watch().with_options(opts)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::error!(sync_key = %self.sync_key, error = %e, "failed to open database-scope change stream");
                return;
            }
            Err(_) => {
                tracing::error!(sync_key = %self.sync_key, "timed out opening database-scope change stream");
                return;
            }
        };

        self.drain(stream, &self.sync_key).await;
    }

    /// Pre-4.0 sources can't open a database-scope stream; open one cursor
    /// per configured source collection, multiplexed into the same channel.
    /// Unlike the original, each collection keeps its own resume-token entry
    /// (`sync_key:collection`) rather than clobbering a single shared one —
    /// see the Open Question on multi-cursor token ordering.
    async fn run_per_collection(&self) {
        let db = self.source_client.database(&self.cfg.source_db);
        let mut handles = Vec::new();

        for source_collection in self.cfg.collections.keys() {
            let resume_key = format!("{}:{}", self.sync_key, source_collection);
            let resume_token = self.resume_store.get(&resume_key);
            let opts = build_options(resume_token);
            let coll: Collection<Document> = db.collection(source_collection);
            let tx = self.tx.clone();
            let resume_store = self.resume_store.clone();
            let sync_key = self.sync_key.clone();
            let source_collection = source_collection.clone();

            handles.push(tokio::spawn(async move {
                let stream = match tokio::time::timeout(SUBSCRIBE_TIMEOUT, coll.watch().with_options(opts)).await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        tracing::error!(sync_key = %sync_key, collection = %source_collection, error = %e, "failed to open per-collection change stream");
                        return;
                    }
                    Err(_) => {
                        tracing::error!(sync_key = %sync_key, collection = %source_collection, "timed out opening per-collection change stream");
                        return;
                    }
                };
                drain_stream(stream, &resume_key, &resume_store, &tx).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn drain(&self, stream: ChangeStream<ChangeStreamEvent<Document>>, resume_key: &str) {
        drain_stream(stream, resume_key, &self.resume_store, &self.tx).await;
    }
}

fn build_options(resume_token: Option<Vec<u8>>) -> ChangeStreamOptions {
    let resume_token: Option<ResumeToken> = resume_token.and_then(|bytes| bson::from_slice(&bytes).ok());
    ChangeStreamOptions::builder()
        .full_document(Some(FullDocumentType::UpdateLookup))
        .resume_after(resume_token)
        .build()
}

async fn drain_stream(
    mut stream: ChangeStream<ChangeStreamEvent<Document>>,
    resume_key: &str,
    resume_store: &ResumeStore,
    tx: &Sender<ChangeEvent>,
) {
    while stream.is_alive() {
        let next = match stream.next_if_any().await {
            Ok(next) => next,
            Err(e) => {
                tracing::error!(resume_key = %resume_key, error = %e, "change stream cursor error, exiting producer loop");
                break;
            }
        };
        let Some(raw_event) = next else {
            continue;
        };

        let event = match decode(raw_event) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(resume_key = %resume_key, error = %e, "failed to decode change event, skipping without advancing token");
                continue;
            }
        };

        let token_bytes = match stream.resume_token() {
            Some(token) => match bson::to_vec(&token) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::error!(resume_key = %resume_key, error = %e, "failed to serialize resume token");
                    continue;
                }
            },
            None => {
                tracing::warn!(resume_key = %resume_key, "change stream produced an event with no resume token");
                continue;
            }
        };

        resume_store.set(resume_key, token_bytes);
        metrics::counter!("relay_events_produced_total").increment(1);

        if tx.send(event).await.is_err() {
            tracing::info!(resume_key = %resume_key, "consumer channel closed, exiting producer loop");
            break;
        }
    }
}

fn decode(event: ChangeStreamEvent<Document>) -> anyhow::Result<ChangeEvent> {
    let operation = format!("{:?}", event.operation_type).to_lowercase();

    // `rename`/`invalidate`/`drop` events carry neither a namespace nor a
    // document key; they are still decoded (zero-valued) so the resume token
    // advances past them. Only the consumer's `parsed_operation()` rejects
    // them, per the unknown-operation contract (spec.md §8 S5).
    let namespace = event
        .ns
        .map(|ns| fc_common::Namespace {
            db: ns.db.to_string(),
            coll: ns.coll.unwrap_or_default(),
        })
        .unwrap_or_default();

    let document_key = event
        .document_key
        .and_then(|doc| doc.get_object_id("_id").ok())
        .map(|id| fc_common::DocumentKey { id });

    let document = event
        .full_document
        .map(bson_to_json_map)
        .transpose()?
        .unwrap_or_default();

    let new_collection_name = event.rename_to.and_then(|ns| ns.coll);

    let id_bytes = bson::to_vec(&event.id)?;

    Ok(ChangeEvent {
        id: id_bytes,
        operation,
        namespace,
        document_key,
        document,
        new_collection_name,
        updates: event
            .update_description
            .map(|u| serde_json::to_value(bson::to_document(&u)?).map_err(anyhow::Error::from))
            .transpose()?,
        cluster_time: event
            .cluster_time
            .map(|t| serde_json::to_value(t.timestamp).map_err(anyhow::Error::from))
            .transpose()?,
        transaction: event.txn_number,
        session_id: None,
    })
}

fn bson_to_json_map(doc: Document) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
    let value = serde_json::to_value(doc)?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Ok(serde_json::Map::new()),
    }
}
