//! Search-index sink: projects change events into an Elasticsearch-shaped
//! bulk API over plain HTTP (there is no dedicated search-index client in
//! the corpus; `reqwest` against `_bulk` is the idiomatic substitute).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fc_common::{ChangeEvent, Operation, SyncConfig};
use fc_sink::Sink;
use reqwest::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const OP_TIMEOUT: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(60);

/// `destination_db` is either a bare index name, or `index/type` (variant B).
fn split_index(destination_db: &str) -> (&str, Option<&str>) {
    match destination_db.split_once('/') {
        Some((index, ty)) => (index, Some(ty)),
        None => (destination_db, None),
    }
}

pub struct SearchIndexSink {
    cfg: SyncConfig,
    http: Client,
    index: String,
    liveness: CancellationToken,
    bootstrapped: RwLock<bool>,
}

impl SearchIndexSink {
    pub fn new(cfg: SyncConfig) -> anyhow::Result<Self> {
        let (index, _ty) = split_index(&cfg.destination_db);
        let index = index.to_string();
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            cfg,
            http,
            index,
            liveness: CancellationToken::new(),
            bootstrapped: RwLock::new(false),
        })
    }

    fn base_url(&self) -> anyhow::Result<&str> {
        self.cfg
            .destination_uri
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("search-index sink requires destination_uri"))
    }

    async fn ensure_index(&self) -> anyhow::Result<()> {
        if *self.bootstrapped.read().await {
            return Ok(());
        }
        let base = self.base_url()?;
        let resp = self.http.head(format!("{base}/{}", self.index)).send().await?;
        if resp.status().is_success() {
            *self.bootstrapped.write().await = true;
            return Ok(());
        }

        let def_path = PathBuf::from(format!("./config/elasticsearch/{}.json", self.index));
        if let Ok(body) = tokio::fs::read_to_string(&def_path).await {
            let resp = self
                .http
                .put(format!("{base}/{}", self.index))
                .header("Content-Type", "application/json")
                .body(body)
                .send()
                .await?;
            if !resp.status().is_success() {
                anyhow::bail!(
                    "failed to create index {} from {}: {}",
                    self.index,
                    def_path.display(),
                    resp.text().await.unwrap_or_default()
                );
            }
        }
        *self.bootstrapped.write().await = true;
        Ok(())
    }

    async fn bulk(&self, ndjson: String) -> anyhow::Result<()> {
        let base = self.base_url()?;
        let resp = tokio::time::timeout(
            OP_TIMEOUT,
            self.http
                .post(format!("{base}/_bulk"))
                .header("Content-Type", "application/x-ndjson")
                .body(ndjson)
                .send(),
        )
        .await??;
        if !resp.status().is_success() {
            anyhow::bail!("bulk request failed: {}", resp.text().await.unwrap_or_default());
        }
        self.flush().await
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let base = self.base_url()?;
        self.http
            .post(format!("{base}/{}/_flush", self.index))
            .send()
            .await?;
        Ok(())
    }

    fn upsert_lines(&self, id: &str, document: &serde_json::Map<String, serde_json::Value>) -> String {
        let meta = serde_json::json!({ "update": { "_index": self.index, "_id": id } });
        let body = serde_json::json!({ "doc": document, "doc_as_upsert": true });
        format!("{}\n{}\n", meta, body)
    }

    fn delete_lines(&self, id: &str) -> String {
        let meta = serde_json::json!({ "delete": { "_index": self.index, "_id": id } });
        format!("{}\n", meta)
    }
}

#[async_trait]
impl Sink for SearchIndexSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        self.ensure_index().await?;

        let http = self.http.clone();
        let base = self.base_url()?.to_string();
        let liveness = self.liveness.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tokio::time::timeout(OP_TIMEOUT, http.get(&base).send()).await {
                            tracing::warn!(error = %e, "search-index sink ping timed out");
                        }
                    }
                    _ = liveness.cancelled() => break,
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.liveness.cancel();
        Ok(())
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        self.ensure_index().await?;
        let id = event.require_document_key()?.hex();
        match event.parsed_operation()? {
            Operation::Insert | Operation::Update => {
                self.bulk(self.upsert_lines(&id, &event.document)).await
            }
            Operation::Delete => self.bulk(self.delete_lines(&id)).await,
            Operation::Replace => {
                let mut ndjson = self.delete_lines(&id);
                ndjson.push_str(&self.upsert_lines(&id, &event.document));
                self.bulk(ndjson).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn split_index_handles_plain_and_index_type() {
        assert_eq!(split_index("products"), ("products", None));
        assert_eq!(split_index("products/item"), ("products", Some("item")));
    }

    fn cfg(uri: String) -> SyncConfig {
        SyncConfig {
            enable: true,
            sink_type: fc_common::SinkType::Elasticsearch,
            destination_uri: Some(uri),
            source_db: "users".into(),
            destination_db: "products".into(),
            collections: HashMap::from([("people".to_string(), "people".to_string())]),
            collection_field: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn handle_data_upserts_through_the_bulk_endpoint_and_flushes() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/products"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/products/_flush"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let sink = SearchIndexSink::new(cfg(server.uri())).unwrap();

        let event: ChangeEvent = serde_json::from_value(serde_json::json!({
            "id": [1,2,3],
            "operation": "insert",
            "namespace": {"db": "users", "coll": "people"},
            "document_key": {"id": "64ef00000000000000000000"},
            "document": {"name": "alice"}
        }))
        .unwrap();

        sink.handle_data(&event).await.unwrap();
    }
}
