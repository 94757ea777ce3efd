//! Document-DB sink: mirrors change events onto another MongoDB deployment.

use std::time::Duration;

use async_trait::async_trait;
use fc_common::{ChangeEvent, Operation, SyncConfig};
use fc_sink::Sink;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::options::ClientOptions;
use mongodb::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const OP_TIMEOUT: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(60);

pub struct DocumentDbSink {
    cfg: SyncConfig,
    client: RwLock<Option<Client>>,
    liveness: CancellationToken,
}

impl DocumentDbSink {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            client: RwLock::new(None),
            liveness: CancellationToken::new(),
        }
    }

    async fn client(&self) -> anyhow::Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("document-db sink not initialized"))
    }

    async fn exists(&self, client: &Client, coll: &str, id: Bson) -> anyhow::Result<bool> {
        let count = tokio::time::timeout(
            OP_TIMEOUT,
            client
                .database(&self.cfg.destination_db)
                .collection::<Document>(coll)
                .count_documents(doc! { "_id": id }),
        )
        .await??;
        Ok(count > 0)
    }

    async fn insert(&self, client: &Client, coll: &str, event: &ChangeEvent) -> anyhow::Result<()> {
        let key = event.require_document_key()?;
        let mut body = bson::to_document(&event.document)?;
        body.insert("_id", key.id);
        tokio::time::timeout(
            OP_TIMEOUT,
            client
                .database(&self.cfg.destination_db)
                .collection::<Document>(coll)
                .insert_one(body),
        )
        .await??;
        Ok(())
    }

    async fn update(&self, client: &Client, coll: &str, event: &ChangeEvent) -> anyhow::Result<()> {
        let id: Bson = event.require_document_key()?.id.into();
        // Update-promoted-to-insert: resume-from-token after a partial sync can
        // deliver an update for a document this sink never received the insert for.
        if !self.exists(client, coll, id.clone()).await? {
            return self.insert(client, coll, event).await;
        }
        let set = bson::to_document(&event.document)?;
        tokio::time::timeout(
            OP_TIMEOUT,
            client
                .database(&self.cfg.destination_db)
                .collection::<Document>(coll)
                .update_one(doc! { "_id": id }, doc! { "$set": set }),
        )
        .await??;
        Ok(())
    }

    async fn delete(&self, client: &Client, coll: &str, event: &ChangeEvent) -> anyhow::Result<()> {
        let key = event.require_document_key()?;
        tokio::time::timeout(
            OP_TIMEOUT,
            client
                .database(&self.cfg.destination_db)
                .collection::<Document>(coll)
                .delete_one(doc! { "_id": key.id }),
        )
        .await??;
        Ok(())
    }

    async fn replace(&self, client: &Client, coll: &str, event: &ChangeEvent) -> anyhow::Result<()> {
        let key = event.require_document_key()?;
        let mut body = bson::to_document(&event.document)?;
        body.insert("_id", key.id);
        tokio::time::timeout(
            OP_TIMEOUT,
            client
                .database(&self.cfg.destination_db)
                .collection::<Document>(coll)
                .replace_one(doc! { "_id": key.id }, body),
        )
        .await??;
        Ok(())
    }
}

#[async_trait]
impl Sink for DocumentDbSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        let uri = self
            .cfg
            .destination_uri
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("document-db sink requires destination_uri"))?;
        let mut opts = ClientOptions::parse(uri).await?;
        opts.app_name = Some("mongodb-sync".to_string());
        let client = Client::with_options(opts)?;
        *self.client.write().await = Some(client.clone());

        let liveness = self.liveness.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = tokio::time::timeout(
                            OP_TIMEOUT,
                            client.database("admin").run_command(doc! { "ping": 1 }),
                        ).await {
                            tracing::warn!(error = %e, "document-db sink ping timed out");
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
        *self.client.write().await = None;
        Ok(())
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let client = self.client().await?;
        let coll = event.destination_collection(&self.cfg).to_string();
        match event.parsed_operation()? {
            Operation::Insert => self.insert(&client, &coll, event).await,
            Operation::Update => self.update(&client, &coll, event).await,
            Operation::Delete => self.delete(&client, &coll, event).await,
            Operation::Replace => self.replace(&client, &coll, event).await,
        }
    }
}
