//! Partitioned-log variant: `destination_db` is the topic.

use std::time::Duration;

use async_trait::async_trait;
use fc_common::{ChangeEvent, SyncConfig};
use fc_sink::Sink;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::RwLock;

const SEND_TIMEOUT: Duration = Duration::from_secs(3);

pub struct KafkaSink {
    cfg: SyncConfig,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaSink {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            producer: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Sink for KafkaSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        let uri = self
            .cfg
            .destination_uri
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("kafka sink requires destination_uri"))?;
        let brokers = uri.replace(';', ",");
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "3000")
            .create()?;
        *self.producer.write().await = Some(producer);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        *self.producer.write().await = None;
        Ok(())
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let guard = self.producer.read().await;
        let producer = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("kafka sink not initialized"))?;

        let envelope = super::envelope(&self.cfg, event)?;
        let payload = serde_json::to_vec(&envelope)?;
        let key = event.destination_collection(&self.cfg);

        producer
            .send(
                FutureRecord::to(&self.cfg.destination_db)
                    .payload(&payload)
                    .key(key),
                SEND_TIMEOUT,
            )
            .await
            .map_err(|(e, _)| anyhow::anyhow!("kafka send failed: {e}"))?;
        Ok(())
    }
}
