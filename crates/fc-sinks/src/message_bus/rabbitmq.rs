//! Pub/sub exchange variant: `destination_db` is a topic exchange, passively
//! declared (it must already exist); routing key is `mongodb-sync.<operation>`.

use async_trait::async_trait;
use fc_common::{ChangeEvent, Operation, SyncConfig};
use fc_sink::Sink;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::RwLock;

fn operation_str(op: Operation) -> &'static str {
    match op {
        Operation::Insert => "insert",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::Replace => "replace",
    }
}

struct RabbitmqClient {
    // Kept alive so the channel isn't closed when the connection drops.
    _connection: Connection,
    channel: Channel,
}

pub struct RabbitmqSink {
    cfg: SyncConfig,
    client: RwLock<Option<RabbitmqClient>>,
}

impl RabbitmqSink {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            client: RwLock::new(None),
        }
    }
}

#[async_trait]
impl Sink for RabbitmqSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        let uri = self
            .cfg
            .destination_uri
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("rabbitmq sink requires destination_uri"))?;
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                &self.cfg.destination_db,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        *self.client.write().await = Some(RabbitmqClient {
            _connection: connection,
            channel,
        });
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(client) = self.client.write().await.take() {
            client.channel.close(200, "disconnect").await?;
        }
        Ok(())
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("rabbitmq sink not initialized"))?;

        let envelope = super::envelope(&self.cfg, event)?;
        let payload = serde_json::to_vec(&envelope)?;
        let routing_key = format!("mongodb-sync.{}", operation_str(envelope.operation));

        client
            .channel
            .basic_publish(
                &self.cfg.destination_db,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await?
            .await?;
        Ok(())
    }
}
