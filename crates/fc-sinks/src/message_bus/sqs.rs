//! Simple queue producer variant, standing in for the original's NSQ
//! producer (no NSQ crate exists in the corpus); `destination_uri` is the
//! queue URL. Runs a periodic ping for connection health, per spec.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use fc_common::{ChangeEvent, SyncConfig};
use fc_sink::Sink;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

const OP_TIMEOUT: Duration = Duration::from_secs(3);
const PING_INTERVAL: Duration = Duration::from_secs(60);

pub struct SqsSink {
    cfg: SyncConfig,
    client: RwLock<Option<Client>>,
    liveness: CancellationToken,
}

impl SqsSink {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            client: RwLock::new(None),
            liveness: CancellationToken::new(),
        }
    }

    fn queue_url(&self) -> anyhow::Result<&str> {
        self.cfg
            .destination_uri
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("nsq-compatible sink requires destination_uri (queue URL)"))
    }
}

#[async_trait]
impl Sink for SqsSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = Client::new(&config);
        *self.client.write().await = Some(client.clone());

        let queue_url = self.queue_url()?.to_string();
        let liveness = self.liveness.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = client.get_queue_attributes().queue_url(&queue_url).send().await {
                            tracing::warn!(error = %e, "nsq-compatible sink ping failed");
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
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("nsq-compatible sink not initialized"))?;

        let envelope = super::envelope(&self.cfg, event)?;
        let body = serde_json::to_string(&envelope)?;
        let dedup_id = event.require_document_key()?.hex();

        tokio::time::timeout(
            OP_TIMEOUT,
            client
                .send_message()
                .queue_url(self.queue_url()?)
                .message_body(body)
                .message_group_id(event.destination_collection(&self.cfg))
                .message_deduplication_id(dedup_id)
                .send(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("sqs send timed out"))?
        .map_err(|e| anyhow::anyhow!("sqs send error: {e}"))?;
        Ok(())
    }
}
