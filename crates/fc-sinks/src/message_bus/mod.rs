//! Message-bus sink: three wire-compatible variants sharing one JSON envelope.

pub mod kafka;
pub mod rabbitmq;
pub mod sqs;

use fc_common::{BusEnvelope, ChangeEvent, SyncConfig};

/// Builds the `{db, collection, operation, document}` envelope every
/// message-bus variant publishes. Only called once the consumer has already
/// confirmed the operation is one of the four known variants.
pub(crate) fn envelope(cfg: &SyncConfig, event: &ChangeEvent) -> anyhow::Result<BusEnvelope> {
    Ok(BusEnvelope {
        db: cfg.destination_db.clone(),
        collection: event.destination_collection(cfg).to_string(),
        operation: event.parsed_operation()?,
        document: event.document.clone(),
    })
}
