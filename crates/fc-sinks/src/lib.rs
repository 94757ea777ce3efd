//! Concrete sink adapters, one module per backend family, plus the factory
//! the Supervisor uses to construct one from a `SyncConfig`.

pub mod append_log;
pub mod document_db;
pub mod message_bus;
pub mod relational_db;
pub mod search_index;

use std::sync::Arc;

use fc_common::{SinkType, SyncConfig};
use fc_sink::Sink;

/// Constructs the sink adapter matching `cfg.sink_type`. Construction errors
/// are the caller's to log; per spec, a failed construction still leaves the
/// pipeline wired (the consumer will simply fail every dispatch).
pub fn build_sink(cfg: SyncConfig) -> anyhow::Result<Arc<dyn Sink>> {
    let sink: Arc<dyn Sink> = match cfg.sink_type {
        SinkType::Mongo => Arc::new(document_db::DocumentDbSink::new(cfg)),
        SinkType::Elasticsearch => Arc::new(search_index::SearchIndexSink::new(cfg)?),
        SinkType::Mysql | SinkType::Postgres => Arc::new(relational_db::RelationalDbSink::new(cfg)),
        SinkType::Kafka => Arc::new(message_bus::kafka::KafkaSink::new(cfg)),
        SinkType::Rabbitmq => Arc::new(message_bus::rabbitmq::RabbitmqSink::new(cfg)),
        SinkType::Nsq => Arc::new(message_bus::sqs::SqsSink::new(cfg)),
        SinkType::File => Arc::new(append_log::AppendLogSink::new(cfg)),
    };
    Ok(sink)
}
