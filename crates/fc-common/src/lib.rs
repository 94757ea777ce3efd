//! Shared types and error handling for the mongodb-sync relay.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub mod telemetry;

/// Errors that can terminate the relay or a single pipeline construction.
///
/// Everything else (subscription, decode, sink, snapshot errors) is logged
/// in place by the producer/consumer and never surfaces as this type.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("source version unsupported: {0}")]
    SourceUnsupported(String),

    #[error("sink error: {0}")]
    Sink(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("change event for operation {0} is missing its document key")]
    MissingDocumentKey(String),

    #[error("resume store error: {0}")]
    Resume(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// One of the five sink backend families a `SyncConfig` can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    Mongo,
    Elasticsearch,
    Mysql,
    Postgres,
    File,
    Kafka,
    Rabbitmq,
    Nsq,
}

impl SinkType {
    /// The token used when deriving a sync key; matches the config file's `type` value.
    pub fn as_key_str(&self) -> &'static str {
        match self {
            SinkType::Mongo => "mongo",
            SinkType::Elasticsearch => "elasticsearch",
            SinkType::Mysql => "mysql",
            SinkType::Postgres => "postgres",
            SinkType::File => "file",
            SinkType::Kafka => "kafka",
            SinkType::Rabbitmq => "rabbitmq",
            SinkType::Nsq => "nsq",
        }
    }

    pub fn requires_destination_uri(&self) -> bool {
        !matches!(self, SinkType::File)
    }
}

impl std::fmt::Display for SinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_key_str())
    }
}

/// One configured pipeline: source collections on one side, a single sink on the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub enable: bool,
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    #[serde(default)]
    pub destination_uri: Option<String>,
    pub source_db: String,
    pub destination_db: String,
    pub collections: HashMap<String, String>,
    #[serde(default)]
    pub collection_field: HashMap<String, Vec<String>>,
}

impl SyncConfig {
    /// Stable identity for this pipeline: `type|destination_uri|source_db|destination_db`.
    pub fn sync_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.sink_type.as_key_str(),
            self.destination_uri.as_deref().unwrap_or(""),
            self.source_db,
            self.destination_db
        )
    }

    /// Destination collection for a given source collection: the configured mapping,
    /// falling back to the source name unchanged.
    pub fn destination_collection<'a>(&'a self, source_collection: &'a str) -> &'a str {
        self.collections
            .get(source_collection)
            .map(String::as_str)
            .unwrap_or(source_collection)
    }

    /// Whether `field` is allowed through for `collection` per the allow-list.
    /// An absent or empty allow-list means every field passes.
    pub fn field_allowed(&self, collection: &str, field: &str) -> bool {
        match self.collection_field.get(collection) {
            None => true,
            Some(allowed) if allowed.is_empty() => true,
            Some(allowed) => allowed.iter().any(|f| f == field),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_db.is_empty() {
            return Err(RelayError::Config("source_db is required".into()));
        }
        if self.destination_db.is_empty() {
            return Err(RelayError::Config("destination_db is required".into()));
        }
        if self.collections.is_empty() {
            return Err(RelayError::Config(
                "collections mapping must not be empty".into(),
            ));
        }
        if self.sink_type.requires_destination_uri() && self.destination_uri.is_none() {
            return Err(RelayError::Config(format!(
                "destination_uri is required for sink type {}",
                self.sink_type
            )));
        }
        Ok(())
    }
}

/// A mutation observed on the source change stream, or `coll` for rename events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

/// Primary identifier of the affected document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentKey {
    pub id: bson::oid::ObjectId,
}

impl DocumentKey {
    pub fn hex(&self) -> String {
        self.id.to_hex()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Replace,
}

impl Operation {
    pub fn parse(raw: &str) -> std::result::Result<Self, RelayError> {
        match raw {
            "insert" => Ok(Operation::Insert),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            "replace" => Ok(Operation::Replace),
            other => Err(RelayError::UnknownOperation(other.to_string())),
        }
    }
}

/// One observed mutation, decoded from the source change stream.
///
/// `operation` is kept as the raw string the source reported (`rename`,
/// `invalidate`, etc. included) rather than the closed `Operation` enum:
/// the producer must advance the resume token for every decoded event
/// regardless of whether the operation is one the sinks understand, and
/// only the consumer's dispatch step rejects unknown operations (§8 S5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Opaque resume-token bytes for this event; never parsed by the core.
    pub id: Vec<u8>,
    pub operation: String,
    pub namespace: Namespace,
    /// Absent for `rename`/`invalidate`/`drop` events, which carry no
    /// document key; always present for `insert`/`update`/`delete`/`replace`.
    pub document_key: Option<DocumentKey>,
    pub document: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub new_collection_name: Option<String>,
    #[serde(default)]
    pub updates: Option<serde_json::Value>,
    #[serde(default)]
    pub cluster_time: Option<serde_json::Value>,
    #[serde(default)]
    pub transaction: Option<i64>,
    #[serde(default)]
    pub session_id: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn destination_collection<'a>(&'a self, cfg: &'a SyncConfig) -> &'a str {
        cfg.destination_collection(&self.namespace.coll)
    }

    /// Remove document keys not present in `cfg`'s allow-list for this event's collection.
    pub fn filter_field(&mut self, cfg: &SyncConfig) {
        let collection = self.namespace.coll.clone();
        self.document
            .retain(|k, _| cfg.field_allowed(&collection, k));
    }

    /// The event's operation, if it's one the sinks understand.
    pub fn parsed_operation(&self) -> Result<Operation> {
        Operation::parse(&self.operation)
    }

    /// The document key, for the operations that are guaranteed to carry one
    /// (`insert`/`update`/`delete`/`replace`). Sinks only ever see events that
    /// passed `parsed_operation()`, so this should never actually miss; it
    /// returns a typed error rather than panicking if it ever does.
    pub fn require_document_key(&self) -> Result<&DocumentKey> {
        self.document_key
            .as_ref()
            .ok_or_else(|| RelayError::MissingDocumentKey(self.operation.clone()))
    }
}

/// JSON envelope published by the message-bus sink variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub db: String,
    pub collection: String,
    pub operation: Operation,
    pub document: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SyncConfig {
        SyncConfig {
            enable: true,
            sink_type: SinkType::Mongo,
            destination_uri: Some("mongodb://dst".into()),
            source_db: "users".into(),
            destination_db: "users_copy".into(),
            collections: HashMap::from([("people".to_string(), "persons".to_string())]),
            collection_field: HashMap::new(),
        }
    }

    #[test]
    fn sync_key_joins_with_pipe() {
        assert_eq!(cfg().sync_key(), "mongo|mongodb://dst|users|users_copy");
    }

    #[test]
    fn destination_collection_falls_back_to_source() {
        let c = cfg();
        assert_eq!(c.destination_collection("people"), "persons");
        assert_eq!(c.destination_collection("other"), "other");
    }

    #[test]
    fn empty_allow_list_passes_everything() {
        let c = cfg();
        assert!(c.field_allowed("people", "anything"));
    }

    #[test]
    fn allow_list_rejects_unlisted_fields() {
        let mut c = cfg();
        c.collection_field
            .insert("people".to_string(), vec!["name".to_string()]);
        assert!(c.field_allowed("people", "name"));
        assert!(!c.field_allowed("people", "age"));
    }

    #[test]
    fn validate_requires_destination_uri_except_for_file() {
        let mut c = cfg();
        c.destination_uri = None;
        assert!(c.validate().is_err());
        c.sink_type = SinkType::File;
        assert!(c.validate().is_ok());
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(Operation::parse("rename").is_err());
        assert!(Operation::parse("insert").is_ok());
    }
}
