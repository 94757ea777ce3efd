//! Append-log sink: a rotating, gzip-compressing newline-delimited-JSON
//! writer. Preferred recovery source — it never reorders and never drops.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fc_common::{ChangeEvent, SyncConfig};
use fc_sink::Sink;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

const MAX_SIZE_BYTES: u64 = 100 * 1024 * 1024;
const BASE_DIR: &str = "./oplog";

struct RotatingWriter {
    path: PathBuf,
    file: File,
    size: u64,
    generation: u64,
}

impl RotatingWriter {
    fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            file,
            size,
            generation: 0,
        })
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.size + line.len() as u64 > MAX_SIZE_BYTES {
            self.rotate()?;
        }
        self.file.write_all(line)?;
        self.size += line.len() as u64;
        Ok(())
    }

    fn rotate(&mut self) -> std::io::Result<()> {
        self.generation += 1;
        let rotated_path = self.path.with_extension(format!("{}.oplog", self.generation));
        fs::rename(&self.path, &rotated_path)?;
        compress_and_remove(&rotated_path)?;
        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

fn compress_and_remove(path: &Path) -> std::io::Result<()> {
    let data = fs::read(path)?;
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    let gz_file = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(gz_file, Compression::default());
    encoder.write_all(&data)?;
    encoder.finish()?;
    fs::remove_file(path)?;
    Ok(())
}

pub struct AppendLogSink {
    cfg: SyncConfig,
    writer: Mutex<Option<RotatingWriter>>,
    rotations: AtomicU64,
}

impl AppendLogSink {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            writer: Mutex::new(None),
            rotations: AtomicU64::new(0),
        }
    }

    fn log_path(&self) -> PathBuf {
        PathBuf::from(BASE_DIR).join(format!(
            "{}-to-{}.oplog",
            self.cfg.source_db, self.cfg.destination_db
        ))
    }

    pub fn rotation_count(&self) -> u64 {
        self.rotations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for AppendLogSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        let writer = RotatingWriter::open(self.log_path())?;
        *self.writer.lock() = Some(writer);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        *self.writer.lock() = None;
        Ok(())
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("append-log sink not initialized"))?;
        let generation_before = writer.generation;
        writer.write_line(&line)?;
        if writer.generation != generation_before {
            self.rotations.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg(dir: &Path) -> SyncConfig {
        SyncConfig {
            enable: true,
            sink_type: fc_common::SinkType::File,
            destination_uri: None,
            source_db: "users".into(),
            destination_db: dir.to_string_lossy().to_string(),
            collections: HashMap::from([("people".to_string(), "people".to_string())]),
            collection_field: HashMap::new(),
        }
    }

    #[test]
    fn writer_rotates_when_a_line_would_exceed_the_bound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a-to-b.oplog");
        let mut writer = RotatingWriter::open(path.clone()).unwrap();
        writer.size = MAX_SIZE_BYTES - 2;
        writer.write_line(b"abcdef\n").unwrap();
        assert_eq!(writer.generation, 1);
        assert!(dir.path().join("a-to-b.1.oplog.gz").exists());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn handle_data_writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_current_dir(&dir).unwrap();
        let sink = AppendLogSink::new(cfg(dir.path()));
        sink.init_client().await.unwrap();

        let event: ChangeEvent = serde_json::from_value(serde_json::json!({
            "id": [1,2,3],
            "operation": "insert",
            "namespace": {"db": "users", "coll": "people"},
            "document_key": {"id": "64ef00000000000000000000"},
            "document": {"name": "alice"}
        }))
        .unwrap();

        sink.handle_data(&event).await.unwrap();
        sink.disconnect().await.unwrap();
    }
}
