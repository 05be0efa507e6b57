//! Periodic snapshot of unprocessed broker traffic.
//!
//! A bulk consumer drains the backup queue and the messages are written as a
//! JSON array to `<location><Weekday>`, so a week of snapshots rotates in
//! place.

use crate::broker::{BulkConsumer, ConnectionManager, Message, MessageFilter};
use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::{DateTime, Local};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One message as stored in a backup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

impl From<&Message> for BackupRecord {
    fn from(message: &Message) -> Self {
        Self {
            headers: message
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.to_string_lossy()))
                .collect(),
            body: BASE64_STANDARD.encode(&message.body),
        }
    }
}

/// `location` is a path prefix, not a directory: `/data/backup/` yields
/// `/data/backup/Monday`, `/data/traffic-` yields `/data/traffic-Monday`.
pub fn backup_path(location: &str, now: DateTime<Local>) -> PathBuf {
    PathBuf::from(format!("{location}{}", now.format("%A")))
}

pub struct BackupJob {
    connection: Arc<ConnectionManager>,
    queue: String,
    location: String,
    connect_retries: u32,
}

impl BackupJob {
    pub fn new(
        connection: Arc<ConnectionManager>,
        queue: &str,
        location: &str,
        connect_retries: u32,
    ) -> Self {
        Self {
            connection,
            queue: queue.to_string(),
            location: location.to_string(),
            connect_retries,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Drains the backup queue into today's file. Returns the message count.
    pub async fn run(&self) -> Result<usize> {
        self.run_at(Local::now()).await
    }

    pub async fn run_at(&self, now: DateTime<Local>) -> Result<usize> {
        let consumer = BulkConsumer::new(Arc::clone(&self.connection), true);
        consumer
            .connect("", &self.queue, self.connect_retries)
            .await
            .with_context(|| format!("backup queue {} unavailable", self.queue))?;

        let records: Vec<BackupRecord> = consumer
            .retrieve_messages(MessageFilter::new())
            .map(|message| BackupRecord::from(&message))
            .collect()
            .await;

        let path = backup_path(&self.location, now);
        write_records(&path, &records).await?;
        tracing::info!(
            queue = self.queue.as_str(),
            path = %path.display(),
            messages = records.len(),
            "Backup snapshot written"
        );
        Ok(records.len())
    }
}

async fn write_records(path: &Path, records: &[BackupRecord]) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_vec_pretty(records).context("failed to serialize backup")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::ConnectParams;
    use crate::broker::memory::{InMemoryBroker, InMemoryOpener};
    use crate::broker::{HeaderValue, Headers};
    use chrono::TimeZone;

    fn monday() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 1, 1, 3, 0, 0).unwrap()
    }

    async fn job(broker: &InMemoryBroker, location: &str) -> BackupJob {
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(InMemoryOpener::new(broker.clone())),
            ConnectParams {
                host: "memory".into(),
                user: String::new(),
                password: String::new(),
                concurrency: 0,
            },
        ));
        manager.open().await.unwrap();
        BackupJob::new(manager, "backup", location, 1)
    }

    #[test]
    fn path_appends_weekday_name() {
        assert_eq!(
            backup_path("/data/backup/", monday()),
            PathBuf::from("/data/backup/Monday")
        );
    }

    #[test]
    fn record_stringifies_headers_and_encodes_body() {
        let message = Message::new(
            Headers::new()
                .with("msgType", "NEURON_DELETE")
                .with("workspace", 12_i64)
                .with("decision", HeaderValue::Bool(true)),
            b"\x00\x01neuron".to_vec(),
        );
        let record = BackupRecord::from(&message);
        assert_eq!(record.headers["workspace"], "12");
        assert_eq!(record.headers["decision"], "true");
        assert_eq!(
            BASE64_STANDARD.decode(&record.body).unwrap(),
            b"\x00\x01neuron"
        );
    }

    #[tokio::test]
    async fn snapshot_drains_queue_into_weekday_file() {
        let dir = tempfile::tempdir().unwrap();
        let location = format!("{}/", dir.path().join("nested").display());
        let broker = InMemoryBroker::new();
        broker.declare_queue("backup");
        for kind in ["NEURON_CREATE", "NEURON_DELETE"] {
            broker.inject(
                "backup",
                Message::new(Headers::new().with("msgType", kind), b"{}".to_vec()),
            );
        }

        let count = job(&broker, &location).await.run_at(monday()).await.unwrap();

        assert_eq!(count, 2);
        assert_eq!(broker.queue_depth("backup"), 0);
        let raw = std::fs::read(dir.path().join("nested").join("Monday")).unwrap();
        let records: Vec<BackupRecord> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].headers["msgType"], "NEURON_CREATE");
    }

    #[tokio::test]
    async fn empty_queue_still_rotates_file() {
        let dir = tempfile::tempdir().unwrap();
        let location = format!("{}/", dir.path().display());
        std::fs::write(dir.path().join("Monday"), b"stale").unwrap();
        let broker = InMemoryBroker::new();
        broker.declare_queue("backup");

        let count = job(&broker, &location).await.run_at(monday()).await.unwrap();

        assert_eq!(count, 0);
        let raw = std::fs::read(dir.path().join("Monday")).unwrap();
        let records: Vec<BackupRecord> = serde_json::from_slice(&raw).unwrap();
        assert!(records.is_empty());
    }
}
