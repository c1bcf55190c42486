use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::ConsentError;

const DATA_RETENTION_DAYS: u32 = 30;

/// Answers whether the customer behind an order agreed to have their photo
/// processed.
#[async_trait]
pub trait ConsentLedger: Send + Sync {
    async fn is_consented(&self, order_id: &str) -> Result<bool, ConsentError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub timestamp: DateTime<Utc>,
    pub order_id: String,
    pub photo_path: String,
    pub consent_given: bool,
    pub consent_method: String,
    pub customer_name: Option<String>,
    pub notes: Option<String>,
    pub data_retention_days: u32,
}

impl ConsentRecord {
    pub fn granted(order_id: impl Into<String>, photo_path: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            order_id: order_id.into(),
            photo_path: photo_path.into(),
            consent_given: true,
            consent_method: "etsy_message".to_string(),
            customer_name: None,
            notes: None,
            data_retention_days: DATA_RETENTION_DAYS,
        }
    }

    pub fn revoked(mut self) -> Self {
        self.consent_given = false;
        self
    }
}

/// Append-only JSON-lines log. The latest record for an order wins, so a
/// revocation is just another line.
pub struct JsonlConsentLedger {
    path: PathBuf,
    append: Mutex<()>,
}

impl JsonlConsentLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, record: ConsentRecord) -> Result<ConsentRecord, ConsentError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.append.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| self.io_error(source))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.io_error(source))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| self.io_error(source))?;
        file.flush().await.map_err(|source| self.io_error(source))?;

        info!(
            "Logged consent for order {} (given: {})",
            record.order_id, record.consent_given
        );
        Ok(record)
    }

    /// Most recent record for `order_id`, if any.
    pub async fn latest(&self, order_id: &str) -> Result<Option<ConsentRecord>, ConsentError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };

        let mut latest = None;
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: ConsentRecord = serde_json::from_str(line)
                .map_err(|source| ConsentError::Malformed {
                    line: index + 1,
                    source,
                })?;
            if record.order_id == order_id {
                latest = Some(record);
            }
        }
        Ok(latest)
    }

    fn io_error(&self, source: std::io::Error) -> ConsentError {
        ConsentError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl ConsentLedger for JsonlConsentLedger {
    async fn is_consented(&self, order_id: &str) -> Result<bool, ConsentError> {
        Ok(self
            .latest(order_id)
            .await?
            .map(|record| record.consent_given)
            .unwrap_or(false))
    }
}

#[derive(Default)]
pub struct MemoryConsentLedger {
    orders: RwLock<HashMap<String, bool>>,
}

impl MemoryConsentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, order_id: &str) {
        self.set(order_id, true);
    }

    pub fn revoke(&self, order_id: &str) {
        self.set(order_id, false);
    }

    fn set(&self, order_id: &str, given: bool) {
        self.orders
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order_id.to_string(), given);
    }
}

#[async_trait]
impl ConsentLedger for MemoryConsentLedger {
    async fn is_consented(&self, order_id: &str) -> Result<bool, ConsentError> {
        Ok(self
            .orders
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .copied()
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_log_means_no_consent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonlConsentLedger::new(dir.path().join("consent_log.jsonl"));
        assert!(!ledger.is_consented("ETSY-1").await.unwrap());
        assert!(ledger.latest("ETSY-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_latest_record_wins() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = JsonlConsentLedger::new(dir.path().join("logs/consent_log.jsonl"));

        ledger
            .record(ConsentRecord::granted("ETSY-1", "photos/a.jpg"))
            .await
            .unwrap();
        ledger
            .record(ConsentRecord::granted("ETSY-2", "photos/b.jpg"))
            .await
            .unwrap();
        assert!(ledger.is_consented("ETSY-1").await.unwrap());

        ledger
            .record(ConsentRecord::granted("ETSY-1", "photos/a.jpg").revoked())
            .await
            .unwrap();
        assert!(!ledger.is_consented("ETSY-1").await.unwrap());
        assert!(ledger.is_consented("ETSY-2").await.unwrap());
        assert!(!ledger.is_consented("ETSY-3").await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consent_log.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let ledger = JsonlConsentLedger::new(path);
        assert!(matches!(
            ledger.is_consented("ETSY-1").await,
            Err(ConsentError::Malformed { line: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_ledger() {
        let ledger = MemoryConsentLedger::new();
        assert!(!ledger.is_consented("A").await.unwrap());
        ledger.grant("A");
        assert!(ledger.is_consented("A").await.unwrap());
        ledger.revoke("A");
        assert!(!ledger.is_consented("A").await.unwrap());
    }
}
