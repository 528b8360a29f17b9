//! JSON-file durable ledger.
//!
//! Stores every ledger key in a single JSON object on disk. Writes go
//! through a tmp file and a rename so a crash never leaves a truncated
//! ledger, and are serialized in-process so concurrent writers do not drop
//! each other's keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::traits::LedgerStore;
use crate::Result;

/// Default ledger location: `<data dir>/keyward/ledger.json`.
pub fn default_ledger_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("keyward")
        .join("ledger.json")
}

/// Durable [`LedgerStore`] backed by a JSON file.
pub struct JsonFileLedgerStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileLedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, i64>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LedgerStore for JsonFileLedgerStore {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn read(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.load().await?.get(key).copied())
    }

    async fn write(&self, key: &str, value: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.load().await?;
        values.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&values)?;
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        debug!(key, value, path = %self.path.display(), "ledger written");
        Ok(())
    }
}
