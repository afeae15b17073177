//! Read-only lookup tables + the mutable AMS-ID pool store for CLG.
//!
//! The pool store owns the only genuine consistency concern in the system:
//! no two allocations may hand out the same identifier. Allocation is an
//! all-or-nothing read-modify-write guarded by a mutex within the process
//! and persisted with a temp-file + atomic-rename write. The file on disk
//! is the sole source of truth between runs; every allocation re-reads it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clg_core::{AmsIdRecord, AppEntry, NetworkEntry};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "clg-store";

// ─── Lookup tables ─────────────────────────────────────────────────────────

/// Network + app index documents, loaded once at startup and read-only for
/// the lifetime of a run. A missing file is a hard startup failure; a
/// missing key is a soft-fail handled by the assembler.
#[derive(Debug, Clone)]
pub struct LookupTables {
    network: HashMap<String, NetworkEntry>,
    app: HashMap<String, AppEntry>,
}

impl LookupTables {
    pub fn load(network_path: impl AsRef<Path>, app_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            network: read_json_file(network_path.as_ref())?,
            app: read_json_file(app_path.as_ref())?,
        })
    }

    pub fn network_entry(&self, key: &str) -> Option<&NetworkEntry> {
        self.network.get(key)
    }

    pub fn app_entry(&self, key: &str) -> Option<&AppEntry> {
        self.app.get(key)
    }

    pub fn network_len(&self) -> usize {
        self.network.len()
    }

    pub fn app_len(&self) -> usize {
        self.app.len()
    }

    #[cfg(test)]
    fn from_parts(network: HashMap<String, NetworkEntry>, app: HashMap<String, AppEntry>) -> Self {
        Self { network, app }
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

// ─── AMS-ID pool store ─────────────────────────────────────────────────────

/// The persisted pool document: partition key → ordered identifier records.
/// Order defines allocation priority (first unused wins).
pub type AmsIdPool = BTreeMap<String, Vec<AmsIdRecord>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("reading pool file {path}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing pool file {path}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("insufficient identifiers in partition '{partition}': requested {requested}, {available} unused")]
    InsufficientIds {
        partition: String,
        requested: usize,
        available: usize,
    },
    /// The in-memory pool advanced but the write-back failed. Consumption
    /// state on disk is unknown to the caller; reload before retrying.
    #[error("persisting pool file {path}")]
    Persist {
        path: String,
        source: std::io::Error,
    },
}

/// Per-partition occupancy, for operator-facing status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStatus {
    pub partition: String,
    pub total: usize,
    pub unused: usize,
}

#[derive(Debug)]
pub struct AmsIdStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process. Cross-process
    // writers are out of contract: the design assumes one writer per pool.
    write_guard: Mutex<()>,
}

impl AmsIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<AmsIdPool, StoreError> {
        let data = fs::read_to_string(&self.path)
            .await
            .map_err(|source| StoreError::Read {
                path: self.path.display().to_string(),
                source,
            })?;
        serde_json::from_str(&data).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub async fn partition_status(&self) -> Result<Vec<PartitionStatus>, StoreError> {
        let pool = self.load().await?;
        Ok(pool
            .iter()
            .map(|(partition, records)| PartitionStatus {
                partition: partition.clone(),
                total: records.len(),
                unused: records.iter().filter(|r| !r.used).count(),
            })
            .collect())
    }

    /// Hand out `count` identifiers from `partition`, oldest-inserted first.
    ///
    /// All-or-nothing: if fewer than `count` unused records exist the pool
    /// is left untouched on disk and in memory. On success the flipped
    /// records are persisted before the identifiers are returned; a
    /// persistence failure is reported as [`StoreError::Persist`] and the
    /// caller must treat consumption state as unknown.
    pub async fn allocate(&self, partition: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let _guard = self.write_guard.lock().await;
        let mut pool = self.load().await?;

        let records = pool.get_mut(partition);
        let available = records
            .as_deref()
            .map(|rs| rs.iter().filter(|r| !r.used).count())
            .unwrap_or(0);
        if available < count {
            return Err(StoreError::InsufficientIds {
                partition: partition.to_string(),
                requested: count,
                available,
            });
        }

        let mut allocated = Vec::with_capacity(count);
        if let Some(records) = records {
            for record in records.iter_mut() {
                if allocated.len() == count {
                    break;
                }
                if !record.used {
                    record.used = true;
                    allocated.push(record.id.clone());
                }
            }
        }

        self.persist(&pool).await?;
        debug!(partition, count, "allocated AMS identifiers");
        Ok(allocated)
    }

    /// Write the whole pool document with a temp file + atomic rename so a
    /// crash mid-write never leaves a truncated pool on disk.
    async fn persist(&self, pool: &AmsIdPool) -> Result<(), StoreError> {
        let persist_err = |source: std::io::Error| StoreError::Persist {
            path: self.path.display().to_string(),
            source,
        };

        let bytes = serde_json::to_vec_pretty(pool).map_err(|source| StoreError::Parse {
            path: self.path.display().to_string(),
            source,
        })?;

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let temp_path = parent.join(format!(".{}.pool.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(persist_err)?;
        if let Err(err) = async {
            file.write_all(&bytes).await?;
            file.flush().await
        }
        .await
        {
            let _ = fs::remove_file(&temp_path).await;
            return Err(persist_err(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(persist_err(err));
        }
        Ok(())
    }
}
