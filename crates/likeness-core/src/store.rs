//! Durable identity collection backed by a single JSON document.
//!
//! The whole collection is rewritten on every mutation: serialized to a
//! sibling temp file, synced, then renamed over the target. A mutation is
//! committed in memory only after the rename succeeds, so memory and disk
//! never diverge.

use crate::types::{Embedding, IdentityRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to read identity store {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("identity store {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("failed to persist identity store: {0}")]
    Persist(#[from] io::Error),
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains a non-finite value")]
    InvalidEmbedding,
    #[error("identity ids exhausted")]
    IdsExhausted,
}

/// On-disk document shape.
#[derive(Deserialize)]
struct StoreDocument {
    faces: Vec<IdentityRecord>,
    /// High-water mark for id allocation. When absent it is recomputed from
    /// the records.
    #[serde(default)]
    next_id: Option<u64>,
}

/// Borrowed form of [`StoreDocument`] so a save does not clone the collection.
#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    faces: &'a [IdentityRecord],
    next_id: u64,
}

struct Inner {
    records: Vec<IdentityRecord>,
    next_id: u64,
}

/// Identity collection keyed by id and by case-insensitive name.
///
/// All access goes through one mutex; readers receive clones.
pub struct IdentityStore {
    path: PathBuf,
    dimension: usize,
    inner: Mutex<Inner>,
}

impl IdentityStore {
    /// Load the collection at `path`, expecting embeddings of `dimension` floats.
    ///
    /// A missing file yields an empty store. Unparseable content or records
    /// that violate the store invariants fail with [`StoreError::Corrupt`]
    /// rather than being discarded, since the next save would overwrite them.
    pub fn load(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, StoreError> {
        let path = path.into();

        let (records, next_id) = match fs::read(&path) {
            Ok(bytes) => {
                let doc: StoreDocument =
                    serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
                        path: path.clone(),
                        reason: e.to_string(),
                    })?;
                validate(&doc.faces, dimension).map_err(|reason| StoreError::Corrupt {
                    path: path.clone(),
                    reason,
                })?;
                let max_id = doc.faces.iter().map(|r| r.id).max().unwrap_or(0);
                let after_max = max_id.checked_add(1).ok_or_else(|| StoreError::Corrupt {
                    path: path.clone(),
                    reason: format!("record id {max_id} leaves no room for new ids"),
                })?;
                let next_id = doc.next_id.unwrap_or(0).max(after_max);
                (doc.faces, next_id)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no identity store on disk; starting empty");
                (Vec::new(), 1)
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        tracing::info!(
            path = %path.display(),
            identities = records.len(),
            next_id,
            dimension,
            "identity store loaded"
        );

        Ok(Self {
            path,
            dimension,
            inner: Mutex::new(Inner { records, next_id }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new identity or update the one with the same (case-insensitive) name.
    ///
    /// Updating keeps the id and `created_at`, replaces embedding, thumbnail
    /// and description, and refreshes `updated_at`. The name is stored
    /// trimmed. Returns the resulting id once the collection has been
    /// persisted.
    pub fn upsert_by_name(
        &self,
        name: &str,
        embedding: Embedding,
        thumbnail: Option<String>,
        description: &str,
    ) -> Result<u64, StoreError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if embedding.dimension() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.dimension(),
            });
        }
        if !embedding.is_finite() {
            return Err(StoreError::InvalidEmbedding);
        }

        let mut inner = self.lock();
        let mut records = inner.records.clone();
        let mut next_id = inner.next_id;
        let now = Utc::now();

        let (id, created) = match records.iter_mut().find(|r| r.has_name(name)) {
            Some(existing) => {
                existing.embedding = embedding;
                existing.thumbnail = thumbnail;
                existing.description = description.to_string();
                existing.updated_at = now.max(existing.updated_at);
                (existing.id, false)
            }
            None => {
                let id = next_id;
                next_id = next_id.checked_add(1).ok_or(StoreError::IdsExhausted)?;
                records.push(IdentityRecord {
                    id,
                    name: name.to_string(),
                    embedding,
                    thumbnail,
                    description: description.to_string(),
                    created_at: now,
                    updated_at: now,
                });
                (id, true)
            }
        };

        write_document(&self.path, &records, next_id)?;
        inner.records = records;
        inner.next_id = next_id;

        tracing::info!(id, name, created, "identity saved");
        Ok(id)
    }

    pub fn find_by_id(&self, id: u64) -> Option<IdentityRecord> {
        self.lock().records.iter().find(|r| r.id == id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<IdentityRecord> {
        self.lock().records.iter().find(|r| r.has_name(name)).cloned()
    }

    /// Copy of every record in insertion order, embeddings included.
    pub fn list_all(&self) -> Vec<IdentityRecord> {
        self.lock().records.clone()
    }

    /// Run `f` against the live collection while holding the store lock.
    ///
    /// Mutations wait until `f` returns, so the closure sees one consistent
    /// collection. Keep it short: no I/O or inference inside.
    pub fn with_records<R>(&self, f: impl FnOnce(&[IdentityRecord]) -> R) -> R {
        let inner = self.lock();
        f(&inner.records)
    }

    /// Remove the record with `id`. Returns whether a record was removed.
    ///
    /// The id is never handed out again.
    pub fn delete_by_id(&self, id: u64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let Some(pos) = inner.records.iter().position(|r| r.id == id) else {
            return Ok(false);
        };

        let mut records = inner.records.clone();
        let removed = records.remove(pos);
        write_document(&self.path, &records, inner.next_id)?;
        inner.records = records;

        tracing::info!(id, name = %removed.name, "identity deleted");
        Ok(true)
    }

    /// Write the current collection to disk.
    pub fn persist(&self) -> Result<(), StoreError> {
        let inner = self.lock();
        write_document(&self.path, &inner.records, inner.next_id)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is only replaced wholesale after a successful write, so a
        // panic while holding the lock cannot leave it half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Check the invariants every persisted collection must satisfy.
fn validate(records: &[IdentityRecord], dimension: usize) -> Result<(), String> {
    let mut ids = HashSet::with_capacity(records.len());
    let mut names = HashSet::with_capacity(records.len());

    for record in records {
        if record.id == 0 {
            return Err(format!("record {:?} has id 0", record.name));
        }
        if !ids.insert(record.id) {
            return Err(format!("duplicate id {}", record.id));
        }
        if record.name.trim().is_empty() {
            return Err(format!("record {} has an empty name", record.id));
        }
        if !record.embedding.is_finite() {
            return Err(format!("record {} has a non-finite embedding", record.id));
        }
        if !names.insert(record.name.to_lowercase()) {
            return Err(format!("duplicate name {:?}", record.name));
        }
        if record.embedding.dimension() != dimension {
            return Err(format!(
                "record {} has a {}-dimensional embedding, expected {dimension}",
                record.id,
                record.embedding.dimension()
            ));
        }
    }
    Ok(())
}

/// Serialize `records` to `<path>.tmp`, fsync it, and rename it over `path`.
fn write_document(path: &Path, records: &[IdentityRecord], next_id: u64) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let result = (|| -> io::Result<()> {
        let file = fs::File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        let doc = StoreDocumentRef {
            faces: records,
            next_id,
        };
        serde_json::to_writer_pretty(&mut writer, &doc).map_err(io::Error::from)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        tracing::error!(path = %path.display(), error = %e, "identity store write failed");
        let _ = fs::remove_file(&tmp_path);
        return Err(StoreError::Persist(e));
    }

    tracing::debug!(path = %path.display(), identities = records.len(), "identity store written");
    Ok(())
}
