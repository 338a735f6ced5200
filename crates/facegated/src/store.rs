//! SQLite-backed face gallery.
//!
//! Append-only. Every committed row is mirrored in an in-memory snapshot so
//! identification queries never touch the database. Writes go to disk first
//! and are published to the snapshot only after the transaction commits.

use chrono::{DateTime, Utc};
use facegate_core::{Embedding, FaceRecord};
use parking_lot::RwLock;
use rusqlite::params;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS faces (
    seq           INTEGER PRIMARY KEY AUTOINCREMENT,
    id            TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    embedding     BLOB NOT NULL,
    dim           INTEGER NOT NULL,
    model_version TEXT,
    created_at    TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("failed to create gallery directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("corrupt gallery row {id}: {reason}")]
    Corrupt { id: String, reason: String },
    #[error("embedding dimension mismatch: gallery uses {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("refusing to store an empty embedding")]
    EmptyEmbedding,
}

/// Durable, append-only store of enrolled faces.
pub struct FaceGallery {
    conn: tokio_rusqlite::Connection,
    records: Arc<RwLock<Arc<Vec<FaceRecord>>>>,
    append_lock: Arc<Mutex<()>>,
}

impl FaceGallery {
    /// Open (or create) the gallery database at `path` and load all rows.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StorageError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = tokio_rusqlite::Connection::open(path).await?;
        let gallery = Self::init(conn).await?;
        tracing::info!(
            path = %path.display(),
            records = gallery.len(),
            "face gallery opened"
        );
        Ok(gallery)
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let conn = tokio_rusqlite::Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: tokio_rusqlite::Connection) -> Result<Self, StorageError> {
        let rows = conn
            .call(|conn| {
                conn.pragma_update_and_check(None, "journal_mode", "wal", |row| {
                    row.get::<_, String>(0)
                })?;
                conn.pragma_update(None, "synchronous", "FULL")?;
                conn.execute_batch(SCHEMA)?;

                let mut stmt = conn.prepare(
                    "SELECT id, name, embedding, dim, model_version, created_at
                     FROM faces ORDER BY seq",
                )?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok(RawRow {
                            id: row.get(0)?,
                            name: row.get(1)?,
                            embedding: row.get(2)?,
                            dim: row.get(3)?,
                            model_version: row.get(4)?,
                            created_at: row.get(5)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let records = rows
            .into_iter()
            .map(RawRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            conn,
            records: Arc::new(RwLock::new(Arc::new(records))),
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    /// All committed records in insertion order.
    ///
    /// Returns a shared snapshot; later appends do not affect it.
    pub fn list_all(&self) -> Arc<Vec<FaceRecord>> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the gallery's append lock.
    ///
    /// While the writer is alive no other append can run, so a caller can
    /// inspect [`GalleryWriter::records`] and then insert without racing.
    pub async fn begin_append(&self) -> GalleryWriter<'_> {
        let guard = Arc::clone(&self.append_lock).lock_owned().await;
        GalleryWriter {
            gallery: self,
            snapshot: self.list_all(),
            guard,
        }
    }

    #[cfg(test)]
    pub async fn add(&self, name: &str, embedding: Embedding) -> Result<FaceRecord, StorageError> {
        self.begin_append().await.add(name, embedding).await
    }
}

/// Exclusive append access to a [`FaceGallery`].
pub struct GalleryWriter<'a> {
    gallery: &'a FaceGallery,
    snapshot: Arc<Vec<FaceRecord>>,
    guard: OwnedMutexGuard<()>,
}

impl GalleryWriter<'_> {
    /// Records committed before this writer was acquired. No append can
    /// happen until the writer is dropped or consumed.
    pub fn records(&self) -> &[FaceRecord] {
        &self.snapshot
    }

    /// Commit a new record and publish it. The gallery is untouched on error.
    pub async fn add(self, name: &str, embedding: Embedding) -> Result<FaceRecord, StorageError> {
        if embedding.values.is_empty() {
            return Err(StorageError::EmptyEmbedding);
        }
        if let Some(first) = self.snapshot.first() {
            let expected = first.embedding.dim();
            if expected != embedding.dim() {
                return Err(StorageError::DimensionMismatch {
                    expected,
                    found: embedding.dim(),
                });
            }
        }

        let record = FaceRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            embedding,
            created_at: Utc::now(),
        };

        let id = record.id.clone();
        let row_name = record.name.clone();
        let blob = encode_embedding(&record.embedding.values);
        let dim = record.embedding.dim() as i64;
        let model_version = record.embedding.model_version.clone();
        let created_at = record.created_at.to_rfc3339();

        let GalleryWriter {
            gallery,
            snapshot,
            guard,
        } = self;
        // Released so make_mut can usually push in place.
        drop(snapshot);
        let records = Arc::clone(&gallery.records);
        let published = record.clone();

        // Commit and publish run on the connection thread, which owns the
        // append lock until both are done. Once queued they complete even if
        // this future is dropped.
        gallery
            .conn
            .call(move |conn| {
                let _guard = guard;
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO faces (id, name, embedding, dim, model_version, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![id, row_name, blob, dim, model_version, created_at],
                )?;
                tx.commit()?;
                Arc::make_mut(&mut *records.write()).push(published);
                Ok(())
            })
            .await?;

        tracing::info!(id = %record.id, name = %record.name, "face record committed");
        Ok(record)
    }
}

struct RawRow {
    id: String,
    name: String,
    embedding: Vec<u8>,
    dim: i64,
    model_version: Option<String>,
    created_at: String,
}

impl RawRow {
    fn into_record(self) -> Result<FaceRecord, StorageError> {
        let values = decode_embedding(&self.embedding).ok_or_else(|| StorageError::Corrupt {
            id: self.id.clone(),
            reason: format!("embedding blob length {} is not a multiple of 4", self.embedding.len()),
        })?;
        if values.len() as i64 != self.dim {
            return Err(StorageError::Corrupt {
                id: self.id,
                reason: format!("declared dim {} but blob holds {}", self.dim, values.len()),
            });
        }
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StorageError::Corrupt {
                id: self.id.clone(),
                reason: format!("bad created_at '{}': {e}", self.created_at),
            })?
            .with_timezone(&Utc);

        Ok(FaceRecord {
            id: self.id,
            name: self.name,
            embedding: Embedding {
                values,
                model_version: self.model_version,
            },
            created_at,
        })
    }
}

/// Little-endian f32 bytes. Decoding reproduces the input bit for bit.
pub fn encode_embedding(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}
