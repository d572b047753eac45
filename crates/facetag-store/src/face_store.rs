//! Face metadata table (`photos`) on SQLite.

use crate::db;
use facetag_core::{FaceId, FaceRecord};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS photos (
    face_id   TEXT PRIMARY KEY,
    image_id  TEXT NOT NULL,
    face_name TEXT
);
CREATE INDEX IF NOT EXISTS idx_photos_face_name ON photos(face_name);
";

#[derive(Error, Debug)]
pub enum FaceStoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to prepare database directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored face id is not valid: {0:?}")]
    CorruptFaceId(String),
    #[error("face store lock poisoned")]
    Poisoned,
}

impl FaceStoreError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlite(e) => db::is_busy(e),
            _ => false,
        }
    }
}

/// Row counts for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceStats {
    pub total: u64,
    pub unnamed: u64,
}

/// Metadata store client for face records.
pub struct FaceStore {
    conn: Mutex<Connection>,
}

impl FaceStore {
    /// Open the database file and create the schema if missing.
    pub fn open(path: &Path) -> Result<Self, FaceStoreError> {
        db::ensure_parent(path)?;
        let store = Self::with_connection(db::open_file(path)?)?;
        tracing::info!(path = %path.display(), "face store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, FaceStoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, FaceStoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, FaceStoreError> {
        self.conn.lock().map_err(|_| FaceStoreError::Poisoned)
    }

    /// Insert an unnamed face record.
    ///
    /// Idempotent: inserting an id that already exists leaves the existing
    /// row (and any name it carries) untouched. Returns whether a row was
    /// actually created.
    pub fn insert_unnamed(&self, face_id: &FaceId, image_id: &str) -> Result<bool, FaceStoreError> {
        let changed = self.conn()?.execute(
            "INSERT INTO photos (face_id, image_id, face_name) VALUES (?1, ?2, NULL)
             ON CONFLICT(face_id) DO NOTHING",
            params![face_id.as_str(), image_id],
        )?;
        Ok(changed == 1)
    }

    /// Pick any one face without a name.
    ///
    /// Uniformly random among unnamed rows, so no face is starved by
    /// insertion order.
    pub fn next_unnamed(&self) -> Result<Option<FaceRecord>, FaceStoreError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT face_id, image_id FROM photos WHERE face_name IS NULL
                 ORDER BY RANDOM() LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(face_id, image_id)| -> Result<FaceRecord, FaceStoreError> {
            let face_id = FaceId::parse(&face_id).ok_or(FaceStoreError::CorruptFaceId(face_id))?;
            Ok(FaceRecord::unnamed(face_id, image_id))
        })
        .transpose()
    }

    /// Set the name of a face. Last writer wins.
    ///
    /// Returns `false` when no record with that id exists.
    pub fn assign_name(&self, face_id: &FaceId, name: &str) -> Result<bool, FaceStoreError> {
        let changed = self.conn()?.execute(
            "UPDATE photos SET face_name = ?1 WHERE face_id = ?2",
            params![name, face_id.as_str()],
        )?;
        Ok(changed > 0)
    }

    /// Distinct source image ids whose faces carry exactly `name`.
    pub fn image_ids_by_name(&self, name: &str) -> Result<Vec<String>, FaceStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT image_id FROM photos WHERE face_name = ?1 ORDER BY image_id",
        )?;
        let ids = stmt
            .query_map([name], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn get(&self, face_id: &FaceId) -> Result<Option<FaceRecord>, FaceStoreError> {
        let record = self
            .conn()?
            .query_row(
                "SELECT image_id, face_name FROM photos WHERE face_id = ?1",
                [face_id.as_str()],
                |row| {
                    Ok(FaceRecord {
                        face_id: face_id.clone(),
                        source_image_id: row.get(0)?,
                        face_name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// All face records cut from one source image.
    pub fn faces_in_image(&self, image_id: &str) -> Result<Vec<FaceRecord>, FaceStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT face_id, face_name FROM photos WHERE image_id = ?1 ORDER BY face_id",
        )?;
        let rows = stmt
            .query_map([image_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(face_id, face_name)| -> Result<FaceRecord, FaceStoreError> {
                let face_id =
                    FaceId::parse(&face_id).ok_or(FaceStoreError::CorruptFaceId(face_id))?;
                Ok(FaceRecord {
                    face_id,
                    source_image_id: image_id.to_string(),
                    face_name,
                })
            })
            .collect()
    }

    pub fn stats(&self) -> Result<FaceStats, FaceStoreError> {
        let (total, unnamed) = self.conn()?.query_row(
            "SELECT COUNT(*), COUNT(*) - COUNT(face_name) FROM photos",
            [],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )?;
        Ok(FaceStats {
            total: total as u64,
            unnamed: unnamed as u64,
        })
    }
}
