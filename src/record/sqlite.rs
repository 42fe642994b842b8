use super::{RecordPatch, RecordStore, RecordStoreError, WorkflowRecord};
use crate::shared::ids::RecordId;
use crate::shared::now_secs;
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};

/// Document-style record store over SQLite: one row per workflow record, the
/// record body as a JSON document. Partial updates merge inside a
/// transaction so a patch never clobbers fields it did not carry.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    db_path: PathBuf,
}

impl SqliteRecordStore {
    pub fn open(db_path: &Path) -> Result<Self, RecordStoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| {
                RecordStoreError::Storage(format!(
                    "failed to create record database parent {}: {source}",
                    parent.display()
                ))
            })?;
        }

        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection, RecordStoreError> {
        Connection::open(&self.db_path).map_err(|source| {
            RecordStoreError::Storage(format!(
                "sqlite open failed at {}: {source}",
                self.db_path.display()
            ))
        })
    }

    fn ensure_schema(&self) -> Result<(), RecordStoreError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_records (
                    id TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(sql_error)?;
        Ok(())
    }
}

fn sql_error(source: rusqlite::Error) -> RecordStoreError {
    RecordStoreError::Storage(format!("sqlite statement failed: {source}"))
}

fn encode(record: &WorkflowRecord) -> Result<String, RecordStoreError> {
    serde_json::to_string(record).map_err(|source| RecordStoreError::Encode { source })
}

fn decode(body: &str) -> Result<WorkflowRecord, RecordStoreError> {
    serde_json::from_str(body).map_err(|source| RecordStoreError::Encode { source })
}

impl RecordStore for SqliteRecordStore {
    fn create(&self, record: WorkflowRecord) -> Result<WorkflowRecord, RecordStoreError> {
        let connection = self.connect()?;
        let body = encode(&record)?;
        connection
            .execute(
                "INSERT INTO workflow_records (id, body, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![record.id.as_str(), body, record.created_at, record.updated_at],
            )
            .map_err(sql_error)?;
        Ok(record)
    }

    fn get(&self, id: &RecordId) -> Result<WorkflowRecord, RecordStoreError> {
        let connection = self.connect()?;
        let body: Option<String> = connection
            .query_row(
                "SELECT body FROM workflow_records WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;

        match body {
            Some(body) => decode(&body),
            None => Err(RecordStoreError::NotFound(id.to_string())),
        }
    }

    fn update(&self, id: &RecordId, patch: RecordPatch) -> Result<WorkflowRecord, RecordStoreError> {
        let mut connection = self.connect()?;
        let tx = connection.transaction().map_err(sql_error)?;

        let body: Option<String> = tx
            .query_row(
                "SELECT body FROM workflow_records WHERE id = ?1",
                params![id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_error)?;
        let Some(body) = body else {
            return Err(RecordStoreError::NotFound(id.to_string()));
        };

        let mut record = decode(&body)?;
        patch.apply(&mut record);
        record.updated_at = now_secs();

        let body = encode(&record)?;
        tx.execute(
            "UPDATE workflow_records SET body = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.as_str(), body, record.updated_at],
        )
        .map_err(sql_error)?;
        tx.commit().map_err(sql_error)?;

        Ok(record)
    }
}
