//! Replica Store
//!
//! Persistent per-replica file status backed by SQLite. Holds one
//! `replicafileinfo` row for every (file, replica) pair, created for all
//! known replicas the first time a file is seen.

use std::path::PathBuf;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use super::replica::{
    ChecksumStatus, FileListStatus, Replica, ReplicaFileStatus, ReplicaType, UploadStatus,
};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS replica (
        replica_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        replica_type TEXT NOT NULL,
        filelist_updated TEXT,
        checksum_updated TEXT
    );

    CREATE TABLE IF NOT EXISTS file (
        file_id INTEGER PRIMARY KEY AUTOINCREMENT,
        filename TEXT NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS replicafileinfo (
        file_id INTEGER NOT NULL REFERENCES file(file_id),
        replica_id TEXT NOT NULL REFERENCES replica(replica_id),
        checksum TEXT,
        upload_status INTEGER NOT NULL DEFAULT 0,
        filelist_status INTEGER NOT NULL DEFAULT 0,
        checksum_status INTEGER NOT NULL DEFAULT 0,
        filelist_checkdatetime TEXT,
        checksum_checkdatetime TEXT,
        PRIMARY KEY (file_id, replica_id)
    );

    CREATE INDEX IF NOT EXISTS idx_replicafileinfo_replica
        ON replicafileinfo(replica_id);
"#;

const STATUS_COLUMNS: &str = "f.filename, r.replica_id, r.checksum, r.checksum_status, \
     r.filelist_status, r.upload_status, r.checksum_checkdatetime, r.filelist_checkdatetime";

/// When a replica last delivered a checksum list and a file list
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReplicaUpdateDates {
    pub checksum_updated: Option<DateTime<Utc>>,
    pub filelist_updated: Option<DateTime<Utc>>,
}

/// Persistent file status store backed by SQLite
pub struct ReplicaStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// The static replica set, in configured order
    replicas: Vec<Replica>,
}

impl ReplicaStore {
    /// Create or open the store database in `state_dir`
    pub fn open(state_dir: PathBuf, replicas: Vec<Replica>) -> Result<Self> {
        std::fs::create_dir_all(&state_dir)?;

        let db_path = state_dir.join("replicacache.db");
        let conn = Connection::open(&db_path)?;
        Self::init(conn, replicas)
    }

    /// Create a store that lives only in memory
    pub fn in_memory(replicas: Vec<Replica>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, replicas)
    }

    fn init(mut conn: Connection, replicas: Vec<Replica>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;

        let tx = conn.transaction()?;
        for replica in &replicas {
            tx.execute(
                r#"
                INSERT INTO replica (replica_id, name, replica_type) VALUES (?1, ?2, ?3)
                ON CONFLICT(replica_id) DO UPDATE SET name = ?2, replica_type = ?3
                "#,
                params![replica.id, replica.name, replica.replica_type.to_string()],
            )?;
            // A replica added after files were registered still needs its rows
            tx.execute(
                "INSERT OR IGNORE INTO replicafileinfo (file_id, replica_id) SELECT file_id, ?1 FROM file",
                params![replica.id],
            )?;
        }
        tx.commit()?;

        tracing::debug!("Replica store initialised with {} replicas", replicas.len());

        Ok(Self {
            conn: Mutex::new(conn),
            replicas,
        })
    }

    /// The static replica set
    pub fn replicas(&self) -> &[Replica] {
        &self.replicas
    }

    /// Look up a replica by id
    pub fn replica(&self, id: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.id == id)
    }

    fn require_replica(&self, id: &str) -> Result<&Replica> {
        self.replica(id)
            .ok_or_else(|| Error::UnknownReplica(id.to_string()))
    }

    /// Register a file, creating one status row per known replica
    pub async fn ensure_file(&self, filename: &str) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_file_in(&tx, filename, &self.replicas)?;
        tx.commit()?;
        Ok(())
    }

    /// All known filenames, sorted
    pub async fn filenames(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT filename FROM file ORDER BY filename")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }

    /// Number of known files
    pub async fn file_count(&self) -> Result<u64> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Status rows of one file, in replica id order
    pub async fn file_statuses(&self, filename: &str) -> Result<Vec<ReplicaFileStatus>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM replicafileinfo r JOIN file f ON f.file_id = r.file_id \
             WHERE f.filename = ?1 ORDER BY r.replica_id",
            STATUS_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![filename], row_to_status)?;

        let mut statuses = Vec::new();
        for status in rows {
            statuses.push(status?);
        }
        Ok(statuses)
    }

    /// Status row of one file on one replica
    pub async fn status(&self, filename: &str, replica_id: &str) -> Result<Option<ReplicaFileStatus>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM replicafileinfo r JOIN file f ON f.file_id = r.file_id \
             WHERE f.filename = ?1 AND r.replica_id = ?2",
            STATUS_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![filename, replica_id], row_to_status)
            .optional()?)
    }

    /// Record a checksum reported by a replica for a file.
    ///
    /// The entry becomes upload-completed and listed, with an unknown
    /// checksum status until the next vote.
    pub async fn set_checksum(&self, filename: &str, replica_id: &str, checksum: &str) -> Result<()> {
        self.require_replica(replica_id)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let file_id = ensure_file_in(&tx, filename, &self.replicas)?;
        update_checksum_in(&tx, file_id, replica_id, checksum, &now)?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a file as missing from a replica
    pub async fn mark_missing(&self, filename: &str, replica_id: &str) -> Result<()> {
        self.require_replica(replica_id)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let file_id = ensure_file_in(&tx, filename, &self.replicas)?;
        tx.execute(
            r#"
            UPDATE replicafileinfo
            SET filelist_status = ?1, checksum_status = ?2, filelist_checkdatetime = ?3, upload_status = ?4
            WHERE file_id = ?5 AND replica_id = ?6
            "#,
            params![
                FileListStatus::Missing.code(),
                ChecksumStatus::Unknown.code(),
                now,
                UploadStatus::Failed.code(),
                file_id,
                replica_id
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Apply the outcome of a checksum vote to a file's entries.
    ///
    /// OK entries are also upload-completed, corrupt entries upload-failed;
    /// unknown only resets the checksum status. All rows are updated in one
    /// transaction.
    pub async fn apply_checksum_statuses(
        &self,
        filename: &str,
        statuses: &[(String, ChecksumStatus)],
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let file_id = ensure_file_in(&tx, filename, &self.replicas)?;
        for (replica_id, status) in statuses {
            match status {
                ChecksumStatus::Ok | ChecksumStatus::Corrupt => {
                    let upload = if *status == ChecksumStatus::Ok {
                        UploadStatus::Completed
                    } else {
                        UploadStatus::Failed
                    };
                    tx.execute(
                        r#"
                        UPDATE replicafileinfo
                        SET checksum_status = ?1, checksum_checkdatetime = ?2, upload_status = ?3
                        WHERE file_id = ?4 AND replica_id = ?5
                        "#,
                        params![status.code(), now, upload.code(), file_id, replica_id],
                    )?;
                }
                ChecksumStatus::Unknown => {
                    tx.execute(
                        r#"
                        UPDATE replicafileinfo
                        SET checksum_status = ?1, checksum_checkdatetime = ?2
                        WHERE file_id = ?3 AND replica_id = ?4
                        "#,
                        params![status.code(), now, file_id, replica_id],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Replace everything known about a replica's checksums with a full list.
    ///
    /// `entries` must be sorted and free of duplicate names. Files known to
    /// the store but absent from the list are marked missing on the replica.
    pub async fn apply_checksum_list(&self, replica_id: &str, entries: &[(String, String)]) -> Result<()> {
        self.require_replica(replica_id)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("CREATE TEMP TABLE IF NOT EXISTS listed (file_id INTEGER PRIMARY KEY)", [])?;
        tx.execute("DELETE FROM listed", [])?;

        for (filename, checksum) in entries {
            let file_id = ensure_file_in(&tx, filename, &self.replicas)?;
            update_checksum_in(&tx, file_id, replica_id, checksum, &now)?;
            tx.execute("INSERT OR IGNORE INTO listed (file_id) VALUES (?1)", params![file_id])?;
        }

        let missing = mark_unlisted_missing(&tx, replica_id, &now)?;
        tx.execute(
            "UPDATE replica SET checksum_updated = ?1, filelist_updated = ?1 WHERE replica_id = ?2",
            params![now, replica_id],
        )?;
        tx.commit()?;

        tracing::info!(
            "Checksum list from replica '{}' applied: {} files listed, {} missing",
            replica_id,
            entries.len(),
            missing
        );
        Ok(())
    }

    /// Replace everything known about a replica's file listing.
    ///
    /// Same as [`apply_checksum_list`](Self::apply_checksum_list) but only the
    /// file list status is touched.
    pub async fn apply_filelist(&self, replica_id: &str, names: &[String]) -> Result<()> {
        self.require_replica(replica_id)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("CREATE TEMP TABLE IF NOT EXISTS listed (file_id INTEGER PRIMARY KEY)", [])?;
        tx.execute("DELETE FROM listed", [])?;

        for filename in names {
            let file_id = ensure_file_in(&tx, filename, &self.replicas)?;
            tx.execute(
                r#"
                UPDATE replicafileinfo SET filelist_status = ?1, filelist_checkdatetime = ?2
                WHERE file_id = ?3 AND replica_id = ?4
                "#,
                params![FileListStatus::Ok.code(), now, file_id, replica_id],
            )?;
            tx.execute("INSERT OR IGNORE INTO listed (file_id) VALUES (?1)", params![file_id])?;
        }

        let missing = mark_unlisted_missing(&tx, replica_id, &now)?;
        tx.execute(
            "UPDATE replica SET filelist_updated = ?1 WHERE replica_id = ?2",
            params![now, replica_id],
        )?;
        tx.commit()?;

        tracing::info!(
            "File list from replica '{}' applied: {} files listed, {} missing",
            replica_id,
            names.len(),
            missing
        );
        Ok(())
    }

    /// When a replica last delivered full lists
    pub async fn update_dates(&self, replica_id: &str) -> Result<ReplicaUpdateDates> {
        self.require_replica(replica_id)?;
        let conn = self.conn.lock().await;
        let (checksum, filelist): (Option<String>, Option<String>) = conn.query_row(
            "SELECT checksum_updated, filelist_updated FROM replica WHERE replica_id = ?1",
            params![replica_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(ReplicaUpdateDates {
            checksum_updated: checksum.as_deref().and_then(parse_timestamp),
            filelist_updated: filelist.as_deref().and_then(parse_timestamp),
        })
    }

    /// Files the replica is known to be missing
    pub async fn missing_files(&self, replica_id: &str) -> Result<Vec<String>> {
        self.require_replica(replica_id)?;
        self.filenames_where(replica_id, "filelist_status", FileListStatus::Missing.code())
            .await
    }

    /// Files whose copy on the replica lost the checksum vote
    pub async fn corrupt_files(&self, replica_id: &str) -> Result<Vec<String>> {
        self.require_replica(replica_id)?;
        self.filenames_where(replica_id, "checksum_status", ChecksumStatus::Corrupt.code())
            .await
    }

    /// First bitarchive replica (in configured order) holding an OK copy
    pub async fn bitarchive_with_ok_copy(
        &self,
        filename: &str,
        excluding: Option<&str>,
    ) -> Result<Option<Replica>> {
        let statuses = self.file_statuses(filename).await?;
        let found = self
            .replicas
            .iter()
            .filter(|r| r.replica_type == ReplicaType::Bitarchive)
            .filter(|r| Some(r.id.as_str()) != excluding)
            .find(|r| {
                statuses
                    .iter()
                    .any(|s| s.replica_id == r.id && s.checksum_status == ChecksumStatus::Ok)
            })
            .cloned();
        Ok(found)
    }

    async fn filenames_where(&self, replica_id: &str, column: &str, code: i64) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT f.filename FROM replicafileinfo r JOIN file f ON f.file_id = r.file_id \
             WHERE r.replica_id = ?1 AND r.{} = ?2 ORDER BY f.filename",
            column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![replica_id, code], |row| row.get::<_, String>(0))?;

        let mut names = Vec::new();
        for name in rows {
            names.push(name?);
        }
        Ok(names)
    }
}

#[cfg(test)]
impl ReplicaStore {
    /// Make every later status write fail
    pub(crate) async fn drop_status_table(&self) {
        let conn = self.conn.lock().await;
        conn.execute_batch("DROP TABLE replicafileinfo").unwrap();
    }
}

/// Insert the file and its per-replica rows if needed; returns the file id
fn ensure_file_in(conn: &Connection, filename: &str, replicas: &[Replica]) -> Result<i64> {
    if filename.is_empty() {
        return Err(Error::Validation("filename cannot be empty".into()));
    }

    conn.execute("INSERT OR IGNORE INTO file (filename) VALUES (?1)", params![filename])?;
    let file_id: i64 = conn.query_row(
        "SELECT file_id FROM file WHERE filename = ?1",
        params![filename],
        |row| row.get(0),
    )?;

    for replica in replicas {
        conn.execute(
            "INSERT OR IGNORE INTO replicafileinfo (file_id, replica_id) VALUES (?1, ?2)",
            params![file_id, replica.id],
        )?;
    }
    Ok(file_id)
}

fn update_checksum_in(
    conn: &Connection,
    file_id: i64,
    replica_id: &str,
    checksum: &str,
    now: &str,
) -> Result<()> {
    conn.execute(
        r#"
        UPDATE replicafileinfo
        SET checksum = ?1, upload_status = ?2, filelist_status = ?3, checksum_status = ?4,
            checksum_checkdatetime = ?5, filelist_checkdatetime = ?5
        WHERE file_id = ?6 AND replica_id = ?7
        "#,
        params![
            checksum,
            UploadStatus::Completed.code(),
            FileListStatus::Ok.code(),
            ChecksumStatus::Unknown.code(),
            now,
            file_id,
            replica_id
        ],
    )?;
    Ok(())
}

/// Mark every row of the replica whose file is not in the temp `listed` table
fn mark_unlisted_missing(conn: &Connection, replica_id: &str, now: &str) -> Result<usize> {
    let missing = conn.execute(
        r#"
        UPDATE replicafileinfo
        SET filelist_status = ?1, filelist_checkdatetime = ?2, upload_status = ?3
        WHERE replica_id = ?4 AND file_id NOT IN (SELECT file_id FROM listed)
        "#,
        params![
            FileListStatus::Missing.code(),
            now,
            UploadStatus::Failed.code(),
            replica_id
        ],
    )?;
    conn.execute("DELETE FROM listed", [])?;
    Ok(missing)
}

fn row_to_status(row: &rusqlite::Row<'_>) -> rusqlite::Result<ReplicaFileStatus> {
    let checksum_checked: Option<String> = row.get(6)?;
    let filelist_checked: Option<String> = row.get(7)?;
    Ok(ReplicaFileStatus {
        filename: row.get(0)?,
        replica_id: row.get(1)?,
        checksum: row.get(2)?,
        checksum_status: ChecksumStatus::from_code(row.get(3)?).unwrap_or(ChecksumStatus::Unknown),
        file_list_status: FileListStatus::from_code(row.get(4)?).unwrap_or(FileListStatus::NoStatus),
        upload_status: UploadStatus::from_code(row.get(5)?).unwrap_or(UploadStatus::Unknown),
        checksum_checked_at: checksum_checked.as_deref().and_then(parse_timestamp),
        file_list_checked_at: filelist_checked.as_deref().and_then(parse_timestamp),
    })
}

fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
