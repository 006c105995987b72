//! Metadata store.
//!
//! A single embedded SQLite database in WAL mode behind a `parking_lot`
//! mutex: readers ride WAL concurrency at the engine level, writers are
//! serialized at ours. Every query the pipelines need is a method here;
//! nothing else in the server speaks SQL.
//!
//! Timestamps are RFC3339 TEXT at second precision, always written through
//! [`ts_str`] so lexical comparison equals chronological comparison.

pub mod schema;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use scatter_core::types::{
    Chunk, DeletionEvent, Device, DeviceType, FileMetadata, RegisterRequest,
};
use scatter_core::{Error, Result};

/// Per-user OAuth token for the cloud backend.
#[derive(Debug, Clone)]
pub struct CloudToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expiry: Option<DateTime<Utc>>,
}

impl CloudToken {
    /// Expired (or about to, within a minute of slack).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiry {
            Some(t) => now + chrono::Duration::seconds(60) >= t,
            None => false,
        }
    }
}

/// Render a timestamp the way every row stores it.
pub fn ts_str(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::MIN_UTC)
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let last_seen: Option<String> = row.get(3)?;
    let device_type: String = row.get(6)?;
    Ok(Device {
        id: row.get(0)?,
        public_key: row.get(1)?,
        name: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        last_seen: last_seen.as_deref().map(parse_ts).unwrap_or(DateTime::<Utc>::MIN_UTC),
        ip: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        online: row.get::<_, i64>(5)? != 0,
        device_type: device_type.parse().unwrap_or(DeviceType::Agent),
    })
}

const DEVICE_COLS: &str = "id, public_key, name, last_seen, ip, online, type";
const DEVICE_COLS_D: &str = "d.id, d.public_key, d.name, d.last_seen, d.ip, d.online, d.type";

/// Handle to the metadata store. Clones share one connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the store. `None` opens an in-memory database,
    /// which the tests use.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p).map_err(Error::database)?,
            None => Connection::open_in_memory().map_err(Error::database)?,
        };

        // WAL for concurrent readers; the pragma returns a row, so query it.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))
            .map_err(Error::database)?;
        // Deletes/cascades are handled explicitly in app code (see
        // delete_device, delete_file_rows); the bundled sqlite3 build
        // defaults this pragma on, so turn it back off to match.
        conn.execute_batch("PRAGMA foreign_keys = OFF;")
            .map_err(Error::database)?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(Error::database)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Users ────────────────────────────────────────────────────────────

    /// Insert a user; the caller supplies the credential digest.
    pub fn create_user(&self, email: &str, password_digest: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, email, password, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![id, email, password_digest, ts_str(Utc::now())],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::invalid("user already exists")
            }
            other => Error::database(other),
        })?;
        Ok(id)
    }

    /// Credential check; returns the user id on a match.
    pub fn find_user(&self, email: &str, password_digest: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id FROM users WHERE email = ?1 AND password = ?2",
            params![email, password_digest],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::database)
    }

    pub fn user_email(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT email FROM users WHERE id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(Error::database)
    }

    // ── Devices ──────────────────────────────────────────────────────────

    /// Upsert an agent registration; mints an id when the agent brings none.
    /// Stamps `last_seen = now, online = true` either way.
    pub fn upsert_device(&self, req: &RegisterRequest, observed_ip: &str) -> Result<String> {
        let device_id = if req.device_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            req.device_id.clone()
        };
        let now = ts_str(Utc::now());

        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM devices WHERE id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::database)?;

        if exists.is_some() {
            conn.execute(
                "UPDATE devices SET public_key = ?1, name = ?2, last_seen = ?3, online = 1,
                        ip = ?4, claim_token = ?5
                 WHERE id = ?6",
                params![req.public_key, req.name, now, observed_ip, req.claim_token, device_id],
            )
            .map_err(Error::database)?;
        } else {
            conn.execute(
                "INSERT INTO devices (id, public_key, name, last_seen, online, ip, claim_token, type)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, 'agent')",
                params![device_id, req.public_key, req.name, now, observed_ip, req.claim_token],
            )
            .map_err(Error::database)?;
        }
        Ok(device_id)
    }

    /// Create or revive the per-user virtual cloud device.
    pub fn upsert_cloud_device(&self, user_id: &str, device_id: &str, name: &str) -> Result<()> {
        let now = ts_str(Utc::now());
        let conn = self.conn.lock();
        let exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM devices WHERE id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::database)?;

        if exists.is_some() {
            conn.execute(
                "UPDATE devices SET online = 1, last_seen = ?1 WHERE id = ?2",
                params![now, device_id],
            )
            .map_err(Error::database)?;
        } else {
            conn.execute(
                "INSERT INTO devices (id, user_id, public_key, name, last_seen, online, ip, type)
                 VALUES (?1, ?2, 'N/A', ?3, ?4, 1, 'cloud', 'cloud')",
                params![device_id, user_id, name, now],
            )
            .map_err(Error::database)?;
        }
        Ok(())
    }

    /// Keep-alive. False when the device is unknown.
    pub fn heartbeat(&self, device_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE devices SET last_seen = ?1, online = 1 WHERE id = ?2",
                params![ts_str(Utc::now()), device_id],
            )
            .map_err(Error::database)?;
        Ok(changed > 0)
    }

    /// Bind a device to a user iff the claim token matches. Idempotent:
    /// re-claiming an already-owned device with the right token succeeds.
    pub fn claim_device(&self, user_id: &str, device_id: &str, claim_token: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "UPDATE devices SET user_id = ?1 WHERE id = ?2 AND claim_token = ?3",
                params![user_id, device_id, claim_token],
            )
            .map_err(Error::database)?;
        Ok(changed > 0)
    }

    /// The owning user of a device, if claimed.
    pub fn device_owner(&self, device_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let owner: Option<Option<String>> = conn
            .query_row(
                "SELECT user_id FROM devices WHERE id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::database)?;
        Ok(owner.flatten().filter(|u| !u.is_empty()))
    }

    pub fn get_device(&self, device_id: &str) -> Result<Option<Device>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {DEVICE_COLS} FROM devices WHERE id = ?1"),
            params![device_id],
            row_to_device,
        )
        .optional()
        .map_err(Error::database)
    }

    /// All of a user's devices, registration order.
    pub fn list_devices(&self, user_id: &str) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEVICE_COLS} FROM devices WHERE user_id = ?1 ORDER BY rowid"
            ))
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![user_id], row_to_device)
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// The user's devices currently considered online: heartbeat within the
    /// window, or cloud-typed (permanently online). Registration order, so
    /// round-robin placement is stable.
    pub fn list_online_devices(
        &self,
        user_id: &str,
        window: chrono::Duration,
    ) -> Result<Vec<Device>> {
        let now = Utc::now();
        Ok(self
            .list_devices(user_id)?
            .into_iter()
            .filter(|d| d.is_online(now, window))
            .collect())
    }

    /// Every device with a fresh heartbeat, any owner: the `/peers` view.
    pub fn list_online_peers(&self, window: chrono::Duration) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEVICE_COLS} FROM devices WHERE online = 1 ORDER BY rowid"
            ))
            .map_err(Error::database)?;
        let rows = stmt
            .query_map([], row_to_device)
            .map_err(Error::database)?;
        let now = Utc::now();
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::database)?
            .into_iter()
            .filter(|d| d.is_online(now, window))
            .collect())
    }

    /// Remove a device and its placements after an ownership check.
    pub fn delete_device(&self, user_id: &str, device_id: &str) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::database)?;
        let owned: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM devices WHERE id = ?1 AND user_id = ?2",
                params![device_id, user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::database)?;
        if owned.is_none() {
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM chunk_locations WHERE device_id = ?1",
            params![device_id],
        )
        .map_err(Error::database)?;
        tx.execute("DELETE FROM devices WHERE id = ?1", params![device_id])
            .map_err(Error::database)?;
        tx.commit().map_err(Error::database)?;
        Ok(true)
    }

    /// Clear the `online` flag on agents whose heartbeat went stale.
    /// Returns how many flipped.
    pub fn mark_stale_offline(&self, window: chrono::Duration) -> Result<usize> {
        let cutoff = ts_str(Utc::now() - window);
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE devices SET online = 0
             WHERE online = 1 AND type = 'agent' AND (last_seen IS NULL OR last_seen < ?1)",
            params![cutoff],
        )
        .map_err(Error::database)
    }

    // ── Files & chunks ───────────────────────────────────────────────────

    /// Start a file record; size and hash are filled in at EOF.
    pub fn insert_file(&self, user_id: &str, path: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = ts_str(Utc::now());
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO files (id, user_id, path, size, hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, '', ?4, ?4)",
            params![id, user_id, path, now],
        )
        .map_err(Error::database)?;
        Ok(id)
    }

    /// Stamp the final size and whole-file hash after the last chunk lands.
    pub fn finalize_file(&self, file_id: &str, size: u64, hash: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE files SET size = ?1, hash = ?2, updated_at = ?3 WHERE id = ?4",
            params![size as i64, hash, ts_str(Utc::now()), file_id],
        )
        .map_err(Error::database)?;
        Ok(())
    }

    /// Transactional file + chunk rows creation (the `/metadata` commit).
    /// Agent-side commits carry no user binding.
    pub fn create_file_with_chunks(&self, user_id: Option<&str>, meta: &FileMetadata) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::database)?;
        tx.execute(
            "INSERT INTO files (id, user_id, path, size, hash, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                meta.id,
                user_id,
                meta.path,
                meta.size as i64,
                meta.hash,
                ts_str(meta.created_at),
                ts_str(meta.updated_at)
            ],
        )
        .map_err(Error::database)?;
        for chunk in &meta.chunks {
            tx.execute(
                "INSERT OR IGNORE INTO chunks (id, file_id, sequence, hash, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![chunk.id, meta.id, chunk.sequence, chunk.hash, chunk.size as i64],
            )
            .map_err(Error::database)?;
        }
        tx.commit().map_err(Error::database)
    }

    /// Every file in the store (agent-facing `/metadata` listing).
    pub fn list_all_files(&self) -> Result<Vec<FileMetadata>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, size, hash, created_at, updated_at
                 FROM files ORDER BY updated_at DESC",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(FileMetadata {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    hash: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                    updated_at: parse_ts(&row.get::<_, String>(5)?),
                    chunks: Vec::new(),
                })
            })
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// A user's files, most recently updated first. No chunk detail.
    pub fn list_files(&self, user_id: &str) -> Result<Vec<FileMetadata>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, path, size, hash, created_at, updated_at
                 FROM files WHERE user_id = ?1 ORDER BY updated_at DESC",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok(FileMetadata {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    hash: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                    updated_at: parse_ts(&row.get::<_, String>(5)?),
                    chunks: Vec::new(),
                })
            })
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// Ownership-checked file lookup, no chunk detail.
    pub fn get_owned_file(&self, user_id: &str, file_id: &str) -> Result<Option<FileMetadata>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, path, size, hash, created_at, updated_at
             FROM files WHERE id = ?1 AND user_id = ?2",
            params![file_id, user_id],
            |row| {
                Ok(FileMetadata {
                    id: row.get(0)?,
                    path: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    hash: row.get(3)?,
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                    updated_at: parse_ts(&row.get::<_, String>(5)?),
                    chunks: Vec::new(),
                })
            },
        )
        .optional()
        .map_err(Error::database)
    }

    /// Full file detail with chunks and their placements (agent-facing).
    pub fn get_file_with_chunks(&self, file_id: &str) -> Result<Option<FileMetadata>> {
        let conn = self.conn.lock();
        let file = conn
            .query_row(
                "SELECT id, path, size, hash, created_at, updated_at FROM files WHERE id = ?1",
                params![file_id],
                |row| {
                    Ok(FileMetadata {
                        id: row.get(0)?,
                        path: row.get(1)?,
                        size: row.get::<_, i64>(2)? as u64,
                        hash: row.get(3)?,
                        created_at: parse_ts(&row.get::<_, String>(4)?),
                        updated_at: parse_ts(&row.get::<_, String>(5)?),
                        chunks: Vec::new(),
                    })
                },
            )
            .optional()
            .map_err(Error::database)?;

        let Some(mut file) = file else { return Ok(None) };

        let mut stmt = conn
            .prepare(
                "SELECT id, sequence, hash, size FROM chunks
                 WHERE file_id = ?1 ORDER BY sequence",
            )
            .map_err(Error::database)?;
        let chunk_rows = stmt
            .query_map(params![file_id], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    file_id: file_id.to_string(),
                    sequence: row.get::<_, i64>(1)? as u32,
                    hash: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                    locations: Vec::new(),
                })
            })
            .map_err(Error::database)?;
        let mut chunks = chunk_rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::database)?;

        let mut loc_stmt = conn
            .prepare("SELECT device_id FROM chunk_locations WHERE chunk_id = ?1")
            .map_err(Error::database)?;
        for chunk in &mut chunks {
            let locs = loc_stmt
                .query_map(params![chunk.id], |row| row.get(0))
                .map_err(Error::database)?;
            chunk.locations = locs
                .collect::<rusqlite::Result<Vec<String>>>()
                .map_err(Error::database)?;
        }

        file.chunks = chunks;
        Ok(Some(file))
    }

    /// Chunks of a file in sequence order (the download walk).
    pub fn file_chunks(&self, file_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, sequence, hash, size FROM chunks
                 WHERE file_id = ?1 ORDER BY sequence",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![file_id], |row| {
                Ok(Chunk {
                    id: row.get(0)?,
                    file_id: file_id.to_string(),
                    sequence: row.get::<_, i64>(1)? as u32,
                    hash: row.get(2)?,
                    size: row.get::<_, i64>(3)? as u64,
                    locations: Vec::new(),
                })
            })
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// `INSERT OR IGNORE` a chunk row; re-placing the same sequence is a
    /// no-op. `id` and `hash` are both the content address.
    pub fn insert_chunk(&self, chunk_id: &str, file_id: &str, sequence: u32, size: u64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO chunks (id, file_id, sequence, hash, size)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![chunk_id, file_id, sequence, chunk_id, size as i64],
        )
        .map_err(Error::database)?;
        Ok(())
    }

    pub fn add_location(&self, chunk_id: &str, device_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO chunk_locations (chunk_id, device_id) VALUES (?1, ?2)",
            params![chunk_id, device_id],
        )
        .map_err(Error::database)?;
        Ok(())
    }

    pub fn remove_location(&self, chunk_id: &str, device_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM chunk_locations WHERE chunk_id = ?1 AND device_id = ?2",
            params![chunk_id, device_id],
        )
        .map_err(Error::database)?;
        Ok(())
    }

    /// Atomically re-point a placement from `source` to `target`. Either both
    /// rows change or neither does, so a chunk is never left location-less.
    pub fn move_location(&self, chunk_id: &str, source: &str, target: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::database)?;
        tx.execute(
            "INSERT OR IGNORE INTO chunk_locations (chunk_id, device_id) VALUES (?1, ?2)",
            params![chunk_id, target],
        )
        .map_err(Error::database)?;
        tx.execute(
            "DELETE FROM chunk_locations WHERE chunk_id = ?1 AND device_id = ?2",
            params![chunk_id, source],
        )
        .map_err(Error::database)?;
        tx.commit().map_err(Error::database)
    }

    /// Devices holding a chunk that are online right now.
    pub fn online_holders(&self, chunk_id: &str, window: chrono::Duration) -> Result<Vec<Device>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEVICE_COLS} FROM devices d
                 JOIN chunk_locations cl ON cl.device_id = d.id
                 WHERE cl.chunk_id = ?1 ORDER BY d.rowid"
            ))
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![chunk_id], row_to_device)
            .map_err(Error::database)?;
        let now = Utc::now();
        Ok(rows
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Error::database)?
            .into_iter()
            .filter(|d| d.is_online(now, window))
            .collect())
    }

    /// Per-device stored bytes for a user's devices (0 for empty devices).
    /// Chunk sizes are deduplicated on content id: a device stores identical
    /// bytes once however many files reference them.
    pub fn device_usage(&self, user_id: &str) -> Result<Vec<(Device, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DEVICE_COLS_D}, COALESCE(SUM(c.size), 0)
                 FROM devices d
                 LEFT JOIN chunk_locations cl ON cl.device_id = d.id
                 LEFT JOIN (SELECT DISTINCT id, size FROM chunks) c ON c.id = cl.chunk_id
                 WHERE d.user_id = ?1
                 GROUP BY d.id ORDER BY d.rowid"
            ))
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((row_to_device(row)?, row.get::<_, i64>(7)? as u64))
            })
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// Up to `limit` chunks resident on a device, with sizes.
    pub fn chunks_on_device(&self, device_id: &str, limit: usize) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT c.id, c.size FROM chunks c
                 JOIN chunk_locations cl ON cl.chunk_id = c.id
                 WHERE cl.device_id = ?1 LIMIT ?2",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![device_id, limit as i64], |row| {
                Ok((row.get(0)?, row.get::<_, i64>(1)? as u64))
            })
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// `(device_id, chunk_id)` pairs for a file: who to notify on delete.
    pub fn file_chunk_placements(&self, file_id: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT cl.device_id, c.id FROM chunks c
                 JOIN chunk_locations cl ON cl.chunk_id = c.id
                 WHERE c.file_id = ?1",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![file_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// Chunk ids used by this file and no other: the ones whose bytes may
    /// actually be deleted from devices.
    pub fn orphaned_chunk_ids(&self, file_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT DISTINCT id FROM chunks WHERE file_id = ?1
                   AND id NOT IN (SELECT id FROM chunks WHERE file_id != ?1)",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![file_id], |row| row.get(0))
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    /// Drop every row belonging to a file: the file, its chunk rows, and
    /// the placements of chunks no other file still references. The
    /// deletion event must already be recorded.
    pub fn delete_file_rows(&self, file_id: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(Error::database)?;
        tx.execute(
            "DELETE FROM chunk_locations WHERE chunk_id IN
               (SELECT id FROM chunks WHERE file_id = ?1
                  AND id NOT IN (SELECT id FROM chunks WHERE file_id != ?1))",
            params![file_id],
        )
        .map_err(Error::database)?;
        tx.execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])
            .map_err(Error::database)?;
        tx.execute("DELETE FROM files WHERE id = ?1", params![file_id])
            .map_err(Error::database)?;
        tx.commit().map_err(Error::database)
    }

    // ── Deletion ledger ──────────────────────────────────────────────────

    /// Append a deletion event. Must happen before the file rows vanish.
    pub fn record_deletion(&self, file_id: &str, chunk_ids: &[String]) -> Result<()> {
        let chunk_json = serde_json::to_string(chunk_ids)
            .map_err(|e| Error::database(format!("chunk_ids encode: {e}")))?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO deleted_files (id, file_id, chunk_ids, deleted_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), file_id, chunk_json, ts_str(Utc::now())],
        )
        .map_err(Error::database)?;
        Ok(())
    }

    /// Events strictly after `since`, oldest first.
    pub fn deletions_since(&self, since: DateTime<Utc>) -> Result<Vec<DeletionEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT file_id, chunk_ids, deleted_at FROM deleted_files
                 WHERE deleted_at > ?1 ORDER BY deleted_at",
            )
            .map_err(Error::database)?;
        let rows = stmt
            .query_map(params![ts_str(since)], |row| {
                let chunk_json: String = row.get(1)?;
                Ok(DeletionEvent {
                    file_id: row.get(0)?,
                    chunk_ids: serde_json::from_str(&chunk_json).unwrap_or_default(),
                    deleted_at: parse_ts(&row.get::<_, String>(2)?),
                })
            })
            .map_err(Error::database)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::database)
    }

    // ── Cloud tokens ─────────────────────────────────────────────────────

    pub fn save_cloud_token(&self, user_id: &str, token: &CloudToken) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cloud_tokens (user_id, access_token, refresh_token, token_type, expiry)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_id) DO UPDATE SET
               access_token = excluded.access_token,
               refresh_token = COALESCE(excluded.refresh_token, cloud_tokens.refresh_token),
               token_type = excluded.token_type,
               expiry = excluded.expiry",
            params![
                user_id,
                token.access_token,
                token.refresh_token,
                token.token_type,
                token.expiry.map(ts_str)
            ],
        )
        .map_err(Error::database)?;
        Ok(())
    }

    pub fn get_cloud_token(&self, user_id: &str) -> Result<Option<CloudToken>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT access_token, refresh_token, token_type, expiry
             FROM cloud_tokens WHERE user_id = ?1",
            params![user_id],
            |row| {
                Ok(CloudToken {
                    access_token: row.get(0)?,
                    refresh_token: row.get(1)?,
                    token_type: row.get::<_, Option<String>>(2)?.unwrap_or_else(|| "Bearer".into()),
                    expiry: row.get::<_, Option<String>>(3)?.as_deref().map(parse_ts),
                })
            },
        )
        .optional()
        .map_err(Error::database)
    }

    // ── Stats ────────────────────────────────────────────────────────────

    pub fn count_devices(&self) -> Result<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM devices", [], |row| {
            row.get::<_, i64>(0).map(|n| n as u64)
        })
        .map_err(Error::database)
    }

    pub fn count_files(&self) -> Result<u64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM files", [], |row| {
            row.get::<_, i64>(0).map(|n| n as u64)
        })
        .map_err(Error::database)
    }
}
