use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Durable storage consumed by the room core. Implementations must be
/// internally thread-safe; every method may block on disk.
pub trait Store: Send + Sync {
    /// Serialized state blob for a room, if one has been saved.
    fn load_room(&self, room_id: &str) -> Result<Option<String>, StoreError>;

    fn save_room(&self, room_id: &str, state_json: &str) -> Result<(), StoreError>;

    /// Append an immutable snapshot; returns its id.
    fn create_snapshot(
        &self,
        room_id: &str,
        label: &str,
        state_json: &str,
    ) -> Result<String, StoreError>;

    /// A snapshot carries its own room id so callers can verify it belongs
    /// to the room being restored.
    fn load_snapshot(&self, snapshot_id: &str) -> Result<Option<(String, String)>, StoreError>;

    fn is_member(&self, user_id: &str, room_id: &str) -> Result<bool, StoreError>;

    fn get_room_owner(&self, room_id: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub room_id: String,
    pub label: String,
    pub created_at: String,
}

/// SQLite-backed store: room meta + state blobs + snapshot log + membership.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.migrate();
        store
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rooms (
                room_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                owner_user_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS room_states (
                room_id TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                snapshot_id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL,
                label TEXT NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_snapshots_room ON snapshots(room_id);

            CREATE TABLE IF NOT EXISTS room_members (
                room_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                PRIMARY KEY (room_id, user_id)
            );",
        )
        .expect("Failed to run migrations");
    }

    /// Record a new room with its owner, enrolling the owner as a member.
    /// Creating an already-known room is an error at the SQL layer.
    pub fn create_room(
        &self,
        room_id: &str,
        name: &str,
        owner_user_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO rooms (room_id, name, owner_user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![room_id, name, owner_user_id, &now],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
            params![room_id, owner_user_id],
        )?;
        Ok(())
    }

    pub fn add_member(&self, room_id: &str, user_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO room_members (room_id, user_id) VALUES (?1, ?2)",
            params![room_id, user_id],
        )?;
        Ok(())
    }

    /// Snapshots for a room, newest first. Serves the snapshot admin surface.
    pub fn list_snapshots(&self, room_id: &str) -> Result<Vec<SnapshotInfo>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT snapshot_id, room_id, label, created_at FROM snapshots
             WHERE room_id = ?1 ORDER BY created_at DESC",
        )?;
        let snapshots = stmt
            .query_map(params![room_id], |row| {
                Ok(SnapshotInfo {
                    snapshot_id: row.get(0)?,
                    room_id: row.get(1)?,
                    label: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(snapshots)
    }
}

impl Store for SqliteStore {
    fn load_room(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let state = conn
            .query_row(
                "SELECT state_json FROM room_states WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    fn save_room(&self, room_id: &str, state_json: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO room_states (room_id, state_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(room_id) DO UPDATE SET state_json = ?2, updated_at = ?3",
            params![room_id, state_json, &now],
        )?;
        Ok(())
    }

    fn create_snapshot(
        &self,
        room_id: &str,
        label: &str,
        state_json: &str,
    ) -> Result<String, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let now = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO snapshots (snapshot_id, room_id, label, state_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&snapshot_id, room_id, label, state_json, &now],
        )?;
        Ok(snapshot_id)
    }

    fn load_snapshot(&self, snapshot_id: &str) -> Result<Option<(String, String)>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT room_id, state_json FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row)
    }

    fn is_member(&self, user_id: &str, room_id: &str) -> Result<bool, StoreError> {
        if self.get_room_owner(room_id)?.as_deref() == Some(user_id) {
            return Ok(true);
        }
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM room_members WHERE room_id = ?1 AND user_id = ?2",
            params![room_id, user_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn get_room_owner(&self, room_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let owner: Option<Option<String>> = conn
            .query_row(
                "SELECT owner_user_id FROM rooms WHERE room_id = ?1",
                params![room_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner.flatten())
    }
}
