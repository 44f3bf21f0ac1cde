//! Credentials store: users, permissions, and chat message history.
//!
//! Single `rusqlite` connection, three tables created on startup, every
//! mutation wrapped in an explicit transaction with rollback on error —
//! mirroring `connect_databases`/`register`/`init_session` in the reference
//! server, which does the same with a raw cursor and `try/except
//! sqlite3.Error: rollback()`.

use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

pub struct CredentialsStore {
    conn: Connection,
}

impl CredentialsStore {
    /// Opens (creating if absent) the database at `path` and ensures the
    /// schema exists.
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path).context("open credentials database")?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    /// In-memory store, for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        let store = Self { conn };
        store.create_tables()?;
        Ok(store)
    }

    fn create_tables(&self) -> anyhow::Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS users(
                id BLOB PRIMARY KEY,
                name VARCHAR(32) NOT NULL UNIQUE COLLATE NOCASE,
                password VARCHAR(255) NOT NULL
            );
            CREATE TABLE IF NOT EXISTS permissions(
                id BLOB PRIMARY KEY,
                privilege_level INT NOT NULL,
                FOREIGN KEY(id) REFERENCES users(id)
            );
            CREATE TABLE IF NOT EXISTS messages(
                id BLOB PRIMARY KEY,
                timestamp TEXT,
                message VARCHAR(255),
                user_id BLOB NOT NULL,
                FOREIGN KEY(user_id) REFERENCES users(id)
            );",
        )
        .context("create schema")
    }

    /// `true` if a user with this name exists (case-insensitive).
    pub fn username_exists(&self, name: &str) -> anyhow::Result<bool> {
        let exists: bool = self
            .conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE name = ?1)",
                params![name],
                |row| row.get(0),
            )
            .context("check username existence")?;
        Ok(exists)
    }

    /// Looks up the stored bcrypt hash for `name`, if registered.
    pub fn password_hash(&self, name: &str) -> anyhow::Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT password FROM users WHERE name = ?1 LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("fetch password hash")
    }

    /// Looks up a user's id by name.
    pub fn user_id(&self, name: &str) -> anyhow::Result<Option<Uuid>> {
        let bytes: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT id FROM users WHERE name = ?1 LIMIT 1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("fetch user id")?;
        bytes
            .map(|b| Uuid::from_slice(&b).context("stored id is not a valid uuid"))
            .transpose()
    }

    /// Creates a user and its default privilege row (0) in one transaction.
    /// Rolls back on any failure.
    pub fn register(&mut self, name: &str, password_hash: &str) -> anyhow::Result<Uuid> {
        let id = Uuid::new_v4();
        let tx = self.conn.transaction().context("begin register transaction")?;
        tx.execute(
            "INSERT INTO users (id, name, password) VALUES (?1, ?2, ?3)",
            params![id.as_bytes().to_vec(), name, password_hash],
        )
        .context("insert user")?;
        tx.execute(
            "INSERT INTO permissions (id, privilege_level) VALUES (?1, 0)",
            params![id.as_bytes().to_vec()],
        )
        .context("insert permissions")?;
        tx.commit().context("commit register transaction")?;
        Ok(id)
    }

    /// Fetches a user's privilege level, creating a default row of 0 if
    /// missing — transactional, matching the reference's fetch-or-create.
    pub fn privilege_level_or_default(&mut self, id: Uuid) -> anyhow::Result<i32> {
        let tx = self.conn.transaction().context("begin privilege transaction")?;
        let existing: Option<i32> = tx
            .query_row(
                "SELECT privilege_level FROM permissions WHERE id = ?1 LIMIT 1",
                params![id.as_bytes().to_vec()],
                |row| row.get(0),
            )
            .optional()
            .context("fetch privilege level")?;
        let level = match existing {
            Some(level) => level,
            None => {
                tx.execute(
                    "INSERT INTO permissions (id, privilege_level) VALUES (?1, 0)",
                    params![id.as_bytes().to_vec()],
                )
                .context("insert default permissions row")?;
                0
            }
        };
        tx.commit().context("commit privilege transaction")?;
        Ok(level)
    }

    /// Inserts a chat message (audit only — never replayed to clients).
    pub fn insert_message(&mut self, text: &str, user_id: Uuid) -> anyhow::Result<()> {
        let tx = self.conn.transaction().context("begin message transaction")?;
        tx.execute(
            "INSERT INTO messages (id, timestamp, message, user_id) VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::new_v4().as_bytes().to_vec(),
                chrono::Utc::now().to_rfc3339(),
                text,
                user_id.as_bytes().to_vec(),
            ],
        )
        .context("insert message")?;
        tx.commit().context("commit message transaction")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_round_trips() {
        let mut store = CredentialsStore::open_in_memory().unwrap();
        assert!(!store.username_exists("dave").unwrap());
        let id = store.register("dave", "hashed").unwrap();
        assert!(store.username_exists("dave").unwrap());
        assert_eq!(store.user_id("dave").unwrap(), Some(id));
        assert_eq!(store.password_hash("dave").unwrap(), Some("hashed".to_string()));
    }

    #[test]
    fn username_uniqueness_is_case_insensitive() {
        let mut store = CredentialsStore::open_in_memory().unwrap();
        store.register("Dave", "hashed").unwrap();
        assert!(store.username_exists("dave").unwrap());
        assert!(store.register("dave", "other").is_err());
    }

    #[test]
    fn privilege_defaults_to_zero_and_is_idempotent() {
        let mut store = CredentialsStore::open_in_memory().unwrap();
        let id = store.register("dave", "hashed").unwrap();
        assert_eq!(store.privilege_level_or_default(id).unwrap(), 0);
        assert_eq!(store.privilege_level_or_default(id).unwrap(), 0);
    }

    #[test]
    fn privilege_fetch_or_create_for_unknown_id_inserts_default() {
        let mut store = CredentialsStore::open_in_memory().unwrap();
        let orphan_id = Uuid::new_v4();
        assert_eq!(store.privilege_level_or_default(orphan_id).unwrap(), 0);
    }
}
