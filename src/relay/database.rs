//! Persistent SQLite store for users and encrypted message history.

use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::relay::cipher::{Cipher, CipherError};

/// Timestamp format used in `message_history.timestamp` (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Cipher { id: i64, source: CipherError },
    Encrypt(CipherError),
    /// A previous holder of the connection lock panicked.
    Poisoned,
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "sqlite error: {e}"),
            Self::Cipher { id, source } => write!(f, "cannot decrypt message {id}: {source}"),
            Self::Encrypt(e) => write!(f, "cannot encrypt message: {e}"),
            Self::Poisoned => write!(f, "database lock poisoned"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sqlite(e) => Some(e),
            Self::Cipher { source, .. } => Some(source),
            Self::Encrypt(e) => Some(e),
            Self::Poisoned => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// A user row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: i64,
    pub is_authorized: bool,
}

/// A decrypted history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: i64,
    pub text: String,
    pub is_bot: bool,
    pub timestamp: String,
}

/// Persistent SQLite database for the relay. All access goes through one lock.
pub struct Database {
    conn: Mutex<Connection>,
    cipher: Cipher,
}

impl Database {
    /// Create a new in-memory database.
    pub fn in_memory(cipher: Cipher) -> Result<Self, DbError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, cipher)
    }

    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path, cipher: Cipher) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let db = Self::with_connection(conn, cipher)?;
        let (users, messages) = db.counts()?;
        info!("Loaded database from {:?} ({} users, {} messages)", path, users, messages);
        Ok(db)
    }

    fn with_connection(conn: Connection, cipher: Cipher) -> Result<Self, DbError> {
        let db = Self { conn: Mutex::new(conn), cipher };
        db.init_schema()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                is_authorized INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS message_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                message TEXT NOT NULL,
                is_bot INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                is_encrypted INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_history_user_id ON message_history(user_id, id);
        "#)?;
        Ok(())
    }

    fn counts(&self) -> Result<(usize, usize), DbError> {
        let conn = self.conn()?;
        let users: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        let messages: i64 = conn.query_row("SELECT COUNT(*) FROM message_history", [], |row| row.get(0))?;
        Ok((users as usize, messages as usize))
    }

    // ==================== USER METHODS ====================

    pub fn get_user(&self, user_id: i64) -> Result<Option<User>, DbError> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT user_id, is_authorized FROM users WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(User {
                        user_id: row.get(0)?,
                        is_authorized: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    /// Insert an unauthorized user. No-op if the user already exists.
    pub fn create_user(&self, user_id: i64) -> Result<User, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO users (user_id, is_authorized) VALUES (?1, 0)",
            params![user_id],
        )?;
        let is_authorized = conn.query_row(
            "SELECT is_authorized FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(User { user_id, is_authorized })
    }

    pub fn set_authorized(&self, user_id: i64, authorized: bool) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, is_authorized) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET is_authorized = ?2",
            params![user_id, authorized],
        )?;
        debug!("User {} authorized={}", user_id, authorized);
        Ok(())
    }

    /// Every user that ever contacted the bot.
    pub fn all_user_ids(&self) -> Result<Vec<i64>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    // ==================== MESSAGE METHODS ====================

    /// Encrypt and append a message. Returns the new row id.
    pub fn append(&self, user_id: i64, text: &str, is_bot: bool, timestamp: &str) -> Result<i64, DbError> {
        let ciphertext = self.cipher.encrypt(text).map_err(DbError::Encrypt)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO message_history (user_id, message, is_bot, timestamp, is_encrypted)
             VALUES (?1, ?2, ?3, ?4, 1)",
            params![user_id, ciphertext, is_bot, timestamp],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Text of the highest-id bot message for this user.
    pub fn last_bot_message(&self, user_id: i64) -> Result<Option<String>, DbError> {
        let row = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT id, message, is_encrypted FROM message_history
                 WHERE user_id = ?1 AND is_bot = 1
                 ORDER BY id DESC LIMIT 1",
                params![user_id],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, bool>(2)?)),
            )
            .optional()?
        };

        match row {
            Some((id, text, encrypted)) => Ok(Some(self.reveal(id, text, encrypted)?)),
            None => Ok(None),
        }
    }

    /// The last `limit` messages of a user, oldest first.
    pub fn recent_messages(&self, user_id: i64, limit: usize) -> Result<Vec<StoredMessage>, DbError> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, message, is_bot, timestamp, is_encrypted FROM message_history
                 WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![user_id, limit as i64], |row| {
                Ok((
                    StoredMessage {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        text: row.get(2)?,
                        is_bot: row.get(3)?,
                        timestamp: row.get(4)?,
                    },
                    row.get::<_, bool>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut result = rows
            .into_iter()
            .map(|(mut msg, encrypted)| {
                msg.text = self.reveal(msg.id, msg.text, encrypted)?;
                Ok(msg)
            })
            .collect::<Result<Vec<_>, DbError>>()?;
        result.reverse();
        Ok(result)
    }

    /// Encrypt every plaintext row in place. Returns how many rows changed.
    pub fn encrypt_legacy_messages(&self) -> Result<usize, DbError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let legacy = {
            let mut stmt = tx.prepare("SELECT id, message FROM message_history WHERE is_encrypted = 0")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for (id, text) in &legacy {
            let ciphertext = self.cipher.encrypt(text).map_err(DbError::Encrypt)?;
            tx.execute(
                "UPDATE message_history SET message = ?1, is_encrypted = 1 WHERE id = ?2",
                params![ciphertext, id],
            )?;
        }
        tx.commit()?;

        if !legacy.is_empty() {
            info!("Encrypted {} legacy message(s)", legacy.len());
        }
        Ok(legacy.len())
    }

    fn reveal(&self, id: i64, text: String, encrypted: bool) -> Result<String, DbError> {
        if encrypted {
            self.cipher.decrypt(&text).map_err(|source| DbError::Cipher { id, source })
        } else {
            Ok(text)
        }
    }

    /// Insert a row the way pre-encryption builds did.
    #[cfg(test)]
    pub fn insert_plaintext(&self, user_id: i64, text: &str, is_bot: bool, timestamp: &str) -> i64 {
        let conn = self.conn().unwrap();
        conn.execute(
            "INSERT INTO message_history (user_id, message, is_bot, timestamp, is_encrypted)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![user_id, text, is_bot, timestamp],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    /// Raw `(message, is_encrypted)` column values, in id order.
    #[cfg(test)]
    pub fn raw_rows(&self) -> Vec<(String, bool)> {
        let conn = self.conn().unwrap();
        let mut stmt = conn
            .prepare("SELECT message, is_encrypted FROM message_history ORDER BY id")
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::new(&[7u8; 16]).unwrap()
    }

    fn db() -> Database {
        Database::in_memory(cipher()).unwrap()
    }

    #[test]
    fn test_create_user_is_unauthorized_and_idempotent() {
        let db = db();
        assert_eq!(db.get_user(42).unwrap(), None);
        let user = db.create_user(42).unwrap();
        assert!(!user.is_authorized);

        db.set_authorized(42, true).unwrap();
        // A second create must not reset the flag.
        let again = db.create_user(42).unwrap();
        assert!(again.is_authorized);
        assert_eq!(db.get_user(42).unwrap(), Some(User { user_id: 42, is_authorized: true }));
    }

    #[test]
    fn test_all_user_ids() {
        let db = db();
        assert!(db.all_user_ids().unwrap().is_empty());
        db.create_user(3).unwrap();
        db.create_user(1).unwrap();
        db.create_user(3).unwrap();
        assert_eq!(db.all_user_ids().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_append_returns_increasing_ids_and_encrypts() {
        let db = db();
        let a = db.append(1, "hello", false, "2024-01-01 10:00:00").unwrap();
        let b = db.append(1, "hi there", true, "2024-01-01 10:00:01").unwrap();
        assert!(b > a);

        let raw = db.raw_rows();
        assert!(raw.iter().all(|(_, encrypted)| *encrypted));
        assert!(raw.iter().all(|(text, _)| text != "hello" && text != "hi there"));
    }

    #[test]
    fn test_recent_messages_last_k_in_order() {
        let db = db();
        for i in 0..7 {
            db.append(1, &format!("m{i}"), i % 2 == 1, "2024-01-01 10:00:00").unwrap();
        }
        db.append(2, "other user", false, "2024-01-01 10:00:00").unwrap();

        let texts = |k| {
            db.recent_messages(1, k)
                .unwrap()
                .into_iter()
                .map(|m| m.text)
                .collect::<Vec<_>>()
        };
        assert_eq!(texts(3), vec!["m4", "m5", "m6"]);
        assert_eq!(texts(7).len(), 7);
        assert_eq!(texts(100).len(), 7);
        assert_eq!(texts(100)[0], "m0");
        assert!(texts(0).is_empty());
        assert!(db.recent_messages(99, 5).unwrap().is_empty());
    }

    #[test]
    fn test_last_bot_message_by_id_not_timestamp() {
        let db = db();
        assert_eq!(db.last_bot_message(1).unwrap(), None);

        db.append(1, "user says", false, "2024-01-01 10:00:00").unwrap();
        assert_eq!(db.last_bot_message(1).unwrap(), None);

        db.append(1, "first reply", true, "2024-06-01 00:00:00").unwrap();
        // Older wall-clock timestamp, but appended later.
        db.append(1, "second reply", true, "2023-01-01 00:00:00").unwrap();
        db.append(1, "user again", false, "2024-07-01 00:00:00").unwrap();

        assert_eq!(db.last_bot_message(1).unwrap().as_deref(), Some("second reply"));
        assert_eq!(db.last_bot_message(2).unwrap(), None);
    }

    #[test]
    fn test_plaintext_rows_readable_before_migration() {
        let db = db();
        db.insert_plaintext(1, "legacy reply", true, "2023-01-01 00:00:00");
        assert_eq!(db.last_bot_message(1).unwrap().as_deref(), Some("legacy reply"));
    }

    #[test]
    fn test_migration_encrypts_mixed_rows() {
        let db = db();
        db.insert_plaintext(1, "old question", false, "2023-01-01 00:00:00");
        db.append(1, "new question", false, "2024-01-01 00:00:00").unwrap();
        db.insert_plaintext(2, "old answer", true, "2023-01-01 00:00:01");

        assert_eq!(db.encrypt_legacy_messages().unwrap(), 2);

        let raw = db.raw_rows();
        assert!(raw.iter().all(|(_, encrypted)| *encrypted));
        let c = cipher();
        let decrypted: Vec<String> = raw.iter().map(|(t, _)| c.decrypt(t).unwrap()).collect();
        assert_eq!(decrypted, vec!["old question", "new question", "old answer"]);

        // Second run touches nothing.
        assert_eq!(db.encrypt_legacy_messages().unwrap(), 0);
        assert_eq!(db.raw_rows(), raw);
    }

    #[test]
    fn test_wrong_key_reports_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let db = Database::open(&path, cipher()).unwrap();
            db.append(5, "bot text", true, "2024-01-01 00:00:00").unwrap();
        }
        let other = Database::open(&path, Cipher::new(&[9u8; 16]).unwrap()).unwrap();
        let err = other.last_bot_message(5).unwrap_err();
        assert!(matches!(err, DbError::Cipher { .. }));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        {
            let db = Database::open(&path, cipher()).unwrap();
            db.create_user(10).unwrap();
            db.set_authorized(10, true).unwrap();
            db.append(10, "persisted", true, "2024-01-01 00:00:00").unwrap();
        }
        let db = Database::open(&path, cipher()).unwrap();
        assert!(db.get_user(10).unwrap().unwrap().is_authorized);
        assert_eq!(db.last_bot_message(10).unwrap().as_deref(), Some("persisted"));
    }
}
