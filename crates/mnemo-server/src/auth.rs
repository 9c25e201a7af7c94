//! Accounts and sync sessions.
//!
//! Both live in a `server.db` SQLite file beside the tenant namespaces.
//! Passwords are stored as salted SHA-256 digests; session keys double as
//! the `k`/`sk` tokens the sync client sends with every request. A session
//! also persists the usn window pinned by `start` so the later protocol
//! steps can resume it.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Mutex;

use mnemo_core::sync::SyncSession;
use mnemo_core::text::int_time;
use mnemo_core::TenantStore;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Session {
    pub skey: String,
    pub username: String,
    pub sync: Option<SyncSession>,
}

pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    pub fn open(data_root: &Path) -> Result<Self, AppError> {
        fs::create_dir_all(data_root).map_err(mnemo_core::Error::from)?;
        let conn = Connection::open(data_root.join("server.db"))?;
        conn.execute_batch(
            "create table if not exists users (
                username text not null primary key,
                salt text not null,
                hash text not null
            );
            create table if not exists sessions (
                skey text not null primary key,
                username text not null,
                created integer not null,
                min_usn integer,
                max_usn integer,
                local_newer integer
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, AppError> {
        self.conn
            .lock()
            .map_err(|_| AppError::internal("user store lock poisoned"))
    }

    /// Create the account if it does not exist yet. Usernames share the
    /// tenant-name syntax since each account owns a namespace.
    pub fn ensure_user(&self, username: &str, password: &str) -> Result<(), AppError> {
        TenantStore::validate_name(username).map_err(AppError::from)?;
        let conn = self.lock()?;
        let exists: Option<String> = conn
            .query_row(
                "select username from users where username = ?",
                [username],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(());
        }
        let salt = Uuid::new_v4().simple().to_string();
        conn.execute(
            "insert into users (username, salt, hash) values (?, ?, ?)",
            [username, &salt, &digest(&salt, password)],
        )?;
        tracing::info!(user = username, "created account");
        Ok(())
    }

    pub fn authenticate(&self, username: &str, password: &str) -> Result<bool, AppError> {
        let conn = self.lock()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "select salt, hash from users where username = ?",
                [username],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.is_some_and(|(salt, hash)| digest(&salt, password) == hash))
    }

    pub fn create_session(&self, username: &str) -> Result<String, AppError> {
        let skey = Uuid::new_v4().simple().to_string();
        let conn = self.lock()?;
        conn.execute(
            "insert into sessions (skey, username, created) values (?, ?, ?)",
            rusqlite::params![skey, username, int_time()],
        )?;
        Ok(skey)
    }

    pub fn session(&self, skey: &str) -> Result<Option<Session>, AppError> {
        let conn = self.lock()?;
        let row: Option<(String, Option<i64>, Option<i64>, Option<i64>)> = conn
            .query_row(
                "select username, min_usn, max_usn, local_newer from sessions where skey = ?",
                [skey],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        Ok(row.map(|(username, min_usn, max_usn, local_newer)| Session {
            skey: skey.to_string(),
            username,
            sync: match (min_usn, max_usn, local_newer) {
                (Some(min_usn), Some(max_usn), Some(local_newer)) => Some(SyncSession {
                    min_usn,
                    max_usn,
                    local_newer: local_newer != 0,
                }),
                _ => None,
            },
        }))
    }

    /// Persist the usn window pinned by `start`.
    pub fn save_sync_state(&self, skey: &str, sync: &SyncSession) -> Result<(), AppError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "update sessions set min_usn = ?, max_usn = ?, local_newer = ? where skey = ?",
            rusqlite::params![
                sync.min_usn,
                sync.max_usn,
                i64::from(sync.local_newer),
                skey
            ],
        )?;
        if changed == 0 {
            return Err(AppError::unauthorized("unknown session key"));
        }
        Ok(())
    }
}

fn digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    let mut hex = String::new();
    for byte in hasher.finalize() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn store() -> (tempfile::TempDir, UserStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = UserStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn accounts_round_trip() {
        let (_dir, store) = store();
        store.ensure_user("alice", "secret").unwrap();
        // idempotent, and the original password keeps working
        store.ensure_user("alice", "other").unwrap();
        assert!(store.authenticate("alice", "secret").unwrap());
        assert!(!store.authenticate("alice", "other").unwrap());
        assert!(!store.authenticate("bob", "secret").unwrap());
    }

    #[test]
    fn invalid_usernames_are_rejected() {
        let (_dir, store) = store();
        assert!(store.ensure_user("../alice", "secret").is_err());
    }

    #[test]
    fn sessions_persist_the_sync_window() {
        let (_dir, store) = store();
        store.ensure_user("alice", "secret").unwrap();
        let skey = store.create_session("alice").unwrap();

        let session = store.session(&skey).unwrap().unwrap();
        assert_eq!(session.username, "alice");
        assert!(session.sync.is_none());

        store
            .save_sync_state(
                &skey,
                &SyncSession {
                    min_usn: 3,
                    max_usn: 7,
                    local_newer: true,
                },
            )
            .unwrap();
        let session = store.session(&skey).unwrap().unwrap();
        let sync = session.sync.unwrap();
        assert_eq!((sync.min_usn, sync.max_usn, sync.local_newer), (3, 7, true));

        assert!(store.session("missing").unwrap().is_none());
    }
}
