//! Tenant namespace management.
//!
//! Each tenant's namespace is one SQLite database file under the data root,
//! plus a sibling media directory. Namespace create/drop/swap map onto file
//! operations, which keeps the full-snapshot swap window to two renames.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;

use super::dialect::{SchemaDialect, TableGroup, TABLES};
use crate::error::{Error, Result};

/// Maximum accepted tenant-name length.
const MAX_TENANT_NAME: usize = 64;

/// Owns the data root and hands out per-tenant connections.
#[derive(Clone)]
pub struct TenantStore {
    data_root: PathBuf,
    dialect: Arc<dyn SchemaDialect>,
}

impl TenantStore {
    pub fn new(data_root: impl Into<PathBuf>, dialect: Arc<dyn SchemaDialect>) -> Self {
        Self {
            data_root: data_root.into(),
            dialect,
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn dialect(&self) -> &Arc<dyn SchemaDialect> {
        &self.dialect
    }

    /// Validate a tenant name against the allow-listed identifier syntax.
    ///
    /// Names become file names and are spliced into nothing else, but the
    /// strict syntax is still enforced at every entry point.
    pub fn validate_name(name: &str) -> Result<()> {
        let mut chars = name.chars();
        let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if head_ok && tail_ok && name.len() <= MAX_TENANT_NAME {
            Ok(())
        } else {
            Err(Error::InvalidTenantName(name.to_string()))
        }
    }

    pub fn db_path(&self, name: &str) -> PathBuf {
        self.data_root.join(format!("{name}.db"))
    }

    /// Media files live beside the namespace, one directory per tenant.
    pub fn media_dir(&self, name: &str) -> PathBuf {
        self.data_root.join(name)
    }

    pub fn namespace_exists(&self, name: &str) -> Result<bool> {
        Self::validate_name(name)?;
        Ok(self.db_path(name).exists())
    }

    /// Create a fresh namespace with the full table catalog and bootstrap
    /// rows. Fails if the namespace already exists.
    pub fn create_namespace(&self, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        let path = self.db_path(name);
        if path.exists() {
            return Err(Error::Namespace(format!("namespace {name} already exists")));
        }
        fs::create_dir_all(&self.data_root)?;
        let conn = Connection::open(&path)?;
        for sql in self.dialect.schema_sql(TABLES) {
            conn.execute_batch(&sql)?;
        }
        tracing::info!(tenant = name, "created namespace");
        Ok(())
    }

    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        Self::validate_name(name)?;
        let path = self.db_path(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// Atomically replace `live` with `staging`: rename the live namespace
    /// aside, rename staging into its place, then delete the old one. The
    /// two renames are the only operations inside the exposure window.
    pub fn swap_namespaces(&self, live: &str, staging: &str) -> Result<()> {
        Self::validate_name(live)?;
        Self::validate_name(staging)?;
        let live_path = self.db_path(live);
        let staging_path = self.db_path(staging);
        if !staging_path.exists() {
            return Err(Error::Namespace(format!(
                "staging namespace {staging} does not exist"
            )));
        }
        let old_path = self.data_root.join(format!("{live}.db.old"));
        let had_live = live_path.exists();
        if had_live {
            fs::rename(&live_path, &old_path)?;
        }
        fs::rename(&staging_path, &live_path)?;
        if had_live {
            fs::remove_file(&old_path)?;
        }
        tracing::info!(tenant = live, from = staging, "swapped namespace");
        Ok(())
    }

    /// Open a connection to an existing namespace.
    pub fn open(&self, name: &str) -> Result<Connection> {
        Self::validate_name(name)?;
        let path = self.db_path(name);
        if !path.exists() {
            return Err(Error::Namespace(format!("namespace {name} does not exist")));
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    /// Names of the tables copied by the full-snapshot engine.
    pub fn snapshot_tables() -> Vec<&'static super::dialect::TableDef> {
        TABLES
            .iter()
            .filter(|t| t.group == TableGroup::Collection)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::SqliteDialect;

    fn store() -> (tempfile::TempDir, TenantStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantStore::new(dir.path(), Arc::new(SqliteDialect));
        (dir, store)
    }

    #[test]
    fn name_validation() {
        assert!(TenantStore::validate_name("alice").is_ok());
        assert!(TenantStore::validate_name("alice_2").is_ok());
        assert!(TenantStore::validate_name("").is_err());
        assert!(TenantStore::validate_name("1alice").is_err());
        assert!(TenantStore::validate_name("alice;drop").is_err());
        assert!(TenantStore::validate_name("../alice").is_err());
    }

    #[test]
    fn create_open_drop() {
        let (_dir, store) = store();
        assert!(!store.namespace_exists("alice").unwrap());
        store.create_namespace("alice").unwrap();
        assert!(store.namespace_exists("alice").unwrap());
        // creating twice is an error, not a silent wipe
        assert!(store.create_namespace("alice").is_err());

        let conn = store.open("alice").unwrap();
        let usn: i64 = conn
            .query_row("select usn from col", [], |row| row.get(0))
            .unwrap();
        assert_eq!(usn, 0);
        drop(conn);

        store.drop_namespace("alice").unwrap();
        assert!(!store.namespace_exists("alice").unwrap());
    }

    #[test]
    fn swap_replaces_live_with_staging() {
        let (_dir, store) = store();
        store.create_namespace("bob").unwrap();
        store.create_namespace("bob_staging").unwrap();

        let conn = store.open("bob_staging").unwrap();
        conn.execute("update col set usn = 42", []).unwrap();
        drop(conn);

        store.swap_namespaces("bob", "bob_staging").unwrap();
        assert!(!store.namespace_exists("bob_staging").unwrap());

        let conn = store.open("bob").unwrap();
        let usn: i64 = conn
            .query_row("select usn from col", [], |row| row.get(0))
            .unwrap();
        assert_eq!(usn, 42);
    }
}
