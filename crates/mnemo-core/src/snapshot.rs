//! Full-snapshot transfer.
//!
//! When the incremental protocol cannot reconcile two collections, one side
//! replaces the other wholesale. Upload adopts a client database through a
//! staging namespace so the live one is never half-written; download serves
//! the live tables as a standalone SQLite file.

use std::fs;
use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;

use crate::collection::Collection;
use crate::db::dialect::{TableDef, SCHEMA_VERSION};
use crate::db::TenantStore;
use crate::error::{Error, Result};
use crate::text::int_time_ms;

/// Rows copied per transaction while cloning a snapshot.
const COPY_BATCH: usize = 10_000;

fn integrity_ok(conn: &Connection) -> Result<bool> {
    let verdict: String = conn.query_row("pragma integrity_check", [], |row| row.get(0))?;
    Ok(verdict == "ok")
}

fn copy_tables(src: &Connection, dst: &Connection, tables: &[&TableDef]) -> Result<()> {
    for t in tables {
        let columns = t.column_list();
        let placeholders = vec!["?"; t.columns.len()].join(", ");
        let mut select = src.prepare(&format!("select {columns} from {}", t.name))?;
        let mut insert = dst.prepare(&format!(
            "insert into {} ({columns}) values ({placeholders})",
            t.name
        ))?;
        let mut rows = select.query([])?;
        let mut copied = 0usize;
        dst.execute_batch("begin")?;
        while let Some(row) = rows.next()? {
            let values: Vec<SqlValue> = (0..t.columns.len())
                .map(|i| row.get(i))
                .collect::<rusqlite::Result<_>>()?;
            insert.execute(rusqlite::params_from_iter(values))?;
            copied += 1;
            if copied % COPY_BATCH == 0 {
                dst.execute_batch("commit; begin")?;
            }
        }
        dst.execute_batch("commit")?;
    }
    Ok(())
}

/// Replace a tenant's namespace with an uploaded collection.
///
/// The upload is validated, cloned into a staging namespace named
/// `{tenant}_{millis}`, then swapped in. Media bookkeeping starts over
/// empty; the client resyncs its files afterwards.
pub fn full_upload(store: &TenantStore, tenant: &str, data: &[u8]) -> Result<()> {
    TenantStore::validate_name(tenant)?;
    fs::create_dir_all(store.data_root())?;
    let upload_path = store.data_root().join(format!("{tenant}.upload.tmp"));
    fs::write(&upload_path, data)?;
    let result = adopt_upload(store, tenant, &upload_path);
    let _ = fs::remove_file(&upload_path);
    result
}

fn adopt_upload(store: &TenantStore, tenant: &str, upload_path: &Path) -> Result<()> {
    let src = Connection::open(upload_path)?;
    if !integrity_ok(&src)? {
        return Err(Error::Integrity(
            "uploaded collection failed its integrity check".into(),
        ));
    }
    let ver: i64 = src.query_row("select ver from col", [], |row| row.get(0))?;
    if ver != SCHEMA_VERSION {
        return Err(Error::Integrity(format!(
            "uploaded collection has schema version {ver}, expected {SCHEMA_VERSION}"
        )));
    }

    let staging = format!("{tenant}_{}", int_time_ms());
    store.create_namespace(&staging)?;
    let copied = (|| {
        let dst = store.open(&staging)?;
        dst.execute("delete from col", [])?;
        copy_tables(&src, &dst, &TenantStore::snapshot_tables())
    })();
    if let Err(err) = copied {
        let _ = store.drop_namespace(&staging);
        return Err(err);
    }

    store.swap_namespaces(tenant, &staging)?;
    tracing::info!(tenant, "adopted full upload");
    Ok(())
}

/// Serialise a tenant's collection into a standalone SQLite file and return
/// its bytes. Pending registry changes are flushed first.
pub fn full_download(store: &TenantStore, tenant: &str) -> Result<Vec<u8>> {
    let mut col = Collection::open(store, tenant)?;
    col.save(None)?;

    let out_path = store.data_root().join(format!("{tenant}.download.tmp"));
    if out_path.exists() {
        fs::remove_file(&out_path)?;
    }
    let result = build_download(store, &col, &out_path);
    drop(col);
    match result {
        Ok(()) => {
            let bytes = fs::read(&out_path)?;
            let _ = fs::remove_file(&out_path);
            tracing::info!(tenant, bytes = bytes.len(), "prepared full download");
            Ok(bytes)
        }
        Err(err) => {
            let _ = fs::remove_file(&out_path);
            Err(err)
        }
    }
}

fn build_download(store: &TenantStore, col: &Collection, out_path: &Path) -> Result<()> {
    let dst = Connection::open(out_path)?;
    dst.pragma_update(None, "page_size", 4096)?;
    // journal_mode returns its new value; read it rather than execute it
    dst.query_row("pragma journal_mode = delete", [], |row| {
        row.get::<_, String>(0)
    })?;

    // same catalog as a live namespace, minus the bootstrap rows and the
    // media bookkeeping
    for t in TenantStore::snapshot_tables() {
        dst.execute_batch(&store.dialect().create_table(t))?;
        for index in store.dialect().create_indexes(t) {
            dst.execute_batch(&index)?;
        }
    }
    copy_tables(col.conn(), &dst, &TenantStore::snapshot_tables())?;
    if !integrity_ok(&dst)? {
        return Err(Error::Integrity(
            "prepared download failed its integrity check".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::test_support::open_collection;
    use pretty_assertions::assert_eq;

    #[test]
    fn download_then_upload_round_trips_a_collection() {
        let (_dir, store, mut col) = open_collection();
        let nid = col
            .create_note(
                "Basic",
                "Default",
                &[
                    ("Front".to_string(), "bonjour".to_string()),
                    ("Back".to_string(), "hello".to_string()),
                ],
                &[],
            )
            .unwrap()
            .unwrap();
        col.save(None).unwrap();
        drop(col);

        let bytes = full_download(&store, "tester").unwrap();
        full_upload(&store, "other", &bytes).unwrap();

        let col = Collection::open(&store, "other").unwrap();
        let flds: String = col
            .conn()
            .query_row("select flds from notes where id = ?", [nid], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(flds.starts_with("bonjour"));
        let cards: i64 = col
            .conn()
            .query_row("select count(*) from cards", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cards, 1);
    }

    #[test]
    fn corrupt_uploads_never_touch_the_live_namespace() {
        let (_dir, store, mut col) = open_collection();
        col.create_note(
            "Basic",
            "Default",
            &[
                ("Front".to_string(), "keep".to_string()),
                ("Back".to_string(), "me".to_string()),
            ],
            &[],
        )
        .unwrap();
        col.save(None).unwrap();
        drop(col);

        assert!(full_upload(&store, "tester", b"this is not a database").is_err());

        let col = Collection::open(&store, "tester").unwrap();
        let notes: i64 = col
            .conn()
            .query_row("select count(*) from notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(notes, 1);
    }
}
