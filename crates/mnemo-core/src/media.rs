//! Media file synchronisation.
//!
//! Media rows carry their own usn sequence, separate from the collection's.
//! A row with a null checksum is a deletion marker; it stays in the table so
//! the removal propagates to other devices. File payloads travel in zip
//! archives whose `_meta` member names the files by member ordinal.

use std::fs;
use std::io::{Cursor, Read, Write};

use serde_json::Value;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::collection::Collection;
use crate::db::dialect::table;
use crate::error::{Error, Result};
use crate::models::MediaEntry;
use crate::text::checksum;

/// Upload archive bounds, checked before anything is written.
const MAX_META_SIZE: u64 = 100_000;
const MAX_ZIP_CONTENTS: u64 = 100 * 1024 * 1024;

/// Download archive bounds; packing stops once either is exceeded.
const DOWNLOAD_ZIP_SIZE: u64 = 5 * 1024 * 1024 / 2;
const DOWNLOAD_ZIP_COUNT: usize = 25;

pub fn last_usn(col: &Collection) -> Result<i64> {
    Ok(col
        .conn()
        .query_row("select max(usn) from media", [], |row| {
            row.get::<_, Option<i64>>(0)
        })?
        .unwrap_or(0))
}

/// Files the tenant currently holds; deletion markers are excluded.
pub fn count(col: &Collection) -> Result<i64> {
    Ok(col
        .conn()
        .query_row("select count(*) from media where csum is not null", [], |row| {
            row.get(0)
        })?)
}

/// Rows the client has not seen, oldest first, as `[fname, usn, csum]`.
pub fn changes(col: &Collection, client_last_usn: i64) -> Result<Vec<(String, i64, Option<String>)>> {
    let server_last_usn = last_usn(col)?;
    let mut result = Vec::new();
    if client_last_usn < server_last_usn || client_last_usn == 0 {
        let mut stmt = col
            .conn()
            .prepare("select fname, usn, csum from media order by usn desc limit ?")?;
        let rows = stmt.query_map([server_last_usn - client_last_usn], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        for row in rows {
            result.push(row?);
        }
    }
    result.reverse();
    Ok(result)
}

/// Tombstone one file: delete it from disk and leave a null-checksum row at
/// the next usn.
pub fn sync_delete(col: &mut Collection, fname: &str) -> Result<()> {
    let path = col.media_dir().join(fname);
    if path.exists() {
        fs::remove_file(path)?;
    }
    let usn = last_usn(col)? + 1;
    let sql = col.dialect().insert_or_update(table("media"));
    col.conn()
        .execute(&sql, rusqlite::params![fname, usn, None::<String>])?;
    col.mark_dirty();
    Ok(())
}

/// Reject oversized upload archives before touching the media directory.
pub fn check_zip<R: Read + std::io::Seek>(archive: &mut ZipArchive<R>) -> Result<()> {
    let meta_size = archive.by_name("_meta")?.size();
    if meta_size > MAX_META_SIZE {
        return Err(Error::Integrity(format!(
            "media archive metadata is {meta_size} bytes, limit {MAX_META_SIZE}"
        )));
    }
    let mut total = 0;
    for i in 0..archive.len() {
        total += archive.by_index(i)?.size();
    }
    if total > MAX_ZIP_CONTENTS {
        return Err(Error::Integrity(format!(
            "media archive contents are {total} bytes, limit {MAX_ZIP_CONTENTS}"
        )));
    }
    Ok(())
}

fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_i64() == Some(0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Apply an upload archive: each `_meta` entry is `[fname, ordinal]`, with
/// a falsy ordinal marking a deletion and a truthy one naming the archive
/// member carrying the file. Returns the number of entries processed.
pub fn adopt_changes_from_zip(col: &mut Collection, data: &[u8]) -> Result<usize> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    check_zip(&mut archive)?;

    let meta: Vec<(String, Value)> = {
        let mut raw = String::new();
        archive.by_name("_meta")?.read_to_string(&mut raw)?;
        serde_json::from_str(&raw)?
    };

    let to_remove: Vec<String> = meta
        .iter()
        .filter(|(_, ordinal)| is_falsy(ordinal))
        .map(|(fname, _)| fname.clone())
        .collect();

    fs::create_dir_all(col.media_dir())?;
    let old_usn = last_usn(col)?;
    let mut usn = old_usn;

    for fname in &to_remove {
        sync_delete(col, fname)?;
        usn += 1;
    }

    let mut to_add: Vec<MediaEntry> = Vec::new();
    for i in 0..archive.len() {
        let mut member = archive.by_index(i)?;
        if member.name() == "_meta" {
            continue;
        }
        let idx: usize = member.name().parse().map_err(|_| {
            Error::InvalidPayload(format!("unexpected media archive member {}", member.name()))
        })?;
        let fname = meta
            .get(idx)
            .map(|(fname, _)| fname.clone())
            .ok_or_else(|| {
                Error::InvalidPayload(format!("media archive member {idx} missing from _meta"))
            })?;
        let mut contents = Vec::new();
        member.read_to_end(&mut contents)?;
        drop(member);

        fs::write(col.media_dir().join(&fname), &contents)?;
        usn += 1;
        to_add.push(MediaEntry {
            fname,
            usn,
            csum: Some(checksum(&contents)),
        });
    }

    let processed = to_remove.len() + to_add.len();
    if processed != meta.len() {
        return Err(Error::Integrity(format!(
            "media archive carried {} entries but {processed} were processed",
            meta.len()
        )));
    }

    if !to_add.is_empty() {
        let sql = col.dialect().insert_or_update(table("media"));
        let mut stmt = col.conn().prepare_cached(&sql)?;
        for entry in &to_add {
            stmt.execute(rusqlite::params![entry.fname, entry.usn, entry.csum])?;
        }
        drop(stmt);
        col.mark_dirty();
    }

    let new_usn = last_usn(col)?;
    if new_usn != old_usn + processed as i64 {
        return Err(Error::Integrity(format!(
            "media usn advanced to {new_usn}, expected {}",
            old_usn + processed as i64
        )));
    }
    Ok(processed)
}

/// Pack the requested files into a download archive, numbering the members
/// and mapping them back to filenames in `_meta`. Stops once the archive
/// holds enough; the client asks again for the rest.
pub fn package_files_for_download(col: &Collection, files: &[String]) -> Result<Vec<u8>> {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let mut names = serde_json::Map::new();
    let mut size: u64 = 0;

    for (count, fname) in files.iter().enumerate() {
        let path = col.media_dir().join(fname);
        let contents = fs::read(&path)?;
        zip.start_file(count.to_string(), options)?;
        zip.write_all(&contents)?;
        names.insert(count.to_string(), Value::String(fname.clone()));
        size += contents.len() as u64;
        if size > DOWNLOAD_ZIP_SIZE || count > DOWNLOAD_ZIP_COUNT {
            break;
        }
    }

    zip.start_file("_meta", options)?;
    zip.write_all(serde_json::to_string(&Value::Object(names))?.as_bytes())?;
    Ok(zip.finish()?.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::test_support::open_collection;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn upload_zip(meta: &Value, files: &[(&str, &[u8])]) -> Vec<u8> {
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("_meta", options).unwrap();
        zip.write_all(meta.to_string().as_bytes()).unwrap();
        for (name, data) in files {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn adopting_uploads_adds_rows_and_files() {
        let (_dir, _store, mut col) = open_collection();
        let meta = json!([["cat.jpg", "0"], ["dog.jpg", "1"]]);
        let data = upload_zip(&meta, &[("0", b"cat-bytes"), ("1", b"dog-bytes")]);

        let processed = adopt_changes_from_zip(&mut col, &data).unwrap();

        assert_eq!(processed, 2);
        assert_eq!(last_usn(&col).unwrap(), 2);
        assert_eq!(count(&col).unwrap(), 2);
        assert_eq!(
            fs::read(col.media_dir().join("cat.jpg")).unwrap(),
            b"cat-bytes"
        );
        let csum: String = col
            .conn()
            .query_row(
                "select csum from media where fname = 'cat.jpg'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(csum, checksum(b"cat-bytes"));
    }

    #[test]
    fn deletions_leave_null_checksum_markers() {
        let (_dir, _store, mut col) = open_collection();
        let add = json!([["cat.jpg", "0"]]);
        adopt_changes_from_zip(&mut col, &upload_zip(&add, &[("0", b"cat-bytes")])).unwrap();

        let del = json!([["cat.jpg", 0]]);
        let processed = adopt_changes_from_zip(&mut col, &upload_zip(&del, &[])).unwrap();

        assert_eq!(processed, 1);
        assert!(!col.media_dir().join("cat.jpg").exists());
        assert_eq!(count(&col).unwrap(), 0);
        assert_eq!(last_usn(&col).unwrap(), 2);
    }

    #[test]
    fn changes_are_reported_oldest_first() {
        let (_dir, _store, mut col) = open_collection();
        let meta = json!([["a.png", "0"], ["b.png", "1"]]);
        adopt_changes_from_zip(&mut col, &upload_zip(&meta, &[("0", b"a"), ("1", b"b")]))
            .unwrap();

        let all = changes(&col, 0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "a.png");
        assert_eq!(all[0].1, 1);

        // a client already at usn 1 only hears about the second file
        let newer = changes(&col, 1).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].0, "b.png");

        // an up-to-date client hears nothing
        assert!(changes(&col, 2).unwrap().is_empty());
    }

    #[test]
    fn oversized_meta_is_rejected_before_writing() {
        let (_dir, _store, mut col) = open_collection();
        let huge = "x".repeat(MAX_META_SIZE as usize + 1);
        let data = upload_zip(&json!(huge), &[]);
        assert!(matches!(
            adopt_changes_from_zip(&mut col, &data),
            Err(Error::Integrity(_))
        ));
        assert_eq!(last_usn(&col).unwrap(), 0);
    }

    #[test]
    fn download_round_trips_files_with_meta_map() {
        let (_dir, _store, mut col) = open_collection();
        let meta = json!([["a.png", "0"], ["b.png", "1"]]);
        adopt_changes_from_zip(&mut col, &upload_zip(&meta, &[("0", b"aaa"), ("1", b"bbb")]))
            .unwrap();

        let packed =
            package_files_for_download(&col, &["a.png".to_string(), "b.png".to_string()]).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(packed)).unwrap();

        let mut raw = String::new();
        archive
            .by_name("_meta")
            .unwrap()
            .read_to_string(&mut raw)
            .unwrap();
        let names: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(names, json!({"0": "a.png", "1": "b.png"}));

        let mut contents = Vec::new();
        archive
            .by_name("0")
            .unwrap()
            .read_to_end(&mut contents)
            .unwrap();
        assert_eq!(contents, b"aaa");
    }
}
