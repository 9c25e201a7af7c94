//! Typed table rows and their positional wire encoding.
//!
//! Chunked sync transfers rows as positional JSON arrays matching the table
//! column order. The structs here convert between that encoding, rusqlite
//! rows, and parameter lists for the dialect's upsert templates.

use rusqlite::types::Value as SqlValue;
use serde_json::Value;

use crate::error::{Error, Result};

/// Object kind recorded in a grave (tombstone) row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraveKind {
    Card = 0,
    Note = 1,
    Deck = 2,
}

impl GraveKind {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }
}

/// One `media` row; a null checksum marks a tombstoned deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEntry {
    pub fname: String,
    pub usn: i64,
    pub csum: Option<String>,
}

fn wire_i64(values: &[Value], idx: usize) -> Result<i64> {
    let v = values
        .get(idx)
        .ok_or_else(|| Error::InvalidPayload(format!("row too short at index {idx}")))?;
    v.as_i64()
        .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        .ok_or_else(|| Error::InvalidPayload(format!("expected integer at index {idx}: {v}")))
}

/// Lenient integer read for cached columns the client may blank out.
fn wire_i64_or_zero(values: &[Value], idx: usize) -> i64 {
    wire_i64(values, idx).unwrap_or(0)
}

fn wire_str(values: &[Value], idx: usize) -> Result<String> {
    let v = values
        .get(idx)
        .ok_or_else(|| Error::InvalidPayload(format!("row too short at index {idx}")))?;
    match v {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        other => Err(Error::InvalidPayload(format!(
            "expected string at index {idx}: {other}"
        ))),
    }
}

/// One `notes` row.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteRow {
    pub id: i64,
    pub guid: String,
    pub mid: i64,
    pub modified: i64,
    pub usn: i64,
    pub tags: String,
    pub flds: String,
    pub sfld: String,
    pub csum: i64,
    pub flags: i64,
    pub data: String,
}

impl NoteRow {
    pub fn from_sql_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            guid: row.get(1)?,
            mid: row.get(2)?,
            modified: row.get(3)?,
            usn: row.get(4)?,
            tags: row.get(5)?,
            flds: row.get(6)?,
            sfld: row.get(7)?,
            csum: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
            flags: row.get(9)?,
            data: row.get(10)?,
        })
    }

    /// Positional encoding, usn replaced by the round's snapshot value.
    /// The sort-field and checksum caches are blanked; the receiver
    /// recomputes them.
    pub fn to_wire(&self, usn: i64) -> Vec<Value> {
        vec![
            self.id.into(),
            self.guid.clone().into(),
            self.mid.into(),
            self.modified.into(),
            usn.into(),
            self.tags.clone().into(),
            self.flds.clone().into(),
            "".into(),
            "".into(),
            self.flags.into(),
            self.data.clone().into(),
        ]
    }

    pub fn from_wire(values: &[Value]) -> Result<Self> {
        Ok(Self {
            id: wire_i64(values, 0)?,
            guid: wire_str(values, 1)?,
            mid: wire_i64(values, 2)?,
            modified: wire_i64(values, 3)?,
            usn: wire_i64(values, 4)?,
            tags: wire_str(values, 5)?,
            flds: wire_str(values, 6)?,
            sfld: wire_str(values, 7).unwrap_or_default(),
            csum: wire_i64_or_zero(values, 8),
            flags: wire_i64(values, 9)?,
            data: wire_str(values, 10)?,
        })
    }

    /// Parameters for the `notes` upsert template, in column order.
    pub fn to_values(&self) -> Vec<SqlValue> {
        vec![
            self.id.into(),
            self.guid.clone().into(),
            self.mid.into(),
            self.modified.into(),
            self.usn.into(),
            self.tags.clone().into(),
            self.flds.clone().into(),
            self.sfld.clone().into(),
            self.csum.into(),
            self.flags.into(),
            self.data.clone().into(),
        ]
    }
}

/// One `cards` row.
#[derive(Debug, Clone, PartialEq)]
pub struct CardRow {
    pub id: i64,
    pub nid: i64,
    pub did: i64,
    pub ord: i64,
    pub modified: i64,
    pub usn: i64,
    pub ctype: i64,
    pub queue: i64,
    pub due: i64,
    pub ivl: i64,
    pub factor: i64,
    pub reps: i64,
    pub lapses: i64,
    pub left: i64,
    pub odue: i64,
    pub odid: i64,
    pub flags: i64,
    pub data: String,
}

impl CardRow {
    pub fn from_sql_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            nid: row.get(1)?,
            did: row.get(2)?,
            ord: row.get(3)?,
            modified: row.get(4)?,
            usn: row.get(5)?,
            ctype: row.get(6)?,
            queue: row.get(7)?,
            due: row.get(8)?,
            ivl: row.get(9)?,
            factor: row.get(10)?,
            reps: row.get(11)?,
            lapses: row.get(12)?,
            left: row.get(13)?,
            odue: row.get(14)?,
            odid: row.get(15)?,
            flags: row.get(16)?,
            data: row.get(17)?,
        })
    }

    pub fn to_wire(&self, usn: i64) -> Vec<Value> {
        vec![
            self.id.into(),
            self.nid.into(),
            self.did.into(),
            self.ord.into(),
            self.modified.into(),
            usn.into(),
            self.ctype.into(),
            self.queue.into(),
            self.due.into(),
            self.ivl.into(),
            self.factor.into(),
            self.reps.into(),
            self.lapses.into(),
            self.left.into(),
            self.odue.into(),
            self.odid.into(),
            self.flags.into(),
            self.data.clone().into(),
        ]
    }

    pub fn from_wire(values: &[Value]) -> Result<Self> {
        Ok(Self {
            id: wire_i64(values, 0)?,
            nid: wire_i64(values, 1)?,
            did: wire_i64(values, 2)?,
            ord: wire_i64(values, 3)?,
            modified: wire_i64(values, 4)?,
            usn: wire_i64(values, 5)?,
            ctype: wire_i64(values, 6)?,
            queue: wire_i64(values, 7)?,
            due: wire_i64(values, 8)?,
            ivl: wire_i64(values, 9)?,
            factor: wire_i64(values, 10)?,
            reps: wire_i64(values, 11)?,
            lapses: wire_i64(values, 12)?,
            left: wire_i64(values, 13)?,
            odue: wire_i64(values, 14)?,
            odid: wire_i64(values, 15)?,
            flags: wire_i64(values, 16)?,
            data: wire_str(values, 17)?,
        })
    }

    pub fn to_values(&self) -> Vec<SqlValue> {
        vec![
            self.id.into(),
            self.nid.into(),
            self.did.into(),
            self.ord.into(),
            self.modified.into(),
            self.usn.into(),
            self.ctype.into(),
            self.queue.into(),
            self.due.into(),
            self.ivl.into(),
            self.factor.into(),
            self.reps.into(),
            self.lapses.into(),
            self.left.into(),
            self.odue.into(),
            self.odid.into(),
            self.flags.into(),
            self.data.clone().into(),
        ]
    }
}

/// One `revlog` row; immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevlogRow {
    pub id: i64,
    pub cid: i64,
    pub usn: i64,
    pub ease: i64,
    pub ivl: i64,
    pub last_ivl: i64,
    pub factor: i64,
    pub time: i64,
    pub rtype: i64,
}

impl RevlogRow {
    pub fn from_sql_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            cid: row.get(1)?,
            usn: row.get(2)?,
            ease: row.get(3)?,
            ivl: row.get(4)?,
            last_ivl: row.get(5)?,
            factor: row.get(6)?,
            time: row.get(7)?,
            rtype: row.get(8)?,
        })
    }

    pub fn to_wire(&self, usn: i64) -> Vec<Value> {
        vec![
            self.id.into(),
            self.cid.into(),
            usn.into(),
            self.ease.into(),
            self.ivl.into(),
            self.last_ivl.into(),
            self.factor.into(),
            self.time.into(),
            self.rtype.into(),
        ]
    }

    pub fn from_wire(values: &[Value]) -> Result<Self> {
        Ok(Self {
            id: wire_i64(values, 0)?,
            cid: wire_i64(values, 1)?,
            usn: wire_i64(values, 2)?,
            ease: wire_i64(values, 3)?,
            ivl: wire_i64(values, 4)?,
            last_ivl: wire_i64(values, 5)?,
            factor: wire_i64(values, 6)?,
            time: wire_i64(values, 7)?,
            rtype: wire_i64(values, 8)?,
        })
    }

    pub fn to_values(&self) -> Vec<SqlValue> {
        vec![
            self.id.into(),
            self.cid.into(),
            self.usn.into(),
            self.ease.into(),
            self.ivl.into(),
            self.last_ivl.into(),
            self.factor.into(),
            self.time.into(),
            self.rtype.into(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn note_wire_blanks_sort_cache_and_stamps_usn() {
        let note = NoteRow {
            id: 1,
            guid: "g".into(),
            mid: 2,
            modified: 3,
            usn: -1,
            tags: " a ".into(),
            flds: "f\u{1f}b".into(),
            sfld: "f".into(),
            csum: 42,
            flags: 0,
            data: String::new(),
        };
        let wire = note.to_wire(9);
        assert_eq!(wire[4], json!(9));
        assert_eq!(wire[7], json!(""));
        assert_eq!(wire[8], json!(""));

        let parsed = NoteRow::from_wire(&wire).unwrap();
        assert_eq!(parsed.usn, 9);
        assert_eq!(parsed.csum, 0);
        assert_eq!(parsed.flds, "f\u{1f}b");
    }

    #[test]
    fn card_wire_round_trips() {
        let card = CardRow {
            id: 5,
            nid: 1,
            did: 1,
            ord: 0,
            modified: 10,
            usn: 7,
            ctype: 0,
            queue: 0,
            due: 1,
            ivl: 0,
            factor: 0,
            reps: 0,
            lapses: 0,
            left: 0,
            odue: 0,
            odid: 0,
            flags: 0,
            data: String::new(),
        };
        assert_eq!(CardRow::from_wire(&card.to_wire(7)).unwrap(), card);
    }

    #[test]
    fn short_rows_are_rejected() {
        assert!(RevlogRow::from_wire(&[json!(1), json!(2)]).is_err());
    }
}
