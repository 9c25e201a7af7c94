//! The incremental sync protocol.
//!
//! A sync round pins a usn window when it starts: `min_usn` is the client's
//! last-seen server usn, `max_usn` the server usn the round will publish.
//! Every step then exchanges exactly the objects stamped inside that window,
//! and `finish` moves the server usn past it. Conflicts resolve per object
//! by strictly-greater modification time; ties keep the local copy.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::collection::Collection;
use crate::db::dialect::table;
use crate::error::{Error, Result};
use crate::models::{
    CardRow, CollectionConfig, Deck, DeckConfig, GraveKind, NoteRow, NoteType, RevlogRow,
};
use crate::sched::Scheduler;
use crate::text::{ids_to_sql, int_time, int_time_ms};

/// Round state persisted between protocol steps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncSession {
    pub min_usn: i64,
    pub max_usn: i64,
    /// True when the server's registries win conflicts this round.
    pub local_newer: bool,
}

/// Tombstones exchanged at the start of a round.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Graves {
    pub cards: Vec<i64>,
    pub notes: Vec<i64>,
    pub decks: Vec<i64>,
}

/// The small-object bundle: registries, tags, and optionally the config and
/// creation stamp when the sending side is authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Changes {
    pub models: Vec<NoteType>,
    pub decks: (Vec<Deck>, Vec<DeckConfig>),
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<CollectionConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crt: Option<i64>,
}

/// Bulk table rows in positional wire encoding.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub done: bool,
    #[serde(default)]
    pub revlog: Vec<Vec<Value>>,
    #[serde(default)]
    pub cards: Vec<Vec<Value>>,
    #[serde(default)]
    pub notes: Vec<Vec<Value>>,
}

/// Response to the `meta` handshake.
#[derive(Debug, Serialize, Deserialize)]
pub struct SyncMeta {
    pub cont: bool,
    #[serde(rename = "hostNum")]
    pub host_num: i64,
    #[serde(rename = "mod")]
    pub modified: i64,
    pub msg: String,
    pub musn: i64,
    pub scm: i64,
    pub ts: i64,
    pub uname: String,
    pub usn: i64,
}

pub fn meta(col: &Collection, username: &str) -> Result<SyncMeta> {
    Ok(SyncMeta {
        cont: true,
        host_num: 1,
        modified: col.modified,
        msg: String::new(),
        musn: crate::media::last_usn(col)?,
        scm: col.scm,
        ts: int_time(),
        uname: username.to_string(),
        usn: col.usn,
    })
}

pub struct SyncHandler<'a> {
    col: &'a mut Collection,
    session: SyncSession,
}

impl<'a> SyncHandler<'a> {
    /// Resume a round from persisted session state.
    pub fn resume(col: &'a mut Collection, session: SyncSession) -> Self {
        Self { col, session }
    }

    /// Open a round: pin the usn window, decide which side's registries win
    /// conflicts, and return the server-side tombstones. Clients sending a
    /// scheduler day offset run the newer scheduler, which this server does
    /// not speak.
    pub fn start(
        col: &'a mut Collection,
        min_usn: i64,
        client_newer: bool,
        offset: Option<i64>,
    ) -> Result<(Self, Graves)> {
        if offset.is_some() {
            return Err(Error::UnsupportedScheduler);
        }
        let session = SyncSession {
            min_usn,
            max_usn: col.usn,
            local_newer: !client_newer,
        };
        let mut handler = Self { col, session };
        let graves = handler.removed()?;
        Ok((handler, graves))
    }

    pub fn session(&self) -> SyncSession {
        self.session
    }

    /// Server-side deletions the client has not seen yet.
    fn removed(&mut self) -> Result<Graves> {
        let mut graves = Graves::default();
        let mut stmt = self
            .col
            .conn()
            .prepare("select oid, type from graves where usn >= ?")?;
        let mut rows = stmt.query([self.session.min_usn])?;
        while let Some(row) = rows.next()? {
            let (oid, kind): (i64, i64) = (row.get(0)?, row.get(1)?);
            match kind {
                k if k == GraveKind::Card.as_i64() => graves.cards.push(oid),
                k if k == GraveKind::Note.as_i64() => graves.notes.push(oid),
                _ => graves.decks.push(oid),
            }
        }
        Ok(graves)
    }

    /// Apply the client's tombstones. Notes go first so removing their
    /// cards does not log duplicate note graves; deck removal keeps
    /// children, which the client graves separately.
    pub fn apply_graves(&mut self, graves: &Graves) -> Result<()> {
        self.col.transact(|col| {
            col.rem_notes(&graves.notes)?;
            col.rem_cards(&graves.cards, false)?;
            for &did in &graves.decks {
                col.remove_deck(did, false, false)?;
            }
            Ok(())
        })
    }

    /// Exchange the small-object bundles. The local bundle is snapshotted
    /// before the merge so objects the merge overwrites are still reported
    /// to the client as they were.
    pub fn apply_changes(&mut self, remote: Changes) -> Result<Changes> {
        let local = self.changes()?;
        self.merge_changes(remote)?;
        Ok(local)
    }

    fn changes(&mut self) -> Result<Changes> {
        let min = self.session.min_usn;
        let models = self
            .col
            .notetypes
            .all()
            .into_iter()
            .filter(|m| m.usn >= min)
            .cloned()
            .collect();
        let decks = self
            .col
            .decks
            .all()
            .into_iter()
            .filter(|d| d.usn >= min)
            .cloned()
            .collect();
        let dconf = self
            .col
            .decks
            .all_conf()
            .into_iter()
            .filter(|c| c.usn >= min)
            .cloned()
            .collect();
        let tags = self
            .col
            .tags_with_usns()
            .into_iter()
            .filter(|&(_, usn)| usn >= min)
            .map(|(t, _)| t.to_string())
            .collect();
        let (conf, crt) = if self.session.local_newer {
            (Some(self.col.conf.clone()), Some(self.col.crt))
        } else {
            (None, None)
        };
        Ok(Changes {
            models,
            decks: (decks, dconf),
            tags,
            conf,
            crt,
        })
    }

    fn merge_changes(&mut self, remote: Changes) -> Result<()> {
        for model in remote.models {
            let newer = self
                .col
                .notetypes
                .get(model.id)
                .is_none_or(|local| model.modified > local.modified);
            if newer {
                self.col.notetypes.update(model);
            }
        }
        let (decks, dconf) = remote.decks;
        for deck in decks {
            let newer = self
                .col
                .decks
                .get(deck.id)
                .is_none_or(|local| deck.modified > local.modified);
            if newer {
                self.col.decks.update(deck);
            }
        }
        for conf in dconf {
            let newer = self
                .col
                .decks
                .conf_by_id(conf.id)
                .is_none_or(|local| conf.modified > local.modified);
            if newer {
                self.col.decks.update_conf(conf);
            }
        }
        self.col
            .register_tags(&remote.tags, Some(self.session.max_usn));
        if let Some(conf) = remote.conf {
            if conf != self.col.conf {
                self.col.conf = conf;
                self.col.mark_dirty();
            }
        }
        if let Some(crt) = remote.crt {
            if crt != self.col.crt {
                self.col.crt = crt;
                self.col.mark_dirty();
            }
        }
        Ok(())
    }

    /// Everything on the server the client has not seen, stamped with this
    /// round's usn. The source rows are marked sent in the same step.
    pub fn chunk(&mut self) -> Result<Chunk> {
        let min = self.session.min_usn;
        let max = self.session.max_usn;
        self.col.transact(|col| {
            let mut chunk = Chunk {
                done: true,
                ..Chunk::default()
            };
            {
                let mut stmt = col.conn().prepare(
                    "select id, cid, usn, ease, ivl, lastIvl, factor, time, type \
                     from revlog where usn >= ?",
                )?;
                let rows = stmt.query_map([min], RevlogRow::from_sql_row)?;
                for row in rows {
                    chunk.revlog.push(row?.to_wire(max));
                }
            }
            {
                let mut stmt = col.conn().prepare(
                    "select id, nid, did, ord, mod, usn, type, queue, due, ivl, factor, \
                     reps, lapses, left, odue, odid, flags, data \
                     from cards where usn >= ?",
                )?;
                let rows = stmt.query_map([min], CardRow::from_sql_row)?;
                for row in rows {
                    chunk.cards.push(row?.to_wire(max));
                }
            }
            {
                let mut stmt = col.conn().prepare(
                    "select id, guid, mid, mod, usn, tags, flds, sfld, csum, flags, data \
                     from notes where usn >= ?",
                )?;
                let rows = stmt.query_map([min], NoteRow::from_sql_row)?;
                for row in rows {
                    chunk.notes.push(row?.to_wire(max));
                }
            }
            for name in ["revlog", "cards", "notes"] {
                col.conn().execute(
                    &format!("update {name} set usn = ? where usn = -1"),
                    [max],
                )?;
            }
            col.mark_dirty();
            Ok(chunk)
        })
    }

    /// Merge the client's bulk rows. Revlog entries are immutable and only
    /// inserted; cards and notes land only where the incoming row is
    /// strictly newer than a local row touched this round.
    pub fn apply_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        let min = self.session.min_usn;
        self.col.transact(|col| {
            if !chunk.revlog.is_empty() {
                let sql = col.dialect().insert_or_ignore(table("revlog"));
                let mut stmt = col.conn().prepare_cached(&sql)?;
                for values in &chunk.revlog {
                    let row = RevlogRow::from_wire(values)?;
                    stmt.execute(rusqlite::params_from_iter(row.to_values()))?;
                }
            }
            if !chunk.cards.is_empty() {
                let rows: Vec<CardRow> = chunk
                    .cards
                    .iter()
                    .map(|v| CardRow::from_wire(v))
                    .collect::<Result<_>>()?;
                let winners =
                    newer_rows(col, "cards", min, rows, |r| r.id, |r| r.modified)?;
                let sql = col.dialect().insert_or_update(table("cards"));
                let mut stmt = col.conn().prepare_cached(&sql)?;
                for row in winners {
                    stmt.execute(rusqlite::params_from_iter(row.to_values()))?;
                }
            }
            if !chunk.notes.is_empty() {
                let rows: Vec<NoteRow> = chunk
                    .notes
                    .iter()
                    .map(|v| NoteRow::from_wire(v))
                    .collect::<Result<_>>()?;
                let winners =
                    newer_rows(col, "notes", min, rows, |r| r.id, |r| r.modified)?;
                let nids: Vec<i64> = winners.iter().map(|r| r.id).collect();
                let sql = col.dialect().insert_or_update(table("notes"));
                {
                    let mut stmt = col.conn().prepare_cached(&sql)?;
                    for row in &winners {
                        stmt.execute(rusqlite::params_from_iter(row.to_values()))?;
                    }
                }
                // incoming rows arrive with blanked caches
                col.update_field_cache(&nids)?;
            }
            col.mark_dirty();
            Ok(())
        })
    }

    /// Compare state digests; both sides must agree before the round can
    /// finish. A mismatch reports both digests so the client can force a
    /// full sync.
    pub fn sanity_check(&mut self, client: &Value) -> Result<Value> {
        let server = self.server_sanity()?;
        if *client == server {
            Ok(json!({ "status": "ok" }))
        } else {
            tracing::warn!(tenant = %self.col.tenant(), "sanity check mismatch");
            Ok(json!({ "status": "bad", "c": client, "s": server }))
        }
    }

    fn server_sanity(&mut self) -> Result<Value> {
        if !self.col.basic_check()? {
            return Ok(json!("failed basic check"));
        }
        for name in ["cards", "notes", "revlog", "graves"] {
            let unsent: i64 = self.col.conn().query_row(
                &format!("select count(*) from {name} where usn = -1"),
                [],
                |row| row.get(0),
            )?;
            if unsent > 0 {
                return Ok(json!(format!("{name} had usn = -1")));
            }
        }
        if self.col.decks.all().iter().any(|d| d.usn == -1) {
            return Ok(json!("deck had usn = -1"));
        }
        if self.col.tags_with_usns().iter().any(|&(_, usn)| usn == -1) {
            return Ok(json!("tag had usn = -1"));
        }
        if self.col.notetypes.all().iter().any(|m| m.usn == -1) {
            return Ok(json!("model had usn = -1"));
        }

        let counts = {
            let mut sched = Scheduler::new(self.col)?;
            let counts = sched.counts()?;
            // repairs missing parent decks before counting them
            sched.deck_due_list()?;
            counts
        };
        let count_of = |name: &str| -> Result<i64> {
            Ok(self.col.conn().query_row(
                &format!("select count(*) from {name}"),
                [],
                |row| row.get(0),
            )?)
        };
        Ok(json!([
            [counts.0, counts.1, counts.2],
            count_of("cards")?,
            count_of("notes")?,
            count_of("revlog")?,
            count_of("graves")?,
            self.col.notetypes.all().len(),
            self.col.decks.all().len(),
            self.col.decks.all_conf().len(),
        ]))
    }

    /// Close the round: move the server usn past the published window and
    /// persist, bumping the mod time even when nothing else changed.
    pub fn finish(&mut self) -> Result<i64> {
        let mod_ms = int_time_ms();
        self.col.ls = mod_ms;
        self.col.usn = self.session.max_usn + 1;
        self.col.mark_dirty();
        self.col.save(Some(mod_ms))?;
        Ok(mod_ms)
    }
}

/// Keep only rows strictly newer than a local row modified inside the sync
/// window; rows unknown locally always win.
fn newer_rows<R>(
    col: &Collection,
    table_name: &str,
    min_usn: i64,
    rows: Vec<R>,
    id_of: impl Fn(&R) -> i64,
    mod_of: impl Fn(&R) -> i64,
) -> Result<Vec<R>> {
    let ids: Vec<i64> = rows.iter().map(&id_of).collect();
    let mut local_mods = std::collections::HashMap::new();
    let mut stmt = col.conn().prepare(&format!(
        "select id, mod from {table_name} where id in {} and usn >= ?",
        ids_to_sql(&ids)
    ))?;
    let mut raw = stmt.query([min_usn])?;
    while let Some(row) = raw.next()? {
        local_mods.insert(row.get::<_, i64>(0)?, row.get::<_, i64>(1)?);
    }
    Ok(rows
        .into_iter()
        .filter(|r| local_mods.get(&id_of(r)).is_none_or(|&m| m < mod_of(r)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::test_support::open_collection;
    use pretty_assertions::assert_eq;

    fn add_note(col: &mut Collection, front: &str) -> i64 {
        col.create_note(
            "Basic",
            "Default",
            &[("Front".to_string(), front.to_string())],
            &[],
        )
        .unwrap()
        .unwrap()
    }

    #[test]
    fn start_on_fresh_tenant_returns_empty_graves() {
        let (_dir, _store, mut col) = open_collection();
        let (handler, graves) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        assert_eq!(graves, Graves::default());
        assert!(handler.session().local_newer);
    }

    #[test]
    fn start_rejects_the_newer_scheduler() {
        let (_dir, _store, mut col) = open_collection();
        assert!(matches!(
            SyncHandler::start(&mut col, 0, false, Some(120)),
            Err(Error::UnsupportedScheduler)
        ));
    }

    #[test]
    fn apply_graves_removes_note_and_logs_tombstone() {
        let (_dir, _store, mut col) = open_collection();
        let nid = add_note(&mut col, "to delete");

        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        handler
            .apply_graves(&Graves {
                cards: vec![],
                notes: vec![nid],
                decks: vec![],
            })
            .unwrap();

        let notes: i64 = col
            .conn()
            .query_row("select count(*) from notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(notes, 0);
        // the tombstone is visible to the next round that starts below it
        let (_, graves) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        assert_eq!(graves.notes, vec![nid]);
    }

    #[test]
    fn apply_changes_snapshots_local_state_before_merging() {
        let (_dir, _store, mut col) = open_collection();
        let mut local_deck = col.decks.get(1).unwrap().clone();
        local_deck.modified = 100;
        local_deck.usn = 0;
        col.decks.update(local_deck.clone());

        let mut remote_deck = local_deck.clone();
        remote_deck.name = "Renamed".into();
        remote_deck.modified = 200;

        let remote = Changes {
            models: vec![],
            decks: (vec![remote_deck], vec![]),
            tags: vec!["shared".to_string()],
            conf: None,
            crt: None,
        };

        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        let local = handler.apply_changes(remote).unwrap();

        // the reply carries the pre-merge deck
        let reported = local.decks.0.iter().find(|d| d.id == 1).unwrap();
        assert_eq!(reported.name, "Default");
        // but the merge applied the newer remote copy
        assert_eq!(col.decks.get(1).unwrap().name, "Renamed");
        // merged tags land at the round's publish usn
        assert_eq!(
            col.tags_with_usns(),
            vec![("shared", 0)]
        );
    }

    #[test]
    fn merge_keeps_local_copy_on_mod_tie() {
        let (_dir, _store, mut col) = open_collection();
        let mut local_deck = col.decks.get(1).unwrap().clone();
        local_deck.modified = 200;
        col.decks.update(local_deck.clone());

        let mut remote_deck = local_deck.clone();
        remote_deck.name = "Loser".into();

        let remote = Changes {
            models: vec![],
            decks: (vec![remote_deck], vec![]),
            tags: vec![],
            conf: None,
            crt: None,
        };
        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        handler.apply_changes(remote).unwrap();
        assert_eq!(col.decks.get(1).unwrap().name, "Default");
    }

    #[test]
    fn chunk_stamps_rows_and_blanks_note_caches() {
        let (_dir, _store, mut col) = open_collection();
        col.usn = 3;
        add_note(&mut col, "hello");
        // a stray unsent row is stamped even though it is not transferred
        col.conn()
            .execute(
                "insert into revlog values (1, 1, -1, 3, 1, 0, 2500, 4000, 1)",
                [],
            )
            .unwrap();

        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        let chunk = handler.chunk().unwrap();

        assert!(chunk.done);
        assert_eq!(chunk.notes.len(), 1);
        assert_eq!(chunk.notes[0][4], json!(3));
        assert_eq!(chunk.notes[0][7], json!(""));
        assert_eq!(chunk.cards.len(), 1);

        let stamped: i64 = col
            .conn()
            .query_row("select usn from revlog where id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stamped, 3);
    }

    #[test]
    fn apply_chunk_prefers_strictly_newer_incoming_rows() {
        let (_dir, _store, mut col) = open_collection();
        let nid = add_note(&mut col, "local");
        let (local_mod, mid): (i64, i64) = col
            .conn()
            .query_row("select mod, mid from notes where id = ?", [nid], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();

        let stale = NoteRow {
            id: nid,
            guid: "g".into(),
            mid,
            modified: local_mod - 10,
            usn: 0,
            tags: String::new(),
            flds: "stale\u{1f}".into(),
            sfld: String::new(),
            csum: 0,
            flags: 0,
            data: String::new(),
        };
        let fresh = NoteRow {
            modified: local_mod + 10,
            flds: "fresh\u{1f}".into(),
            ..stale.clone()
        };

        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        let mut chunk = Chunk {
            done: true,
            notes: vec![stale.to_wire(0)],
            ..Chunk::default()
        };
        handler.apply_chunk(&chunk).unwrap();
        let flds: String = col
            .conn()
            .query_row("select flds from notes where id = ?", [nid], |row| {
                row.get(0)
            })
            .unwrap();
        assert!(flds.starts_with("local"));

        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        chunk.notes = vec![fresh.to_wire(0)];
        handler.apply_chunk(&chunk).unwrap();
        let (flds, sfld): (String, String) = col
            .conn()
            .query_row(
                "select flds, sfld from notes where id = ?",
                [nid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!(flds.starts_with("fresh"));
        // the blanked sort cache was recomputed on merge
        assert_eq!(sfld, "fresh");
    }

    #[test]
    fn sanity_check_agrees_and_disagrees() {
        let (_dir, _store, mut col) = open_collection();
        add_note(&mut col, "q");

        let (mut handler, _) = SyncHandler::start(&mut col, 0, false, None).unwrap();
        handler.chunk().unwrap();

        let client = json!([[1, 0, 0], 1, 1, 0, 0, 1, 1, 1]);
        let verdict = handler.sanity_check(&client).unwrap();
        assert_eq!(verdict["status"], json!("ok"));

        // a client disagreeing on the card count is rejected, with both
        // digests reported
        let wrong = json!([[1, 0, 0], 2, 1, 0, 0, 1, 1, 1]);
        let verdict = handler.sanity_check(&wrong).unwrap();
        assert_eq!(verdict["status"], json!("bad"));
        assert_eq!(verdict["s"][1], json!(1));
    }

    #[test]
    fn finish_publishes_past_the_window() {
        let (_dir, _store, mut col) = open_collection();
        col.usn = 7;
        col.mark_dirty();
        col.save(None).unwrap();

        let (mut handler, _) = SyncHandler::start(&mut col, 5, false, None).unwrap();
        let mod_ms = handler.finish().unwrap();

        assert_eq!(col.usn, 8);
        assert_eq!(col.ls, mod_ms);
        assert_eq!(col.modified, mod_ms);
    }

    #[test]
    fn meta_reports_schema_and_usn() {
        let (_dir, _store, mut col) = open_collection();
        col.usn = 4;
        let meta = meta(&col, "tester").unwrap();
        assert_eq!(meta.usn, 4);
        assert_eq!(meta.uname, "tester");
        assert!(meta.cont);
        assert_eq!(meta.scm, col.scm);
    }
}
