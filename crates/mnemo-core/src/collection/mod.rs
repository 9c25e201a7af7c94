//! The per-tenant collection aggregate.
//!
//! `Collection` owns the tenant's connection plus the parsed registry state
//! from the `col` row, and is the single write path for notes, cards and
//! graves. Registry flushes are deferred until `save`, which also bumps the
//! collection mod time when anything was written.

mod decks;
mod notetypes;

pub use decks::DeckRegistry;
pub use notetypes::NoteTypeRegistry;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::TimeZone;
use regex::Regex;
use rusqlite::{params, Connection};

use crate::db::{dialect::table, SchemaDialect, TenantStore};
use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{CardRow, CollectionConfig, GraveKind, NoteType, MODEL_STD};
use crate::text::{
    field_checksum, guid64, ids_to_sql, int_time, int_time_ms, join_fields, strip_html_media,
};

pub struct Collection {
    conn: Connection,
    tenant: String,
    media_dir: PathBuf,
    dialect: Arc<dyn SchemaDialect>,
    pub crt: i64,
    pub modified: i64,
    pub scm: i64,
    pub dty: i64,
    pub usn: i64,
    pub ls: i64,
    pub conf: CollectionConfig,
    pub decks: DeckRegistry,
    pub notetypes: NoteTypeRegistry,
    tags: BTreeMap<String, i64>,
    tags_changed: bool,
    dirty: bool,
}

/// `crt` is snapped to 04:00 local time so the day rollover happens at a
/// quiet hour, matching client behaviour.
fn creation_stamp() -> i64 {
    let shifted = chrono::Local::now() - chrono::Duration::hours(4);
    let four_am = shifted
        .date_naive()
        .and_hms_opt(4, 0, 0)
        .expect("valid time of day");
    chrono::Local
        .from_local_datetime(&four_am)
        .earliest()
        .map_or_else(int_time, |dt| dt.timestamp())
}

impl Collection {
    /// Open a tenant's collection, creating and bootstrapping the namespace
    /// on first use.
    pub fn open(store: &TenantStore, tenant: &str) -> Result<Self> {
        let created = !store.namespace_exists(tenant)?;
        if created {
            store.create_namespace(tenant)?;
        }
        let conn = store.open(tenant)?;
        if created {
            Self::bootstrap(&conn)?;
        }

        let mut col = Self::load(
            conn,
            tenant.to_string(),
            store.media_dir(tenant),
            Arc::clone(store.dialect()),
        )?;

        if col.crt == 0 {
            col.crt = creation_stamp();
            col.dirty = true;
        }
        if !col.conf.new_bury {
            col.conf.new_bury = true;
            col.dirty = true;
        }
        col.save(None)?;
        Ok(col)
    }

    fn bootstrap(conn: &Connection) -> Result<()> {
        conn.execute("update col set scm = ?", [int_time_ms()])?;
        let model = defaults::basic_notetype(int_time_ms(), int_time());
        let models = serde_json::json!({ model.id.to_string(): model });
        let decks = serde_json::json!({ "1": defaults::default_deck() });
        let dconf = serde_json::json!({ "1": defaults::default_deck_config() });
        conn.execute(
            "update col set conf = ?, models = ?, decks = ?, dconf = ?",
            params![
                serde_json::to_string(&defaults::collection_config())?,
                models.to_string(),
                decks.to_string(),
                dconf.to_string(),
            ],
        )?;
        Ok(())
    }

    fn load(
        conn: Connection,
        tenant: String,
        media_dir: PathBuf,
        dialect: Arc<dyn SchemaDialect>,
    ) -> Result<Self> {
        let row = conn.query_row(
            "select crt, mod, scm, dty, usn, ls, conf, models, decks, dconf, tags from col",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            },
        )?;
        let (crt, modified, scm, dty, usn, ls, conf, models, decks, dconf, tags) = row;

        let or_empty = |s: String| if s.is_empty() { "{}".to_string() } else { s };
        let conf: CollectionConfig = serde_json::from_str(&or_empty(conf))?;
        let decks = DeckRegistry::load(&or_empty(decks), &or_empty(dconf), usn)?;
        let notetypes = NoteTypeRegistry::load(&or_empty(models))?;
        let tags: BTreeMap<String, i64> = serde_json::from_str(&or_empty(tags))?;

        Ok(Self {
            conn,
            tenant,
            media_dir,
            dialect,
            crt,
            modified,
            scm,
            dty,
            usn,
            ls,
            conf,
            decks,
            notetypes,
            tags,
            tags_changed: false,
            dirty: false,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn media_dir(&self) -> &PathBuf {
        &self.media_dir
    }

    pub fn dialect(&self) -> &Arc<dyn SchemaDialect> {
        &self.dialect
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Run a closure inside one SQL transaction, rolling back on error.
    /// Protocol steps use this so a failed step leaves no partial writes.
    pub fn transact<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("begin")?;
        match f(self) {
            Ok(value) => {
                self.conn.execute_batch("commit")?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("rollback");
                Err(err)
            }
        }
    }

    /// Days since the collection was created.
    pub fn today(&self) -> i64 {
        (int_time() - self.crt).div_euclid(86_400)
    }

    /// Write the `col` scalar columns, bumping the mod time.
    fn flush(&mut self, mod_ms: Option<i64>) -> Result<()> {
        self.modified = mod_ms.unwrap_or_else(int_time_ms);
        self.conn.execute(
            "update col set crt = ?, mod = ?, scm = ?, dty = ?, usn = ?, ls = ?, conf = ?",
            params![
                self.crt,
                self.modified,
                self.scm,
                self.dty,
                self.usn,
                self.ls,
                serde_json::to_string(&self.conf)?,
            ],
        )?;
        Ok(())
    }

    /// Flush any changed registries, then the collection row if anything
    /// was written this round.
    pub fn save(&mut self, mod_ms: Option<i64>) -> Result<()> {
        if self.notetypes.changed() {
            let models = self.notetypes.to_json()?;
            self.conn
                .execute("update col set models = ?", [models])?;
            self.notetypes.clear_changed();
            self.dirty = true;
        }
        if self.decks.changed() {
            let (decks, dconf) = self.decks.to_json()?;
            self.conn
                .execute("update col set decks = ?, dconf = ?", params![decks, dconf])?;
            self.decks.clear_changed();
            self.dirty = true;
        }
        if self.tags_changed {
            let tags = serde_json::to_string(&self.tags)?;
            self.conn.execute("update col set tags = ?", [tags])?;
            self.tags_changed = false;
            self.dirty = true;
        }
        if self.dirty {
            self.flush(mod_ms)?;
            self.dirty = false;
        }
        Ok(())
    }

    // Tag registry

    pub fn register_tags(&mut self, tags: &[String], usn: Option<i64>) {
        for tag in tags {
            if !self.tags.contains_key(tag) {
                self.tags
                    .insert(tag.clone(), usn.unwrap_or(self.usn));
                self.tags_changed = true;
            }
        }
    }

    pub fn all_tags(&self) -> Vec<&str> {
        self.tags.keys().map(String::as_str).collect()
    }

    pub fn tags_with_usns(&self) -> Vec<(&str, i64)> {
        self.tags.iter().map(|(t, &u)| (t.as_str(), u)).collect()
    }

    /// Canonical tag string for a note: quotes stripped, case matched to
    /// the registry, sorted, deduplicated, wrapped in single spaces.
    pub fn tagstring_for_note(&self, note_tags: &[String]) -> String {
        let re_quotes = Regex::new("[\"']").expect("valid regex");
        let mut cleaned: Vec<String> = note_tags
            .iter()
            .map(|t| {
                let stripped = re_quotes.replace_all(t, "").into_owned();
                self.tags
                    .keys()
                    .find(|existing| existing.to_lowercase() == stripped.to_lowercase())
                    .cloned()
                    .unwrap_or(stripped)
            })
            .collect();
        cleaned.sort();
        cleaned.dedup();
        if cleaned.is_empty() {
            String::new()
        } else {
            format!(" {} ", cleaned.join(" "))
        }
    }

    // Graves and bulk removal

    pub fn add_graves(&mut self, ids: &[i64], kind: GraveKind) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare_cached("insert into graves (usn, oid, type) values (?, ?, ?)")?;
        for id in ids {
            stmt.execute(params![self.usn, id, kind.as_i64()])?;
        }
        drop(stmt);
        self.dirty = true;
        Ok(())
    }

    /// Bulk delete notes by id, leaving graves. Graves are logged for notes
    /// independently of cards because the two sides may disagree on
    /// template counts.
    pub fn rem_notes(&mut self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.add_graves(ids, GraveKind::Note)?;
        self.conn.execute(
            &format!("delete from notes where id in {}", ids_to_sql(ids)),
            [],
        )?;
        self.dirty = true;
        Ok(())
    }

    /// Bulk delete cards by id, then any notes left without cards.
    pub fn rem_cards(&mut self, ids: &[i64], notes_too: bool) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let sids = ids_to_sql(ids);
        let nids = self.query_ids(&format!("select nid from cards where id in {sids}"))?;
        self.add_graves(ids, GraveKind::Card)?;
        self.conn
            .execute(&format!("delete from cards where id in {sids}"), [])?;
        self.dirty = true;
        if !notes_too {
            return Ok(());
        }
        let orphaned = self.query_ids(&format!(
            "select id from notes where id in {} and id not in (select nid from cards)",
            ids_to_sql(&nids)
        ))?;
        self.rem_notes(&orphaned)
    }

    fn query_ids(&self, sql: &str) -> Result<Vec<i64>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    // Field cache

    /// Recompute sort-field and checksum caches for the given notes, after
    /// a merge or find-and-replace. Relies on the caller to bump usn/mod.
    pub fn update_field_cache(&mut self, nids: &[i64]) -> Result<()> {
        if nids.is_empty() {
            return Ok(());
        }
        let mut rows = Vec::new();
        {
            let mut stmt = self.conn.prepare(&format!(
                "select id, mid, flds from notes where id in {}",
                ids_to_sql(nids)
            ))?;
            let mut raw = stmt.query([])?;
            while let Some(row) = raw.next()? {
                rows.push((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ));
            }
        }
        let mut updates = Vec::new();
        for (nid, mid, flds) in rows {
            // notes pointing at a missing model keep their stale cache
            let Some(model) = self.notetypes.get(mid) else {
                continue;
            };
            let fields = crate::text::split_fields(&flds);
            let sort_idx = NoteTypeRegistry::sort_idx(model);
            let sfld = strip_html_media(fields.get(sort_idx).map_or("", String::as_str));
            let csum = field_checksum(fields.first().map_or("", String::as_str));
            updates.push((sfld, csum, nid));
        }
        let mut stmt = self
            .conn
            .prepare_cached("update notes set sfld = ?, csum = ? where id = ?")?;
        for (sfld, csum, nid) in updates {
            stmt.execute(params![sfld, csum, nid])?;
        }
        Ok(())
    }

    // Integrity

    /// Fast referential check used before a sync round. True if ok.
    pub fn basic_check(&self) -> Result<bool> {
        let exists = |sql: &str| -> Result<bool> {
            let mut stmt = self.conn.prepare(sql)?;
            Ok(stmt.exists([])?)
        };
        // cards without notes
        if exists("select 1 from cards where nid not in (select id from notes) limit 1")? {
            return Ok(false);
        }
        // notes without cards or models
        if exists(&format!(
            "select 1 from notes where id not in (select distinct nid from cards) \
             or mid not in {} limit 1",
            ids_to_sql(&self.notetypes.ids())
        ))? {
            return Ok(false);
        }
        // cards with ordinals their model no longer declares
        for model in self.notetypes.all() {
            if model.kind != MODEL_STD {
                continue;
            }
            let ords = ids_to_sql(&model.declared_ordinals());
            let mut stmt = self.conn.prepare(&format!(
                "select 1 from cards where ord not in {ords} and nid in \
                 (select id from notes where mid = ?) limit 1"
            ))?;
            if stmt.exists([model.id])? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reassign cards whose deck no longer exists to the default deck.
    /// Deliberately does not mark the collection dirty, matching the
    /// repair-on-read behaviour of sanity checking.
    pub fn recover_orphan_cards(&self) -> Result<usize> {
        let moved = self.conn.execute(
            &format!(
                "update cards set did = 1 where did not in {}",
                ids_to_sql(&self.decks.ids())
            ),
            [],
        )?;
        if moved > 0 {
            tracing::warn!(tenant = %self.tenant, moved, "reassigned orphan cards to default deck");
        }
        Ok(moved)
    }

    pub fn check_integrity(&mut self) -> Result<()> {
        self.recover_orphan_cards()?;
        let template = defaults::default_deck();
        self.decks
            .check_tree(&template, int_time_ms(), self.usn);
        Ok(())
    }

    // Deck operations that touch card rows

    /// Reselect a deck, refreshing the active-deck list with its children.
    pub fn select_deck(&mut self, did: i64) {
        self.conf.current_deck = did;
        let mut children = self.decks.children(did);
        children.sort();
        let mut active = vec![did];
        active.extend(children.into_iter().map(|(_, id)| id));
        self.conf.active_decks = active;
        self.dirty = true;
    }

    /// Return a filtered deck's cards to their home decks.
    pub fn empty_filtered_deck(&mut self, did: i64) -> Result<()> {
        self.conn.execute(
            "update cards set did = odid, \
             queue = (case when type = 1 then 0 else type end), \
             type = (case when type = 1 then 0 else type end), \
             due = odue, odue = 0, odid = 0, usn = ? \
             where did = ? and odid != 0",
            params![self.usn, did],
        )?;
        self.dirty = true;
        Ok(())
    }

    /// Remove a deck, leaving a grave. The default deck is renamed out of
    /// any parent rather than deleted. Children are kept when merging a
    /// remote removal, since the other side logs them separately.
    pub fn remove_deck(&mut self, did: i64, cards_too: bool, children_too: bool) -> Result<()> {
        if did == 1 {
            // rename the default deck to top level if it was nested
            if let Some(deck) = self.decks.get(1) {
                if let Some((_, base)) = deck.name.rsplit_once("::") {
                    let mut name = base.to_string();
                    while self.decks.by_name(&name).is_some() {
                        name.push('1');
                    }
                    let mut renamed = deck.clone();
                    renamed.name = name;
                    renamed.modified = int_time();
                    renamed.usn = self.usn;
                    self.decks.update(renamed);
                }
            }
            return Ok(());
        }
        // log the removal whether or not the deck exists locally
        self.add_graves(&[did], GraveKind::Deck)?;
        let Some(deck) = self.decks.get(did).cloned() else {
            return Ok(());
        };
        if deck.is_dynamic() {
            // removing a filtered deck returns its cards rather than
            // deleting them
            self.empty_filtered_deck(did)?;
            if children_too {
                for (_, child) in self.decks.children(did) {
                    self.remove_deck(child, cards_too, children_too)?;
                }
            }
        } else {
            if children_too {
                for (_, child) in self.decks.children(did) {
                    self.remove_deck(child, cards_too, children_too)?;
                }
            }
            if cards_too {
                let cids = self.query_ids(&format!(
                    "select id from cards where did = {did} or odid = {did}"
                ))?;
                self.rem_cards(&cids, true)?;
            }
        }
        self.decks.remove_entry(did);
        if self.conf.active_decks.contains(&did) {
            let fallback = self.decks.ids().into_iter().min().unwrap_or(1);
            self.select_deck(fallback);
        }
        self.dirty = true;
        Ok(())
    }

    // Note and card creation

    /// First id guaranteed to collide with nothing in notes or cards.
    pub fn max_id(&self) -> Result<i64> {
        let max_of = |sql: &str| -> Result<i64> {
            Ok(self
                .conn
                .query_row(sql, [], |row| row.get::<_, Option<i64>>(0))?
                .unwrap_or(0))
        };
        Ok(int_time_ms()
            .max(max_of("select max(id) from notes")?)
            .max(max_of("select max(id) from cards")?)
            + 1)
    }

    /// A millisecond timestamp id not yet present in the table.
    pub fn timestamp_id(&self, table_name: &str) -> Result<i64> {
        let mut ts = int_time_ms();
        let mut stmt = self
            .conn
            .prepare(&format!("select 1 from {table_name} where id = ?"))?;
        while stmt.exists([ts])? {
            ts += 1;
        }
        Ok(ts)
    }

    /// Stamp and upsert a card, enforcing the state invariants.
    pub fn flush_card(&mut self, card: &mut CardRow) -> Result<()> {
        card.modified = int_time();
        card.usn = self.usn;
        let in_dyn = self
            .decks
            .get(card.did)
            .is_some_and(crate::models::Deck::is_dynamic);
        if card.queue == 2 && card.odue != 0 && !in_dyn {
            return Err(Error::InvalidCard(format!(
                "card {} has odue set outside a filtered deck",
                card.id
            )));
        }
        if card.due >= 4_294_967_296 {
            return Err(Error::InvalidCard(format!(
                "card {} due {} out of range",
                card.id, card.due
            )));
        }
        let sql = self.dialect.insert_or_update(table("cards"));
        self.conn
            .execute(&sql, rusqlite::params_from_iter(card.to_values()))?;
        self.dirty = true;
        Ok(())
    }

    /// Create a note plus its generated cards. Returns the new note id, or
    /// `None` when no template produces a card for the given fields.
    pub fn create_note(
        &mut self,
        model_name: &str,
        deck_name: &str,
        field_values: &[(String, String)],
        tags: &[String],
    ) -> Result<Option<i64>> {
        let model = self
            .notetypes
            .by_name(model_name)
            .ok_or_else(|| Error::NotFound(format!("note type {model_name}")))?
            .clone();
        let template_deck = defaults::default_deck();
        let did = self
            .decks
            .get_or_add(deck_name, &template_deck, int_time_ms(), self.usn);

        let mut fields = vec![String::new(); model.flds.len()];
        for (name, value) in field_values {
            let ord = model
                .field_ord(name)
                .ok_or_else(|| Error::NotFound(format!("field {name} on {model_name}")))?;
            fields[ord] = value.clone();
        }

        let flds = join_fields(&fields);
        let avail = NoteTypeRegistry::avail_ords(&model, &flds);
        let templates = templates_from_ordinals(&model, &avail);
        if templates.is_empty() {
            return Ok(None);
        }

        let tags: Vec<String> = tags.iter().filter(|t| !t.trim().is_empty()).cloned().collect();
        let tag_string = self.tagstring_for_note(&tags);
        let nid = self.timestamp_id("notes")?;
        let sort_idx = NoteTypeRegistry::sort_idx(&model);
        let sql = self.dialect.insert_or_update(table("notes"));
        self.conn.execute(
            &sql,
            params![
                nid,
                guid64(),
                model.id,
                int_time(),
                self.usn,
                tag_string,
                flds,
                strip_html_media(fields.get(sort_idx).map_or("", String::as_str)),
                field_checksum(fields.first().map_or("", String::as_str)),
                0,
                "",
            ],
        )?;
        self.register_tags(&tags, None);
        self.dirty = true;

        let due = self.conf.take_next_pos();
        for (ord, tmpl_did) in templates {
            self.new_card(nid, ord, tmpl_did, did, due)?;
        }
        Ok(Some(nid))
    }

    /// Deck resolution order for a fresh card: existing sibling deck, then
    /// the template override, then the argument, then the model default.
    /// Filtered decks are never a home deck.
    fn new_card(
        &mut self,
        nid: i64,
        ord: i64,
        tmpl_did: Option<i64>,
        arg_did: i64,
        due: i64,
    ) -> Result<()> {
        let sibling_did: Option<i64> = self
            .conn
            .query_row(
                "select did from cards where nid = ? and ord = ?",
                params![nid, ord],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        let mut did = match sibling_did {
            Some(d) if d != 0 => d,
            _ => tmpl_did
                .filter(|&d| d != 0 && self.decks.get(d).is_some())
                .unwrap_or(if arg_did != 0 { arg_did } else { self.default_model_did(nid)? }),
        };
        if let Some(deck) = self.decks.get_or_default(did) {
            did = if deck.is_dynamic() { 1 } else { deck.id };
        }

        let due = self.due_for_deck(did, due);
        let mut card = CardRow {
            id: self.timestamp_id("cards")?,
            nid,
            did,
            ord,
            modified: 0,
            usn: 0,
            ctype: 0,
            queue: 0,
            due,
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
        self.flush_card(&mut card)
    }

    fn default_model_did(&self, nid: i64) -> Result<i64> {
        let mid: i64 = self
            .conn
            .query_row("select mid from notes where id = ?", [nid], |row| {
                row.get(0)
            })?;
        Ok(self.notetypes.get(mid).map_or(1, |m| m.did))
    }

    /// In-order decks take the position counter as-is; random-order decks
    /// derive a position from it so siblings land together.
    fn due_for_deck(&self, did: i64, due: i64) -> i64 {
        let in_order = self.decks.conf_for(did).is_none_or(|c| c.new.order == 1);
        if in_order {
            return due;
        }
        let ceiling = due.max(1_000);
        let mut x = (due as u64) ^ 0x9e37_79b9_7f4a_7c15;
        x ^= x >> 30;
        x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        x ^= x >> 27;
        1 + (x % (ceiling as u64 - 1)) as i64
    }

    /// Regenerate cards for the given notes after a field or model change.
    /// Inserts any newly satisfiable templates and returns the ids of cards
    /// whose template no longer applies, for the caller to remove.
    pub fn gen_cards(&mut self, nids: &[i64]) -> Result<Vec<i64>> {
        if nids.is_empty() {
            return Ok(Vec::new());
        }
        let snids = ids_to_sql(nids);

        // nid -> ord -> card id, plus each note's sibling deck and due
        let mut have: HashMap<i64, HashMap<i64, i64>> = HashMap::new();
        let mut sibling_decks: HashMap<i64, Option<i64>> = HashMap::new();
        let mut dues: HashMap<i64, i64> = HashMap::new();
        {
            let mut stmt = self.conn.prepare(&format!(
                "select id, nid, ord, did, due, odue, odid from cards where nid in {snids}"
            ))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let (cid, nid, ord): (i64, i64, i64) = (row.get(0)?, row.get(1)?, row.get(2)?);
                let (mut did, mut due): (i64, i64) = (row.get(3)?, row.get(4)?);
                let (odue, odid): (i64, i64) = (row.get(5)?, row.get(6)?);
                have.entry(nid).or_default().insert(ord, cid);
                // cards in a filtered deck generate siblings in their home deck
                if odid != 0 {
                    did = odid;
                    due = odue;
                }
                match sibling_decks.entry(nid) {
                    std::collections::hash_map::Entry::Occupied(mut e) => {
                        // split across decks: fall back to the model default
                        if e.get().is_some_and(|d| d != did) {
                            e.insert(None);
                        }
                    }
                    std::collections::hash_map::Entry::Vacant(e) => {
                        e.insert(Some(did));
                    }
                }
                dues.entry(nid).or_insert(due);
            }
        }

        let mut notes = Vec::new();
        {
            let mut stmt = self
                .conn
                .prepare(&format!("select id, mid, flds from notes where id in {snids}"))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                notes.push((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ));
            }
        }

        let mut ts = self.max_id()?;
        let now = int_time();
        let usn = self.usn;
        let mut new_cards: Vec<(i64, i64, i64, i64, i64)> = Vec::new();
        let mut removable = Vec::new();

        for (nid, mid, flds) in notes {
            let Some(model) = self.notetypes.get(mid) else {
                continue;
            };
            let avail = NoteTypeRegistry::avail_ords(model, &flds);
            let fallback_did = sibling_decks
                .get(&nid)
                .copied()
                .flatten()
                .unwrap_or(model.did);
            let sibling_due = dues.get(&nid).copied();

            for (ord, tmpl_did) in templates_from_ordinals(model, &avail) {
                if have.get(&nid).is_some_and(|h| h.contains_key(&ord)) {
                    continue;
                }
                let mut did = tmpl_did
                    .filter(|&d| d != 0 && self.decks.get(d).is_some())
                    .unwrap_or(fallback_did);
                if let Some(deck) = self.decks.get_or_default(did) {
                    did = if deck.is_dynamic() { 1 } else { deck.id };
                }
                let due = match sibling_due {
                    Some(d) => d,
                    None => self.conf.take_next_pos(),
                };
                new_cards.push((ts, nid, did, ord, due));
                ts += 1;
            }
            if let Some(owned) = have.get(&nid) {
                for (&ord, &cid) in owned {
                    if !avail.contains(&ord) {
                        removable.push(cid);
                    }
                }
            }
        }

        if !new_cards.is_empty() {
            let mut stmt = self.conn.prepare_cached(
                "insert into cards \
                 (id, nid, did, ord, mod, usn, type, queue, due, ivl, factor, \
                  reps, lapses, left, odue, odid, flags, data) \
                 values (?, ?, ?, ?, ?, ?, 0, 0, ?, 0, 0, 0, 0, 0, 0, 0, 0, '')",
            )?;
            for (cid, nid, did, ord, due) in &new_cards {
                stmt.execute(params![cid, nid, did, ord, now, usn, due])?;
            }
            drop(stmt);
            self.dirty = true;
        }
        Ok(removable)
    }
}

/// Template ordinals that apply; standard models filter declared templates,
/// cloze models fan the first template out over the deletion ordinals.
fn templates_from_ordinals(model: &NoteType, avail: &[i64]) -> Vec<(i64, Option<i64>)> {
    if model.kind == MODEL_STD {
        model
            .tmpls
            .iter()
            .filter(|t| avail.contains(&t.ord))
            .map(|t| (t.ord, t.did))
            .collect()
    } else {
        let did = model.tmpls.first().and_then(|t| t.did);
        avail.iter().map(|&ord| (ord, did)).collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::SqliteDialect;

    pub fn open_collection() -> (tempfile::TempDir, TenantStore, Collection) {
        let dir = tempfile::tempdir().unwrap();
        let store = TenantStore::new(dir.path(), Arc::new(SqliteDialect));
        let col = Collection::open(&store, "tester").unwrap();
        (dir, store, col)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::open_collection;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bootstrap_creates_defaults() {
        let (_dir, _store, col) = open_collection();
        assert!(col.crt > 0);
        assert!(col.scm > 0);
        assert!(col.conf.new_bury);
        assert_eq!(col.decks.get(1).map(|d| d.name.as_str()), Some("Default"));
        assert!(col.notetypes.by_name("Basic").is_some());
    }

    #[test]
    fn reopen_preserves_state() {
        let (_dir, store, mut col) = open_collection();
        col.usn = 5;
        col.mark_dirty();
        col.save(None).unwrap();
        drop(col);

        let col = Collection::open(&store, "tester").unwrap();
        assert_eq!(col.usn, 5);
    }

    #[test]
    fn create_note_generates_cards_and_tags() {
        let (_dir, _store, mut col) = open_collection();
        let nid = col
            .create_note(
                "Basic",
                "Default",
                &[
                    ("Front".to_string(), "bonjour".to_string()),
                    ("Back".to_string(), "hello".to_string()),
                ],
                &["french".to_string(), "Greetings".to_string()],
            )
            .unwrap()
            .expect("note should generate a card");

        let (tags, sfld, csum): (String, String, i64) = col
            .conn()
            .query_row(
                "select tags, sfld, csum from notes where id = ?",
                [nid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(tags, " Greetings french ");
        assert_eq!(sfld, "bonjour");
        assert_eq!(csum, field_checksum("bonjour"));

        let cards: i64 = col
            .conn()
            .query_row("select count(*) from cards where nid = ?", [nid], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(cards, 1);
        assert!(col.all_tags().contains(&"french"));
    }

    #[test]
    fn create_note_with_empty_required_field_adds_nothing() {
        let (_dir, _store, mut col) = open_collection();
        let result = col
            .create_note(
                "Basic",
                "Default",
                &[("Back".to_string(), "orphan".to_string())],
                &[],
            )
            .unwrap();
        assert_eq!(result, None);
        let notes: i64 = col
            .conn()
            .query_row("select count(*) from notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(notes, 0);
    }

    #[test]
    fn rem_cards_removes_childless_notes() {
        let (_dir, _store, mut col) = open_collection();
        let nid = col
            .create_note(
                "Basic",
                "Default",
                &[("Front".to_string(), "q".to_string())],
                &[],
            )
            .unwrap()
            .unwrap();
        let cid: i64 = col
            .conn()
            .query_row("select id from cards where nid = ?", [nid], |row| {
                row.get(0)
            })
            .unwrap();

        col.rem_cards(&[cid], true).unwrap();

        let notes: i64 = col
            .conn()
            .query_row("select count(*) from notes", [], |row| row.get(0))
            .unwrap();
        assert_eq!(notes, 0);
        let graves: Vec<(i64, i64)> = {
            let mut stmt = col
                .conn()
                .prepare("select oid, type from graves order by type")
                .unwrap();
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(graves, vec![(cid, 0), (nid, 1)]);
    }

    #[test]
    fn gen_cards_flags_unsatisfied_templates() {
        let (_dir, _store, mut col) = open_collection();
        let nid = col
            .create_note(
                "Basic",
                "Default",
                &[("Front".to_string(), "q".to_string())],
                &[],
            )
            .unwrap()
            .unwrap();

        // blank the first field; the only template is no longer satisfied
        col.conn()
            .execute("update notes set flds = ? where id = ?", params![
                "\u{1f}answer", nid
            ])
            .unwrap();
        let removable = col.gen_cards(&[nid]).unwrap();
        assert_eq!(removable.len(), 1);
    }

    #[test]
    fn basic_check_spots_dangling_cards() {
        let (_dir, _store, mut col) = open_collection();
        assert!(col.basic_check().unwrap());
        col.conn()
            .execute(
                "insert into cards values (9, 999, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, '')",
                [],
            )
            .unwrap();
        assert!(!col.basic_check().unwrap());
    }

    #[test]
    fn flush_card_rejects_odue_outside_filtered_deck() {
        let (_dir, _store, mut col) = open_collection();
        let mut card = CardRow {
            id: 1,
            nid: 1,
            did: 1,
            ord: 0,
            modified: 0,
            usn: 0,
            ctype: 2,
            queue: 2,
            due: 10,
            ivl: 1,
            factor: 2500,
            reps: 1,
            lapses: 0,
            left: 0,
            odue: 5,
            odid: 0,
            flags: 0,
            data: String::new(),
        };
        assert!(matches!(
            col.flush_card(&mut card),
            Err(Error::InvalidCard(_))
        ));
    }

    #[test]
    fn remove_deck_returns_filtered_cards_home() {
        let (_dir, _store, mut col) = open_collection();
        let template = defaults::default_deck();
        let home = col
            .decks
            .get_or_add("Home", &template, int_time_ms(), 0);
        let mut filtered = template.clone();
        filtered.id = 77;
        filtered.name = "Cram".into();
        filtered.dynamic = 1;
        filtered.conf = None;
        col.decks.update(filtered);

        col.conn()
            .execute(
                "insert into cards values (5, 1, 77, 0, 0, 0, 2, 2, 12, 1, 2500, 1, 0, 0, 30, ?, 0, '')",
                [home],
            )
            .unwrap();

        col.remove_deck(77, false, false).unwrap();

        let (did, due, odid): (i64, i64, i64) = col
            .conn()
            .query_row("select did, due, odid from cards where id = 5", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(did, home);
        assert_eq!(due, 30);
        assert_eq!(odid, 0);
        assert!(col.decks.get(77).is_none());
    }
}
