//! Day-rollover bookkeeping and due-count reporting.
//!
//! The scheduler is a transient view over a collection: constructed per
//! operation, it computes the current day from the creation stamp, rolls
//! stale per-day counters, restores buried cards on day change, and reports
//! walking counts that respect parent-deck limits.

use std::collections::HashMap;

use crate::collection::Collection;
use crate::error::Result;
use crate::models::Deck;
use crate::text::int_time;

/// Counts above this are clipped in reports.
pub const REPORT_LIMIT: i64 = 1_000;

#[derive(Clone, Copy)]
enum CountKind {
    New,
    Rev,
}

/// One row of the per-deck due report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeckDueEntry {
    pub name: String,
    pub did: i64,
    pub rev: i64,
    pub lrn: i64,
    pub new: i64,
}

pub struct Scheduler<'a> {
    col: &'a mut Collection,
    pub today: i64,
    pub day_cutoff: i64,
}

impl<'a> Scheduler<'a> {
    pub fn new(col: &'a mut Collection) -> Result<Self> {
        let mut sched = Self {
            col,
            today: 0,
            day_cutoff: 0,
        };
        sched.update_cutoff()?;
        Ok(sched)
    }

    /// Recompute the current day, roll stale per-day counters, and restore
    /// buried cards if the day has changed.
    ///
    /// The counter reset is in-memory only; the decks are left unflushed so
    /// a read-only report does not contend with a concurrent writer. The
    /// reset is persisted with whatever next saves the registry.
    fn update_cutoff(&mut self) -> Result<()> {
        self.today = self.col.today();
        self.day_cutoff = self.col.crt + (self.today + 1) * 86_400;
        self.col.decks.roll_daily_counters(self.today);
        if self.col.conf.last_unburied < self.today {
            self.unbury_cards()?;
        }
        Ok(())
    }

    /// Return user-buried cards to their regular queues.
    pub fn unbury_cards(&mut self) -> Result<()> {
        self.col.conf.last_unburied = self.today;
        self.col
            .conn()
            .execute("update cards set queue = type where queue = -2", [])?;
        self.col.mark_dirty();
        Ok(())
    }

    /// Re-run the cutoff computation if the stored cutoff has passed.
    pub fn check_day(&mut self) -> Result<()> {
        if int_time() > self.day_cutoff {
            self.update_cutoff()?;
        }
        Ok(())
    }

    /// (new, lrn, rev) across the active decks, each respecting per-day
    /// limits walked up the deck tree.
    pub fn counts(&mut self) -> Result<(i64, i64, i64)> {
        self.check_day()?;
        let new = self.walking_count(CountKind::New)?;
        let lrn = self.learn_count()?;
        let rev = self.walking_count(CountKind::Rev)?;
        Ok((new, lrn, rev))
    }

    fn deck_limit(&self, deck: &Deck, kind: CountKind) -> i64 {
        if deck.is_dynamic() {
            return REPORT_LIMIT;
        }
        let Some(conf) = self.col.decks.conf_for(deck.id) else {
            return REPORT_LIMIT;
        };
        match kind {
            CountKind::New => (conf.new.per_day - deck.new_today.1).max(0),
            CountKind::Rev => (conf.rev.per_day - deck.rev_today.1).max(0),
        }
    }

    fn count_for_deck(&self, did: i64, limit: i64, kind: CountKind) -> Result<i64> {
        let limit = limit.min(REPORT_LIMIT);
        if limit == 0 {
            return Ok(0);
        }
        let count = match kind {
            CountKind::New => self.col.conn().query_row(
                "select count(*) from \
                 (select 1 from cards where did = ? and queue = 0 limit ?)",
                rusqlite::params![did, limit],
                |row| row.get(0),
            )?,
            CountKind::Rev => self.col.conn().query_row(
                "select count(*) from \
                 (select 1 from cards where did = ? and queue = 2 and due <= ? limit ?)",
                rusqlite::params![did, self.today, limit],
                |row| row.get(0),
            )?,
        };
        Ok(count)
    }

    /// Walk the active decks, capping each deck's count by the tightest
    /// per-day limit among its ancestors and spending the counted cards
    /// against those ancestor limits.
    fn walking_count(&self, kind: CountKind) -> Result<i64> {
        let mut total = 0;
        let mut parent_budget: HashMap<i64, i64> = HashMap::new();
        for did in self.col.conf.active_decks.clone() {
            let Some(deck) = self.col.decks.get(did) else {
                continue;
            };
            let mut limit = self.deck_limit(deck, kind);
            if limit == 0 {
                continue;
            }
            let parents = self.col.decks.parent_ids(did);
            for &pid in &parents {
                let budget = match parent_budget.get(&pid) {
                    Some(b) => *b,
                    None => {
                        let b = self
                            .col
                            .decks
                            .get(pid)
                            .map_or(REPORT_LIMIT, |p| self.deck_limit(p, kind));
                        parent_budget.insert(pid, b);
                        b
                    }
                };
                limit = limit.min(budget);
            }
            let count = self.count_for_deck(did, limit, kind)?;
            for pid in parents {
                if let Some(budget) = parent_budget.get_mut(&pid) {
                    *budget -= count;
                }
            }
            parent_budget.insert(did, limit - count);
            total += count;
        }
        Ok(total)
    }

    /// Learning cards carry their remaining step count in `left`; sub-day
    /// steps count per step, day-learning cards count once.
    fn learn_count(&self) -> Result<i64> {
        let active = crate::text::ids_to_sql(&self.col.conf.active_decks);
        let sub_day: i64 = self
            .col
            .conn()
            .query_row(
                &format!(
                    "select sum(left/1000) from (select left from cards where \
                     did in {active} and queue = 1 and due < ? limit {REPORT_LIMIT})"
                ),
                [self.day_cutoff],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .unwrap_or(0);
        let day: i64 = self.col.conn().query_row(
            &format!(
                "select count(*) from (select 1 from cards where \
                 did in {active} and queue = 3 and due <= ? limit {REPORT_LIMIT})"
            ),
            [self.today],
            |row| row.get(0),
        )?;
        Ok(sub_day + day)
    }

    fn learn_count_for_deck(&self, did: i64) -> Result<i64> {
        let collapse = int_time() + self.col.conf.collapse_time;
        let sub_day: i64 = self
            .col
            .conn()
            .query_row(
                &format!(
                    "select sum(left/1000) from (select left from cards where \
                     did = ? and queue = 1 and due < ? limit {REPORT_LIMIT})"
                ),
                rusqlite::params![did, collapse],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .unwrap_or(0);
        let day: i64 = self.col.conn().query_row(
            &format!(
                "select count(*) from (select 1 from cards where \
                 did = ? and queue = 3 and due <= ? limit {REPORT_LIMIT})"
            ),
            rusqlite::params![did, self.today],
            |row| row.get(0),
        )?;
        Ok(sub_day + day)
    }

    /// Per-deck due report, name-sorted, each deck capped by its immediate
    /// parent's limit. Repairs the deck tree first so every row has a
    /// resolvable parent.
    pub fn deck_due_list(&mut self) -> Result<Vec<DeckDueEntry>> {
        self.check_day()?;
        self.col.check_integrity()?;

        let decks: Vec<Deck> = self
            .col
            .decks
            .all_sorted_by_name()
            .into_iter()
            .cloned()
            .collect();
        let mut limits: HashMap<String, (i64, i64)> = HashMap::new();
        let mut report = Vec::new();

        for deck in decks {
            let parent = deck.parent_name();
            let mut new_limit = self.deck_limit(&deck, CountKind::New);
            let mut rev_limit = self.deck_limit(&deck, CountKind::Rev);
            if let Some(parent_limits) = parent.as_deref().and_then(|p| limits.get(p)) {
                new_limit = new_limit.min(parent_limits.0);
                rev_limit = rev_limit.min(parent_limits.1);
            }
            let new = self.count_for_deck(deck.id, new_limit, CountKind::New)?;
            let lrn = self.learn_count_for_deck(deck.id)?;
            let rev = self.count_for_deck(deck.id, rev_limit, CountKind::Rev)?;
            report.push(DeckDueEntry {
                name: deck.name.clone(),
                did: deck.id,
                rev,
                lrn,
                new,
            });
            limits.insert(deck.name, (new_limit, rev_limit));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::test_support::open_collection;
    use pretty_assertions::assert_eq;

    fn add_basic_note(col: &mut Collection, deck: &str, front: &str) {
        col.create_note(
            "Basic",
            deck,
            &[("Front".to_string(), front.to_string())],
            &[],
        )
        .unwrap()
        .unwrap();
    }

    #[test]
    fn counts_new_cards_in_active_decks() {
        let (_dir, _store, mut col) = open_collection();
        add_basic_note(&mut col, "Default", "a");
        add_basic_note(&mut col, "Default", "b");

        let mut sched = Scheduler::new(&mut col).unwrap();
        let (new, lrn, rev) = sched.counts().unwrap();
        assert_eq!((new, lrn, rev), (2, 0, 0));
    }

    #[test]
    fn per_day_limit_caps_new_count() {
        let (_dir, _store, mut col) = open_collection();
        for i in 0..5 {
            add_basic_note(&mut col, "Default", &format!("n{i}"));
        }
        // pretend 19 of today's 20 new cards were already studied
        let today = col.today();
        if let Some(deck) = col.decks.get(1).cloned() {
            let mut deck = deck;
            deck.new_today = (today, 19);
            col.decks.update(deck);
        }

        let mut sched = Scheduler::new(&mut col).unwrap();
        let (new, _, _) = sched.counts().unwrap();
        assert_eq!(new, 1);
    }

    #[test]
    fn day_rollover_unburies_and_resets_counters() {
        let (_dir, _store, mut col) = open_collection();
        add_basic_note(&mut col, "Default", "a");
        col.conn()
            .execute("update cards set queue = -2", [])
            .unwrap();
        // stale counter from a previous day
        if let Some(deck) = col.decks.get(1).cloned() {
            let mut deck = deck;
            deck.new_today = (-1, 7);
            col.decks.update(deck);
        }
        col.save(None).unwrap();
        col.conf.last_unburied = -1;

        let _sched = Scheduler::new(&mut col).unwrap();

        let queue: i64 = col
            .conn()
            .query_row("select queue from cards", [], |row| row.get(0))
            .unwrap();
        assert_eq!(queue, 0);
        let today = col.today();
        assert_eq!(col.decks.get(1).unwrap().new_today, (today, 0));
        assert_eq!(col.conf.last_unburied, today);
    }

    #[test]
    fn deck_due_list_is_name_sorted_and_parent_capped() {
        let (_dir, _store, mut col) = open_collection();
        add_basic_note(&mut col, "Zoo::Birds", "a");
        add_basic_note(&mut col, "Zoo::Birds", "b");
        add_basic_note(&mut col, "Alpha", "c");

        let mut sched = Scheduler::new(&mut col).unwrap();
        let report = sched.deck_due_list().unwrap();
        let names: Vec<&str> = report.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "Default", "Zoo", "Zoo::Birds"]);
        let birds = report.iter().find(|e| e.name == "Zoo::Birds").unwrap();
        assert_eq!(birds.new, 2);
    }
}
