//! In-memory deck registry.
//!
//! Decks and deck configs are stored as JSON maps in the `col` row, keyed by
//! stringified id. The registry parses them on load, tracks whether a flush
//! is needed, and serializes back on save. Cross-cutting operations that
//! touch card rows (orphan repair, deck removal graves) live on
//! `Collection`, which owns the connection.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{Deck, DeckConfig, PER_DAY_CAP};
use crate::text::int_time;

pub struct DeckRegistry {
    decks: HashMap<i64, Deck>,
    dconf: HashMap<i64, DeckConfig>,
    changed: bool,
}

impl DeckRegistry {
    /// Parse the two registry documents. Per-day limits beyond the cap are
    /// clamped and the clamped config restamped, which marks the registry
    /// changed so the repair is written back.
    pub fn load(decks_json: &str, dconf_json: &str, usn: i64) -> Result<Self> {
        let raw_decks: Map<String, Value> = serde_json::from_str(decks_json)?;
        let raw_dconf: Map<String, Value> = serde_json::from_str(dconf_json)?;

        let mut decks = HashMap::new();
        for doc in raw_decks.into_iter().map(|(_, v)| v) {
            let deck: Deck = serde_json::from_value(doc)?;
            decks.insert(deck.id, deck);
        }

        let mut changed = false;
        let mut dconf = HashMap::new();
        for doc in raw_dconf.into_iter().map(|(_, v)| v) {
            let mut conf: DeckConfig = serde_json::from_value(doc)?;
            if conf.new.per_day > PER_DAY_CAP || conf.rev.per_day > PER_DAY_CAP {
                conf.new.per_day = conf.new.per_day.min(PER_DAY_CAP);
                conf.rev.per_day = conf.rev.per_day.min(PER_DAY_CAP);
                conf.modified = int_time();
                conf.usn = usn;
                changed = true;
            }
            dconf.insert(conf.id, conf);
        }

        Ok(Self {
            decks,
            dconf,
            changed,
        })
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn mark_changed(&mut self) {
        self.changed = true;
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    /// Serialize back to the two stored documents.
    pub fn to_json(&self) -> Result<(String, String)> {
        let decks: Map<String, Value> = self
            .decks
            .values()
            .map(|d| Ok((d.id.to_string(), serde_json::to_value(d)?)))
            .collect::<Result<_>>()?;
        let dconf: Map<String, Value> = self
            .dconf
            .values()
            .map(|c| Ok((c.id.to_string(), serde_json::to_value(c)?)))
            .collect::<Result<_>>()?;
        Ok((
            serde_json::to_string(&decks)?,
            serde_json::to_string(&dconf)?,
        ))
    }

    pub fn get(&self, did: i64) -> Option<&Deck> {
        self.decks.get(&did)
    }

    /// Deck by id, falling back to the default deck.
    pub fn get_or_default(&self, did: i64) -> Option<&Deck> {
        self.decks.get(&did).or_else(|| self.decks.get(&1))
    }

    pub fn all(&self) -> Vec<&Deck> {
        self.decks.values().collect()
    }

    pub fn all_sorted_by_name(&self) -> Vec<&Deck> {
        let mut decks = self.all();
        decks.sort_by(|a, b| a.name.cmp(&b.name));
        decks
    }

    pub fn all_conf(&self) -> Vec<&DeckConfig> {
        self.dconf.values().collect()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.decks.keys().copied().collect()
    }

    /// Add or replace a deck. Used for syncing and merging; does not bump
    /// the deck's own mod time.
    pub fn update(&mut self, deck: Deck) {
        self.decks.insert(deck.id, deck);
        self.changed = true;
    }

    pub fn update_conf(&mut self, conf: DeckConfig) {
        self.dconf.insert(conf.id, conf);
        self.changed = true;
    }

    /// Reset per-day counters left over from a previous day. In-memory
    /// only: the registry is not marked changed, so the reset rides along
    /// with the next deck save instead of forcing one.
    pub fn roll_daily_counters(&mut self, today: i64) {
        for deck in self.decks.values_mut() {
            for counter in [
                &mut deck.new_today,
                &mut deck.rev_today,
                &mut deck.lrn_today,
                &mut deck.time_today,
            ] {
                if counter.0 != today {
                    *counter = (today, 0);
                }
            }
        }
    }

    pub fn remove_entry(&mut self, did: i64) -> Option<Deck> {
        let deck = self.decks.remove(&did);
        if deck.is_some() {
            self.changed = true;
        }
        deck
    }

    /// Config governing a deck's limits, `None` for filtered decks, which
    /// embed their own settings and are capped elsewhere.
    pub fn conf_for(&self, did: i64) -> Option<&DeckConfig> {
        let deck = self.get_or_default(did)?;
        let conf_id = deck.conf?;
        self.dconf.get(&conf_id)
    }

    pub fn conf_by_id(&self, id: i64) -> Option<&DeckConfig> {
        self.dconf.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&Deck> {
        self.decks.values().find(|d| d.name == name)
    }

    pub fn name(&self, did: i64) -> Option<&str> {
        self.get(did).map(|d| d.name.as_str())
    }

    /// All children of a deck, as (name, id) pairs.
    pub fn children(&self, did: i64) -> Vec<(String, i64)> {
        let Some(prefix) = self.get(did).map(|d| format!("{}::", d.name)) else {
            return Vec::new();
        };
        self.decks
            .values()
            .filter(|d| d.name.starts_with(&prefix))
            .map(|d| (d.name.clone(), d.id))
            .collect()
    }

    /// Ids of all ancestors of a deck, nearest last.
    pub fn parent_ids(&self, did: i64) -> Vec<i64> {
        let Some(deck) = self.get(did) else {
            return Vec::new();
        };
        let by_name: HashMap<&str, i64> = self
            .decks
            .values()
            .map(|d| (d.name.as_str(), d.id))
            .collect();
        let parts: Vec<&str> = deck.name.split("::").collect();
        let mut parents = Vec::new();
        let mut path = String::new();
        for part in &parts[..parts.len().saturating_sub(1)] {
            if !path.is_empty() {
                path.push_str("::");
            }
            path.push_str(part);
            if let Some(&id) = by_name.get(path.as_str()) {
                parents.push(id);
            }
        }
        parents
    }

    /// Find a deck by name, creating it (and any missing parents) from the
    /// given template if absent. Matching is case-insensitive; the created
    /// name adopts the case of existing parents.
    pub fn get_or_add(&mut self, name: &str, template: &Deck, now_ms: i64, usn: i64) -> i64 {
        let name = name.replace('"', "");
        if let Some(deck) = self
            .decks
            .values()
            .find(|d| d.name.to_lowercase() == name.to_lowercase())
        {
            return deck.id;
        }
        let name = self.ensure_parents(&name, template, now_ms, usn);
        let mut deck = template.clone();
        let mut did = now_ms;
        while self.decks.contains_key(&did) {
            did += 1;
        }
        deck.id = did;
        deck.name = name;
        deck.modified = int_time();
        deck.usn = usn;
        self.decks.insert(did, deck);
        self.changed = true;
        did
    }

    /// Create any missing ancestors and return the name with case matching
    /// the existing parents.
    fn ensure_parents(&mut self, name: &str, template: &Deck, now_ms: i64, usn: i64) -> String {
        let parts: Vec<&str> = name.split("::").collect();
        if parts.len() < 2 {
            return name.to_string();
        }
        let mut path = String::new();
        for part in &parts[..parts.len() - 1] {
            if path.is_empty() {
                path = (*part).to_string();
            } else {
                path = format!("{path}::{part}");
            }
            let did = self.get_or_add(&path, template, now_ms, usn);
            if let Some(existing) = self.name(did) {
                path = existing.to_string();
            }
        }
        format!("{}::{}", path, parts[parts.len() - 1])
    }

    /// Repair the deck tree in place: rename duplicates, replace names with
    /// blank segments, and synthesize missing parents.
    pub fn check_tree(&mut self, template: &Deck, now_ms: i64, usn: i64) {
        let mut ids: Vec<i64> = self.decks.keys().copied().collect();
        ids.sort_by(|a, b| {
            let an = self.name(*a).unwrap_or_default();
            let bn = self.name(*b).unwrap_or_default();
            an.cmp(bn)
        });

        let mut names: std::collections::HashSet<String> = std::collections::HashSet::new();
        for did in ids {
            let Some(deck) = self.decks.get(&did) else {
                continue;
            };
            let mut name = deck.name.clone();
            let mut fixed = false;

            if names.contains(&name) {
                tracing::warn!(deck = %name, "renaming duplicate deck");
                name.push_str(&now_ms.to_string());
                fixed = true;
            }
            if name.split("::").any(str::is_empty) {
                tracing::warn!(deck = %name, "renaming deck with blank segment");
                name = format!("recovered{now_ms}");
                fixed = true;
            }
            if fixed {
                if let Some(deck) = self.decks.get_mut(&did) {
                    deck.name = name.clone();
                    deck.modified = int_time();
                    deck.usn = usn;
                }
                self.changed = true;
            }

            if let Some((parent, _)) = name.rsplit_once("::") {
                if !names.contains(parent) && self.by_name(parent).is_none() {
                    tracing::warn!(deck = %name, parent, "synthesizing missing parent deck");
                    let parent = parent.to_string();
                    self.get_or_add(&parent, template, now_ms, usn);
                    names.insert(parent);
                }
            }
            names.insert(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults;
    use pretty_assertions::assert_eq;

    fn registry() -> DeckRegistry {
        let decks = serde_json::json!({"1": serde_json::to_value(defaults::default_deck()).unwrap()});
        let dconf =
            serde_json::json!({"1": serde_json::to_value(defaults::default_deck_config()).unwrap()});
        DeckRegistry::load(&decks.to_string(), &dconf.to_string(), 0).unwrap()
    }

    #[test]
    fn per_day_limits_are_clamped_on_load() {
        let mut dconf_doc = serde_json::to_value(defaults::default_deck_config()).unwrap();
        dconf_doc["new"]["perDay"] = serde_json::json!(5_000_000);
        let dconf = serde_json::json!({"1": dconf_doc});
        let decks =
            serde_json::json!({"1": serde_json::to_value(defaults::default_deck()).unwrap()});
        let reg = DeckRegistry::load(&decks.to_string(), &dconf.to_string(), 3).unwrap();
        assert!(reg.changed());
        let conf = reg.conf_for(1).unwrap();
        assert_eq!(conf.new.per_day, PER_DAY_CAP);
        assert_eq!(conf.usn, 3);
    }

    #[test]
    fn get_or_add_creates_missing_parents() {
        let mut reg = registry();
        let template = defaults::default_deck();
        let did = reg.get_or_add("Languages::French::Verbs", &template, 1_000, 0);
        assert!(reg.by_name("Languages").is_some());
        assert!(reg.by_name("Languages::French").is_some());
        assert_eq!(reg.name(did), Some("Languages::French::Verbs"));
        // second lookup reuses the deck, case-insensitively
        assert_eq!(
            reg.get_or_add("languages::french::verbs", &template, 2_000, 0),
            did
        );
    }

    #[test]
    fn parent_ids_walk_the_name_path() {
        let mut reg = registry();
        let template = defaults::default_deck();
        let leaf = reg.get_or_add("A::B::C", &template, 1_000, 0);
        let parents = reg.parent_ids(leaf);
        assert_eq!(parents.len(), 2);
        assert_eq!(reg.name(parents[0]), Some("A"));
        assert_eq!(reg.name(parents[1]), Some("A::B"));
    }

    #[test]
    fn check_tree_repairs_blank_segments_and_parents() {
        let mut reg = registry();
        let template = defaults::default_deck();
        let mut broken = template.clone();
        broken.id = 50;
        broken.name = "Or::phan::Leaf".into();
        reg.update(broken);
        let mut blank = template.clone();
        blank.id = 51;
        blank.name = "Bad::::Name".into();
        reg.update(blank);

        reg.check_tree(&template, 9_999, 0);

        assert!(reg.by_name("Or").is_some());
        assert!(reg.by_name("Or::phan").is_some());
        assert_eq!(reg.name(51), Some("recovered9999"));
    }
}
