//! In-memory note-type registry and card-generation requirement logic.

use std::collections::HashMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::models::{NoteType, ReqKind};
use crate::text::{checksum, int_time, split_fields};

pub struct NoteTypeRegistry {
    models: HashMap<i64, NoteType>,
    changed: bool,
}

impl NoteTypeRegistry {
    pub fn load(models_json: &str) -> Result<Self> {
        let raw: Map<String, Value> = serde_json::from_str(models_json)?;
        let mut models = HashMap::new();
        for doc in raw.into_iter().map(|(_, v)| v) {
            let model: NoteType = serde_json::from_value(doc)?;
            models.insert(model.id, model);
        }
        Ok(Self {
            models,
            changed: false,
        })
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn clear_changed(&mut self) {
        self.changed = false;
    }

    pub fn to_json(&self) -> Result<String> {
        let map: Map<String, Value> = self
            .models
            .values()
            .map(|m| Ok((m.id.to_string(), serde_json::to_value(m)?)))
            .collect::<Result<_>>()?;
        Ok(serde_json::to_string(&map)?)
    }

    pub fn get(&self, mid: i64) -> Option<&NoteType> {
        self.models.get(&mid)
    }

    pub fn all(&self) -> Vec<&NoteType> {
        self.models.values().collect()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.models.keys().copied().collect()
    }

    pub fn by_name(&self, name: &str) -> Option<&NoteType> {
        self.models.values().find(|m| m.name == name)
    }

    /// Add or replace a note type. Used for syncing and merging; renames
    /// the incoming type if a different type already holds its name.
    pub fn update(&mut self, mut model: NoteType) {
        if self
            .models
            .values()
            .any(|m| m.name == model.name && m.id != model.id)
        {
            let suffix = checksum(int_time().to_string().as_bytes());
            model.name = format!("{}-{}", model.name, &suffix[..5]);
        }
        self.models.insert(model.id, model);
        self.changed = true;
    }

    /// Given a joined field string, return the template ordinals that would
    /// produce a non-empty card.
    pub fn avail_ords(model: &NoteType, flds: &str) -> Vec<i64> {
        if model.is_cloze() {
            return Self::avail_cloze_ords(model, flds);
        }
        let fields: Vec<String> = split_fields(flds)
            .into_iter()
            .map(|f| f.trim().to_string())
            .collect();
        let filled = |idx: usize| fields.get(idx).is_some_and(|f| !f.is_empty());

        let mut avail = Vec::new();
        for req in &model.req {
            let ok = match req.1 {
                ReqKind::None => false,
                ReqKind::All => req.2.iter().all(|&idx| filled(idx)),
                ReqKind::Any => req.2.iter().any(|&idx| filled(idx)),
            };
            if ok {
                avail.push(req.0);
            }
        }
        avail
    }

    /// Cloze ordinals referenced by the first template's question format.
    /// A note with no cloze deletions still gets its first card.
    fn avail_cloze_ords(model: &NoteType, flds: &str) -> Vec<i64> {
        let Some(first) = model.tmpls.first() else {
            return Vec::new();
        };
        let fields = split_fields(flds);

        let re_braces = Regex::new(r"\{\{[^}]*?cloze:(?:[^}]?:)*(.+?)\}\}").expect("valid regex");
        let re_percent = Regex::new(r"<%cloze:(.+?)%>").expect("valid regex");
        let re_ord = Regex::new(r"(?s)\{\{c(\d+)::.+?\}\}").expect("valid regex");

        let mut ords = std::collections::BTreeSet::new();
        let names = re_braces
            .captures_iter(&first.qfmt)
            .chain(re_percent.captures_iter(&first.qfmt))
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()));
        for fname in names {
            let Some(field_ord) = model.field_ord(&fname) else {
                continue;
            };
            let Some(field) = fields.get(field_ord) else {
                continue;
            };
            for cap in re_ord.captures_iter(field) {
                if let Ok(n) = cap[1].parse::<i64>() {
                    if n >= 1 {
                        ords.insert(n - 1);
                    }
                }
            }
        }
        if ords.is_empty() {
            return vec![0];
        }
        ords.into_iter().collect()
    }

    /// Index of the field cached as the sort field, bounded to the model.
    pub fn sort_idx(model: &NoteType) -> usize {
        model.sortf.min(model.flds.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn basic() -> NoteType {
        defaults::basic_notetype(1_000, 0)
    }

    fn cloze() -> NoteType {
        serde_json::from_value(json!({
            "id": 2_000, "name": "Cloze", "type": 1, "mod": 0, "usn": 0,
            "sortf": 0, "did": 1,
            "flds": [{"name": "Text", "ord": 0}, {"name": "Extra", "ord": 1}],
            "tmpls": [{"name": "Cloze", "ord": 0, "qfmt": "{{cloze:Text}}", "afmt": ""}],
            "req": [],
        }))
        .unwrap()
    }

    #[test]
    fn std_requirements_gate_ordinals() {
        let model = basic();
        assert_eq!(
            NoteTypeRegistry::avail_ords(&model, "front\u{1f}back"),
            vec![0]
        );
        // front field required, so an empty front yields no cards
        assert_eq!(
            NoteTypeRegistry::avail_ords(&model, "\u{1f}back"),
            Vec::<i64>::new()
        );
        // whitespace counts as empty
        assert_eq!(
            NoteTypeRegistry::avail_ords(&model, "  \u{1f}back"),
            Vec::<i64>::new()
        );
    }

    #[test]
    fn cloze_ordinals_come_from_deletions() {
        let model = cloze();
        assert_eq!(
            NoteTypeRegistry::avail_ords(&model, "{{c1::a}} and {{c3::b}}\u{1f}"),
            vec![0, 2]
        );
        // no deletions still yields the first card
        assert_eq!(
            NoteTypeRegistry::avail_ords(&model, "plain text\u{1f}"),
            vec![0]
        );
        // deletions in a non-referenced field are ignored
        assert_eq!(
            NoteTypeRegistry::avail_ords(&model, "plain\u{1f}{{c2::x}}"),
            vec![0]
        );
    }

    #[test]
    fn update_renames_on_name_collision() {
        let mut reg = NoteTypeRegistry::load("{}").unwrap();
        reg.update(basic());
        let mut clash = basic();
        clash.id = 9_000;
        reg.update(clash);
        assert_eq!(reg.all().len(), 2);
        let other = reg.get(9_000).unwrap();
        assert!(other.name.starts_with("Basic-"));
        assert_eq!(reg.get(1_000).unwrap().name, "Basic");
    }
}
