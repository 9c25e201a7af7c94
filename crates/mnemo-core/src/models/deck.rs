//! Deck and deck-config documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::int_or_string;

/// Per-day limits are clamped to this on load.
pub const PER_DAY_CAP: i64 = 999_999;

/// One deck. Hierarchy is encoded in the name with `::` separators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deck {
    pub id: i64,
    pub name: String,
    #[serde(rename = "mod", deserialize_with = "int_or_string", default)]
    pub modified: i64,
    #[serde(default)]
    pub usn: i64,
    /// Non-zero for filtered ("dynamic") decks.
    #[serde(rename = "dyn", default)]
    pub dynamic: i64,
    /// Referenced deck-config id; absent for filtered decks, which embed
    /// their own settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf: Option<i64>,
    #[serde(rename = "newToday", default)]
    pub new_today: (i64, i64),
    #[serde(rename = "revToday", default)]
    pub rev_today: (i64, i64),
    #[serde(rename = "lrnToday", default)]
    pub lrn_today: (i64, i64),
    #[serde(rename = "timeToday", default)]
    pub time_today: (i64, i64),
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Deck {
    pub fn is_dynamic(&self) -> bool {
        self.dynamic != 0
    }

    /// Name of the immediate parent, if the deck is not top-level.
    pub fn parent_name(&self) -> Option<String> {
        let (parent, _) = self.name.rsplit_once("::")?;
        Some(parent.to_string())
    }
}

/// Scheduling limits shared by zero or more decks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeckConfig {
    pub id: i64,
    pub name: String,
    #[serde(rename = "mod", deserialize_with = "int_or_string", default)]
    pub modified: i64,
    #[serde(default)]
    pub usn: i64,
    pub new: NewConfig,
    pub rev: RevConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConfig {
    #[serde(rename = "perDay")]
    pub per_day: i64,
    /// 0 = random order, 1 = in creation order.
    #[serde(default = "default_order")]
    pub order: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevConfig {
    #[serde(rename = "perDay")]
    pub per_day: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_order() -> i64 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn unknown_fields_survive_round_trip() {
        let doc = json!({
            "id": 1, "name": "Default", "mod": 100, "usn": 0, "dyn": 0, "conf": 1,
            "newToday": [5, 2], "revToday": [5, 0], "lrnToday": [5, 0], "timeToday": [5, 0],
            "desc": "", "collapsed": false, "extendNew": 10
        });
        let deck: Deck = serde_json::from_value(doc.clone()).unwrap();
        assert_eq!(deck.new_today, (5, 2));
        assert_eq!(deck.extra.get("extendNew"), Some(&json!(10)));
        assert_eq!(serde_json::to_value(&deck).unwrap(), doc);
    }

    #[test]
    fn string_mod_times_are_tolerated() {
        let deck: Deck =
            serde_json::from_value(json!({"id": 2, "name": "x", "mod": "1234"})).unwrap();
        assert_eq!(deck.modified, 1234);
    }

    #[test]
    fn parent_names() {
        let deck: Deck =
            serde_json::from_value(json!({"id": 3, "name": "A::B::C", "mod": 0})).unwrap();
        assert_eq!(deck.parent_name(), Some("A::B".to_string()));
        let top: Deck = serde_json::from_value(json!({"id": 4, "name": "A", "mod": 0})).unwrap();
        assert_eq!(top.parent_name(), None);
    }
}
