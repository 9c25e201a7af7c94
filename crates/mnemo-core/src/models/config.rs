//! The collection-wide configuration document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Deck selection state and scheduling globals. Overwritten wholesale on
/// sync when the authoritative side sends one, so unknown fields are kept
/// verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    #[serde(rename = "curDeck", default = "default_one")]
    pub current_deck: i64,
    #[serde(rename = "activeDecks", default = "default_active")]
    pub active_decks: Vec<i64>,
    #[serde(rename = "newSpread", default)]
    pub new_spread: i64,
    #[serde(rename = "collapseTime", default = "default_collapse")]
    pub collapse_time: i64,
    /// Day number sibling-buried cards were last restored on.
    #[serde(rename = "lastUnburied", default)]
    pub last_unburied: i64,
    #[serde(rename = "newBury", default)]
    pub new_bury: bool,
    /// Next position counter for in-order new cards.
    #[serde(rename = "nextPos", default = "default_one")]
    pub next_pos: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

const fn default_one() -> i64 {
    1
}

fn default_active() -> Vec<i64> {
    vec![1]
}

const fn default_collapse() -> i64 {
    1200
}

impl CollectionConfig {
    /// Take the next new-card position, incrementing the counter.
    pub fn take_next_pos(&mut self) -> i64 {
        let pos = self.next_pos;
        self.next_pos = pos + 1;
        pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn defaults_fill_missing_fields() {
        let conf: CollectionConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(conf.current_deck, 1);
        assert_eq!(conf.active_decks, vec![1]);
        assert_eq!(conf.collapse_time, 1200);
        assert_eq!(conf.next_pos, 1);
        assert!(!conf.new_bury);
    }

    #[test]
    fn next_pos_increments() {
        let mut conf: CollectionConfig = serde_json::from_value(json!({"nextPos": 7})).unwrap();
        assert_eq!(conf.take_next_pos(), 7);
        assert_eq!(conf.next_pos, 8);
    }
}
