//! Typed shapes for the documents and rows the protocol moves around.
//!
//! Registry documents (decks, deck configs, note types, collection config)
//! are stored and transmitted as JSON; the structs here parse the known
//! fields and keep everything else in a flattened `extra` map so unknown
//! client fields survive a merge round trip unchanged.

mod config;
mod deck;
mod notetype;
mod rows;

pub use config::CollectionConfig;
pub use deck::{Deck, DeckConfig, NewConfig, RevConfig, PER_DAY_CAP};
pub use notetype::{FieldDef, NoteType, ReqKind, Requirement, Template, MODEL_CLOZE, MODEL_STD};
pub use rows::{CardRow, GraveKind, MediaEntry, NoteRow, RevlogRow};

use serde::{Deserialize, Deserializer};

/// Accept either an integer or a numeric string.
///
/// Some clients have historically stored deck `mod` times as strings; the
/// merge must not choke on them.
pub(crate) fn int_or_string<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Lenient {
        Int(i64),
        Float(f64),
        Str(String),
    }
    match Lenient::deserialize(deserializer)? {
        Lenient::Int(v) => Ok(v),
        #[allow(clippy::cast_possible_truncation)]
        Lenient::Float(v) => Ok(v as i64),
        Lenient::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("not an integer: {s:?}"))),
    }
}
