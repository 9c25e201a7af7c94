//! Note-type ("model") documents: fields, card templates, and the
//! generation-requirement expressions used for card generation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::int_or_string;

pub const MODEL_STD: i64 = 0;
pub const MODEL_CLOZE: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteType {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: i64,
    #[serde(rename = "mod", deserialize_with = "int_or_string", default)]
    pub modified: i64,
    #[serde(default)]
    pub usn: i64,
    /// Index of the field cached as the sort field.
    #[serde(default)]
    pub sortf: usize,
    /// Default deck new cards of this type land in.
    #[serde(default)]
    pub did: i64,
    pub tmpls: Vec<Template>,
    pub flds: Vec<FieldDef>,
    /// Per-template generation requirements; unused by cloze models.
    #[serde(default)]
    pub req: Vec<Requirement>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NoteType {
    pub fn is_cloze(&self) -> bool {
        self.kind == MODEL_CLOZE
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.flds.iter().map(|f| f.name.as_str()).collect()
    }

    /// Ordinal of a field by name.
    pub fn field_ord(&self, name: &str) -> Option<usize> {
        self.flds.iter().find(|f| f.name == name).map(|f| f.ord)
    }

    pub fn declared_ordinals(&self) -> Vec<i64> {
        self.tmpls.iter().map(|t| t.ord).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub ord: i64,
    #[serde(default)]
    pub qfmt: String,
    #[serde(default)]
    pub afmt: String,
    /// Per-template deck override.
    #[serde(default)]
    pub did: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ord: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `[ordinal, kind, field-indices]` triple from the model document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement(pub i64, pub ReqKind, pub Vec<usize>);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReqKind {
    /// Every listed field must be non-empty.
    All,
    /// At least one listed field must be non-empty.
    Any,
    /// Never satisfiable.
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn requirements_parse_from_triples() {
        let doc = json!({
            "id": 10, "name": "Basic", "type": 0, "mod": 5, "usn": 0, "sortf": 0, "did": 1,
            "tmpls": [{"name": "Card 1", "ord": 0, "qfmt": "{{Front}}", "afmt": "{{Back}}", "did": null}],
            "flds": [{"name": "Front", "ord": 0}, {"name": "Back", "ord": 1}],
            "req": [[0, "any", [0]]]
        });
        let model: NoteType = serde_json::from_value(doc).unwrap();
        assert_eq!(model.req, vec![Requirement(0, ReqKind::Any, vec![0])]);
        assert_eq!(model.field_ord("Back"), Some(1));
        assert_eq!(model.declared_ordinals(), vec![0]);
        assert!(!model.is_cloze());
    }
}
