//! Bootstrap documents for a freshly created tenant.
//!
//! A new collection starts with one deck, one deck config, one note type
//! and the stock collection config, all at the schema-11 shapes clients
//! expect. Ids 1 for the deck and deck config are load-bearing: clients
//! treat deck 1 as the default deck and never delete it.

use serde_json::json;

use crate::models::{CollectionConfig, Deck, DeckConfig, NoteType};

pub fn collection_config() -> CollectionConfig {
    serde_json::from_value(json!({
        "nextPos": 1,
        "estTimes": true,
        "activeDecks": [1],
        "sortType": "noteFld",
        "timeLim": 0,
        "sortBackwards": false,
        "addToCur": true,
        "curDeck": 1,
        "newBury": true,
        "newSpread": 0,
        "dueCounts": true,
        "curModel": null,
        "collapseTime": 1200,
    }))
    .expect("static document")
}

pub fn default_deck() -> Deck {
    serde_json::from_value(json!({
        "id": 1,
        "name": "Default",
        "mod": 0,
        "usn": 0,
        "dyn": 0,
        "conf": 1,
        "desc": "",
        "collapsed": false,
        "extendNew": 10,
        "extendRev": 50,
        "newToday": [0, 0],
        "revToday": [0, 0],
        "lrnToday": [0, 0],
        "timeToday": [0, 0],
    }))
    .expect("static document")
}

pub fn default_deck_config() -> DeckConfig {
    serde_json::from_value(json!({
        "id": 1,
        "name": "Default",
        "mod": 0,
        "usn": 0,
        "maxTaken": 60,
        "autoplay": true,
        "timer": 0,
        "replayq": true,
        "new": {
            "bury": true,
            "delays": [1, 10],
            "initialFactor": 2500,
            "ints": [1, 4, 7],
            "order": 1,
            "perDay": 20,
            "separate": true,
        },
        "rev": {
            "bury": true,
            "ease4": 1.3,
            "fuzz": 0.05,
            "ivlFct": 1,
            "maxIvl": 36500,
            "minSpace": 1,
            "perDay": 100,
        },
        "lapse": {
            "delays": [10],
            "leechAction": 0,
            "leechFails": 8,
            "minInt": 1,
            "mult": 0,
        },
    }))
    .expect("static document")
}

/// The stock two-field front/back note type, stamped with the given id and
/// modification time.
pub fn basic_notetype(id: i64, mod_secs: i64) -> NoteType {
    serde_json::from_value(json!({
        "id": id,
        "name": "Basic",
        "type": 0,
        "mod": mod_secs,
        "usn": 0,
        "sortf": 0,
        "did": 1,
        "latexPre": "\\documentclass[12pt]{article}\n\\special{papersize=3in,5in}\n\\usepackage[utf8]{inputenc}\n\\usepackage{amssymb,amsmath}\n\\pagestyle{empty}\n\\setlength{\\parindent}{0in}\n\\begin{document}\n",
        "latexPost": "\\end{document}",
        "css": ".card {\n font-family: arial;\n font-size: 20px;\n text-align: center;\n color: black;\n background-color: white;\n}\n",
        "flds": [
            {"name": "Front", "ord": 0, "sticky": false, "rtl": false, "font": "Arial", "size": 20, "media": []},
            {"name": "Back", "ord": 1, "sticky": false, "rtl": false, "font": "Arial", "size": 20, "media": []},
        ],
        "tmpls": [
            {
                "name": "Card 1",
                "ord": 0,
                "qfmt": "{{Front}}",
                "afmt": "{{FrontSide}}\n\n<hr id=answer>\n\n{{Back}}",
                "did": null,
                "bqfmt": "",
                "bafmt": "",
            },
        ],
        "req": [[0, "all", [0]]],
        "tags": [],
        "vers": [],
    }))
    .expect("static document")
}
