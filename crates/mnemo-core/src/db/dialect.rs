//! The table catalog and SQL generation strategy.
//!
//! One `TableDef` per synced table is the single source of truth for DDL,
//! upsert templates, and the column lists used by the snapshot engine. The
//! generation itself sits behind [`SchemaDialect`], constructed once at
//! startup and passed into the tenant store rather than read from ambient
//! state.

/// Schema version stamped into the `col.ver` column and expected from
/// uploaded snapshots.
pub const SCHEMA_VERSION: i64 = 11;

/// Which parent database group a table belongs to. Media bookkeeping is
/// excluded from full-snapshot copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableGroup {
    Collection,
    Media,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct ColumnDef {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
}

const fn col(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: false,
        primary_key: false,
    }
}

const fn pk(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: false,
        primary_key: true,
    }
}

const fn nullable(name: &'static str, ty: ColumnType) -> ColumnDef {
    ColumnDef {
        name,
        ty,
        nullable: true,
        primary_key: false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct TableDef {
    pub name: &'static str,
    pub group: TableGroup,
    pub columns: &'static [ColumnDef],
    pub indexes: &'static [IndexDef],
    /// Row(s) inserted right after table creation.
    pub init_sql: Option<&'static str>,
}

impl TableDef {
    pub fn primary_key(&self) -> Option<&'static str> {
        self.columns.iter().find(|c| c.primary_key).map(|c| c.name)
    }

    /// Comma-separated column list, usable in SELECT and INSERT statements.
    pub fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| c.name)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

use ColumnType::{Integer, Text};

pub const TABLES: &[TableDef] = &[
    TableDef {
        name: "col",
        group: TableGroup::Collection,
        columns: &[
            pk("id", Integer),
            col("crt", Integer),
            col("mod", Integer),
            col("scm", Integer),
            col("ver", Integer),
            col("dty", Integer),
            col("usn", Integer),
            col("ls", Integer),
            col("conf", Text),
            col("models", Text),
            col("decks", Text),
            col("dconf", Text),
            col("tags", Text),
        ],
        indexes: &[],
        init_sql: Some("insert into col values (1, 0, 0, 1, 11, 0, 0, 0, '', '{}', '', '', '{}')"),
    },
    TableDef {
        name: "notes",
        group: TableGroup::Collection,
        columns: &[
            pk("id", Integer),
            col("guid", Text),
            col("mid", Integer),
            col("mod", Integer),
            col("usn", Integer),
            col("tags", Text),
            col("flds", Text),
            col("sfld", Text),
            col("csum", Integer),
            col("flags", Integer),
            col("data", Text),
        ],
        indexes: &[
            IndexDef {
                name: "ix_notes_csum",
                columns: &["csum"],
            },
            IndexDef {
                name: "ix_notes_usn",
                columns: &["usn"],
            },
        ],
        init_sql: None,
    },
    TableDef {
        name: "cards",
        group: TableGroup::Collection,
        columns: &[
            pk("id", Integer),
            col("nid", Integer),
            col("did", Integer),
            col("ord", Integer),
            col("mod", Integer),
            col("usn", Integer),
            col("type", Integer),
            col("queue", Integer),
            col("due", Integer),
            col("ivl", Integer),
            col("factor", Integer),
            col("reps", Integer),
            col("lapses", Integer),
            col("left", Integer),
            col("odue", Integer),
            col("odid", Integer),
            col("flags", Integer),
            col("data", Text),
        ],
        indexes: &[
            IndexDef {
                name: "ix_cards_nid",
                columns: &["nid"],
            },
            IndexDef {
                name: "ix_cards_sched",
                columns: &["did", "queue", "due"],
            },
            IndexDef {
                name: "ix_cards_usn",
                columns: &["usn"],
            },
        ],
        init_sql: None,
    },
    TableDef {
        name: "revlog",
        group: TableGroup::Collection,
        columns: &[
            pk("id", Integer),
            col("cid", Integer),
            col("usn", Integer),
            col("ease", Integer),
            col("ivl", Integer),
            col("lastIvl", Integer),
            col("factor", Integer),
            col("time", Integer),
            col("type", Integer),
        ],
        indexes: &[
            IndexDef {
                name: "ix_revlog_cid",
                columns: &["cid"],
            },
            IndexDef {
                name: "ix_revlog_usn",
                columns: &["usn"],
            },
        ],
        init_sql: None,
    },
    TableDef {
        name: "graves",
        group: TableGroup::Collection,
        columns: &[col("usn", Integer), col("oid", Integer), col("type", Integer)],
        indexes: &[],
        init_sql: None,
    },
    TableDef {
        name: "media",
        group: TableGroup::Media,
        columns: &[pk("fname", Text), col("usn", Integer), nullable("csum", Text)],
        indexes: &[IndexDef {
            name: "ix_media_usn",
            columns: &["usn"],
        }],
        init_sql: None,
    },
    TableDef {
        name: "meta",
        group: TableGroup::Media,
        columns: &[col("dirmod", Integer), col("lastusn", Integer)],
        indexes: &[],
        init_sql: Some("insert into meta values (0, 0)"),
    },
];

pub fn table(name: &str) -> &'static TableDef {
    TABLES
        .iter()
        .find(|t| t.name == name)
        .unwrap_or_else(|| panic!("unknown table {name}"))
}

/// SQL generation for one relational dialect. A single implementation is
/// selected at startup and shared by every tenant store operation.
pub trait SchemaDialect: Send + Sync {
    /// Full DDL for one table, indexes excluded.
    fn create_table(&self, table: &TableDef) -> String;

    /// DDL for the table's secondary indexes.
    fn create_indexes(&self, table: &TableDef) -> Vec<String>;

    /// Parameterized "upsert by primary key": every non-key column is
    /// overwritten on conflict.
    fn insert_or_update(&self, table: &TableDef) -> String;

    /// Parameterized "insert, ignore on conflict": used for append-only
    /// logs whose existing history must not be clobbered.
    fn insert_or_ignore(&self, table: &TableDef) -> String;

    /// Every statement needed to materialise a fresh namespace holding the
    /// given tables, bootstrap rows included.
    fn schema_sql(&self, tables: &[TableDef]) -> Vec<String> {
        let mut sql = Vec::new();
        for t in tables {
            sql.push(self.create_table(t));
            sql.extend(self.create_indexes(t));
            if let Some(init) = t.init_sql {
                sql.push(init.to_string());
            }
        }
        sql
    }
}

/// SQLite rendering of the catalog.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteDialect;

impl SqliteDialect {
    fn column_sql(column: &ColumnDef) -> String {
        let ty = match column.ty {
            Integer => "integer",
            Text => "text",
        };
        let null = if column.nullable { "" } else { " not null" };
        let key = if column.primary_key { " primary key" } else { "" };
        format!("{} {}{}{}", column.name, ty, null, key)
    }
}

impl SchemaDialect for SqliteDialect {
    fn create_table(&self, table: &TableDef) -> String {
        let columns: Vec<String> = table.columns.iter().map(Self::column_sql).collect();
        format!("create table {} ({})", table.name, columns.join(", "))
    }

    fn create_indexes(&self, table: &TableDef) -> Vec<String> {
        table
            .indexes
            .iter()
            .map(|ix| {
                format!(
                    "create index {} on {} ({})",
                    ix.name,
                    table.name,
                    ix.columns.join(", ")
                )
            })
            .collect()
    }

    fn insert_or_update(&self, table: &TableDef) -> String {
        let key = table.primary_key().expect("upsert requires a primary key");
        let placeholders = vec!["?"; table.columns.len()].join(", ");
        let updates: Vec<String> = table
            .columns
            .iter()
            .filter(|c| !c.primary_key)
            .map(|c| format!("{} = excluded.{}", c.name, c.name))
            .collect();
        format!(
            "insert into {} ({}) values ({}) on conflict ({}) do update set {}",
            table.name,
            table.column_list(),
            placeholders,
            key,
            updates.join(", ")
        )
    }

    fn insert_or_ignore(&self, table: &TableDef) -> String {
        let key = table
            .primary_key()
            .expect("conflict clause requires a primary key");
        let placeholders = vec!["?"; table.columns.len()].join(", ");
        format!(
            "insert into {} ({}) values ({}) on conflict ({}) do nothing",
            table.name,
            table.column_list(),
            placeholders,
            key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn catalog_has_all_tables() {
        let names: Vec<&str> = TABLES.iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec!["col", "notes", "cards", "revlog", "graves", "media", "meta"]
        );
    }

    #[test]
    fn upsert_overwrites_every_nonkey_column() {
        let sql = SqliteDialect.insert_or_update(table("media"));
        assert_eq!(
            sql,
            "insert into media (fname, usn, csum) values (?, ?, ?) \
             on conflict (fname) do update set usn = excluded.usn, csum = excluded.csum"
        );
    }

    #[test]
    fn insert_or_ignore_preserves_history() {
        let sql = SqliteDialect.insert_or_ignore(table("revlog"));
        assert!(sql.ends_with("on conflict (id) do nothing"));
        assert_eq!(sql.matches('?').count(), 9);
    }

    #[test]
    fn schema_sql_includes_bootstrap_rows() {
        let statements = SqliteDialect.schema_sql(TABLES);
        assert!(statements.iter().any(|s| s.starts_with("insert into col")));
        assert!(statements.iter().any(|s| s.starts_with("insert into meta")));
        assert!(statements.iter().any(|s| s.contains("ix_cards_sched")));
    }
}
