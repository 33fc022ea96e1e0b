/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The structural description of one table, as read from SQL Server's catalog and as
//! rendered back into DDL. Every field here is a direct transcription of a catalog
//! column or a value derived from one; nothing is inferred beyond what §3/§4.1 specify.

use std::fmt;

/// `(schema_name, table_name)`. Case is preserved for display and DDL rendering, but
/// equality and hashing are case-insensitive, matching SQL Server's default collation
/// behavior for identifiers.
#[derive(Debug, Clone)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.schema.eq_ignore_ascii_case(&other.schema) && self.table.eq_ignore_ascii_case(&other.table)
    }
}
impl Eq for TableRef {}

impl std::hash::Hash for TableRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.schema.to_ascii_lowercase().hash(state);
        self.table.to_ascii_lowercase().hash(state);
    }
}

/// Identity seed/increment, present only on columns the catalog reports as `is_identity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityDesc {
    pub seed: i64,
    pub increment: i64,
}

/// A computed column's expression and whether it is materialized (`PERSISTED`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedDesc {
    pub expression: String,
    pub persisted: bool,
}

/// Which structural role a column plays, driving how the DDL emitter renders it.
///
/// This is the tagged-variant the design notes (§9) call for: rendering is an
/// exhaustive match over this enum rather than a chain of `if column.identity.is_some()`
/// checks, so a new kind can't be silently skipped by a stray branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnKind {
    Regular,
    Identity(IdentityDesc),
    Computed(ComputedDesc),
    Rowversion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDesc {
    pub ordinal: u32,
    pub name: String,
    /// Declared type exactly as the catalog would render it, e.g. `NVARCHAR(128)`,
    /// `DECIMAL(18,4)`, `VARBINARY(MAX)`.
    pub sql_type: String,
    pub nullable: bool,
    /// Collation name, present only for character types.
    pub collation: Option<String>,
    pub kind: ColumnKind,
    pub default_expression: Option<String>,
}

impl ColumnDesc {
    pub fn is_rowversion(&self) -> bool {
        matches!(self.kind, ColumnKind::Rowversion)
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.kind, ColumnKind::Computed(_))
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.kind, ColumnKind::Identity(_))
    }
}

/// The table's primary key, if it has one (§4.1: tables without one are legal and
/// yield an empty `columns` list here).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDesc {
    pub columns: Vec<String>,
}

impl KeyDesc {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueConstraintDesc {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Clustered,
    Nonclustered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeyColumn {
    pub name: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDesc {
    pub name: String,
    pub kind: IndexKind,
    pub unique: bool,
    pub key_columns: Vec<IndexKeyColumn>,
    pub included_columns: Vec<String>,
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForeignKeyAction {
    NoAction,
    Cascade,
    SetNull,
    SetDefault,
}

impl ForeignKeyAction {
    pub fn as_sql(self) -> &'static str {
        match self {
            ForeignKeyAction::NoAction => "NO ACTION",
            ForeignKeyAction::Cascade => "CASCADE",
            ForeignKeyAction::SetNull => "SET NULL",
            ForeignKeyAction::SetDefault => "SET DEFAULT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyDesc {
    pub name: String,
    pub columns: Vec<String>,
    pub referenced_table: TableRef,
    pub referenced_columns: Vec<String>,
    pub on_delete: ForeignKeyAction,
    pub on_update: ForeignKeyAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConstraintDesc {
    pub name: String,
    pub expression: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerTiming {
    After,
    InsteadOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvents {
    pub insert: bool,
    pub update: bool,
    pub delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerDesc {
    pub name: String,
    pub timing: TriggerTiming,
    pub events: TriggerEvents,
    pub body: String,
}

/// The full structural description of one table.
///
/// Invariant (§3): every column name referenced by `primary_key`, `unique_constraints`,
/// `indexes`, `foreign_keys`, or `check_constraints` exists in `columns`. Constructors
/// of this type outside of tests are expected to come from [`crate::schema::catalog`],
/// which reads directly from the catalog views that guarantee this by construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub table_ref: TableRef,
    pub columns: Vec<ColumnDesc>,
    pub primary_key: KeyDesc,
    pub unique_constraints: Vec<UniqueConstraintDesc>,
    pub indexes: Vec<IndexDesc>,
    pub foreign_keys: Vec<ForeignKeyDesc>,
    pub check_constraints: Vec<CheckConstraintDesc>,
    pub triggers: Vec<TriggerDesc>,
}

impl TableSchema {
    /// The single rowversion column, if the table has one. §4.1: exactly one column
    /// may be rowversion, so the first match is authoritative.
    pub fn rowversion_column(&self) -> Option<&ColumnDesc> {
        self.columns.iter().find(|c| c.is_rowversion())
    }

    /// All columns except computed and rowversion columns (§4.5's `DATA_COLS`): the
    /// columns the batch applier is allowed to write and the hash strategy compares.
    pub fn data_columns(&self) -> Vec<&ColumnDesc> {
        self.columns
            .iter()
            .filter(|c| !c.is_computed() && !c.is_rowversion())
            .collect()
    }

    /// True if every name in `columns` exists in `self.columns`. Used to validate a
    /// user-supplied primary-key override (§4.7 step 1 / `InvalidPKOverride`).
    pub fn has_all_columns(&self, columns: &[String]) -> bool {
        columns
            .iter()
            .all(|name| self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name)))
    }
}

/// Per-table configuration supplied by the caller (§3): an optional PK override and an
/// optional row filter, plus whether the user selected this table for this run.
#[derive(Debug, Clone)]
pub struct TableSyncConfig {
    pub table_ref: TableRef,
    pub primary_key_override: Option<Vec<String>>,
    pub row_filter: Option<String>,
    pub selected: bool,
}

impl TableSyncConfig {
    pub fn new(table_ref: TableRef) -> Self {
        Self {
            table_ref,
            primary_key_override: None,
            row_filter: None,
            selected: true,
        }
    }

    pub fn with_primary_key_override(mut self, columns: Vec<String>) -> Self {
        self.primary_key_override = Some(columns);
        self
    }

    pub fn with_row_filter(mut self, filter: impl Into<String>) -> Self {
        self.row_filter = Some(filter.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_ref_equality_is_case_insensitive() {
        assert_eq!(TableRef::new("dbo", "Customer"), TableRef::new("DBO", "customer"));
    }

    fn sample_column(name: &str, kind: ColumnKind) -> ColumnDesc {
        ColumnDesc {
            ordinal: 1,
            name: name.to_string(),
            sql_type: "INT".to_string(),
            nullable: false,
            collation: None,
            kind,
            default_expression: None,
        }
    }

    #[test]
    fn data_columns_excludes_computed_and_rowversion() {
        let schema = TableSchema {
            table_ref: TableRef::new("dbo", "T"),
            columns: vec![
                sample_column("Id", ColumnKind::Identity(IdentityDesc { seed: 1, increment: 1 })),
                sample_column(
                    "Total",
                    ColumnKind::Computed(ComputedDesc {
                        expression: "[Qty]*[Price]".into(),
                        persisted: false,
                    }),
                ),
                sample_column("RV", ColumnKind::Rowversion),
                sample_column("Name", ColumnKind::Regular),
            ],
            primary_key: KeyDesc { columns: vec!["Id".into()] },
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            triggers: vec![],
        };
        let names: Vec<&str> = schema.data_columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Id", "Name"]);
        assert_eq!(schema.rowversion_column().unwrap().name, "RV");
    }

    #[test]
    fn has_all_columns_checks_case_insensitively() {
        let schema = TableSchema {
            table_ref: TableRef::new("dbo", "T"),
            columns: vec![sample_column("Id", ColumnKind::Regular)],
            primary_key: KeyDesc::default(),
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            triggers: vec![],
        };
        assert!(schema.has_all_columns(&["id".to_string()]));
        assert!(!schema.has_all_columns(&["Missing".to_string()]));
    }
}
