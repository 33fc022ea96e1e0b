/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Change-detection strategy selection (C4 / §4.4): deciding, per table and per run,
//! whether to diff by ROWVERSION high-water mark or fall back to a full-table hash
//! comparison.

use crate::ledger::SyncLedgerEntry;
use crate::schema::model::TableSchema;

/// The strategy chosen for one table on one run.
///
/// `Rowversion` and `RowversionInitial` are deliberately distinct variants rather than
/// `Rowversion { high_water: Option<Vec<u8>> }`: the delta computer's query shape really
/// is different (an open range scan vs. "every row is new"), and collapsing them back
/// into an `Option` would reintroduce the kind of silent-omission risk §9 calls out for
/// `ColumnKind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeStrategy {
    /// The table has a rowversion column and the ledger already has a high-water mark
    /// recorded against that same column from a prior successful run.
    Rowversion { rowversion_column: String, high_water: Vec<u8> },
    /// The table has a rowversion column but there is no usable prior high-water mark
    /// (first run, or the rowversion column changed since the last recorded sync): every
    /// row is treated as new.
    RowversionInitial { rowversion_column: String },
    /// The table has no rowversion column; changes are detected by comparing a hash of
    /// each row's data columns against the previous run's hash.
    Hash,
}

impl ChangeStrategy {
    pub fn rowversion_column(&self) -> Option<&str> {
        match self {
            ChangeStrategy::Rowversion { rowversion_column, .. } => Some(rowversion_column),
            ChangeStrategy::RowversionInitial { rowversion_column } => Some(rowversion_column),
            ChangeStrategy::Hash => None,
        }
    }
}

/// Select the strategy for one table given its structural schema and whatever ledger
/// entry exists for it (`None` on a fresh, never-synced table).
///
/// Decision rule (§4.4):
/// 1. No rowversion column on the source table → `Hash`.
/// 2. Rowversion column present, and the ledger has a high-water mark recorded against
///    that exact column name → `Rowversion` with that high-water mark.
/// 3. Rowversion column present but no matching high-water mark (first sync, or the
///    rowversion column was swapped since the last one) → `RowversionInitial`.
pub fn select_strategy(schema: &TableSchema, ledger_entry: Option<&SyncLedgerEntry>) -> ChangeStrategy {
    let Some(rv_column) = schema.rowversion_column() else {
        return ChangeStrategy::Hash;
    };
    let high_water = ledger_entry.and_then(|entry| {
        let recorded_column = entry.rowversion_column.as_deref()?;
        if !recorded_column.eq_ignore_ascii_case(&rv_column.name) {
            return None;
        }
        entry.last_rowversion_synced.clone()
    });
    match high_water {
        Some(high_water) => ChangeStrategy::Rowversion {
            rowversion_column: rv_column.name.clone(),
            high_water,
        },
        None => ChangeStrategy::RowversionInitial {
            rowversion_column: rv_column.name.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LastSyncStatus, LedgerStrategy};
    use crate::schema::model::{ColumnDesc, ColumnKind, KeyDesc, TableRef};
    use chrono::Utc;

    fn schema_with(rowversion: bool) -> TableSchema {
        let mut columns = vec![ColumnDesc {
            ordinal: 1,
            name: "Id".into(),
            sql_type: "INT".into(),
            nullable: false,
            collation: None,
            kind: ColumnKind::Regular,
            default_expression: None,
        }];
        if rowversion {
            columns.push(ColumnDesc {
                ordinal: 2,
                name: "RV".into(),
                sql_type: "ROWVERSION".into(),
                nullable: false,
                collation: None,
                kind: ColumnKind::Rowversion,
                default_expression: None,
            });
        }
        TableSchema {
            table_ref: TableRef::new("dbo", "T"),
            columns,
            primary_key: KeyDesc { columns: vec!["Id".into()] },
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            triggers: vec![],
        }
    }

    fn entry_with(rowversion_column: Option<&str>, high_water: Option<Vec<u8>>) -> SyncLedgerEntry {
        let now = Utc::now().naive_utc();
        SyncLedgerEntry {
            table_ref: TableRef::new("dbo", "T"),
            primary_key_columns: vec!["Id".into()],
            pk_auto_detected: true,
            where_clause: None,
            change_detection_strategy: LedgerStrategy::Rowversion,
            rowversion_column: rowversion_column.map(String::from),
            last_rowversion_synced: high_water,
            last_hash_synced: None,
            last_sync_date: now,
            last_sync_status: LastSyncStatus::Ok,
            records_inserted: 0,
            records_updated: 0,
            records_deleted: 0,
            last_error_message: None,
            last_error_date: None,
            created_date: now,
            modified_date: now,
        }
    }

    #[test]
    fn no_rowversion_column_means_hash() {
        let schema = schema_with(false);
        assert_eq!(select_strategy(&schema, None), ChangeStrategy::Hash);
    }

    #[test]
    fn rowversion_column_with_no_ledger_entry_means_initial() {
        let schema = schema_with(true);
        let strategy = select_strategy(&schema, None);
        assert_eq!(strategy, ChangeStrategy::RowversionInitial { rowversion_column: "RV".into() });
    }

    #[test]
    fn rowversion_column_with_matching_high_water_means_incremental() {
        let schema = schema_with(true);
        let entry = entry_with(Some("RV"), Some(vec![0, 0, 0, 0, 0, 0, 0, 5]));
        let strategy = select_strategy(&schema, Some(&entry));
        assert_eq!(
            strategy,
            ChangeStrategy::Rowversion {
                rowversion_column: "RV".into(),
                high_water: vec![0, 0, 0, 0, 0, 0, 0, 5],
            }
        );
    }

    #[test]
    fn rowversion_column_renamed_since_last_sync_means_initial_again() {
        let schema = schema_with(true);
        let entry = entry_with(Some("OldRV"), Some(vec![1]));
        let strategy = select_strategy(&schema, Some(&entry));
        assert_eq!(strategy, ChangeStrategy::RowversionInitial { rowversion_column: "RV".into() });
    }

    #[test]
    fn rowversion_column_present_but_high_water_missing_means_initial() {
        let schema = schema_with(true);
        let entry = entry_with(Some("RV"), None);
        let strategy = select_strategy(&schema, Some(&entry));
        assert_eq!(strategy, ChangeStrategy::RowversionInitial { rowversion_column: "RV".into() });
    }
}
