/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The delta computer (C5 / §4.5): produces INSERT/UPDATE/DELETE sets for one table by
//! streaming `(PK, version)` tuples from both sides in PK order and merging them, rather
//! than a set-based cross-database join. This keeps the merge algorithm testable
//! against in-memory fixtures behind the [`SqlExecutor`] seam without a live server.

use crate::error::{MirrorError, Result};
use crate::schema::model::{ColumnDesc, TableSchema};
use crate::strategy::ChangeStrategy;
use dbmirror_sql_support::{quote_ident, SqlExecutor, SqlParam};
use tiberius::Row;

/// A candidate row read from the source side, ready to be written to the destination.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub pk: Vec<String>,
    /// Values in `TableSchema::data_columns()` order.
    pub values: Vec<SqlParam>,
}

#[derive(Debug, Clone, Default)]
pub struct DeltaSet {
    pub inserts: Vec<SourceRow>,
    pub updates: Vec<SourceRow>,
    /// PK tuples only. A DELETE only needs to locate the row, not read it.
    pub deletes: Vec<Vec<String>>,
    /// The new ROWVERSION high-water mark, if this run observed any rowversion rows.
    /// `None` when the strategy is [`ChangeStrategy::Hash`] or no candidate row was seen.
    pub new_high_water: Option<Vec<u8>>,
}

impl DeltaSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

const SENTINEL_SEPARATOR: &str = "NCHAR(30)";

pub struct DeltaComputer;

impl DeltaComputer {
    /// Compute the delta for one table. `effective_pk` is the already-resolved primary
    /// key (catalog PK or user override); `row_filter` is applied identically to both
    /// sides (§4.5's symmetry requirement).
    pub async fn compute(
        source: &mut dyn SqlExecutor,
        dest: &mut dyn SqlExecutor,
        schema: &TableSchema,
        effective_pk: &[String],
        row_filter: Option<&str>,
        strategy: &ChangeStrategy,
    ) -> Result<DeltaSet> {
        let data_cols = schema.data_columns();

        let source_pk_sql = select_pk_sql(&schema.table_ref, effective_pk, row_filter);
        let source_pk_rows = run_query(source, schema, &source_pk_sql).await?;
        let source_pks = rows_to_pk_tuples(&source_pk_rows, effective_pk.len());

        let dest_pk_sql = select_pk_sql(&schema.table_ref, effective_pk, row_filter);
        let dest_pk_rows = run_query(dest, schema, &dest_pk_sql).await?;
        let dest_pks = rows_to_pk_tuples(&dest_pk_rows, effective_pk.len());

        let (insert_only, common, delete_only) = merge_pk_sets(&source_pks, &dest_pks);

        let candidate_sql = candidate_source_sql(schema, effective_pk, row_filter, strategy, &data_cols);
        let candidate_rows = run_query(source, schema, &candidate_sql).await?;

        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut new_high_water: Option<Vec<u8>> = None;

        let dest_hashes = if matches!(strategy, ChangeStrategy::Hash) {
            let dest_hash_sql = select_pk_and_hash_sql(&schema.table_ref, effective_pk, row_filter, &data_cols);
            let rows = run_query(dest, schema, &dest_hash_sql).await?;
            Some(rows_to_pk_hash_map(&rows, effective_pk.len()))
        } else {
            None
        };

        for row in &candidate_rows {
            let pk = row_pk(row, effective_pk.len());
            let values = row_values(row, effective_pk.len(), data_cols.len());

            if let ChangeStrategy::Rowversion { .. } | ChangeStrategy::RowversionInitial { .. } = strategy {
                if let Some(bytes) = row.get::<&[u8], _>(effective_pk.len() + data_cols.len()) {
                    new_high_water = Some(match &new_high_water {
                        Some(current) if current.as_slice() >= bytes => current.clone(),
                        _ => bytes.to_vec(),
                    });
                }
            }

            if insert_only.contains(&pk) {
                inserts.push(SourceRow { pk, values });
            } else if common.contains(&pk) {
                let changed = match (strategy, &dest_hashes) {
                    (ChangeStrategy::Hash, Some(hashes)) => {
                        let source_hash: &str = row.get(effective_pk.len() + data_cols.len()).unwrap_or_default();
                        hashes.get(&pk).map(|h| h.as_str() != source_hash).unwrap_or(true)
                    }
                    _ => true,
                };
                if changed {
                    updates.push(SourceRow { pk, values });
                }
            }
        }

        Ok(DeltaSet { inserts, updates, deletes: delete_only, new_high_water })
    }
}

async fn run_query(executor: &mut dyn SqlExecutor, schema: &TableSchema, sql: &str) -> Result<Vec<Row>> {
    executor
        .query(sql)
        .await
        .map_err(|source| MirrorError::DeltaComputationFailed { table: schema.table_ref.clone(), source })
}

fn filter_clause(row_filter: Option<&str>) -> String {
    match row_filter {
        Some(f) => format!(" AND ({f})"),
        None => String::new(),
    }
}

fn select_pk_sql(table: &crate::schema::model::TableRef, pk: &[String], row_filter: Option<&str>) -> String {
    let pk_cols: Vec<String> = pk.iter().map(|c| format!("CAST({} AS NVARCHAR(450))", quote_ident(c))).collect();
    let order_cols: Vec<String> = pk.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {} FROM {}.{} WHERE 1 = 1{} ORDER BY {}",
        pk_cols.join(", "),
        quote_ident(&table.schema),
        quote_ident(&table.table),
        filter_clause(row_filter),
        order_cols.join(", ")
    )
}

fn data_cols_concat_expr(data_cols: &[&ColumnDesc]) -> String {
    let parts: Vec<String> = data_cols
        .iter()
        .map(|c| format!("ISNULL(CONVERT(NVARCHAR(MAX), {}), NCHAR(0))", quote_ident(&c.name)))
        .collect();
    format!("CONCAT_WS({SENTINEL_SEPARATOR}, {})", parts.join(", "))
}

fn select_pk_and_hash_sql(
    table: &crate::schema::model::TableRef,
    pk: &[String],
    row_filter: Option<&str>,
    data_cols: &[&ColumnDesc],
) -> String {
    let pk_cols: Vec<String> = pk.iter().map(|c| format!("CAST({} AS NVARCHAR(450))", quote_ident(c))).collect();
    let order_cols: Vec<String> = pk.iter().map(|c| quote_ident(c)).collect();
    format!(
        "SELECT {}, CONVERT(NVARCHAR(64), HASHBYTES('SHA2_256', {}), 2) AS row_hash_hex FROM {}.{} WHERE 1 = 1{} ORDER BY {}",
        pk_cols.join(", "),
        data_cols_concat_expr(data_cols),
        quote_ident(&table.schema),
        quote_ident(&table.table),
        filter_clause(row_filter),
        order_cols.join(", ")
    )
}

fn candidate_source_sql(
    schema: &TableSchema,
    pk: &[String],
    row_filter: Option<&str>,
    strategy: &ChangeStrategy,
    data_cols: &[&ColumnDesc],
) -> String {
    let pk_cols: Vec<String> = pk.iter().map(|c| format!("CAST({} AS NVARCHAR(450))", quote_ident(c))).collect();
    // Every data column is cast to a stable textual form, not just the PK: `Row::get::<R>`
    // panics if the requested type doesn't match the actual column type, and a table's
    // data columns can be any SQL type (INT, BIT, DATETIME2, ...), not just character data.
    let data_col_names: Vec<String> =
        data_cols.iter().map(|c| format!("CAST({} AS NVARCHAR(MAX))", quote_ident(&c.name))).collect();
    let order_cols: Vec<String> = pk.iter().map(|c| quote_ident(c)).collect();

    let mut select_list = pk_cols;
    select_list.extend(data_col_names);

    let strategy_filter = match strategy {
        ChangeStrategy::Rowversion { rowversion_column, high_water } => {
            select_list.push(quote_ident(rowversion_column));
            format!(" AND {} > {}", quote_ident(rowversion_column), hex_literal(high_water))
        }
        ChangeStrategy::RowversionInitial { rowversion_column } => {
            select_list.push(quote_ident(rowversion_column));
            String::new()
        }
        ChangeStrategy::Hash => {
            select_list.push(format!(
                "CONVERT(NVARCHAR(64), HASHBYTES('SHA2_256', {}), 2) AS row_hash_hex",
                data_cols_concat_expr(data_cols)
            ));
            String::new()
        }
    };

    format!(
        "SELECT {} FROM {}.{} WHERE 1 = 1{}{} ORDER BY {}",
        select_list.join(", "),
        quote_ident(&schema.table_ref.schema),
        quote_ident(&schema.table_ref.table),
        filter_clause(row_filter),
        strategy_filter,
        order_cols.join(", ")
    )
}

fn hex_literal(bytes: &[u8]) -> String {
    format!("0x{}", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}

fn row_pk(row: &Row, pk_len: usize) -> Vec<String> {
    (0..pk_len).map(|i| row.get::<&str, _>(i).unwrap_or_default().to_string()).collect()
}

fn row_values(row: &Row, pk_len: usize, data_len: usize) -> Vec<SqlParam> {
    (pk_len..pk_len + data_len)
        .map(|i| {
            row.get::<&str, _>(i)
                .map(|s| SqlParam::String(s.to_string()))
                .unwrap_or(SqlParam::Null)
        })
        .collect()
}

fn rows_to_pk_tuples(rows: &[Row], pk_len: usize) -> Vec<Vec<String>> {
    rows.iter().map(|r| row_pk(r, pk_len)).collect()
}

fn rows_to_pk_hash_map(rows: &[Row], pk_len: usize) -> std::collections::HashMap<Vec<String>, String> {
    rows.iter()
        .map(|r| (row_pk(r, pk_len), r.get::<&str, _>(pk_len).unwrap_or_default().to_string()))
        .collect()
}

/// Walk two PK lists that are each sorted ascending and partition them into
/// (source-only, common, dest-only) in a single forward pass: the ordered merge
/// described in §4.5, made unit-testable without a database by operating on plain
/// `Vec<Vec<String>>` fixtures.
fn merge_pk_sets(
    source: &[Vec<String>],
    dest: &[Vec<String>],
) -> (std::collections::HashSet<Vec<String>>, std::collections::HashSet<Vec<String>>, Vec<Vec<String>>) {
    use std::collections::HashSet;
    let mut source_only = HashSet::new();
    let mut common = HashSet::new();
    let mut dest_only = Vec::new();

    let (mut i, mut j) = (0, 0);
    while i < source.len() && j < dest.len() {
        match source[i].cmp(&dest[j]) {
            std::cmp::Ordering::Less => {
                source_only.insert(source[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                dest_only.push(dest[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                common.insert(source[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    while i < source.len() {
        source_only.insert(source[i].clone());
        i += 1;
    }
    while j < dest.len() {
        dest_only.push(dest[j].clone());
        j += 1;
    }

    (source_only, common, dest_only)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(s: &str) -> Vec<String> {
        vec![s.to_string()]
    }

    #[test]
    fn merge_detects_inserts_updates_and_deletes() {
        let source = vec![pk("1"), pk("2"), pk("4")];
        let dest = vec![pk("2"), pk("3")];
        let (insert_only, common, delete_only) = merge_pk_sets(&source, &dest);
        assert!(insert_only.contains(&pk("1")));
        assert!(insert_only.contains(&pk("4")));
        assert_eq!(insert_only.len(), 2);
        assert!(common.contains(&pk("2")));
        assert_eq!(common.len(), 1);
        assert_eq!(delete_only, vec![pk("3")]);
    }

    #[test]
    fn merge_handles_empty_destination_as_all_inserts() {
        let source = vec![pk("1"), pk("2")];
        let dest: Vec<Vec<String>> = vec![];
        let (insert_only, common, delete_only) = merge_pk_sets(&source, &dest);
        assert_eq!(insert_only.len(), 2);
        assert!(common.is_empty());
        assert!(delete_only.is_empty());
    }

    #[test]
    fn merge_handles_empty_source_as_all_deletes() {
        let source: Vec<Vec<String>> = vec![];
        let dest = vec![pk("1"), pk("2")];
        let (insert_only, common, delete_only) = merge_pk_sets(&source, &dest);
        assert!(insert_only.is_empty());
        assert!(common.is_empty());
        assert_eq!(delete_only, dest);
    }

    #[test]
    fn hex_literal_renders_rowversion_as_binary_literal() {
        assert_eq!(hex_literal(&[0, 0, 0, 0, 0, 0, 0, 5]), "0x0000000000000005");
    }

    #[test]
    fn candidate_source_sql_casts_every_data_column_to_text() {
        use crate::schema::model::{ColumnDesc, ColumnKind, KeyDesc, TableRef, TableSchema};

        let schema = TableSchema {
            table_ref: TableRef::new("dbo", "Widget"),
            columns: vec![
                ColumnDesc {
                    ordinal: 1,
                    name: "Id".into(),
                    sql_type: "INT".into(),
                    nullable: false,
                    collation: None,
                    kind: ColumnKind::Regular,
                    default_expression: None,
                },
                ColumnDesc {
                    ordinal: 2,
                    name: "IsActive".into(),
                    sql_type: "BIT".into(),
                    nullable: false,
                    collation: None,
                    kind: ColumnKind::Regular,
                    default_expression: None,
                },
            ],
            primary_key: KeyDesc { columns: vec!["Id".into()] },
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            triggers: vec![],
        };
        let data_cols = schema.data_columns();
        let sql = candidate_source_sql(&schema, &["Id".to_string()], None, &ChangeStrategy::Hash, &data_cols);
        // Every projected column (PK and data) must be cast to a stable textual form so
        // `row_values` never asks tiberius for the wrong Rust type.
        assert!(sql.contains("CAST([Id] AS NVARCHAR(450))"));
        assert!(sql.contains("CAST([IsActive] AS NVARCHAR(MAX))"));
        assert!(!sql.contains("SELECT [Id], [IsActive]"));
    }
}
