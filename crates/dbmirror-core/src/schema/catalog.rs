/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The catalog reader (C1 / §4.1): turns SQL Server's system catalog views into a
//! [`TableSchema`].

use crate::error::{MirrorError, Result};
use crate::schema::model::*;
use dbmirror_sql_support::{SqlExecutor, SqlParam};
use tiberius::Row;

pub struct CatalogReader;

impl CatalogReader {
    /// Read the complete structural description of one table. Fails with
    /// [`MirrorError::TableNotFound`] if the schema/table pair does not resolve to an
    /// object, and [`MirrorError::CatalogQueryFailed`] if any catalog round-trip errors.
    #[tracing::instrument(skip(source), fields(table = %table))]
    pub async fn read_table(source: &mut dyn SqlExecutor, table: &TableRef) -> Result<TableSchema> {
        let object_id = Self::resolve_object_id(source, table).await?;

        let columns = Self::read_columns(source, table, object_id).await?;
        let primary_key = Self::read_primary_key(source, table, object_id).await?;
        let unique_constraints = Self::read_unique_constraints(source, table, object_id).await?;
        let indexes = Self::read_indexes(source, table, object_id).await?;
        let foreign_keys = Self::read_foreign_keys(source, table, object_id).await?;
        let check_constraints = Self::read_check_constraints(source, table, object_id).await?;
        let triggers = Self::read_triggers(source, table, object_id).await?;

        tracing::debug!(
            columns = columns.len(),
            indexes = indexes.len(),
            foreign_keys = foreign_keys.len(),
            "read table schema"
        );

        Ok(TableSchema {
            table_ref: TableRef::new(table.schema.clone(), table.table.clone()),
            columns,
            primary_key,
            unique_constraints,
            indexes,
            foreign_keys,
            check_constraints,
            triggers,
        })
    }

    async fn resolve_object_id(source: &mut dyn SqlExecutor, table: &TableRef) -> Result<i32> {
        let sql = "SELECT t.object_id AS object_id FROM sys.tables t \
                    WHERE SCHEMA_NAME(t.schema_id) = @P1 AND t.name = @P2";
        let params = [SqlParam::String(table.schema.clone()), SqlParam::String(table.table.clone())];
        let rows = query(source, table, sql, &params).await?;
        match rows.first() {
            Some(row) => Ok(row.get::<i32, _>("object_id").unwrap_or_default()),
            None => Err(MirrorError::TableNotFound(table.clone())),
        }
    }

    async fn read_columns(source: &mut dyn SqlExecutor, table: &TableRef, object_id: i32) -> Result<Vec<ColumnDesc>> {
        let sql = "SELECT c.column_id, c.name AS col_name, ty.name AS type_name, \
                          c.max_length, c.precision, c.scale, c.is_nullable, c.collation_name, \
                          ic.seed_value, ic.increment_value, \
                          cc.definition AS computed_expr, cc.is_persisted, \
                          dc.definition AS default_expr \
                   FROM sys.columns c \
                   JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
                   LEFT JOIN sys.identity_columns ic ON ic.object_id = c.object_id AND ic.column_id = c.column_id \
                   LEFT JOIN sys.computed_columns cc ON cc.object_id = c.object_id AND cc.column_id = c.column_id \
                   LEFT JOIN sys.default_constraints dc ON dc.parent_object_id = c.object_id AND dc.parent_column_id = c.column_id \
                   WHERE c.object_id = @P1 \
                   ORDER BY c.column_id";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        Ok(rows.iter().map(row_to_column).collect())
    }

    async fn read_primary_key(source: &mut dyn SqlExecutor, table: &TableRef, object_id: i32) -> Result<KeyDesc> {
        let sql = "SELECT col.name AS col_name, ic.key_ordinal \
                   FROM sys.key_constraints kc \
                   JOIN sys.index_columns ic ON ic.object_id = kc.parent_object_id AND ic.index_id = kc.unique_index_id \
                   JOIN sys.columns col ON col.object_id = ic.object_id AND col.column_id = ic.column_id \
                   WHERE kc.parent_object_id = @P1 AND kc.type = 'PK' \
                   ORDER BY ic.key_ordinal";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        let columns = rows.iter().map(|r| r.get::<&str, _>("col_name").unwrap_or_default().to_string()).collect();
        Ok(KeyDesc { columns })
    }

    async fn read_unique_constraints(
        source: &mut dyn SqlExecutor,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<UniqueConstraintDesc>> {
        let sql = "SELECT kc.name AS constraint_name, col.name AS col_name, ic.key_ordinal \
                   FROM sys.key_constraints kc \
                   JOIN sys.index_columns ic ON ic.object_id = kc.parent_object_id AND ic.index_id = kc.unique_index_id \
                   JOIN sys.columns col ON col.object_id = ic.object_id AND col.column_id = ic.column_id \
                   WHERE kc.parent_object_id = @P1 AND kc.type = 'UQ' \
                   ORDER BY kc.name, ic.key_ordinal";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        let mut out: Vec<UniqueConstraintDesc> = Vec::new();
        for row in &rows {
            let name = row.get::<&str, _>("constraint_name").unwrap_or_default().to_string();
            let col = row.get::<&str, _>("col_name").unwrap_or_default().to_string();
            match out.iter_mut().find(|uc| uc.name == name) {
                Some(uc) => uc.columns.push(col),
                None => out.push(UniqueConstraintDesc { name, columns: vec![col] }),
            }
        }
        Ok(out)
    }

    async fn read_indexes(source: &mut dyn SqlExecutor, table: &TableRef, object_id: i32) -> Result<Vec<IndexDesc>> {
        let sql = "SELECT i.name AS index_name, i.type_desc, i.is_unique, i.has_filter, i.filter_definition, \
                          col.name AS col_name, ic.key_ordinal, ic.is_descending_key, ic.is_included_column \
                   FROM sys.indexes i \
                   JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
                   JOIN sys.columns col ON col.object_id = ic.object_id AND col.column_id = ic.column_id \
                   WHERE i.object_id = @P1 AND i.is_primary_key = 0 AND i.is_unique_constraint = 0 \
                         AND i.name IS NOT NULL \
                   ORDER BY i.name, ic.key_ordinal";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        let mut out: Vec<IndexDesc> = Vec::new();
        for row in &rows {
            let name = row.get::<&str, _>("index_name").unwrap_or_default().to_string();
            let col = row.get::<&str, _>("col_name").unwrap_or_default().to_string();
            let is_included: bool = row.get("is_included_column").unwrap_or(false);
            let entry = match out.iter_mut().find(|i| i.name == name) {
                Some(entry) => entry,
                None => {
                    let type_desc: &str = row.get("type_desc").unwrap_or("NONCLUSTERED");
                    let kind = if type_desc.starts_with("CLUSTERED") { IndexKind::Clustered } else { IndexKind::Nonclustered };
                    out.push(IndexDesc {
                        name: name.clone(),
                        kind,
                        unique: row.get("is_unique").unwrap_or(false),
                        key_columns: Vec::new(),
                        included_columns: Vec::new(),
                        filter: row.get::<&str, _>("filter_definition").map(str::to_string),
                    });
                    out.last_mut().unwrap()
                }
            };
            if is_included {
                entry.included_columns.push(col);
            } else {
                let descending: bool = row.get("is_descending_key").unwrap_or(false);
                entry.key_columns.push(IndexKeyColumn {
                    name: col,
                    direction: if descending { SortDirection::Desc } else { SortDirection::Asc },
                });
            }
        }
        Ok(out)
    }

    async fn read_foreign_keys(
        source: &mut dyn SqlExecutor,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<ForeignKeyDesc>> {
        let sql = "SELECT fk.name AS fk_name, fk.delete_referential_action, fk.update_referential_action, \
                          SCHEMA_NAME(rt.schema_id) AS ref_schema, rt.name AS ref_table, \
                          fkc.constraint_column_id, c1.name AS local_col, c2.name AS ref_col \
                   FROM sys.foreign_keys fk \
                   JOIN sys.foreign_key_columns fkc ON fkc.constraint_object_id = fk.object_id \
                   JOIN sys.tables rt ON rt.object_id = fk.referenced_object_id \
                   JOIN sys.columns c1 ON c1.object_id = fkc.parent_object_id AND c1.column_id = fkc.parent_column_id \
                   JOIN sys.columns c2 ON c2.object_id = fkc.referenced_object_id AND c2.column_id = fkc.referenced_column_id \
                   WHERE fk.parent_object_id = @P1 \
                   ORDER BY fk.name, fkc.constraint_column_id";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        let mut out: Vec<ForeignKeyDesc> = Vec::new();
        for row in &rows {
            let name = row.get::<&str, _>("fk_name").unwrap_or_default().to_string();
            let local_col = row.get::<&str, _>("local_col").unwrap_or_default().to_string();
            let ref_col = row.get::<&str, _>("ref_col").unwrap_or_default().to_string();
            match out.iter_mut().find(|fk| fk.name == name) {
                Some(fk) => {
                    fk.columns.push(local_col);
                    fk.referenced_columns.push(ref_col);
                }
                None => {
                    let ref_schema: &str = row.get("ref_schema").unwrap_or("dbo");
                    let ref_table: &str = row.get("ref_table").unwrap_or_default();
                    let del_action: u8 = row.get("delete_referential_action").unwrap_or(0);
                    let upd_action: u8 = row.get("update_referential_action").unwrap_or(0);
                    out.push(ForeignKeyDesc {
                        name,
                        columns: vec![local_col],
                        referenced_table: TableRef::new(ref_schema, ref_table),
                        referenced_columns: vec![ref_col],
                        on_delete: parse_referential_action(del_action),
                        on_update: parse_referential_action(upd_action),
                    });
                }
            }
        }
        Ok(out)
    }

    async fn read_check_constraints(
        source: &mut dyn SqlExecutor,
        table: &TableRef,
        object_id: i32,
    ) -> Result<Vec<CheckConstraintDesc>> {
        let sql = "SELECT name AS constraint_name, definition FROM sys.check_constraints WHERE parent_object_id = @P1";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        Ok(rows
            .iter()
            .map(|row| CheckConstraintDesc {
                name: row.get::<&str, _>("constraint_name").unwrap_or_default().to_string(),
                expression: row.get::<&str, _>("definition").unwrap_or_default().to_string(),
            })
            .collect())
    }

    async fn read_triggers(source: &mut dyn SqlExecutor, table: &TableRef, object_id: i32) -> Result<Vec<TriggerDesc>> {
        let sql = "SELECT t.name AS trigger_name, t.is_instead_of_trigger, m.definition, \
                          MAX(CASE WHEN te.type = 1 THEN 1 ELSE 0 END) AS has_insert, \
                          MAX(CASE WHEN te.type = 2 THEN 1 ELSE 0 END) AS has_update, \
                          MAX(CASE WHEN te.type = 3 THEN 1 ELSE 0 END) AS has_delete \
                   FROM sys.triggers t \
                   JOIN sys.sql_modules m ON m.object_id = t.object_id \
                   JOIN sys.trigger_events te ON te.object_id = t.object_id \
                   WHERE t.parent_id = @P1 AND t.is_disabled = 0 \
                   GROUP BY t.name, t.is_instead_of_trigger, m.definition \
                   ORDER BY t.name";
        let rows = query(source, table, sql, &[SqlParam::I32(object_id)]).await?;
        Ok(rows
            .iter()
            .map(|row| TriggerDesc {
                name: row.get::<&str, _>("trigger_name").unwrap_or_default().to_string(),
                timing: if row.get("is_instead_of_trigger").unwrap_or(false) {
                    TriggerTiming::InsteadOf
                } else {
                    TriggerTiming::After
                },
                events: TriggerEvents {
                    insert: row.get::<i32, _>("has_insert").unwrap_or(0) != 0,
                    update: row.get::<i32, _>("has_update").unwrap_or(0) != 0,
                    delete: row.get::<i32, _>("has_delete").unwrap_or(0) != 0,
                },
                body: row.get::<&str, _>("definition").unwrap_or_default().to_string(),
            })
            .collect())
    }
}

async fn query(source: &mut dyn SqlExecutor, table: &TableRef, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>> {
    source
        .query_params(sql, params)
        .await
        .map_err(|source| MirrorError::CatalogQueryFailed { table: table.clone(), source })
}

fn parse_referential_action(action: u8) -> ForeignKeyAction {
    match action {
        1 => ForeignKeyAction::Cascade,
        2 => ForeignKeyAction::SetNull,
        3 => ForeignKeyAction::SetDefault,
        _ => ForeignKeyAction::NoAction,
    }
}

/// A column's base type name is sufficient to tell whether it's rowversion; SQL Server
/// reports this type under either historical name.
fn is_rowversion_type(type_name: &str) -> bool {
    type_name.eq_ignore_ascii_case("timestamp") || type_name.eq_ignore_ascii_case("rowversion")
}

fn row_to_column(row: &Row) -> ColumnDesc {
    let ordinal: i32 = row.get("column_id").unwrap_or_default();
    let name = row.get::<&str, _>("col_name").unwrap_or_default().to_string();
    let type_name: &str = row.get("type_name").unwrap_or("int");
    let max_length: i16 = row.get("max_length").unwrap_or(0);
    let precision: u8 = row.get("precision").unwrap_or(0);
    let scale: u8 = row.get("scale").unwrap_or(0);
    let nullable: bool = row.get("is_nullable").unwrap_or(true);
    let collation = row.get::<&str, _>("collation_name").map(str::to_string);
    let default_expression = row.get::<&str, _>("default_expr").map(str::to_string);

    let kind = if is_rowversion_type(type_name) {
        ColumnKind::Rowversion
    } else if let Some(expr) = row.get::<&str, _>("computed_expr") {
        ColumnKind::Computed(ComputedDesc {
            expression: expr.to_string(),
            persisted: row.get("is_persisted").unwrap_or(false),
        })
    } else if let Some(seed) = row.get::<i64, _>("seed_value") {
        ColumnKind::Identity(IdentityDesc { seed, increment: row.get("increment_value").unwrap_or(1) })
    } else {
        ColumnKind::Regular
    };

    let sql_type = if matches!(kind, ColumnKind::Rowversion | ColumnKind::Computed(_)) {
        String::new()
    } else {
        render_sql_type(type_name, max_length, precision, scale)
    };

    ColumnDesc { ordinal: ordinal as u32, name, sql_type, nullable, collation, kind, default_expression }
}

/// Reproduce the catalog's type string, e.g. `NVARCHAR(128)`, `DECIMAL(18,4)`,
/// `VARBINARY(MAX)`, matching §4.2's fidelity requirement.
fn render_sql_type(type_name: &str, max_length: i16, precision: u8, scale: u8) -> String {
    let upper = type_name.to_ascii_uppercase();
    match upper.as_str() {
        "NVARCHAR" | "NCHAR" => {
            if max_length == -1 {
                format!("{upper}(MAX)")
            } else {
                format!("{upper}({})", max_length / 2)
            }
        }
        "VARCHAR" | "CHAR" | "VARBINARY" | "BINARY" => {
            if max_length == -1 {
                format!("{upper}(MAX)")
            } else {
                format!("{upper}({max_length})")
            }
        }
        "DECIMAL" | "NUMERIC" => format!("{upper}({precision},{scale})"),
        "FLOAT" if precision != 53 => format!("FLOAT({precision})"),
        "DATETIME2" | "DATETIMEOFFSET" | "TIME" => {
            if scale == 7 {
                upper
            } else {
                format!("{upper}({scale})")
            }
        }
        _ => upper,
    }
}
