/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The DDL emitter (C2 / §4.2): renders a [`TableSchema`] (or a batch of them) into an
//! ordered sequence of statements that recreate the same structure on a destination.

use crate::dag::level_order;
use crate::schema::model::*;
use dbmirror_sql_support::quote_ident;

pub struct DdlEmitter;

impl DdlEmitter {
    /// Emit the full statement sequence for one table, in isolation. Foreign keys
    /// referencing tables outside the batch are emitted last, just like everything
    /// else here; this entry point is for the "destination table does not exist yet and
    /// is being created on its own" case (§4.7 step 2).
    pub fn emit_table(schema: &TableSchema) -> Vec<String> {
        let mut statements = vec![render_create_table(schema)];
        if let Some(pk) = render_primary_key(schema) {
            statements.push(pk);
        }
        statements.extend(render_unique_constraints(schema));
        statements.extend(render_indexes(schema));
        statements.extend(render_check_constraints(schema));
        statements.extend(render_foreign_keys(schema));
        statements.extend(render_triggers(schema));
        statements
    }

    /// Emit the full statement sequence for a set of tables, breaking foreign-key
    /// cycles per §4.2 rule 2 and §9: every table's `CREATE TABLE` and non-FK
    /// constraints are emitted first, then every FOREIGN KEY constraint as a separate
    /// `ALTER TABLE`, then triggers last. The create/constraint pass follows dependency
    /// order where one exists, purely for readability; correctness does not depend on
    /// it since FKs are deferred regardless.
    pub fn emit_batch(schemas: &[TableSchema]) -> Vec<String> {
        let levels = level_order(schemas);
        let ordered: Vec<&TableSchema> = levels
            .into_iter()
            .flatten()
            .filter_map(|table_ref| schemas.iter().find(|s| s.table_ref == table_ref))
            .collect();

        let mut statements = Vec::new();
        for schema in &ordered {
            statements.push(render_create_table(schema));
            if let Some(pk) = render_primary_key(schema) {
                statements.push(pk);
            }
            statements.extend(render_unique_constraints(schema));
            statements.extend(render_indexes(schema));
            statements.extend(render_check_constraints(schema));
        }
        for schema in &ordered {
            statements.extend(render_foreign_keys(schema));
        }
        for schema in &ordered {
            statements.extend(render_triggers(schema));
        }
        statements
    }
}

fn qualified(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

fn render_create_table(schema: &TableSchema) -> String {
    let mut columns: Vec<&ColumnDesc> = schema.columns.iter().collect();
    columns.sort_by_key(|c| c.ordinal);
    let column_defs: Vec<String> = columns.iter().map(|c| render_column_def(c)).collect();
    format!("CREATE TABLE {} (\n    {}\n)", qualified(&schema.table_ref), column_defs.join(",\n    "))
}

fn render_column_def(column: &ColumnDesc) -> String {
    let name = quote_ident(&column.name);
    let mut parts = vec![name];

    match &column.kind {
        ColumnKind::Rowversion => parts.push("ROWVERSION".to_string()),
        ColumnKind::Computed(desc) => {
            parts.push(format!("AS ({})", desc.expression));
            if desc.persisted {
                parts.push("PERSISTED".to_string());
            }
        }
        ColumnKind::Identity(id) => {
            parts.push(column.sql_type.clone());
            parts.push(format!("IDENTITY({},{})", id.seed, id.increment));
        }
        ColumnKind::Regular => parts.push(column.sql_type.clone()),
    }

    if let Some(collation) = &column.collation {
        if !matches!(column.kind, ColumnKind::Computed(_)) {
            parts.push(format!("COLLATE {collation}"));
        }
    }

    if !matches!(column.kind, ColumnKind::Computed(_)) {
        parts.push(if column.nullable { "NULL".to_string() } else { "NOT NULL".to_string() });
    }

    if let Some(default_expr) = &column.default_expression {
        if !matches!(column.kind, ColumnKind::Computed(_) | ColumnKind::Rowversion) {
            parts.push(format!("DEFAULT ({default_expr})"));
        }
    }

    parts.join(" ")
}

fn render_primary_key(schema: &TableSchema) -> Option<String> {
    if schema.primary_key.is_empty() {
        return None;
    }
    let cols: Vec<String> = schema.primary_key.columns.iter().map(|c| quote_ident(c)).collect();
    Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} PRIMARY KEY CLUSTERED ({})",
        qualified(&schema.table_ref),
        quote_ident(&format!("PK_{}", schema.table_ref.table)),
        cols.join(", ")
    ))
}

fn render_unique_constraints(schema: &TableSchema) -> Vec<String> {
    schema
        .unique_constraints
        .iter()
        .map(|uc| {
            let cols: Vec<String> = uc.columns.iter().map(|c| quote_ident(c)).collect();
            format!(
                "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({})",
                qualified(&schema.table_ref),
                quote_ident(&uc.name),
                cols.join(", ")
            )
        })
        .collect()
}

fn render_indexes(schema: &TableSchema) -> Vec<String> {
    schema
        .indexes
        .iter()
        .map(|idx| {
            let kind = match idx.kind {
                IndexKind::Clustered => "CLUSTERED",
                IndexKind::Nonclustered => "NONCLUSTERED",
            };
            let unique = if idx.unique { "UNIQUE " } else { "" };
            let key_cols: Vec<String> = idx
                .key_columns
                .iter()
                .map(|kc| {
                    let dir = match kc.direction {
                        SortDirection::Asc => "ASC",
                        SortDirection::Desc => "DESC",
                    };
                    format!("{} {}", quote_ident(&kc.name), dir)
                })
                .collect();
            let mut stmt = format!(
                "CREATE {unique}{kind} INDEX {} ON {} ({})",
                quote_ident(&idx.name),
                qualified(&schema.table_ref),
                key_cols.join(", ")
            );
            if !idx.included_columns.is_empty() {
                let included: Vec<String> = idx.included_columns.iter().map(|c| quote_ident(c)).collect();
                stmt.push_str(&format!(" INCLUDE ({})", included.join(", ")));
            }
            if let Some(filter) = &idx.filter {
                stmt.push_str(&format!(" WHERE {filter}"));
            }
            stmt
        })
        .collect()
}

fn render_check_constraints(schema: &TableSchema) -> Vec<String> {
    schema
        .check_constraints
        .iter()
        .map(|cc| {
            format!(
                "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({})",
                qualified(&schema.table_ref),
                quote_ident(&cc.name),
                cc.expression
            )
        })
        .collect()
}

fn render_foreign_keys(schema: &TableSchema) -> Vec<String> {
    schema
        .foreign_keys
        .iter()
        .map(|fk| {
            let local_cols: Vec<String> = fk.columns.iter().map(|c| quote_ident(c)).collect();
            let ref_cols: Vec<String> = fk.referenced_columns.iter().map(|c| quote_ident(c)).collect();
            format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
                qualified(&schema.table_ref),
                quote_ident(&fk.name),
                local_cols.join(", "),
                qualified(&fk.referenced_table),
                ref_cols.join(", "),
                fk.on_delete.as_sql(),
                fk.on_update.as_sql(),
            )
        })
        .collect()
}

fn render_triggers(schema: &TableSchema) -> Vec<String> {
    // `body` is the trigger's full `CREATE TRIGGER ... AS ...` text as stored by
    // `sys.sql_modules.definition`; it is emitted verbatim rather than reconstructed.
    schema.triggers.iter().map(|t| t.body.clone()).collect()
}
