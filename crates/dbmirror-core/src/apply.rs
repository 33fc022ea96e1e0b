/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The batch applier (C6 / §4.6): writes one table's delta to the destination inside a
//! single transaction, in DELETE → UPDATE → INSERT order, chunked by
//! `RunConfig::batch_size`.
//!
//! Transactions here are plain T-SQL (`BEGIN`/`COMMIT`/`ROLLBACK TRANSACTION`) issued
//! over an async connection. Rust has no stable async `Drop`, so nothing rolls back
//! automatically if this future is dropped mid-flight: every fallible step here
//! explicitly rolls back on its own error path before returning.
//!
//! The ledger update for this table is folded into the same transaction: it runs as the
//! last fallible step before `COMMIT TRANSACTION`, so a crash can never leave committed
//! data with a stale ledger high-water mark.

use crate::delta::{DeltaSet, SourceRow};
use crate::error::{MirrorError, Result};
use crate::events::{BatchKind, EventSink, ProgressEvent};
use crate::ledger::{LedgerStrategy, MetadataLedger, WriteCounters};
use crate::schema::model::TableSchema;
use dbmirror_interrupt::Cancellable;
use dbmirror_sql_support::{each_chunk, quote_ident, SqlExecutor, SqlParam};

pub struct BatchApplier;

impl BatchApplier {
    #[allow(clippy::too_many_arguments)]
    pub async fn apply(
        dest: &mut dyn SqlExecutor,
        schema: &TableSchema,
        effective_pk: &[String],
        delta: &DeltaSet,
        batch_size: usize,
        events: &EventSink,
        cancel: &dyn Cancellable,
        ledger: &MetadataLedger,
        ledger_strategy: LedgerStrategy,
        rowversion_column: Option<&str>,
    ) -> Result<WriteCounters> {
        wrap(dest.execute("BEGIN TRANSACTION").await, schema)?;

        let outcome = match Self::apply_inner(dest, schema, effective_pk, delta, batch_size, events, cancel).await {
            Ok(counters) => {
                ledger
                    .record_success(dest, &schema.table_ref, ledger_strategy, rowversion_column, delta.new_high_water.as_deref(), counters)
                    .await
                    .map(|()| counters)
            }
            Err(err) => Err(err),
        };

        match outcome {
            Ok(counters) => {
                wrap(dest.execute("COMMIT TRANSACTION").await, schema)?;
                Ok(counters)
            }
            Err(err) => {
                if let Err(rollback_err) = dest.execute("ROLLBACK TRANSACTION").await {
                    tracing::warn!(table = %schema.table_ref, "rollback failed after apply error: {rollback_err}");
                }
                Err(err)
            }
        }
    }

    async fn apply_inner(
        dest: &mut dyn SqlExecutor,
        schema: &TableSchema,
        effective_pk: &[String],
        delta: &DeltaSet,
        batch_size: usize,
        events: &EventSink,
        cancel: &dyn Cancellable,
    ) -> Result<WriteCounters> {
        let mut counters = WriteCounters::default();
        let chunk_size = batch_size.max(1);
        let qualified = format!("{}.{}", quote_ident(&schema.table_ref.schema), quote_ident(&schema.table_ref.table));

        let identity_pk = schema
            .columns
            .iter()
            .any(|c| c.is_identity() && effective_pk.iter().any(|pk| pk.eq_ignore_ascii_case(&c.name)));

        let delete_sql = build_delete_sql(schema, effective_pk);
        each_chunk(&delta.deletes, chunk_size, |chunk, _offset| {
            let dest = &mut *dest;
            let delete_sql = &delete_sql;
            let counters = &mut counters;
            async move {
                cancel.err_if_cancelled()?;
                for pk_values in chunk {
                    let params: Vec<SqlParam> = pk_values.iter().map(|v| SqlParam::String(v.clone())).collect();
                    wrap(dest.execute_params(delete_sql, &params).await, schema)?;
                }
                counters.deleted += chunk.len() as u64;
                events.emit(ProgressEvent::BatchApplied {
                    table: schema.table_ref.clone(),
                    kind: BatchKind::Delete,
                    rows: chunk.len() as u64,
                });
                Ok(())
            }
        })
        .await?;

        let update_sql = build_update_sql(schema, effective_pk);
        each_chunk(&delta.updates, chunk_size, |chunk, _offset| {
            let dest = &mut *dest;
            let update_sql = &update_sql;
            let counters = &mut counters;
            async move {
                cancel.err_if_cancelled()?;
                for row in chunk {
                    let params = update_params(row, effective_pk.len());
                    wrap(dest.execute_params(update_sql, &params).await, schema)?;
                }
                counters.updated += chunk.len() as u64;
                events.emit(ProgressEvent::BatchApplied {
                    table: schema.table_ref.clone(),
                    kind: BatchKind::Update,
                    rows: chunk.len() as u64,
                });
                Ok(())
            }
        })
        .await?;

        if identity_pk && !delta.inserts.is_empty() {
            wrap(dest.execute(&format!("SET IDENTITY_INSERT {qualified} ON")).await, schema)?;
        }
        let insert_sql = build_insert_sql(schema);
        each_chunk(&delta.inserts, chunk_size, |chunk, _offset| {
            let dest = &mut *dest;
            let insert_sql = &insert_sql;
            let counters = &mut counters;
            async move {
                cancel.err_if_cancelled()?;
                for row in chunk {
                    wrap(dest.execute_params(insert_sql, &row.values).await, schema)?;
                }
                counters.inserted += chunk.len() as u64;
                events.emit(ProgressEvent::BatchApplied {
                    table: schema.table_ref.clone(),
                    kind: BatchKind::Insert,
                    rows: chunk.len() as u64,
                });
                Ok(())
            }
        })
        .await?;
        if identity_pk && !delta.inserts.is_empty() {
            wrap(dest.execute(&format!("SET IDENTITY_INSERT {qualified} OFF")).await, schema)?;
        }

        Ok(counters)
    }
}

fn wrap<T>(result: std::result::Result<T, dbmirror_sql_support::ExecutorError>, schema: &TableSchema) -> Result<T> {
    result.map_err(|source| MirrorError::BatchApplyFailed { table: schema.table_ref.clone(), source })
}

fn update_params(row: &SourceRow, pk_len: usize) -> Vec<SqlParam> {
    let mut params = row.values.clone();
    params.reserve(pk_len);
    params.extend(row.pk.iter().cloned().map(SqlParam::String));
    params
}

fn pk_predicate(pk: &[String], starting_at: usize) -> String {
    pk.iter()
        .enumerate()
        .map(|(i, col)| format!("{} = @P{}", quote_ident(col), starting_at + i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn build_delete_sql(schema: &TableSchema, pk: &[String]) -> String {
    format!(
        "DELETE FROM {}.{} WHERE {}",
        quote_ident(&schema.table_ref.schema),
        quote_ident(&schema.table_ref.table),
        pk_predicate(pk, 0)
    )
}

fn build_update_sql(schema: &TableSchema, pk: &[String]) -> String {
    let data_cols = schema.data_columns();
    let set_clause: Vec<String> = data_cols
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = @P{}", quote_ident(&c.name), i + 1))
        .collect();
    format!(
        "UPDATE {}.{} SET {} WHERE {}",
        quote_ident(&schema.table_ref.schema),
        quote_ident(&schema.table_ref.table),
        set_clause.join(", "),
        pk_predicate(pk, data_cols.len())
    )
}

fn build_insert_sql(schema: &TableSchema) -> String {
    let data_cols = schema.data_columns();
    let col_names: Vec<String> = data_cols.iter().map(|c| quote_ident(&c.name)).collect();
    let placeholders: Vec<String> = (1..=data_cols.len()).map(|i| format!("@P{i}")).collect();
    format!(
        "INSERT INTO {}.{} ({}) VALUES ({})",
        quote_ident(&schema.table_ref.schema),
        quote_ident(&schema.table_ref.table),
        col_names.join(", "),
        placeholders.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::events::event_channel;
    use crate::schema::model::{ColumnDesc, ColumnKind, IdentityDesc, KeyDesc, TableRef};
    use dbmirror_interrupt::NeverCancelled;
    use dbmirror_sql_support::MockSqlExecutor;

    fn schema() -> TableSchema {
        TableSchema {
            table_ref: TableRef::new("dbo", "Customer"),
            columns: vec![
                ColumnDesc {
                    ordinal: 1,
                    name: "Id".into(),
                    sql_type: "INT".into(),
                    nullable: false,
                    collation: None,
                    kind: ColumnKind::Identity(IdentityDesc { seed: 1, increment: 1 }),
                    default_expression: None,
                },
                ColumnDesc {
                    ordinal: 2,
                    name: "Name".into(),
                    sql_type: "NVARCHAR(128)".into(),
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
        }
    }

    #[test]
    fn delete_sql_uses_all_pk_columns() {
        let sql = build_delete_sql(&schema(), &["Id".to_string()]);
        assert_eq!(sql, "DELETE FROM [dbo].[Customer] WHERE [Id] = @P1");
    }

    #[test]
    fn insert_sql_excludes_rowversion_and_computed() {
        let sql = build_insert_sql(&schema());
        assert_eq!(sql, "INSERT INTO [dbo].[Customer] ([Id], [Name]) VALUES (@P1, @P2)");
    }

    #[test]
    fn update_sql_places_pk_params_after_set_params() {
        let sql = build_update_sql(&schema(), &["Id".to_string()]);
        assert_eq!(sql, "UPDATE [dbo].[Customer] SET [Id] = @P1, [Name] = @P2 WHERE [Id] = @P3");
    }

    #[tokio::test]
    async fn apply_commits_on_success_and_toggles_identity_insert() {
        let mut mock = MockSqlExecutor::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql| sql == "BEGIN TRANSACTION")
            .returning(|_| Ok(0));
        mock.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql| sql.contains("IDENTITY_INSERT") && sql.contains("ON"))
            .returning(|_| Ok(0));
        mock.expect_execute_params()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql, _| sql.starts_with("INSERT INTO"))
            .returning(|_, _| Ok(1));
        mock.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql| sql.contains("IDENTITY_INSERT") && sql.contains("OFF"))
            .returning(|_| Ok(0));
        mock.expect_execute_params()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql, _| sql.contains("change_detection_strategy"))
            .returning(|_, _| Ok(1));
        mock.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql| sql == "COMMIT TRANSACTION")
            .returning(|_| Ok(0));

        let (sink, mut rx) = event_channel(8);
        let delta = DeltaSet {
            inserts: vec![SourceRow { pk: vec!["1".into()], values: vec![SqlParam::I32(1), SqlParam::String("Ann".into())] }],
            updates: vec![],
            deletes: vec![],
            new_high_water: None,
        };
        let ledger = MetadataLedger::new(&RunConfig::default());

        let counters = BatchApplier::apply(
            &mut mock,
            &schema(),
            &["Id".to_string()],
            &delta,
            100,
            &sink,
            &NeverCancelled,
            &ledger,
            LedgerStrategy::Hash,
            None,
        )
        .await
        .unwrap();
        assert_eq!(counters.inserted, 1);
        drop(sink);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ProgressEvent::BatchApplied { kind: BatchKind::Insert, rows: 1, .. }));
    }

    #[tokio::test]
    async fn apply_rolls_back_explicitly_on_failure() {
        let mut mock = MockSqlExecutor::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_execute().times(1).in_sequence(&mut seq).withf(|sql| sql == "BEGIN TRANSACTION").returning(|_| Ok(0));
        mock.expect_execute_params()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(dbmirror_sql_support::ExecutorError::Statement("constraint violation".into())));
        mock.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql| sql == "ROLLBACK TRANSACTION")
            .returning(|_| Ok(0));

        let (sink, _rx) = event_channel(8);
        let delta = DeltaSet {
            inserts: vec![],
            updates: vec![],
            deletes: vec![vec!["1".into()]],
            new_high_water: None,
        };
        let ledger = MetadataLedger::new(&RunConfig::default());
        let err = BatchApplier::apply(
            &mut mock,
            &schema(),
            &["Id".to_string()],
            &delta,
            100,
            &sink,
            &NeverCancelled,
            &ledger,
            LedgerStrategy::Hash,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MirrorError::BatchApplyFailed { .. }));
    }

    #[tokio::test]
    async fn apply_rolls_back_when_ledger_update_fails() {
        let mut mock = MockSqlExecutor::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_execute().times(1).in_sequence(&mut seq).withf(|sql| sql == "BEGIN TRANSACTION").returning(|_| Ok(0));
        mock.expect_execute_params()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql, _| sql.contains("change_detection_strategy"))
            .returning(|_, _| Err(dbmirror_sql_support::ExecutorError::Statement("deadlocked".into())));
        mock.expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|sql| sql == "ROLLBACK TRANSACTION")
            .returning(|_| Ok(0));

        let (sink, _rx) = event_channel(8);
        let delta = DeltaSet { inserts: vec![], updates: vec![], deletes: vec![], new_high_water: None };
        let ledger = MetadataLedger::new(&RunConfig::default());
        let err = BatchApplier::apply(
            &mut mock,
            &schema(),
            &["Id".to_string()],
            &delta,
            100,
            &sink,
            &NeverCancelled,
            &ledger,
            LedgerStrategy::Hash,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MirrorError::LedgerUpdateFailed { .. }));
    }
}
