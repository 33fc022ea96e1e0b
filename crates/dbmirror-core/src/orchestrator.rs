/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The table orchestrator (C7 / §4.7): drives every selected table through catalog
//! read → DDL → ledger bootstrap → strategy selection → delta → apply → ledger update,
//! scheduling independent tables concurrently up to `RunConfig::max_parallel_tables`
//! one dependency-DAG level at a time (§5).

use crate::apply::BatchApplier;
use crate::config::RunConfig;
use crate::dag::level_order;
use crate::delta::DeltaComputer;
use crate::error::{MirrorError, Result};
use crate::events::{EventSink, ProgressEvent, RunSummary};
use crate::ledger::{LedgerStrategy, MetadataLedger, WriteCounters};
use crate::schema::catalog::CatalogReader;
use crate::schema::ddl::DdlEmitter;
use crate::schema::model::{TableRef, TableSchema, TableSyncConfig};
use crate::strategy::{select_strategy, ChangeStrategy};
use async_trait::async_trait;
use dbmirror_interrupt::Cancellable;
use dbmirror_sql_support::{SqlExecutor, SqlParam};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Opens independent source/destination connections for a table worker. The core
/// never assembles a connection string or prompts for credentials (§1/§6); this trait
/// is the seam an integrator plugs a real connection pool into. Each call must return
/// a connection this worker owns exclusively; workers never share connections (§5).
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    async fn open_source(&self) -> Result<Box<dyn SqlExecutor>>;
    async fn open_destination(&self) -> Result<Box<dyn SqlExecutor>>;
}

/// §9's per-table lifecycle. Purely a bookkeeping aid for tracing/diagnostics here;
/// the actual control flow in [`run_one_table`] is linear, but naming each stage keeps
/// log lines and any future branching honest about which phase failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Pending,
    SchemaReady,
    LedgerReady,
    Applying,
    Done,
    Failed,
}

pub struct Orchestrator;

impl Orchestrator {
    /// Run every selected table in `table_configs` to completion (or failure), honoring
    /// the foreign-key dependency order and `max_parallel_tables` concurrency cap.
    pub async fn run(
        factory: Arc<dyn ExecutorFactory>,
        table_configs: Vec<TableSyncConfig>,
        config: RunConfig,
        events: EventSink,
        cancel: Arc<dyn Cancellable + Send + Sync>,
    ) -> Result<RunSummary> {
        let ledger = Arc::new(MetadataLedger::new(&config));
        {
            let mut dest = factory.open_destination().await?;
            ledger.ensure_table(dest.as_mut()).await?;
        }

        let selected: Vec<TableSyncConfig> = table_configs.into_iter().filter(|t| t.selected).collect();
        let mut summary = RunSummary { tables_total: selected.len() as u32, tables_ok: 0, tables_failed: 0 };
        if selected.is_empty() {
            return Ok(summary);
        }

        let schemas = Self::read_all_schemas(&factory, &selected).await?;
        let levels = level_order(&schemas);
        let by_table: std::collections::HashMap<TableRef, TableSyncConfig> =
            selected.into_iter().map(|t| (t.table_ref.clone(), t)).collect();

        let semaphore = Arc::new(Semaphore::new(config.max_parallel_tables as usize));
        let mut run_fatal: Option<MirrorError> = None;

        for level in levels {
            if run_fatal.is_some() || cancel.is_cancelled() {
                break;
            }
            let mut join_set: JoinSet<(TableRef, Result<WriteCounters>)> = JoinSet::new();
            for table_ref in level {
                let Some(table_config) = by_table.get(&table_ref).cloned() else { continue };
                let schema = schemas.iter().find(|s| s.table_ref == table_ref).cloned();
                let Some(schema) = schema else { continue };

                let factory = factory.clone();
                let ledger = ledger.clone();
                let events = events.clone();
                let cancel = cancel.clone();
                let config = config.clone();
                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closes");

                join_set.spawn(async move {
                    let _permit = permit;
                    let result = run_one_table(factory, ledger, events, cancel, config, table_config, schema).await;
                    (table_ref, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let (table_ref, result) = joined.expect("table worker task panicked");
                match result {
                    Ok(_) => summary.tables_ok += 1,
                    Err(err) => {
                        summary.tables_failed += 1;
                        if err.is_run_fatal() {
                            tracing::error!(table = %table_ref, "run-fatal error, aborting remaining schedule: {err}");
                            run_fatal = Some(err);
                        }
                    }
                }
            }
        }

        if let Some(err) = run_fatal {
            return Err(err);
        }
        Ok(summary)
    }

    async fn read_all_schemas(factory: &Arc<dyn ExecutorFactory>, tables: &[TableSyncConfig]) -> Result<Vec<TableSchema>> {
        let mut source = factory.open_source().await?;
        let mut schemas = Vec::with_capacity(tables.len());
        for t in tables {
            schemas.push(CatalogReader::read_table(source.as_mut(), &t.table_ref).await?);
        }
        Ok(schemas)
    }
}

async fn run_one_table(
    factory: Arc<dyn ExecutorFactory>,
    ledger: Arc<MetadataLedger>,
    events: EventSink,
    cancel: Arc<dyn Cancellable + Send + Sync>,
    config: RunConfig,
    table_config: TableSyncConfig,
    schema: TableSchema,
) -> Result<WriteCounters> {
    let table_ref = table_config.table_ref.clone();
    let mut state = TableState::Pending;
    events.emit(ProgressEvent::TableStarted { table: table_ref.clone() });

    let outcome = run_one_table_inner(&factory, &ledger, &events, cancel.as_ref(), &config, &table_config, &schema, &mut state).await;

    match &outcome {
        Ok(counters) => {
            state = TableState::Done;
            tracing::debug!(table = %table_ref, ?state, "table completed");
            events.emit(ProgressEvent::TableCompleted {
                table: table_ref.clone(),
                inserted: counters.inserted,
                updated: counters.updated,
                deleted: counters.deleted,
            });
        }
        Err(err) => {
            state = TableState::Failed;
            tracing::warn!(table = %table_ref, ?state, "table failed: {err}");
            events.emit(ProgressEvent::TableFailed {
                table: table_ref.clone(),
                error_label: err.label(),
                message: err.to_string(),
            });
            if let Ok(mut dest) = factory.open_destination().await {
                let _ = ledger.record_error(dest.as_mut(), &table_ref, &err.to_string()).await;
            }
        }
    }

    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_one_table_inner(
    factory: &Arc<dyn ExecutorFactory>,
    ledger: &MetadataLedger,
    events: &EventSink,
    cancel: &(dyn Cancellable + Send + Sync),
    config: &RunConfig,
    table_config: &TableSyncConfig,
    schema: &TableSchema,
    state: &mut TableState,
) -> Result<WriteCounters> {
    cancel.err_if_cancelled()?;

    let effective_pk = resolve_effective_pk(table_config, schema)?;

    let mut dest = factory.open_destination().await?;

    if !destination_table_exists(dest.as_mut(), &schema.table_ref).await? {
        let statements = DdlEmitter::emit_table(schema);
        for stmt in &statements {
            dest.execute(stmt)
                .await
                .map_err(|source| MirrorError::DDLExecutionFailed { table: schema.table_ref.clone(), source })?;
        }
        events.emit(ProgressEvent::TableSchemaCreated { table: schema.table_ref.clone() });
    }
    *state = TableState::SchemaReady;

    ledger
        .initialize(dest.as_mut(), &schema.table_ref, &effective_pk, table_config.primary_key_override.is_none(), table_config.row_filter.as_deref())
        .await?;
    let ledger_entry = ledger.load(dest.as_mut(), &schema.table_ref).await?;
    ledger.record_start(dest.as_mut(), &schema.table_ref).await?;
    *state = TableState::LedgerReady;

    let strategy = select_strategy(schema, ledger_entry.as_ref());
    events.emit(ProgressEvent::TableStrategySelected { table: schema.table_ref.clone(), strategy: strategy.clone() });

    cancel.err_if_cancelled()?;
    let mut source = factory.open_source().await?;
    let delta = DeltaComputer::compute(source.as_mut(), dest.as_mut(), schema, &effective_pk, table_config.row_filter.as_deref(), &strategy).await?;

    *state = TableState::Applying;
    let ledger_strategy = match &strategy {
        ChangeStrategy::Rowversion { .. } | ChangeStrategy::RowversionInitial { .. } => LedgerStrategy::Rowversion,
        ChangeStrategy::Hash => LedgerStrategy::Hash,
    };
    // The ledger update for this table rides in the same transaction as the data delta
    // (§4.3's "same transaction" invariant): BatchApplier::apply records it as the last
    // fallible step before COMMIT, so a crash never leaves committed data with a stale
    // high-water mark.
    let counters = BatchApplier::apply(
        dest.as_mut(),
        schema,
        &effective_pk,
        &delta,
        config.batch_size as usize,
        events,
        cancel,
        ledger,
        ledger_strategy,
        strategy.rowversion_column(),
    )
    .await?;

    Ok(counters)
}

/// Resolve §4.7 step 1: user override (validated against the catalog columns) takes
/// precedence over the catalog's own primary key; a table with neither fails the table
/// rather than guessing.
fn resolve_effective_pk(table_config: &TableSyncConfig, schema: &TableSchema) -> Result<Vec<String>> {
    if let Some(override_cols) = &table_config.primary_key_override {
        if override_cols.is_empty() || !schema.has_all_columns(override_cols) {
            return Err(MirrorError::InvalidPKOverride {
                table: schema.table_ref.clone(),
                columns: override_cols.clone(),
            });
        }
        return Ok(override_cols.clone());
    }
    if schema.primary_key.is_empty() {
        return Err(MirrorError::NoPrimaryKey(schema.table_ref.clone()));
    }
    Ok(schema.primary_key.columns.clone())
}

async fn destination_table_exists(dest: &mut dyn SqlExecutor, table: &TableRef) -> Result<bool> {
    let sql = "SELECT 1 AS found FROM sys.tables t WHERE SCHEMA_NAME(t.schema_id) = @P1 AND t.name = @P2";
    let params = [SqlParam::String(table.schema.clone()), SqlParam::String(table.table.clone())];
    let rows = dest
        .query_params(sql, &params)
        .await
        .map_err(|source| MirrorError::CatalogQueryFailed { table: table.clone(), source })?;
    Ok(!rows.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{ColumnDesc, ColumnKind, KeyDesc};

    fn sample_schema() -> TableSchema {
        TableSchema {
            table_ref: TableRef::new("dbo", "Widget"),
            columns: vec![ColumnDesc {
                ordinal: 1,
                name: "Id".into(),
                sql_type: "INT".into(),
                nullable: false,
                collation: None,
                kind: ColumnKind::Regular,
                default_expression: None,
            }],
            primary_key: KeyDesc { columns: vec!["Id".into()] },
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: vec![],
            check_constraints: vec![],
            triggers: vec![],
        }
    }

    #[test]
    fn resolve_effective_pk_prefers_valid_override() {
        let mut cfg = TableSyncConfig::new(TableRef::new("dbo", "Widget"));
        cfg.primary_key_override = Some(vec!["Id".to_string()]);
        let pk = resolve_effective_pk(&cfg, &sample_schema()).unwrap();
        assert_eq!(pk, vec!["Id".to_string()]);
    }

    #[test]
    fn resolve_effective_pk_rejects_override_with_unknown_column() {
        let mut cfg = TableSyncConfig::new(TableRef::new("dbo", "Widget"));
        cfg.primary_key_override = Some(vec!["Nope".to_string()]);
        let err = resolve_effective_pk(&cfg, &sample_schema()).unwrap_err();
        assert!(matches!(err, MirrorError::InvalidPKOverride { .. }));
    }

    #[test]
    fn resolve_effective_pk_falls_back_to_catalog_pk() {
        let cfg = TableSyncConfig::new(TableRef::new("dbo", "Widget"));
        let pk = resolve_effective_pk(&cfg, &sample_schema()).unwrap();
        assert_eq!(pk, vec!["Id".to_string()]);
    }

    #[test]
    fn resolve_effective_pk_fails_without_any_key() {
        let cfg = TableSyncConfig::new(TableRef::new("dbo", "Widget"));
        let mut schema = sample_schema();
        schema.primary_key = KeyDesc::default();
        let err = resolve_effective_pk(&cfg, &schema).unwrap_err();
        assert!(matches!(err, MirrorError::NoPrimaryKey(_)));
    }

    #[tokio::test]
    async fn destination_table_exists_reflects_catalog_lookup() {
        let mut mock = dbmirror_sql_support::MockSqlExecutor::new();
        mock.expect_query_params().returning(|_, _| Ok(vec![]));
        let exists = destination_table_exists(&mut mock, &TableRef::new("dbo", "Ghost")).await.unwrap();
        assert!(!exists);
    }
}
