/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Incremental, structure-preserving table replication between two SQL Server
//! databases.
//!
//! The crate mirrors a source table's structure onto a destination (`schema` module),
//! picks a change-detection strategy per table (`strategy`), computes the minimal
//! INSERT/UPDATE/DELETE set to converge the destination to the source (`delta`),
//! applies it transactionally (`apply`), and records durable per-table progress in a
//! destination-resident ledger (`ledger`) so runs are resumable. `orchestrator` drives
//! all of this across a dependency-respecting, bounded-concurrency table schedule.

pub mod apply;
pub mod config;
pub mod dag;
pub mod delta;
pub mod error;
pub mod events;
pub mod ledger;
pub mod orchestrator;
pub mod schema;
pub mod strategy;

pub use config::RunConfig;
pub use error::{MirrorError, Result};
pub use events::{BatchKind, EventSink, ProgressEvent, RunSummary};
pub use ledger::{LastSyncStatus, LedgerStrategy, MetadataLedger, SyncLedgerEntry, WriteCounters};
pub use orchestrator::{ExecutorFactory, Orchestrator};
pub use schema::model::{TableRef, TableSchema, TableSyncConfig};
pub use strategy::ChangeStrategy;

pub use dbmirror_interrupt::{Cancellable, CancellationScope, NeverCancelled};
pub use dbmirror_sql_support::{ExecutorError, SqlExecutor, SqlParam};
