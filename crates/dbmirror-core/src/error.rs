/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::schema::model::TableRef;
use dbmirror_sql_support::ExecutorError;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// The full error taxonomy (§7). Every variant is scoped to a single table except
/// `ConnectionFailed`, which the orchestrator treats as fatal to the whole run.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("connection to {0} failed: {1}")]
    ConnectionFailed(&'static str, String),

    #[error("catalog query for {table} failed: {source}")]
    CatalogQueryFailed {
        table: TableRef,
        #[source]
        source: ExecutorError,
    },

    #[error("table {0} does not exist in the source database")]
    TableNotFound(TableRef),

    #[error("table {0} has no primary key and no primary-key override was supplied")]
    NoPrimaryKey(TableRef),

    #[error("primary-key override for {table} references column(s) not present in the source table: {columns:?}")]
    InvalidPKOverride { table: TableRef, columns: Vec<String> },

    #[error("DDL execution for {table} failed: {source}")]
    DDLExecutionFailed {
        table: TableRef,
        #[source]
        source: ExecutorError,
    },

    #[error("delta computation for {table} failed: {source}")]
    DeltaComputationFailed {
        table: TableRef,
        #[source]
        source: ExecutorError,
    },

    #[error("batch apply for {table} failed: {source}")]
    BatchApplyFailed {
        table: TableRef,
        #[source]
        source: ExecutorError,
    },

    #[error("ledger update for {table} failed: {source}")]
    LedgerUpdateFailed {
        table: TableRef,
        #[source]
        source: ExecutorError,
    },

    #[error("operation was canceled")]
    Canceled(#[from] dbmirror_interrupt::Canceled),
}

impl MirrorError {
    /// A stable, display-text-independent label for telemetry and log aggregation,
    /// mirroring `logins::Error::label()`.
    pub fn label(&self) -> &'static str {
        match self {
            MirrorError::ConnectionFailed(..) => "ConnectionFailed",
            MirrorError::CatalogQueryFailed { .. } => "CatalogQueryFailed",
            MirrorError::TableNotFound(_) => "TableNotFound",
            MirrorError::NoPrimaryKey(_) => "NoPrimaryKey",
            MirrorError::InvalidPKOverride { .. } => "InvalidPKOverride",
            MirrorError::DDLExecutionFailed { .. } => "DDLExecutionFailed",
            MirrorError::DeltaComputationFailed { .. } => "DeltaComputationFailed",
            MirrorError::BatchApplyFailed { .. } => "BatchApplyFailed",
            MirrorError::LedgerUpdateFailed { .. } => "LedgerUpdateFailed",
            MirrorError::Canceled(_) => "Canceled",
        }
    }

    /// Whether this error should abort the whole run rather than just the current table
    /// (§7 propagation policy).
    pub fn is_run_fatal(&self) -> bool {
        matches!(self, MirrorError::ConnectionFailed(..))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable_identifiers_not_display_text() {
        let err = MirrorError::NoPrimaryKey(TableRef::new("dbo", "Widget"));
        assert_eq!(err.label(), "NoPrimaryKey");
        assert!(err.to_string().contains("Widget"));
    }

    #[test]
    fn only_connection_failed_is_run_fatal() {
        assert!(MirrorError::ConnectionFailed("source", "timed out".into()).is_run_fatal());
        assert!(!MirrorError::Canceled(dbmirror_interrupt::Canceled).is_run_fatal());
        assert!(!MirrorError::NoPrimaryKey(TableRef::new("dbo", "T")).is_run_fatal());
    }
}
