/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use async_trait::async_trait;
use std::fmt;
use tiberius::{Query, Row};
use tokio::io::{AsyncRead, AsyncWrite};

/// Error surfaced by [`SqlExecutor`] implementations.
///
/// This is intentionally narrower than the core crate's `MirrorError`: it only knows
/// about "a statement failed" and "the connection is gone", and leaves the caller to
/// decide which `ErrorKind` that maps to (a catalog query failing is `CatalogQueryFailed`,
/// the same failure during DDL execution is `DDLExecutionFailed`).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("the connection to the server was lost or never established: {0}")]
    Connection(String),
    #[error("statement failed: {0}")]
    Statement(String),
}

impl From<tiberius::error::Error> for ExecutorError {
    fn from(e: tiberius::error::Error) -> Self {
        match &e {
            tiberius::error::Error::Io { .. } => ExecutorError::Connection(e.to_string()),
            _ => ExecutorError::Statement(e.to_string()),
        }
    }
}

/// A single bound parameter for a parameterized statement.
///
/// `tiberius::ToSql`/`IntoSql` bind against concrete Rust types directly, which doesn't
/// play nicely with a boxed, mockable trait object. Components above this seam bind
/// against this small owned enum instead; [`TiberiusExecutor`] converts each variant to
/// the driver's own call at the point of use.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Bit(bool),
    I32(i32),
    I64(i64),
    F64(f64),
    String(String),
    VarBinary(Vec<u8>),
    Null,
}

impl fmt::Display for SqlParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlParam::Bit(b) => write!(f, "{b}"),
            SqlParam::I32(i) => write!(f, "{i}"),
            SqlParam::I64(i) => write!(f, "{i}"),
            SqlParam::F64(v) => write!(f, "{v}"),
            SqlParam::String(s) => write!(f, "{s}"),
            SqlParam::VarBinary(b) => write!(f, "0x{}", hex_encode(b)),
            SqlParam::Null => write!(f, "NULL"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The seam between replication logic and a concrete SQL Server connection.
///
/// Every component that talks to a database (the catalog reader, the ledger, the
/// delta computer, the batch applier) takes `&mut dyn SqlExecutor` rather than a
/// concrete `tiberius::Client`. That's what lets `MockSqlExecutor` (behind the
/// `test-support` feature) stand in for a live SQL Server in unit tests.
#[async_trait]
pub trait SqlExecutor: Send {
    /// Run a query with no bound parameters and return all rows of its first result set.
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, ExecutorError>;

    /// Run a parameterized query and return all rows of its first result set.
    async fn query_params(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Row>, ExecutorError>;

    /// Execute a statement with no result set (DDL, DML) and return the affected row count.
    async fn execute(&mut self, sql: &str) -> Result<u64, ExecutorError>;

    /// Execute a parameterized statement and return the affected row count.
    async fn execute_params(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<u64, ExecutorError>;
}

fn bind_param<'a>(query: &mut Query<'a>, param: &'a SqlParam) {
    match param {
        SqlParam::Bit(b) => query.bind(*b),
        SqlParam::I32(i) => query.bind(*i),
        SqlParam::I64(i) => query.bind(*i),
        SqlParam::F64(v) => query.bind(*v),
        SqlParam::String(s) => query.bind(s.as_str()),
        SqlParam::VarBinary(b) => query.bind(b.as_slice()),
        SqlParam::Null => query.bind(Option::<i32>::None),
    }
}

/// A live [`SqlExecutor`] backed by an open `tiberius::Client`.
///
/// Generic over the underlying stream so callers can plug in a plain TCP socket, a
/// TLS-wrapped one, or a named-pipe transport; this crate never opens the connection
/// itself, matching the rule that connection assembly lives outside the core.
pub struct TiberiusExecutor<'a, S> {
    client: &'a mut tiberius::Client<S>,
}

impl<'a, S> TiberiusExecutor<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(client: &'a mut tiberius::Client<S>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<'a, S> SqlExecutor for TiberiusExecutor<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn query(&mut self, sql: &str) -> Result<Vec<Row>, ExecutorError> {
        let stream = self.client.simple_query(sql).await?;
        Ok(stream.into_first_result().await?)
    }

    async fn query_params(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<Vec<Row>, ExecutorError> {
        let mut query = Query::new(sql);
        for p in params {
            bind_param(&mut query, p);
        }
        let stream = query.query(self.client).await?;
        Ok(stream.into_first_result().await?)
    }

    async fn execute(&mut self, sql: &str) -> Result<u64, ExecutorError> {
        let result = Query::new(sql).execute(self.client).await?;
        Ok(result.rows_affected().iter().sum())
    }

    async fn execute_params(
        &mut self,
        sql: &str,
        params: &[SqlParam],
    ) -> Result<u64, ExecutorError> {
        let mut query = Query::new(sql);
        for p in params {
            bind_param(&mut query, p);
        }
        let result = query.execute(self.client).await?;
        Ok(result.rows_affected().iter().sum())
    }
}

#[cfg(feature = "test-support")]
mockall::mock! {
    pub SqlExecutor {}

    #[async_trait]
    impl SqlExecutor for SqlExecutor {
        async fn query(&mut self, sql: &str) -> Result<Vec<Row>, ExecutorError>;
        async fn query_params(&mut self, sql: &str, params: &[SqlParam]) -> Result<Vec<Row>, ExecutorError>;
        async fn execute(&mut self, sql: &str) -> Result<u64, ExecutorError>;
        async fn execute_params(&mut self, sql: &str, params: &[SqlParam]) -> Result<u64, ExecutorError>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_param_display_matches_literal_form() {
        assert_eq!(SqlParam::I64(42).to_string(), "42");
        assert_eq!(SqlParam::String("x".into()).to_string(), "x");
        assert_eq!(SqlParam::Null.to_string(), "NULL");
        assert_eq!(SqlParam::VarBinary(vec![0xab, 0x01]).to_string(), "0xab01");
    }
}
