/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The configuration record consumed by the core (§6).

use serde::{Deserialize, Serialize};

/// Recognized run-level options. Every field has a documented default and the
/// constructor rejects the zero values that would make the corresponding component
/// meaningless (a zero batch size, a zero-width worker pool, a zero timeout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub batch_size: u32,
    pub max_parallel_tables: u32,
    pub connection_timeout_seconds: u32,
    pub command_timeout_seconds: u32,
    pub ledger_schema: String,
    pub ledger_table: String,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_parallel_tables: 5,
            connection_timeout_seconds: 30,
            command_timeout_seconds: 300,
            ledger_schema: "dbo".to_string(),
            ledger_table: "SyncMetadata".to_string(),
        }
    }
}

/// Raised by [`RunConfig::validate`] when a field is out of range.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid configuration: {0}")]
pub struct InvalidConfig(pub String);

impl RunConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if self.batch_size == 0 {
            return Err(InvalidConfig("batch_size must be positive".into()));
        }
        if self.max_parallel_tables == 0 {
            return Err(InvalidConfig("max_parallel_tables must be positive".into()));
        }
        if self.connection_timeout_seconds == 0 {
            return Err(InvalidConfig("connection_timeout_seconds must be positive".into()));
        }
        if self.command_timeout_seconds == 0 {
            return Err(InvalidConfig("command_timeout_seconds must be positive".into()));
        }
        if self.ledger_schema.is_empty() || self.ledger_table.is_empty() {
            return Err(InvalidConfig("ledger_schema and ledger_table must be non-empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = RunConfig::default();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.max_parallel_tables, 5);
        assert_eq!(cfg.connection_timeout_seconds, 30);
        assert_eq!(cfg.command_timeout_seconds, 300);
        assert_eq!(cfg.ledger_schema, "dbo");
        assert_eq!(cfg.ledger_table, "SyncMetadata");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let cfg = RunConfig { batch_size: 0, ..RunConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_ledger_table_is_rejected() {
        let cfg = RunConfig { ledger_table: String::new(), ..RunConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
