/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Low-level SQL Server plumbing shared across the mirroring core: the executor
//! seam components talk through, identifier quoting, and batch-splitting.

mod chunk;
mod executor;
mod ident;

pub use chunk::each_chunk;
pub use executor::{ExecutorError, SqlExecutor, SqlParam, TiberiusExecutor};
pub use ident::{quote_ident, quote_qualified};

#[cfg(feature = "test-support")]
pub use executor::MockSqlExecutor;
