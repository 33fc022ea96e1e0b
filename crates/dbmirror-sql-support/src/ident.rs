/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! SQL Server identifier quoting.
//!
//! Object names are delimited with square brackets (`[name]`); a literal `]` inside a
//! name is escaped by doubling it, same as SQL Server's own bracket-escaping rule.

/// Quote a single identifier with square brackets.
pub fn quote_ident(name: &str) -> String {
    format!("[{}]", name.replace(']', "]]"))
}

/// Quote a `schema.table` (or `schema.table.column`) path, quoting each segment.
pub fn quote_qualified(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| quote_ident(s))
        .collect::<Vec<_>>()
        .join(".")
}
