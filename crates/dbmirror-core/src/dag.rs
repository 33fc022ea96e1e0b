/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Dependency ordering shared by the DDL emitter and the orchestrator's scheduler
//! (§5, §9 "Dependency ordering"): a leveled topological sort over the foreign-key
//! graph restricted to the set of tables taking part in one run.

use crate::schema::model::{TableRef, TableSchema};
use std::collections::{HashMap, HashSet};

/// Partition `tables` into levels where every table in level *n* only references
/// tables (among those participating in this run) that appear in levels `< n`.
/// Self-references and reference cycles that can't be resolved by any ordering are
/// dumped into one final level together, rather than attempting a strict topological
/// sort that a cycle would make impossible, mirroring the DDL emitter's own
/// cycle-breaking approach instead of introducing a second, incompatible one.
pub fn level_order(tables: &[TableSchema]) -> Vec<Vec<TableRef>> {
    let present: HashSet<TableRef> = tables.iter().map(|t| t.table_ref.clone()).collect();

    let mut deps: HashMap<TableRef, HashSet<TableRef>> = HashMap::new();
    for table in tables {
        let mut d = HashSet::new();
        for fk in &table.foreign_keys {
            if fk.referenced_table != table.table_ref && present.contains(&fk.referenced_table) {
                d.insert(fk.referenced_table.clone());
            }
        }
        deps.insert(table.table_ref.clone(), d);
    }

    let mut placed: HashSet<TableRef> = HashSet::new();
    let mut levels: Vec<Vec<TableRef>> = Vec::new();
    let mut remaining: Vec<TableRef> = tables.iter().map(|t| t.table_ref.clone()).collect();

    while !remaining.is_empty() {
        let (ready, not_ready): (Vec<TableRef>, Vec<TableRef>) = remaining
            .into_iter()
            .partition(|t| deps[t].iter().all(|d| placed.contains(d)));

        if ready.is_empty() {
            levels.push(not_ready);
            break;
        }
        for t in &ready {
            placed.insert(t.clone());
        }
        levels.push(ready);
        remaining = not_ready;
    }

    levels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::model::{ForeignKeyAction, ForeignKeyDesc, KeyDesc};

    fn empty_table(name: &str, refs: &[&str]) -> TableSchema {
        TableSchema {
            table_ref: TableRef::new("dbo", name),
            columns: vec![],
            primary_key: KeyDesc::default(),
            unique_constraints: vec![],
            indexes: vec![],
            foreign_keys: refs
                .iter()
                .map(|r| ForeignKeyDesc {
                    name: format!("FK_{name}_{r}"),
                    columns: vec![],
                    referenced_table: TableRef::new("dbo", *r),
                    referenced_columns: vec![],
                    on_delete: ForeignKeyAction::NoAction,
                    on_update: ForeignKeyAction::NoAction,
                })
                .collect(),
            check_constraints: vec![],
            triggers: vec![],
        }
    }

    #[test]
    fn independent_tables_share_one_level() {
        let tables = vec![empty_table("A", &[]), empty_table("B", &[])];
        let levels = level_order(&tables);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }

    #[test]
    fn referenced_table_precedes_referencer() {
        let tables = vec![empty_table("Orders", &["Customers"]), empty_table("Customers", &[])];
        let levels = level_order(&tables);
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0], vec![TableRef::new("dbo", "Customers")]);
        assert_eq!(levels[1], vec![TableRef::new("dbo", "Orders")]);
    }

    #[test]
    fn self_reference_does_not_block_its_own_level() {
        let tables = vec![empty_table("Employee", &["Employee"])];
        let levels = level_order(&tables);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 1);
    }

    #[test]
    fn mutual_cycle_is_flushed_into_one_level() {
        let tables = vec![empty_table("A", &["B"]), empty_table("B", &["A"])];
        let levels = level_order(&tables);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }

    #[test]
    fn reference_outside_the_run_set_is_ignored() {
        let tables = vec![empty_table("Orders", &["Customers"])];
        let levels = level_order(&tables);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0], vec![TableRef::new("dbo", "Orders")]);
    }
}
