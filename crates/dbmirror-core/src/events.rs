/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Structured progress events (§6) emitted over a bounded, non-blocking channel so the
//! core never calls back into a foreground collaborator synchronously (§9's "Threaded
//! UI decoupling" note).

use crate::schema::model::TableRef;
use crate::strategy::ChangeStrategy;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchKind {
    Delete,
    Update,
    Insert,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    TableStarted { table: TableRef },
    TableSchemaCreated { table: TableRef },
    TableStrategySelected { table: TableRef, strategy: ChangeStrategy },
    BatchApplied { table: TableRef, kind: BatchKind, rows: u64 },
    TableCompleted { table: TableRef, inserted: u64, updated: u64, deleted: u64 },
    TableFailed { table: TableRef, error_label: &'static str, message: String },
}

/// `tables_total`/`tables_ok`/`tables_failed` for one completed run (§6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tables_total: u32,
    pub tables_ok: u32,
    pub tables_failed: u32,
}

/// The sending half handed to every table worker. Cloning is cheap (an `mpsc::Sender`
/// clone); a full channel means the collaborator is falling behind, so sends never
/// block the replication pipeline waiting on a slow consumer: `try_send` drops an
/// event and logs rather than stall a worker indefinitely.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProgressEvent>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!("progress event dropped, collaborator is not keeping up: {e}");
        }
    }
}

/// Create a bounded progress-event channel; `capacity` should comfortably exceed the
/// number of events one table emits per batch so a momentarily-slow collaborator
/// doesn't cause drops under normal operation.
pub fn event_channel(capacity: usize) -> (EventSink, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSink::new(tx), rx)
}
