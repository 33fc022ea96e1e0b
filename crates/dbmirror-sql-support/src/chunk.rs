/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Batch-splitting helper used by the batch applier.
//!
//! Unlike SQLite's `SQLITE_LIMIT_VARIABLE_NUMBER`, SQL Server has no single fixed
//! parameter-count ceiling worth hard-coding here; the chunk size is instead the
//! user-configurable `batch_size` from `RunConfig`. This is a thin wrapper over
//! `[T]::chunks` that also reports each chunk's starting offset and awaits an async
//! callback per chunk, since every caller needs to issue statements against the
//! executor between chunks.

use std::future::Future;

/// Call `do_chunk` once per `chunk_size`-sized slice of `items`, in order, awaiting each
/// call before starting the next and short-circuiting on the first error.
pub async fn each_chunk<T, E, Fut>(
    items: &[T],
    chunk_size: usize,
    mut do_chunk: impl FnMut(&[T], usize) -> Fut,
) -> Result<(), E>
where
    Fut: Future<Output = Result<(), E>>,
{
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut offset = 0;
    for chunk in items.chunks(chunk_size) {
        do_chunk(chunk, offset).await?;
        offset += chunk.len();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_into_even_chunks() {
        let items = [1, 2, 3, 4, 5, 6];
        let mut seen = Vec::new();
        each_chunk::<_, (), _>(&items, 2, |chunk, offset| {
            seen.push((offset, chunk.to_vec()));
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![(0, vec![1, 2]), (2, vec![3, 4]), (4, vec![5, 6])]);
    }

    #[tokio::test]
    async fn last_chunk_may_be_short() {
        let items = [1, 2, 3, 4, 5];
        let mut seen = Vec::new();
        each_chunk::<_, (), _>(&items, 2, |chunk, offset| {
            seen.push((offset, chunk.to_vec()));
            async { Ok(()) }
        })
        .await
        .unwrap();
        assert_eq!(seen, vec![(0, vec![1, 2]), (2, vec![3, 4]), (4, vec![5])]);
    }

    #[tokio::test]
    async fn empty_input_calls_nothing() {
        let items: [i32; 0] = [];
        each_chunk::<_, (), _>(&items, 10, |_, _| async { panic!("should not be called") }).await.unwrap();
    }

    #[tokio::test]
    async fn stops_on_first_error() {
        let items = [1, 2, 3, 4];
        let mut calls = 0;
        let result = each_chunk::<_, &'static str, _>(&items, 1, |_, offset| {
            calls += 1;
            async move { if offset == 2 { Err("boom") } else { Ok(()) } }
        })
        .await;
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, 3);
    }
}
