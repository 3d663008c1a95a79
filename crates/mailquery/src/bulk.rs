//! Chunked bulk mutations over a [`BulkService`].
//!
//! Ids are sent in sequential chunks. Each chunk's outcomes are appended in
//! request order, so the result lines up with the input ids.

use crate::error::Result;
use crate::service::{BulkService, FolderId, ItemError, ItemId, TransportError};

fn check_len<T>(outcomes: &[T], sent: usize) -> Result<()> {
    if outcomes.len() != sent {
        return Err(TransportError::MalformedResponse(format!(
            "bulk call returned {} outcomes for {} ids",
            outcomes.len(),
            sent
        ))
        .into());
    }
    Ok(())
}

/// Deletes `ids` in chunks of `chunk_size`.
///
/// A transport error aborts the remaining chunks.
pub fn delete_items<B: BulkService + ?Sized>(
    service: &B,
    ids: &[ItemId],
    chunk_size: usize,
) -> Result<Vec<Result<(), ItemError>>> {
    let mut outcomes = Vec::with_capacity(ids.len());
    for (n, chunk) in ids.chunks(chunk_size.max(1)).enumerate() {
        tracing::debug!(chunk = n, ids = chunk.len(), "deleting items");
        let results = service.delete(chunk)?;
        check_len(&results, chunk.len())?;
        outcomes.extend(results);
    }
    Ok(outcomes)
}

/// Moves `ids` to `folder` in chunks of `chunk_size`.
pub fn move_items<B: BulkService + ?Sized>(
    service: &B,
    ids: &[ItemId],
    folder: &FolderId,
    chunk_size: usize,
) -> Result<Vec<Result<ItemId, ItemError>>> {
    let mut outcomes = Vec::with_capacity(ids.len());
    for (n, chunk) in ids.chunks(chunk_size.max(1)).enumerate() {
        tracing::debug!(chunk = n, ids = chunk.len(), %folder, "moving items");
        let results = service.move_items(chunk, folder)?;
        check_len(&results, chunk.len())?;
        outcomes.extend(results);
    }
    Ok(outcomes)
}
