// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pending request table.
//!
//! Maps request ids (sequence numbers) to write-once result slots. Mutated
//! from two contexts: callers issuing requests, and the transport thread
//! delivering responses. Every operation is a short shard-level critical
//! section of the underlying `DashMap`; nothing blocks on I/O.

use crate::error::{ServiceError, ServiceResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::oneshot;

/// Receiving half of a pending slot.
pub type SlotReceiver<T> = oneshot::Receiver<ServiceResult<T>>;

struct PendingRequest<T> {
    slot: oneshot::Sender<ServiceResult<T>>,
    issued_at: Instant,
}

/// Concurrent id -> pending result mapping, owned by one client engine.
pub struct CorrelationTable<T> {
    pending: DashMap<u64, PendingRequest<T>>,
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Create a pending slot for `id`.
    ///
    /// Fails with [`ServiceError::DuplicateId`] if `id` is already pending.
    /// Ids come from a single monotonic counter, so this indicates a bug.
    pub fn register(&self, id: u64) -> ServiceResult<SlotReceiver<T>> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(ServiceError::DuplicateId(id)),
            Entry::Vacant(vacant) => {
                let (tx, rx) = oneshot::channel();
                vacant.insert(PendingRequest {
                    slot: tx,
                    issued_at: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Complete and remove the slot for `id`.
    ///
    /// Returns false when nothing is pending under `id` (stale, duplicate or
    /// foreign response).
    pub fn resolve(&self, id: u64, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    /// Fail and remove the slot for `id`.
    pub fn fail(&self, id: u64, error: ServiceError) -> bool {
        self.complete(id, Err(error))
    }

    /// Fail every pending slot with `error` and clear the table.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, error: &ServiceError) -> usize {
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|&id| self.complete(id, Err(error.clone())))
            .count()
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    fn complete(&self, id: u64, result: ServiceResult<T>) -> bool {
        let Some((_, request)) = self.pending.remove(&id) else {
            return false;
        };
        log::debug!(
            "request {} completed after {:?} (ok={})",
            id,
            request.issued_at.elapsed(),
            result.is_ok()
        );
        // Receiver dropped means the caller stopped waiting
        let _ = request.slot.send(result);
        true
    }
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
