//! Outstanding-call registry.
//!
//! Maps a correlation id to the caller waiting for its reply. Entries are
//! removed when the reply arrives, or by [`PendingGuard`] when the caller stops
//! waiting (timeout, publish failure, dropped future). Abandoned ids are kept
//! as tombstones for a grace window so a late reply is dropped instead of
//! reaching a later call that reuses the id.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{RabbitRpcError, Result};
use crate::message::ReplyEnvelope;

/// What a waiting caller eventually receives
pub(crate) type CallOutcome = Result<ReplyEnvelope>;

/// A caller suspended on a reply
#[derive(Debug)]
pub struct PendingCall {
    response_tx: oneshot::Sender<CallOutcome>,
    pub started_at: Instant,
}

/// Concurrency-safe map of outstanding calls, shared by the callers and the
/// reply dispatcher
#[derive(Debug, Clone)]
pub struct PendingCalls {
    calls: Arc<DashMap<String, PendingCall>>,
    tombstones: Arc<DashMap<String, Instant>>,
    grace: Duration,
}

impl PendingCalls {
    /// `grace` is how long an abandoned id stays reserved
    pub fn new(grace: Duration) -> Self {
        Self {
            calls: Arc::new(DashMap::new()),
            tombstones: Arc::new(DashMap::new()),
            grace,
        }
    }

    /// Register `correlation_id` as outstanding. Fails if the id is already
    /// outstanding or was abandoned within the grace window.
    pub(crate) fn register(
        &self,
        correlation_id: &str,
    ) -> Result<(PendingGuard, oneshot::Receiver<CallOutcome>)> {
        self.purge_tombstones();
        if self.tombstones.contains_key(correlation_id) {
            return Err(RabbitRpcError::DuplicateCorrelationId(
                correlation_id.to_string(),
            ));
        }

        let (response_tx, response_rx) = oneshot::channel();
        match self.calls.entry(correlation_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(RabbitRpcError::DuplicateCorrelationId(
                    correlation_id.to_string(),
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    response_tx,
                    started_at: Instant::now(),
                });
            }
        }

        let guard = PendingGuard {
            calls: self.clone(),
            correlation_id: correlation_id.to_string(),
        };
        Ok((guard, response_rx))
    }

    /// Hand a reply to its caller. Returns `false` for unknown or late replies,
    /// which leave every outstanding call untouched.
    pub fn resolve(&self, reply: ReplyEnvelope) -> bool {
        let Some((correlation_id, call)) = self.calls.remove(&reply.correlation_id) else {
            if self.tombstones.contains_key(&reply.correlation_id) {
                debug!(
                    "Dropping late reply for abandoned correlation_id: {}",
                    reply.correlation_id
                );
            } else {
                warn!(
                    "Received reply for unknown correlation_id: {}",
                    reply.correlation_id
                );
            }
            return false;
        };

        debug!(
            "Resolved correlation_id {} after {:?}",
            correlation_id,
            call.started_at.elapsed()
        );
        if call.response_tx.send(Ok(reply)).is_err() {
            warn!("Failed to send response to caller (receiver dropped)");
        }
        true
    }

    /// Fail every outstanding call, e.g. when the reply stream is lost
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.calls.iter().map(|entry| entry.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call
                    .response_tx
                    .send(Err(RabbitRpcError::transport(reason)));
                failed += 1;
            }
        }
        failed
    }

    /// Number of outstanding calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    fn abandon(&self, correlation_id: &str) {
        if self.calls.remove(correlation_id).is_some() {
            self.tombstones
                .insert(correlation_id.to_string(), Instant::now() + self.grace);
        }
    }

    fn purge_tombstones(&self) {
        let now = Instant::now();
        self.tombstones.retain(|_, expires_at| *expires_at > now);
    }
}

/// Removes its registry entry when the caller stops waiting
#[derive(Debug)]
pub(crate) struct PendingGuard {
    calls: PendingCalls,
    correlation_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.abandon(&self.correlation_id);
    }
}
