//! Correlation registry: in-flight correlation ids to waiting callers.
//!
//! Uses `DashMap` so registering, resolving and cancelling from many tasks
//! only contends on a single shard. Each entry owns a oneshot sender, which
//! makes "exactly one resolution per pending call" a property of the type:
//! whoever removes the entry is the only party that can complete it.
//!
//! The id that travels on the wire is the caller's id tagged with the
//! registration's generation (`{id}:{generation}`). A reply addressed to an
//! earlier registration of the same caller id therefore never resolves a
//! later one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_core::{CorrelationId, ResponseEnvelope};
use tokio::sync::oneshot;
use tracing::warn;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Why a pending call ended without a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's deadline elapsed.
    Timeout,
    /// The client is shutting down.
    ClientClosed,
}

/// The single outcome delivered to a waiter.
#[derive(Debug)]
pub enum Resolution {
    Response(ResponseEnvelope),
    Cancelled(CancelReason),
}

/// Errors returned by [`CorrelationRegistry::register`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("correlation id `{0}` is already pending")]
    DuplicateCorrelationId(CorrelationId),
    #[error("correlation id must not be empty")]
    EmptyCorrelationId,
}

/// Bookkeeping for one in-flight request.
#[derive(Debug)]
struct PendingCall {
    completion: oneshot::Sender<Resolution>,
    created_at: Instant,
    /// Distinguishes this registration from any later one reusing the id.
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    pending: DashMap<CorrelationId, PendingCall>,
    next_generation: AtomicU64,
    late_deliveries: AtomicU64,
}

// ---------------------------------------------------------------------------
// CorrelationRegistry
// ---------------------------------------------------------------------------

/// Thread-safe map from correlation id to pending call.
///
/// Cloning is cheap and yields a handle to the same registry.
#[derive(Debug, Clone, Default)]
pub struct CorrelationRegistry {
    inner: Arc<Inner>,
}

impl CorrelationRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a pending call for `id` and returns the handle its caller
    /// waits on.
    ///
    /// # Errors
    ///
    /// - `RegistryError::EmptyCorrelationId` if `id` is empty
    /// - `RegistryError::DuplicateCorrelationId` if `id` is already pending;
    ///   the existing registration is left untouched
    pub fn register(&self, id: CorrelationId) -> Result<CompletionHandle, RegistryError> {
        if id.is_empty() {
            return Err(RegistryError::EmptyCorrelationId);
        }
        match self.inner.pending.entry(id.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateCorrelationId(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                slot.insert(PendingCall {
                    completion: tx,
                    created_at: Instant::now(),
                    generation,
                });
                Ok(CompletionHandle {
                    wire_id: wire_id(&id, generation),
                    id,
                    generation,
                    rx,
                    registry: Arc::clone(&self.inner),
                })
            }
        }
    }

    /// Delivers `response` to the waiter whose wire id it carries.
    ///
    /// The waiter receives the response with the caller's own id restored.
    /// Returns `false` when nobody is waiting (late, duplicate or stale
    /// delivery); the response is discarded and counted.
    pub fn resolve(&self, mut response: ResponseEnvelope) -> bool {
        let removed = split_wire_id(&response.correlation_id).and_then(|(id, generation)| {
            self.inner
                .pending
                .remove_if(&id, |_, pending| pending.generation == generation)
        });
        let Some((id, pending)) = removed else {
            self.inner.late_deliveries.fetch_add(1, Ordering::Relaxed);
            warn!(
                correlation_id = %response.correlation_id,
                "discarding late or duplicate response"
            );
            return false;
        };

        let waited = pending.created_at.elapsed();
        response.correlation_id = id.clone();
        if pending.completion.send(Resolution::Response(response)).is_err() {
            // Waiter was dropped between removal and send; same as late.
            self.inner.late_deliveries.fetch_add(1, Ordering::Relaxed);
            warn!(correlation_id = %id, "waiter gone before response arrived");
            return false;
        }
        tracing::trace!(correlation_id = %id, waited_ms = millis(waited), "response delivered");
        true
    }

    /// Removes `id` and wakes its waiter with `reason`.
    ///
    /// Returns `false` if `id` was not pending.
    pub fn cancel(&self, id: &CorrelationId, reason: CancelReason) -> bool {
        match self.inner.pending.remove(id) {
            Some((_, pending)) => {
                let _ = pending.completion.send(Resolution::Cancelled(reason));
                true
            }
            None => false,
        }
    }

    /// Cancels every pending call. Returns how many were cancelled.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let ids: Vec<CorrelationId> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        ids.iter().filter(|id| self.cancel(id, reason)).count()
    }

    /// Number of pending calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.pending.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.inner.pending.contains_key(id)
    }

    /// Responses discarded because no waiter matched them.
    #[must_use]
    pub fn late_deliveries(&self) -> u64 {
        self.inner.late_deliveries.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// CompletionHandle
// ---------------------------------------------------------------------------

/// Waiter side of a pending call.
///
/// Dropping the handle before it resolves removes the pending call, so an
/// abandoned caller never leaks an entry.
#[derive(Debug)]
pub struct CompletionHandle {
    id: CorrelationId,
    wire_id: CorrelationId,
    generation: u64,
    rx: oneshot::Receiver<Resolution>,
    registry: Arc<Inner>,
}

impl CompletionHandle {
    #[must_use]
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    /// The id to put on the request so its reply resolves this handle.
    #[must_use]
    pub fn wire_id(&self) -> &CorrelationId {
        &self.wire_id
    }

    /// Waits for the call's single resolution.
    pub async fn wait(mut self) -> Resolution {
        // The sender only disappears without sending if the entry was
        // dropped wholesale, which happens when the registry goes away.
        (&mut self.rx)
            .await
            .unwrap_or(Resolution::Cancelled(CancelReason::ClientClosed))
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        let generation = self.generation;
        self.registry
            .pending
            .remove_if(&self.id, |_, pending| pending.generation == generation);
    }
}

fn wire_id(id: &CorrelationId, generation: u64) -> CorrelationId {
    CorrelationId::new(format!("{id}:{generation}"))
}

/// Splits a wire id into the caller's id and the generation suffix.
fn split_wire_id(wire: &CorrelationId) -> Option<(CorrelationId, u64)> {
    let (id, generation) = wire.as_str().rsplit_once(':')?;
    Some((CorrelationId::from(id), generation.parse().ok()?))
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn reply_to(handle: &CompletionHandle, body: &'static [u8]) -> ResponseEnvelope {
        ResponseEnvelope::success(handle.wire_id().clone(), Bytes::from_static(body))
    }

    fn payload_of(resolution: Resolution) -> Bytes {
        match resolution {
            Resolution::Response(resp) => resp.payload,
            Resolution::Cancelled(r) => panic!("unexpected cancel: {r:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_delivers_to_registered_waiter() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register(CorrelationId::from("a")).unwrap();

        assert!(registry.resolve(reply_to(&handle, b"ok")));
        match handle.wait().await {
            Resolution::Response(resp) => {
                assert_eq!(resp.correlation_id.as_str(), "a");
                assert_eq!(&resp.payload[..], b"ok");
            }
            Resolution::Cancelled(r) => panic!("unexpected cancel: {r:?}"),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn wire_id_carries_generation() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register(CorrelationId::from("a:b")).unwrap();
        let (id, _) = split_wire_id(handle.wire_id()).unwrap();
        assert_eq!(id.as_str(), "a:b");
        assert_ne!(handle.wire_id(), handle.id());
    }

    #[test]
    fn duplicate_registration_fails_and_keeps_original() {
        let registry = CorrelationRegistry::new();
        let _first = registry.register(CorrelationId::from("dup")).unwrap();

        let err = registry.register(CorrelationId::from("dup")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateCorrelationId(CorrelationId::from("dup"))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn empty_id_is_refused() {
        let registry = CorrelationRegistry::new();
        let err = registry.register(CorrelationId::from("")).unwrap_err();
        assert_eq!(err, RegistryError::EmptyCorrelationId);
        assert!(registry.is_empty());
    }

    #[test]
    fn resolve_without_waiter_counts_late_delivery() {
        let registry = CorrelationRegistry::new();
        let ghost = ResponseEnvelope::success(CorrelationId::from("ghost:0"), Bytes::new());
        assert!(!registry.resolve(ghost));
        assert_eq!(registry.late_deliveries(), 1);
    }

    #[test]
    fn untagged_reply_is_late_even_if_id_is_pending() {
        let registry = CorrelationRegistry::new();
        let _handle = registry.register(CorrelationId::from("plain")).unwrap();

        let untagged = ResponseEnvelope::success(CorrelationId::from("plain"), Bytes::new());
        assert!(!registry.resolve(untagged));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.late_deliveries(), 1);
    }

    #[tokio::test]
    async fn cancel_wakes_waiter_with_reason() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register(CorrelationId::from("t")).unwrap();
        let late = reply_to(&handle, b"late");

        assert!(registry.cancel(&CorrelationId::from("t"), CancelReason::Timeout));
        assert!(matches!(
            handle.wait().await,
            Resolution::Cancelled(CancelReason::Timeout)
        ));
        // Response after cancellation is a late delivery.
        assert!(!registry.resolve(late));
        assert_eq!(registry.late_deliveries(), 1);
    }

    #[test]
    fn cancel_unknown_id_is_noop() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.cancel(&CorrelationId::from("nope"), CancelReason::Timeout));
    }

    #[tokio::test]
    async fn cancel_all_drains_every_waiter() {
        let registry = CorrelationRegistry::new();
        let handles: Vec<_> = (0..5)
            .map(|i| registry.register(CorrelationId::new(format!("id-{i}"))).unwrap())
            .collect();

        assert_eq!(registry.cancel_all(CancelReason::ClientClosed), 5);
        assert!(registry.is_empty());
        for handle in handles {
            assert!(matches!(
                handle.wait().await,
                Resolution::Cancelled(CancelReason::ClientClosed)
            ));
        }
    }

    #[test]
    fn dropping_handle_removes_entry() {
        let registry = CorrelationRegistry::new();
        let handle = registry.register(CorrelationId::from("drop")).unwrap();
        assert!(registry.contains(&CorrelationId::from("drop")));
        drop(handle);
        assert!(!registry.contains(&CorrelationId::from("drop")));
    }

    #[test]
    fn stale_handle_drop_does_not_evict_new_registration() {
        let registry = CorrelationRegistry::new();
        let old = registry.register(CorrelationId::from("reuse")).unwrap();
        assert!(registry.cancel(&CorrelationId::from("reuse"), CancelReason::Timeout));

        let _new = registry.register(CorrelationId::from("reuse")).unwrap();
        drop(old);
        assert!(registry.contains(&CorrelationId::from("reuse")));
    }

    #[tokio::test]
    async fn late_response_does_not_leak_into_next_call() {
        let registry = CorrelationRegistry::new();
        let first = registry.register(CorrelationId::from("first")).unwrap();
        let stale = reply_to(&first, b"stale");
        registry.cancel(first.id(), CancelReason::Timeout);
        drop(first);

        let second = registry.register(CorrelationId::from("second")).unwrap();
        assert!(!registry.resolve(stale));
        assert!(registry.resolve(reply_to(&second, b"fresh")));
        assert_eq!(&payload_of(second.wait().await)[..], b"fresh");
    }

    #[tokio::test]
    async fn late_response_for_reused_id_is_discarded() {
        let registry = CorrelationRegistry::new();
        let first = registry.register(CorrelationId::from("same")).unwrap();
        let old_reply = reply_to(&first, b"OLD");
        registry.cancel(first.id(), CancelReason::Timeout);
        drop(first);

        let second = registry.register(CorrelationId::from("same")).unwrap();
        assert!(!registry.resolve(old_reply));
        assert!(registry.contains(&CorrelationId::from("same")));
        assert_eq!(registry.late_deliveries(), 1);

        assert!(registry.resolve(reply_to(&second, b"NEW")));
        assert_eq!(&payload_of(second.wait().await)[..], b"NEW");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_register_resolve_cancel_keeps_single_entry_per_id() {
        let registry = CorrelationRegistry::new();
        let mut tasks = Vec::new();

        for worker in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let mut outcomes = Vec::new();
                let mut duplicates = 0;
                for round in 0..200 {
                    // Eight workers fight over 16 shared ids.
                    let id = CorrelationId::new(format!("shared-{}", (worker + round) % 16));
                    match registry.register(id.clone()) {
                        Ok(handle) => {
                            if round % 2 == 0 {
                                assert!(registry.resolve(reply_to(&handle, b"")));
                            } else {
                                assert!(registry.cancel(&id, CancelReason::Timeout));
                            }
                            outcomes.push((round, handle.wait().await));
                        }
                        Err(RegistryError::DuplicateCorrelationId(_)) => duplicates += 1,
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                (outcomes, duplicates)
            }));
        }

        let mut total = 0;
        for task in tasks {
            let (outcomes, duplicates) = task.await.unwrap();
            assert_eq!(outcomes.len() + duplicates, 200);
            for (round, outcome) in outcomes {
                match outcome {
                    Resolution::Response(_) => assert_eq!(round % 2, 0),
                    Resolution::Cancelled(CancelReason::Timeout) => assert_eq!(round % 2, 1),
                    Resolution::Cancelled(other) => panic!("unexpected cancel: {other:?}"),
                }
                total += 1;
            }
        }
        assert!(total > 0);
        assert!(registry.is_empty());
        assert_eq!(registry.late_deliveries(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register(u8),
        Resolve(u8),
        ResolveStale(u8),
        Cancel(u8),
        DropHandle(u8),
    }

    fn op() -> impl proptest::strategy::Strategy<Value = Op> {
        use proptest::prelude::*;
        prop_oneof![
            (0u8..4).prop_map(Op::Register),
            (0u8..4).prop_map(Op::Resolve),
            (0u8..4).prop_map(Op::ResolveStale),
            (0u8..4).prop_map(Op::Cancel),
            (0u8..4).prop_map(Op::DropHandle),
        ]
    }

    proptest::proptest! {
        /// The registry agrees with a plain set model under any operation
        /// sequence: at most one pending call per id, removal on every
        /// outcome, replies to earlier registrations never delivered, and
        /// misses counted as late deliveries.
        #[test]
        fn registry_matches_set_model(ops in proptest::collection::vec(op(), 0..64)) {
            use std::collections::HashMap;

            let registry = CorrelationRegistry::new();
            let mut handles: HashMap<u8, CompletionHandle> = HashMap::new();
            // Wire id of the most recent registration of each id.
            let mut wire_ids: HashMap<u8, CorrelationId> = HashMap::new();
            // Wire id of the registration before that.
            let mut stale: HashMap<u8, CorrelationId> = HashMap::new();
            let mut late = 0u64;

            for op in ops {
                match op {
                    Op::Register(n) => {
                        let result = registry.register(CorrelationId::from(n.to_string()));
                        if handles.contains_key(&n) {
                            proptest::prop_assert!(result.is_err());
                        } else {
                            let handle = result.unwrap();
                            if let Some(previous) = wire_ids.insert(n, handle.wire_id().clone()) {
                                stale.insert(n, previous);
                            }
                            handles.insert(n, handle);
                        }
                    }
                    Op::Resolve(n) => {
                        let wire = wire_ids
                            .get(&n)
                            .cloned()
                            .unwrap_or_else(|| CorrelationId::from(format!("{n}:0")));
                        let delivered = registry.resolve(ResponseEnvelope::success(wire, Bytes::new()));
                        proptest::prop_assert_eq!(delivered, handles.remove(&n).is_some());
                        if !delivered {
                            late += 1;
                        }
                    }
                    Op::ResolveStale(n) => {
                        if let Some(wire) = stale.get(&n).cloned() {
                            let delivered = registry.resolve(ResponseEnvelope::success(wire, Bytes::new()));
                            proptest::prop_assert!(!delivered);
                            late += 1;
                        }
                    }
                    Op::Cancel(n) => {
                        let cancelled = registry.cancel(&CorrelationId::from(n.to_string()), CancelReason::Timeout);
                        proptest::prop_assert_eq!(cancelled, handles.remove(&n).is_some());
                    }
                    Op::DropHandle(n) => {
                        handles.remove(&n);
                    }
                }
                proptest::prop_assert_eq!(registry.len(), handles.len());
            }
            proptest::prop_assert_eq!(registry.late_deliveries(), late);
        }
    }
}
