//! Request coalescing for batched matchers.
//!
//! A [`BatchCoalescer`] collects `load` calls made during one tick,
//! deduplicates them by stable key, and hands the whole queue to a batch
//! function exactly once. A tick is one poll pass of the future driven by
//! [`BatchContext::drive`]: every `load` issued while that future is being
//! polled lands in the same batch, even across independent branches of an
//! expression tree.

use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::pin::pin;
use std::sync::Arc;
use std::task::Poll;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::error::{contain, BoxError, ErrorCause};
use crate::hash::stable_key_of;
use crate::types::Subject;

/// Future returned by a batch function.
pub type BatchFuture = BoxFuture<'static, std::result::Result<(), BoxError>>;

/// Batch function: receives every queued entry and must resolve each one.
pub type BatchFn<R> = Arc<dyn Fn(Vec<BatchEntry<R>>) -> BatchFuture + Send + Sync>;

/// Future handed out by [`BatchCoalescer::load`]. Cloneable; duplicates share it.
pub type LoadFuture = Shared<BoxFuture<'static, std::result::Result<bool, ResolverDropped>>>;

/// The batch function finished without resolving a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("batch request was dropped without being resolved")]
pub struct ResolverDropped;

/// One-shot completion handle for a queued request.
///
/// Cloneable; the first `resolve` wins and later calls are ignored.
#[derive(Clone)]
pub struct Resolver {
    slot: Arc<Mutex<Option<oneshot::Sender<bool>>>>,
}

impl Resolver {
    fn new(sender: oneshot::Sender<bool>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(sender))),
        }
    }

    /// Complete the request. Returns `false` if it was already resolved.
    pub fn resolve(&self, value: bool) -> bool {
        match self.slot.lock().take() {
            // The waiter may be gone; that is not our concern.
            Some(sender) => {
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_none()
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// A queued request paired with its resolver.
#[derive(Debug)]
pub struct BatchEntry<R> {
    pub request: R,
    pub resolver: Resolver,
}

/// Request queued by a batched matcher.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    /// The subject under evaluation
    pub subject: Subject,
    /// Bound (validated) arguments, if the matcher takes any
    pub args: Option<Value>,
}

/// A failed batch: the cause plus every resolver of the batch.
#[derive(Debug)]
pub struct BatchFailure {
    pub cause: ErrorCause,
    pub resolvers: Vec<Resolver>,
}

impl BatchFailure {
    /// Resolve every still-pending request. Returns how many were pending.
    pub fn resolve_all(&self, value: bool) -> usize {
        self.resolvers.iter().filter(|r| r.resolve(value)).count()
    }
}

struct Queue<R> {
    entries: Vec<BatchEntry<R>>,
    dedup: HashMap<String, LoadFuture>,
}

impl<R> Queue<R> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            dedup: HashMap::new(),
        }
    }
}

/// Drained queue, ready to hand to the batch function.
pub struct Batch<R> {
    entries: Vec<BatchEntry<R>>,
    batch_fn: BatchFn<R>,
}

impl<R: Send + 'static> Batch<R> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke the batch function once with every entry.
    ///
    /// On failure (error or panic) no request is resolved here; the caller
    /// decides what pending requests become.
    pub async fn run(self) -> std::result::Result<(), BatchFailure> {
        let resolvers: Vec<Resolver> = self.entries.iter().map(|e| e.resolver.clone()).collect();
        let batch_fn = self.batch_fn;
        let entries = self.entries;

        contain(move || batch_fn(entries))
            .await
            .map_err(|cause| BatchFailure { cause, resolvers })
    }
}

/// Coalesces same-tick requests into one batch function call.
pub struct BatchCoalescer<R> {
    batch_fn: BatchFn<R>,
    queue: Mutex<Queue<R>>,
}

impl<R: Send + 'static> BatchCoalescer<R> {
    /// Create a coalescer around a boxed batch function
    pub fn new(batch_fn: BatchFn<R>) -> Self {
        Self {
            batch_fn,
            queue: Mutex::new(Queue::new()),
        }
    }

    /// Create a coalescer from an async closure
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<BatchEntry<R>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        Self::new(Arc::new(move |entries: Vec<BatchEntry<R>>| -> BatchFuture {
            f(entries).boxed()
        }))
    }

    /// Queue a request under an explicit dedup key.
    ///
    /// If a request with the same key is already queued in the current batch,
    /// its future is returned instead of queueing a duplicate.
    pub fn load_keyed(&self, key: String, request: R) -> LoadFuture {
        let mut queue = self.queue.lock();
        if let Some(existing) = queue.dedup.get(&key) {
            return existing.clone();
        }

        let (tx, rx) = oneshot::channel();
        let load = async move { rx.await.map_err(|_| ResolverDropped) }
            .boxed()
            .shared();
        queue.entries.push(BatchEntry {
            request,
            resolver: Resolver::new(tx),
        });
        queue.dedup.insert(key, load.clone());
        load
    }

    /// Number of requests waiting for the next flush
    pub fn pending(&self) -> usize {
        self.queue.lock().entries.len()
    }

    /// Swap out the queue and dedup cache for fresh ones.
    ///
    /// Requests loaded after this call belong to the next batch.
    pub fn take_batch(&self) -> Option<Batch<R>> {
        let drained = std::mem::replace(&mut *self.queue.lock(), Queue::new());
        if drained.entries.is_empty() {
            return None;
        }
        Some(Batch {
            entries: drained.entries,
            batch_fn: self.batch_fn.clone(),
        })
    }

    /// Drain the queue and invoke the batch function once.
    pub async fn flush(&self) -> std::result::Result<(), BatchFailure> {
        match self.take_batch() {
            Some(batch) => batch.run().await,
            None => Ok(()),
        }
    }
}

impl<R: Serialize + Send + 'static> BatchCoalescer<R> {
    /// Queue a request, deduplicated by its stable structural key.
    pub fn load(&self, request: R) -> LoadFuture {
        match stable_key_of(&request) {
            Ok(key) => self.load_keyed(key, request),
            Err(_) => {
                // Unserializable requests cannot be compared; give each its own slot.
                let key = format!("#{}", self.pending());
                self.load_keyed(key, request)
            }
        }
    }
}

/// Per-evaluation registry of active coalescers, keyed by matcher name.
#[derive(Default)]
pub struct BatchContext {
    coalescers: Mutex<HashMap<String, Arc<BatchCoalescer<BatchRequest>>>>,
}

impl BatchContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the coalescer for `matcher`, creating it on first use.
    ///
    /// There is one coalescer per matcher name, not per argument value: a
    /// single batch function call may carry requests with different `args`.
    /// Requests with structurally equal arguments are deduplicated into one
    /// entry.
    pub fn coalescer<F>(&self, matcher: &str, make: F) -> Arc<BatchCoalescer<BatchRequest>>
    where
        F: FnOnce() -> BatchCoalescer<BatchRequest>,
    {
        self.coalescers
            .lock()
            .entry(matcher.to_string())
            .or_insert_with(|| Arc::new(make()))
            .clone()
    }

    /// Number of requests queued across every coalescer
    pub fn pending(&self) -> usize {
        self.coalescers.lock().values().map(|c| c.pending()).sum()
    }

    fn take_ready(&self) -> Vec<(String, Batch<BatchRequest>)> {
        let coalescers = self.coalescers.lock();
        coalescers
            .iter()
            .filter_map(|(name, c)| c.take_batch().map(|b| (name.clone(), b)))
            .collect()
    }

    /// Run `fut` to completion, flushing queued batches after every poll pass.
    ///
    /// Returns once `fut` has completed and every batch it started has
    /// finished; in-flight batch functions are never cancelled.
    pub async fn drive<F: Future>(&self, fut: F) -> F::Output {
        let mut fut = pin!(fut);
        let mut output: Option<F::Output> = None;
        let mut flushes: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        poll_fn(move |cx| {
            if output.is_none() {
                if let Poll::Ready(out) = fut.as_mut().poll(cx) {
                    output = Some(out);
                }
            }

            for (matcher, batch) in self.take_ready() {
                flushes.push(run_contained(matcher, batch).boxed());
            }
            while let Poll::Ready(Some(())) = flushes.poll_next_unpin(cx) {}

            if flushes.is_empty() {
                if let Some(out) = output.take() {
                    return Poll::Ready(out);
                }
            }
            Poll::Pending
        })
        .await
    }
}

/// Flush every non-empty queue in `batches`, once per batch.
///
/// A failing batch function never propagates: every request it left pending
/// is resolved to `false`. Returns the number of batches flushed.
pub async fn flush_all_batch_queues(batches: &BatchContext) -> usize {
    let mut flushed = 0;
    loop {
        let ready = batches.take_ready();
        if ready.is_empty() {
            return flushed;
        }
        flushed += ready.len();
        join_all(
            ready
                .into_iter()
                .map(|(matcher, batch)| run_contained(matcher, batch)),
        )
        .await;
    }
}

async fn run_contained(matcher: String, batch: Batch<BatchRequest>) {
    let size = batch.len();
    tracing::debug!(matcher = %matcher, size, "flushing batch");
    if let Err(failure) = batch.run().await {
        let pending = failure.resolve_all(false);
        tracing::warn!(
            matcher = %matcher,
            size,
            pending,
            error = %failure.cause,
            "batch evaluator failed, pending requests resolved to false"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_coalescer(
        calls: Arc<AtomicUsize>,
        sizes: Arc<Mutex<Vec<usize>>>,
    ) -> BatchCoalescer<Value> {
        BatchCoalescer::from_fn(move |entries: Vec<BatchEntry<Value>>| {
            calls.fetch_add(1, Ordering::SeqCst);
            sizes.lock().push(entries.len());
            async move {
                for entry in entries {
                    entry.resolver.resolve(entry.request == json!("yes"));
                }
                Ok(())
            }
        })
    }

    fn request_coalescer(calls: Arc<AtomicUsize>) -> BatchCoalescer<BatchRequest> {
        BatchCoalescer::from_fn(move |entries: Vec<BatchEntry<BatchRequest>>| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                for entry in entries {
                    entry.resolver.resolve(entry.request.args == Some(json!("yes")));
                }
                Ok(())
            }
        })
    }

    fn request(args: Value) -> BatchRequest {
        BatchRequest {
            subject: Subject::new(json!({"id": 1})),
            args: Some(args),
        }
    }

    #[tokio::test]
    async fn test_same_tick_requests_are_deduplicated() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = counting_coalescer(calls.clone(), sizes.clone());

        let a = coalescer.load(json!({"k": "yes", "n": 1}));
        let b = coalescer.load(json!({"n": 1, "k": "yes"}));
        assert_eq!(coalescer.pending(), 1);

        assert!(coalescer.flush().await.is_ok());
        assert_eq!(a.await, Ok(false));
        assert_eq!(b.await, Ok(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*sizes.lock(), vec![1]);
    }

    #[tokio::test]
    async fn test_new_batch_after_flush() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = counting_coalescer(calls.clone(), sizes.clone());

        let first = coalescer.load(json!("yes"));
        let second = coalescer.load(json!("no"));
        coalescer.flush().await.unwrap();
        assert_eq!(first.await, Ok(true));
        assert_eq!(second.await, Ok(false));

        let third = coalescer.load(json!("yes"));
        coalescer.flush().await.unwrap();
        assert_eq!(third.await, Ok(true));

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*sizes.lock(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_flush_of_empty_queue_is_a_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let coalescer = counting_coalescer(calls.clone(), Arc::new(Mutex::new(Vec::new())));
        assert!(coalescer.flush().await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_resolution_to_caller() {
        let coalescer: BatchCoalescer<Value> = BatchCoalescer::from_fn(|_entries| async {
            Err::<(), BoxError>("backend down".into())
        });

        let a = coalescer.load(json!(1));
        let b = coalescer.load(json!(2));
        let failure = coalescer.flush().await.unwrap_err();
        assert_eq!(failure.cause.to_string(), "backend down");
        assert_eq!(failure.resolvers.len(), 2);
        assert_eq!(failure.resolve_all(false), 2);
        assert_eq!(a.await, Ok(false));
        assert_eq!(b.await, Ok(false));
    }

    #[tokio::test]
    async fn test_panicking_batch_is_a_failure() {
        let coalescer: BatchCoalescer<Value> = BatchCoalescer::from_fn(|entries| async move {
            if !entries.is_empty() {
                panic!("batch exploded");
            }
            Ok(())
        });
        let load = coalescer.load(json!(1));
        let failure = coalescer.flush().await.unwrap_err();
        assert!(failure.cause.to_string().contains("batch exploded"));
        failure.resolve_all(false);
        assert_eq!(load.await, Ok(false));
    }

    #[tokio::test]
    async fn test_unresolved_request_reports_dropped() {
        let coalescer: BatchCoalescer<Value> = BatchCoalescer::from_fn(|_entries| async { Ok(()) });
        let load = coalescer.load(json!("ignored"));
        coalescer.flush().await.unwrap();
        assert_eq!(load.await, Err(ResolverDropped));
    }

    #[tokio::test]
    async fn test_request_during_flush_joins_next_batch() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let coalescer = counting_coalescer(calls.clone(), sizes.clone());

        let first = coalescer.load(json!("yes"));
        let batch = coalescer.take_batch().expect("one request queued");

        // The swap already happened, so this starts a new batch even though
        // the first one has not run yet.
        let late = coalescer.load(json!("yes"));
        assert_eq!(coalescer.pending(), 1);

        batch.run().await.unwrap();
        assert_eq!(first.await, Ok(true));

        coalescer.flush().await.unwrap();
        assert_eq!(late.await, Ok(true));
        assert_eq!(*sizes.lock(), vec![1, 1]);
    }

    #[test]
    fn test_resolver_first_call_wins() {
        let (tx, mut rx) = oneshot::channel();
        let resolver = Resolver::new(tx);
        let clone = resolver.clone();
        assert!(resolver.resolve(true));
        assert!(!clone.resolve(false));
        assert!(clone.is_resolved());
        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[tokio::test]
    async fn test_drive_coalesces_loads_from_one_poll_pass() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batches = BatchContext::new();
        let coalescer = batches.coalescer("hasFlag", || request_coalescer(calls.clone()));

        let c1 = coalescer.clone();
        let c2 = coalescer.clone();
        let (a, b) = batches
            .drive(futures::future::join(
                async move { c1.load(request(json!("yes"))).await },
                async move { c2.load(request(json!("no"))).await },
            ))
            .await;

        assert_eq!(a, Ok(true));
        assert_eq!(b, Ok(false));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batches.pending(), 0);
    }

    #[tokio::test]
    async fn test_drive_flushes_dependent_loads_separately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let batches = BatchContext::new();
        let coalescer = batches.coalescer("hasFlag", || request_coalescer(calls.clone()));

        let result = batches
            .drive(async move {
                let first = coalescer.load(request(json!("yes"))).await;
                let second = coalescer.load(request(json!("no"))).await;
                (first, second)
            })
            .await;

        assert_eq!(result, (Ok(true), Ok(false)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_flush_all_resolves_failures_to_false() {
        let batches = BatchContext::new();
        let failing = batches.coalescer("remote", || {
            BatchCoalescer::from_fn(|_entries| async { Err::<(), BoxError>("timeout".into()) })
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let working = batches.coalescer("local", || request_coalescer(calls.clone()));

        let a = failing.load(request(json!("yes")));
        let b = working.load(request(json!("yes")));
        assert_eq!(batches.pending(), 2);

        assert_eq!(flush_all_batch_queues(&batches).await, 2);
        assert_eq!(a.await, Ok(false));
        assert_eq!(b.await, Ok(true));
        assert_eq!(flush_all_batch_queues(&batches).await, 0);
    }
}
