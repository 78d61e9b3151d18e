//! Concurrent request scheduler.
//!
//! [`RequestRunner`] owns the store handle and drives any number of
//! [`RequestQueue`]s:
//!
//! ```text
//!   tick ──► cancel requested tags ──► expire deadlines ──► start runnable
//!     ▲                                                        │
//!     └──── completion / progress / poll interval ◄────────────┘
//! ```
//!
//! Queues are polled round-robin, one request per queue per pass, with at
//! most `max_concurrent` requests in flight. Nothing new starts while the
//! connection is uploading trailing data.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::constants::DEFAULT_CANCEL_TIMEOUT;
use crate::constants::N_CONCURRENT;
use crate::constants::POLL_INTERVAL;
use crate::error::StoreResult;
use crate::traits::ObjectStore;
use crate::traits::execute;
use crate::types::ConnectionState;
use crate::types::Progress;
use crate::types::RequestContext;
use crate::types::RequestTag;
use crate::types::StoreRequest;
use crate::types::StoreResponse;

type Completion = (RequestTag, StoreResult<StoreResponse>);

/// A source of store requests that consumes their results.
///
/// State machines implement this; the runner never interprets results.
pub trait RequestQueue: Send {
    /// Next request to start, if any. Called at most once per pass.
    fn next_runnable(&mut self) -> Option<StoreRequest>;

    /// A request finished. Includes cancelled requests and, for finished
    /// queues, orphaned requests whose results should be discarded.
    fn request_done(&mut self, tag: &RequestTag, result: StoreResult<StoreResponse>);

    /// A running request reported progress.
    fn request_progress(&mut self, _tag: &RequestTag, _progress: &Progress) {}

    /// Tags the queue wants cancelled on this tick.
    fn drain_cancellations(&mut self) -> Vec<RequestTag> {
        Vec::new()
    }

    /// True once the queue needs no further requests.
    fn is_finished(&self) -> bool;
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every queue reported finished.
    Finished,
    /// Nothing is running and no queue has work, yet some queue is not done.
    Stalled,
}

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub max_concurrent: usize,
    /// Time a request may run without progress before it is cancelled.
    pub cancel_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: N_CONCURRENT,
            cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
            poll_interval: POLL_INTERVAL,
        }
    }
}

struct Running {
    queue: usize,
    deadline: Instant,
    cancel: CancellationToken,
    kind: &'static str,
}

/// Round-robin scheduler over request queues.
pub struct RequestRunner<S: ObjectStore + ?Sized> {
    store: Arc<S>,
    config: RunnerConfig,
    next_queue: usize,
}

impl<S: ObjectStore + ?Sized + 'static> RequestRunner<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, RunnerConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: RunnerConfig) -> Self {
        debug_assert!(config.max_concurrent > 0);
        Self {
            store,
            config,
            next_queue: 0,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Drive `queues` until all are finished or the run stalls.
    ///
    /// Requests still in flight when the run ends are orphaned: they keep
    /// running in a detached task and their results are dropped.
    pub async fn run(&mut self, queues: &mut [&mut dyn RequestQueue]) -> RunOutcome {
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(RequestTag, Progress)>();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, Completion>> = FuturesUnordered::new();
        let mut running: HashMap<RequestTag, Running> = HashMap::new();
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            Self::apply_cancellations(queues, &running);
            self.expire_deadlines(&running);
            self.start_runnable(queues, &mut running, &mut in_flight, &progress_tx);

            if queues.iter().all(|queue| queue.is_finished()) {
                break RunOutcome::Finished;
            }
            if in_flight.is_empty() && self.store.connection_state() != ConnectionState::Uploading {
                break RunOutcome::Stalled;
            }

            tokio::select! {
                Some((tag, result)) = in_flight.next() => {
                    match running.remove(&tag) {
                        Some(entry) => {
                            trace!(tag = %tag, kind = entry.kind, ok = result.is_ok(), "request finished");
                            queues[entry.queue].request_done(&tag, result);
                        }
                        None => debug!(tag = %tag, "completion for unknown request"),
                    }
                }
                Some((tag, progress)) = progress_rx.recv() => {
                    if let Some(entry) = running.get_mut(&tag) {
                        entry.deadline = Instant::now() + self.config.cancel_timeout;
                        queues[entry.queue].request_progress(&tag, &progress);
                    }
                }
                _ = ticker.tick() => {}
            }
        };

        if !in_flight.is_empty() {
            debug!(orphans = in_flight.len(), "detaching orphaned requests");
            tokio::spawn(async move {
                while let Some((tag, result)) = in_flight.next().await {
                    trace!(tag = %tag, ok = result.is_ok(), "orphaned request finished");
                }
            });
        }
        outcome
    }

    fn apply_cancellations(queues: &mut [&mut dyn RequestQueue], running: &HashMap<RequestTag, Running>) {
        for queue in queues.iter_mut() {
            for tag in queue.drain_cancellations() {
                if let Some(entry) = running.get(&tag) {
                    debug!(tag = %tag, "cancelling request");
                    entry.cancel.cancel();
                }
            }
        }
    }

    fn expire_deadlines(&self, running: &HashMap<RequestTag, Running>) {
        let now = Instant::now();
        for (tag, entry) in running {
            if entry.deadline <= now && !entry.cancel.is_cancelled() {
                warn!(tag = %tag, kind = entry.kind, "request timed out, cancelling");
                entry.cancel.cancel();
            }
        }
    }

    fn start_runnable(
        &mut self,
        queues: &mut [&mut dyn RequestQueue],
        running: &mut HashMap<RequestTag, Running>,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Completion>>,
        progress_tx: &mpsc::UnboundedSender<(RequestTag, Progress)>,
    ) {
        if queues.is_empty() {
            return;
        }
        loop {
            let mut started = false;
            for offset in 0..queues.len() {
                if running.len() >= self.config.max_concurrent
                    || self.store.connection_state() == ConnectionState::Uploading
                {
                    return;
                }
                let index = (self.next_queue + offset) % queues.len();
                if queues[index].is_finished() {
                    continue;
                }
                let Some(request) = queues[index].next_runnable() else {
                    continue;
                };
                started = true;
                running.insert(request.tag.clone(), self.spawn(index, request, in_flight, progress_tx));
            }
            self.next_queue = (self.next_queue + 1) % queues.len();
            if !started {
                return;
            }
        }
    }

    fn spawn(
        &self,
        queue: usize,
        request: StoreRequest,
        in_flight: &mut FuturesUnordered<BoxFuture<'static, Completion>>,
        progress_tx: &mpsc::UnboundedSender<(RequestTag, Progress)>,
    ) -> Running {
        let ctx = RequestContext::new(request.tag.clone()).with_progress(progress_tx.clone());
        let entry = Running {
            queue,
            deadline: Instant::now() + self.config.cancel_timeout,
            cancel: ctx.cancel.clone(),
            kind: request.kind.name(),
        };
        debug!(tag = %request.tag, kind = entry.kind, "starting request");

        let store = self.store.clone();
        in_flight.push(Box::pin(async move {
            let result = execute(store.as_ref(), &ctx, &request.kind).await;
            (request.tag, result)
        }));
        entry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use bytes::Bytes;

    use super::*;
    use crate::error::StoreError;
    use crate::memory_store::InMemoryObjectStore;
    use crate::types::RequestKind;

    /// Queue that issues a fixed list of puts and records results.
    struct ListQueue {
        pending: VecDeque<StoreRequest>,
        outstanding: usize,
        max_outstanding: usize,
        results: Vec<StoreResult<StoreResponse>>,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
        cancel: Vec<RequestTag>,
    }

    impl ListQueue {
        fn puts(label: &str, n: usize) -> Self {
            Self::logged(label, n, Arc::default())
        }

        fn logged(label: &str, n: usize, log: Arc<parking_lot::Mutex<Vec<String>>>) -> Self {
            let pending = (0..n)
                .map(|i| {
                    StoreRequest::new(label, RequestKind::PutChk {
                        data: Bytes::from(format!("{label}-{i}")),
                        mime: None,
                        dont_compress: true,
                    })
                })
                .collect();
            Self {
                pending,
                outstanding: 0,
                max_outstanding: 0,
                results: Vec::new(),
                log,
                cancel: Vec::new(),
            }
        }
    }

    impl RequestQueue for ListQueue {
        fn next_runnable(&mut self) -> Option<StoreRequest> {
            let request = self.pending.pop_front()?;
            self.outstanding += 1;
            self.max_outstanding = self.max_outstanding.max(self.outstanding);
            self.log.lock().push(request.tag.to_string());
            Some(request)
        }

        fn request_done(&mut self, _tag: &RequestTag, result: StoreResult<StoreResponse>) {
            self.outstanding -= 1;
            self.results.push(result);
        }

        fn drain_cancellations(&mut self) -> Vec<RequestTag> {
            std::mem::take(&mut self.cancel)
        }

        fn is_finished(&self) -> bool {
            self.pending.is_empty() && self.outstanding == 0
        }
    }

    struct NeverDone;

    impl RequestQueue for NeverDone {
        fn next_runnable(&mut self) -> Option<StoreRequest> {
            None
        }

        fn request_done(&mut self, _tag: &RequestTag, _result: StoreResult<StoreResponse>) {}

        fn is_finished(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_all_requests_within_bound() {
        let store = InMemoryObjectStore::new();
        store.set_latency(Duration::from_millis(50));
        let mut runner = RequestRunner::new(Arc::new(store.clone()));
        let mut queue = ListQueue::puts("put", 10);

        let outcome = runner.run(&mut [&mut queue]).await;
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(queue.results.len(), 10);
        assert!(queue.results.iter().all(|r| r.is_ok()));
        assert_eq!(queue.max_outstanding, N_CONCURRENT);
        assert_eq!(store.stats().chk_puts, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_robin_across_queues() {
        let store = InMemoryObjectStore::new();
        store.set_latency(Duration::from_millis(10));
        let mut runner = RequestRunner::with_config(Arc::new(store), RunnerConfig {
            max_concurrent: 2,
            ..RunnerConfig::default()
        });
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut a = ListQueue::logged("a", 3, log.clone());
        let mut b = ListQueue::logged("b", 3, log.clone());

        runner.run(&mut [&mut a, &mut b]).await;
        // The first pass starts one request from each queue.
        let started = log.lock().clone();
        assert_eq!(started.len(), 6);
        assert!(started[0].starts_with("a-"));
        assert!(started[1].starts_with("b-"));
        assert_eq!(a.results.len(), 3);
        assert_eq!(b.results.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cancels_slow_requests() {
        let store = InMemoryObjectStore::new();
        store.set_latency(Duration::from_secs(600));
        let mut runner = RequestRunner::with_config(Arc::new(store), RunnerConfig {
            cancel_timeout: Duration::from_secs(5),
            ..RunnerConfig::default()
        });
        let mut queue = ListQueue::puts("slow", 2);

        let outcome = runner.run(&mut [&mut queue]).await;
        assert_eq!(outcome, RunOutcome::Finished);
        assert_eq!(queue.results.len(), 2);
        assert!(queue.results.iter().all(|r| matches!(r, Err(StoreError::Cancelled { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_requested_cancellation() {
        let store = InMemoryObjectStore::new();
        store.set_latency(Duration::from_secs(600));
        let mut runner = RequestRunner::new(Arc::new(store));

        struct CancelFirst(ListQueue);
        impl RequestQueue for CancelFirst {
            fn next_runnable(&mut self) -> Option<StoreRequest> {
                let request = self.0.next_runnable()?;
                self.0.cancel.push(request.tag.clone());
                Some(request)
            }
            fn request_done(&mut self, tag: &RequestTag, result: StoreResult<StoreResponse>) {
                self.0.request_done(tag, result)
            }
            fn drain_cancellations(&mut self) -> Vec<RequestTag> {
                self.0.drain_cancellations()
            }
            fn is_finished(&self) -> bool {
                self.0.is_finished()
            }
        }

        let mut queue = CancelFirst(ListQueue::puts("c", 1));
        assert_eq!(runner.run(&mut [&mut queue]).await, RunOutcome::Finished);
        assert!(matches!(queue.0.results[0], Err(StoreError::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_uploading_holds_new_requests() {
        let store = InMemoryObjectStore::new();
        store.set_connection_state(ConnectionState::Uploading);
        let mut runner = RequestRunner::new(Arc::new(store.clone()));
        let mut queue = ListQueue::puts("held", 1);

        let release = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                assert_eq!(store.stats().chk_puts, 0);
                store.set_connection_state(ConnectionState::Connected);
            })
        };
        assert_eq!(runner.run(&mut [&mut queue]).await, RunOutcome::Finished);
        release.await.unwrap();
        assert_eq!(store.stats().chk_puts, 1);
    }

    #[tokio::test]
    async fn test_stalls_when_no_work() {
        let mut runner = RequestRunner::new(Arc::new(InMemoryObjectStore::new()));
        assert_eq!(runner.run(&mut [&mut NeverDone]).await, RunOutcome::Stalled);
    }
}
