//! Request classification, bounded worker pools and the retry/metrics loop.
//!
//! Two pools sit in front of the [`ReplicationCoordinator`]:
//!
//! - the **grant pool** serves `PRESTAMO` requests. Callers get a
//!   [`GrantTicket`] and wait on it for at most `grant_timeout`; a timeout
//!   never cancels the worker.
//! - the **async pool** serves returns, renewals and failover notices. The
//!   caller is acknowledged before any work happens, so failures are recovered
//!   by writing the original request to a [`RetryQueues`] file.
//!
//! Both pools are fed through bounded `flume` channels. A full grant queue is
//! reported as [`DispatchError::QueueFull`]; a full async queue diverts the
//! request straight to its retry queue and answers `PENDING`.
//!
//! A background task drains the retry queues every `retry_interval` through
//! the same code paths as live traffic and logs a [`MetricsSnapshot`].

use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use flume::{Receiver, Sender, TrySendError};
use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{oneshot, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::LamportClock;
use crate::error::{DispatchError, StoreError};
use crate::metrics::{Counter, Metrics, MetricsSnapshot};
use crate::protocol::{self, Failure, Inbound, LoanRequest, RejectReason, Request, Response};
use crate::replication::ReplicationCoordinator;
use crate::retry_queue::{ProcessReport, RetryCategory, RetryQueues};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub grant_workers: usize,
    pub async_workers: usize,
    pub grant_queue_capacity: usize,
    pub async_queue_capacity: usize,
    /// How long a grant caller waits for its worker.
    pub grant_timeout: Duration,
    /// Period of the retry drain and metrics log.
    pub retry_interval: Duration,
    /// Extra grant attempts after a failover, before answering
    /// `GA_NoDisponible`.
    pub grant_retry_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        let parallelism = thread::available_parallelism().map_or(4, |n| n.get());
        Self {
            grant_workers: parallelism,
            async_workers: parallelism,
            grant_queue_capacity: 64,
            async_queue_capacity: 256,
            grant_timeout: Duration::from_secs(5),
            retry_interval: Duration::from_secs(10),
            grant_retry_attempts: 1,
        }
    }
}

struct GrantJob {
    order: LoanRequest,
    reply: oneshot::Sender<Response>,
}

struct AsyncJob {
    request: Request,
    raw: String,
}

/// Completion handle for one submitted grant.
#[must_use = "a grant ticket does nothing unless waited on"]
pub struct GrantTicket {
    rx: oneshot::Receiver<Response>,
    metrics: Arc<Metrics>,
}

impl GrantTicket {
    /// Waits for the worker's answer. On timeout the worker keeps going and
    /// its eventual result is discarded.
    pub async fn wait(self, timeout: Duration) -> Result<Response, DispatchError> {
        match time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(DispatchError::Closed),
            Err(_) => {
                self.metrics.record(Counter::Timeouts);
                Err(DispatchError::Timeout)
            }
        }
    }
}

/// Front door for every request line.
///
/// Grants go onto a bounded queue served by the grant pool, and the caller
/// waits for the result with a timeout. Returns, renewals and failover
/// signals are acknowledged at once and handled by the async pool. A
/// background task replays the retry queues on a fixed interval.
///
/// # Why two pools?
///
/// A grant needs an answer, so its queue must stay short and fail fast with
/// `ERROR:QueueFull`. Returns and renewals only need to happen eventually,
/// so when their pool is busy they spill into the durable retry queue
/// instead of being rejected.
pub struct Dispatcher {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Spawns both worker pools and the background task on the current Tokio
    /// runtime.
    pub fn start(
        config: DispatcherConfig,
        coordinator: Arc<ReplicationCoordinator>,
        queues: Arc<RetryQueues>,
        clock: Arc<LamportClock>,
    ) -> Self {
        let (grant_tx, grant_rx) = flume::bounded(config.grant_queue_capacity.max(1));
        let (async_tx, async_rx) = flume::bounded(config.async_queue_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            config,
            coordinator,
            queues,
            clock,
            metrics: Arc::new(Metrics::default()),
            grant_tx,
            async_tx,
        });

        let mut tasks = Vec::new();
        for worker in 0..shared.config.grant_workers.max(1) {
            tasks.push(tokio::spawn(grant_worker(
                worker,
                Arc::clone(&shared),
                grant_rx.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        for worker in 0..shared.config.async_workers.max(1) {
            tasks.push(tokio::spawn(async_worker(
                worker,
                Arc::clone(&shared),
                async_rx.clone(),
                shutdown_tx.subscribe(),
            )));
        }
        tasks.push(tokio::spawn(background_task(
            Arc::clone(&shared),
            shutdown_tx.subscribe(),
        )));

        info!(
            grant_workers = shared.config.grant_workers,
            async_workers = shared.config.async_workers,
            grant_queue_capacity = shared.config.grant_queue_capacity,
            async_queue_capacity = shared.config.async_queue_capacity,
            "dispatcher started"
        );

        Self {
            shared,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn coordinator(&self) -> &Arc<ReplicationCoordinator> {
        &self.shared.coordinator
    }

    pub fn queues(&self) -> &Arc<RetryQueues> {
        &self.shared.queues
    }

    pub fn clock(&self) -> &Arc<LamportClock> {
        &self.shared.clock
    }

    /// Parses, stamps and routes one request line, returning the reply.
    pub async fn handle(&self, line: &str) -> Response {
        let inbound = match protocol::parse(line) {
            Ok(inbound) => inbound,
            Err(err) => {
                debug!(error = %err, request = line.trim(), "rejecting request");
                if let protocol::ParseError::Unknown = err {
                    return Response::Unknown;
                }
                self.shared.clock.stamp(err.remote_ts());
                self.shared.metrics.record(Counter::Rejected);
                return err.response(self.shared.clock.tick());
            }
        };

        let Inbound {
            request,
            remote_ts,
            raw,
        } = inbound;
        match request {
            Request::Grant(order) => {
                self.shared.clock.stamp(remote_ts);
                self.request_grant(order).await
            }
            Request::Enqueue { category, payload } => {
                self.shared.clock.stamp(remote_ts);
                self.enqueue(category, payload).await
            }
            request => {
                self.shared.clock.stamp(remote_ts);
                self.shared.submit_async(request, raw).await
            }
        }
    }

    /// Pushes a grant onto the bounded grant queue without waiting.
    pub fn submit_grant(&self, order: LoanRequest) -> Result<GrantTicket, DispatchError> {
        self.shared.submit_grant(order)
    }

    async fn request_grant(&self, order: LoanRequest) -> Response {
        let outcome = match self.shared.submit_grant(order) {
            Ok(ticket) => ticket.wait(self.shared.config.grant_timeout).await,
            Err(err) => Err(err),
        };
        outcome.unwrap_or_else(|err| {
            warn!(error = %err, "grant not answered");
            Response::Failure(Failure::from(err))
        })
    }

    async fn enqueue(&self, category: RetryCategory, payload: String) -> Response {
        match self.shared.defer(category, payload).await {
            Ok(()) => Response::Enqueued,
            Err(err) => {
                error!(error = ?err, %category, "failed to persist enqueued payload");
                Response::Failure(Failure::InternalError)
            }
        }
    }

    /// Runs one pass over every retry queue right now.
    pub async fn drain_retry_queues(&self) -> Result<ProcessReport> {
        drain(&self.shared).await
    }

    /// Counters, queue depths and replica state right now.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.snapshot()
    }

    /// Stops the background task, lets the workers finish what is already
    /// queued and waits for all of them. Later calls return immediately.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        if tasks.is_empty() {
            return;
        }
        for result in join_all(tasks).await {
            if let Err(err) = result {
                warn!(error = ?err, "dispatcher task ended abnormally");
            }
        }
        info!("dispatcher stopped");
    }
}

struct Shared {
    config: DispatcherConfig,
    coordinator: Arc<ReplicationCoordinator>,
    queues: Arc<RetryQueues>,
    clock: Arc<LamportClock>,
    metrics: Arc<Metrics>,
    grant_tx: Sender<GrantJob>,
    async_tx: Sender<AsyncJob>,
}

impl Shared {
    fn submit_grant(&self, order: LoanRequest) -> Result<GrantTicket, DispatchError> {
        let (reply, rx) = oneshot::channel();
        match self.grant_tx.try_send(GrantJob { order, reply }) {
            Ok(()) => Ok(GrantTicket {
                rx,
                metrics: Arc::clone(&self.metrics),
            }),
            Err(TrySendError::Full(_)) => {
                self.metrics.record(Counter::Saturated);
                Err(DispatchError::QueueFull)
            }
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::Closed),
        }
    }

    async fn submit_async(&self, request: Request, raw: String) -> Response {
        let Some(category) = request.retry_category() else {
            return Response::Failure(Failure::Unsupported);
        };
        match self.async_tx.try_send(AsyncJob { request, raw }) {
            Ok(()) => Response::Ack,
            Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => {
                self.metrics.record(Counter::Saturated);
                match self.defer(category, job.raw).await {
                    Ok(()) => Response::Pending,
                    Err(err) => {
                        error!(error = ?err, %category, "async pool saturated and retry queue unwritable");
                        Response::Failure(Failure::InternalError)
                    }
                }
            }
        }
    }

    /// Appends `payload` to the retry queue of `category`.
    async fn defer(&self, category: RetryCategory, payload: String) -> Result<()> {
        let queues = Arc::clone(&self.queues);
        task::spawn_blocking(move || queues.enqueue(category, &payload))
            .await
            .context("retry enqueue task panicked")?
            .with_context(|| format!("failed to append to {category} retry queue"))?;
        self.metrics.record(Counter::Deferred);
        Ok(())
    }

    async fn failover(&self, reason: &str) {
        let coordinator = Arc::clone(&self.coordinator);
        match task::spawn_blocking(move || coordinator.trigger_failover()).await {
            Ok(outcome) if outcome.performed => {
                warn!(reason, resynced = outcome.resynced, "failover performed");
            }
            Ok(_) => debug!(reason, "failover already done"),
            Err(err) => error!(error = ?err, reason, "failover task panicked"),
        }
    }

    async fn run_grant(&self, order: LoanRequest) -> Response {
        let mut attempt = 0;
        loop {
            let coordinator = Arc::clone(&self.coordinator);
            let call = order.clone();
            let result = task::spawn_blocking(move || {
                coordinator.grant_loan(&call.user_id, &call.book_code, &call.start_date, &call.end_date)
            })
            .await;

            match result {
                Ok(Ok(Some(loan))) => {
                    self.metrics.record(Counter::Processed);
                    info!(loan_id = %loan.id, user_id = %loan.user_id, book_code = %loan.book_code, "loan granted");
                    return Response::Granted {
                        loan_id: loan.id,
                        ts: self.clock.tick(),
                    };
                }
                Ok(Ok(None)) => {
                    self.metrics.record(Counter::Rejected);
                    return Response::Rejected {
                        reason: RejectReason::NoCopies,
                        ts: self.clock.tick(),
                    };
                }
                Ok(Err(err)) if err.is_unavailable() => {
                    self.failover("grant hit unavailable store").await;
                    if attempt < self.config.grant_retry_attempts {
                        attempt += 1;
                        self.metrics.record(Counter::Retried);
                        continue;
                    }
                    self.metrics.record(Counter::Failed);
                    return Response::Rejected {
                        reason: RejectReason::StoreUnavailable,
                        ts: self.clock.tick(),
                    };
                }
                Ok(Err(err)) => {
                    self.metrics.record(Counter::Failed);
                    error!(error = %err, book_code = %order.book_code, "grant failed");
                    return Response::Failure(Failure::InternalError);
                }
                Err(err) => {
                    self.metrics.record(Counter::Failed);
                    error!(error = ?err, "grant task panicked");
                    return Response::Failure(Failure::InternalError);
                }
            }
        }
    }

    /// Applies a return or renewal on the active store.
    async fn apply_write(&self, request: &Request) -> Result<Result<bool, StoreError>> {
        let coordinator = Arc::clone(&self.coordinator);
        let request = request.clone();
        task::spawn_blocking(move || match &request {
            Request::Return { loan_id } => Ok(coordinator.register_return(loan_id)),
            Request::Renewal {
                loan_id,
                new_end_date,
            } => Ok(coordinator.register_renewal(loan_id, new_end_date)),
            other => Err(anyhow!("{} is not a store write", other.kind())),
        })
        .await
        .context("store write task panicked")?
    }

    async fn run_async(&self, job: AsyncJob) {
        let AsyncJob { request, raw } = job;
        let Some(category) = request.retry_category() else {
            warn!(kind = request.kind(), "unexpected request on async pool");
            return;
        };

        if let Request::Failover { site } = &request {
            info!(%site, "failover requested");
            self.failover("control message").await;
            self.metrics.record(Counter::Processed);
            return;
        }

        let outcome = match self.apply_write(&request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = ?err, kind = request.kind(), "async write failed");
                self.metrics.record(Counter::Failed);
                self.defer_or_log(category, raw).await;
                return;
            }
        };

        match outcome {
            Ok(true) => self.metrics.record(Counter::Processed),
            Ok(false) => {
                self.metrics.record(Counter::Rejected);
                info!(kind = request.kind(), request = %raw, "write rejected by store");
            }
            Err(err) => {
                self.metrics.record(Counter::Failed);
                warn!(error = %err, kind = request.kind(), "write failed, deferring to retry queue");
                let unavailable = err.is_unavailable();
                self.defer_or_log(category, raw).await;
                if unavailable {
                    self.failover("async write hit unavailable store").await;
                }
            }
        }
    }

    async fn defer_or_log(&self, category: RetryCategory, raw: String) {
        if let Err(err) = self.defer(category, raw.clone()).await {
            error!(error = ?err, %category, request = %raw, "failed to defer write, operation lost");
        }
    }

    /// Replays one retry queue item. `Ok(true)` removes it from the queue.
    async fn replay(&self, category: RetryCategory, item: &str) -> Result<bool> {
        self.metrics.record(Counter::Retried);
        let inbound = match protocol::parse(item) {
            Ok(inbound) => inbound,
            Err(err) => {
                warn!(%category, item, error = %err, "dropping unparseable retry item");
                return Ok(true);
            }
        };
        self.clock.stamp(inbound.remote_ts);

        match inbound.request {
            Request::Grant(order) => {
                let response = match self.submit_grant(order) {
                    Ok(ticket) => ticket.wait(self.config.grant_timeout).await,
                    Err(err) => Err(err),
                }
                .unwrap_or_else(|err| Response::Failure(Failure::from(err)));
                debug!(%category, %response, "replayed grant");
                Ok(response.is_terminal())
            }
            Request::Failover { site } => {
                info!(%site, "replaying failover request");
                self.failover("replayed control message").await;
                Ok(true)
            }
            Request::Enqueue { .. } => {
                warn!(%category, item, "dropping nested enqueue envelope");
                Ok(true)
            }
            request => match self.apply_write(&request).await? {
                Ok(applied) => {
                    let counter = if applied {
                        Counter::Processed
                    } else {
                        Counter::Rejected
                    };
                    self.metrics.record(counter);
                    info!(%category, applied, kind = request.kind(), "replayed deferred write");
                    Ok(true)
                }
                Err(err) if err.is_unavailable() => {
                    self.failover("replay hit unavailable store").await;
                    Ok(false)
                }
                Err(err) => Err(anyhow::Error::new(err).context("replay failed")),
            },
        }
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.metrics.counters(),
            grant_queue_depth: self.grant_tx.len(),
            async_queue_depth: self.async_tx.len(),
            retry_queue_depth: self.queues.depth(),
            clock: self.clock.current(),
            primary_active: self.coordinator.primary_active(),
            replica_state: self.coordinator.state(),
            replication: self.coordinator.replication_stats(),
        }
    }
}

async fn grant_worker(
    worker: usize,
    shared: Arc<Shared>,
    rx: Receiver<GrantJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "grant worker started");
    loop {
        let job = select! {
            biased;
            job = rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };

        let GrantJob { order, reply } = job;
        if reply.is_closed() {
            debug!(worker, book_code = %order.book_code, "caller already left, granting anyway");
        }
        let response = shared.run_grant(order).await;
        if let Err(response) = reply.send(response) {
            info!(worker, %response, "grant finished after its caller timed out, result discarded");
        }
    }
    debug!(worker, "grant worker stopped");
}

async fn async_worker(
    worker: usize,
    shared: Arc<Shared>,
    rx: Receiver<AsyncJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "async worker started");
    loop {
        let job = select! {
            biased;
            job = rx.recv_async() => match job {
                Ok(job) => job,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        shared.run_async(job).await;
    }
    debug!(worker, "async worker stopped");
}

async fn background_task(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(shared.config.retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match drain(&shared).await {
                    Ok(report) if report.processed > 0 || report.kept > 0 => {
                        info!(processed = report.processed, kept = report.kept, errors = report.errors, "retry queues drained");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = ?err, "retry drain failed"),
                }
                log_metrics(&shared);
            }
        }
    }
    debug!("background task stopped");
}

fn log_metrics(shared: &Shared) {
    match serde_json::to_string(&shared.snapshot()) {
        Ok(json) => info!(metrics = %json, "dispatcher metrics"),
        Err(err) => warn!(error = %err, "failed to encode metrics"),
    }
}

async fn drain(shared: &Arc<Shared>) -> Result<ProcessReport> {
    let shared = Arc::clone(shared);
    let handle = Handle::current();
    task::spawn_blocking(move || {
        shared
            .queues
            .process_all(|category, item| handle.block_on(shared.replay(category, item)))
    })
    .await
    .context("retry drain task panicked")?
    .context("failed to rewrite retry queue")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Book;
    use crate::store::StorageEngine;

    struct Fixture {
        _dir: tempfile::TempDir,
        dispatcher: Dispatcher,
    }

    fn fixture(config: DispatcherConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let primary = Arc::new(StorageEngine::in_memory("primary"));
        let secondary = Arc::new(StorageEngine::in_memory("secondary"));
        let books = [Book::new("L1", "El Quijote", "Cervantes", 2)];
        primary.seed(books.clone()).unwrap();
        secondary.seed(books).unwrap();
        let coordinator = Arc::new(ReplicationCoordinator::new(primary, secondary).unwrap());
        let queues = Arc::new(RetryQueues::open(dir.path()).unwrap());
        let dispatcher = Dispatcher::start(config, coordinator, queues, Arc::new(LamportClock::new()));
        Fixture {
            _dir: dir,
            dispatcher,
        }
    }

    fn small_config() -> DispatcherConfig {
        DispatcherConfig {
            grant_workers: 2,
            async_workers: 2,
            grant_timeout: Duration::from_secs(2),
            retry_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grant_round_trip_stamps_reply() {
        let fixture = fixture(small_config());
        let response = fixture
            .dispatcher
            .handle("PRESTAMO;usuarioId=U1;libroCodigo=L1;inicio=a;fin=b;ts=10")
            .await;
        let (loan_id, ts) = match response {
            Response::Granted { loan_id, ts } => (loan_id, ts),
            other => panic!("unexpected response {other}"),
        };
        assert!(ts > 10);
        assert!(fixture.dispatcher.coordinator().primary().loan(&loan_id).is_some());
        fixture.dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_and_malformed_requests() {
        let fixture = fixture(small_config());
        assert_eq!(fixture.dispatcher.handle("HOLA").await, Response::Unknown);
        assert_eq!(
            fixture.dispatcher.handle("DEVOLUCION;ts=20").await,
            Response::Rejected {
                reason: RejectReason::Malformed,
                ts: 22,
            }
        );
        assert_eq!(
            fixture.dispatcher.handle("ENQUEUE;type=Nada;carga=x").await,
            Response::Failure(Failure::UnknownType)
        );
        fixture.dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unavailable_grant_fails_over_and_retries() {
        let fixture = fixture(small_config());
        fixture.dispatcher.coordinator().primary().set_available(false);

        let response = fixture
            .dispatcher
            .handle("PRESTAMO;usuarioId=U1;libroCodigo=L1;inicio=a;fin=b")
            .await;
        assert!(matches!(response, Response::Granted { .. }), "{response}");
        assert!(!fixture.dispatcher.coordinator().primary_active());
        assert_eq!(fixture.dispatcher.metrics().counters.retried, 1);
        fixture.dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn grant_answers_store_unavailable_when_both_sides_are_down() {
        let fixture = fixture(small_config());
        let coordinator = fixture.dispatcher.coordinator();
        coordinator.primary().set_available(false);
        coordinator.secondary().set_available(false);

        let response = fixture
            .dispatcher
            .handle("PRESTAMO;usuarioId=U1;libroCodigo=L1;inicio=a;fin=b")
            .await;
        assert!(matches!(
            response,
            Response::Rejected {
                reason: RejectReason::StoreUnavailable,
                ..
            }
        ));
        fixture.dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueue_envelope_persists_payload() {
        let fixture = fixture(small_config());
        let response = fixture
            .dispatcher
            .handle("ENQUEUE;type=Devolucion;carga=DEVOLUCION;prestamoId=zz")
            .await;
        assert_eq!(response, Response::Enqueued);
        assert_eq!(
            fixture
                .dispatcher
                .queues()
                .queue(RetryCategory::Return)
                .snapshot()
                .unwrap(),
            vec!["DEVOLUCION;prestamoId=zz"]
        );

        // Unknown loan: replay is a terminal rejection and the item goes away.
        let report = fixture.dispatcher.drain_retry_queues().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(fixture.dispatcher.queues().depth(), 0);
        fixture.dispatcher.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enqueue_envelope_observes_the_payload_timestamp() {
        let fixture = fixture(small_config());
        let response = fixture
            .dispatcher
            .handle("ENQUEUE;type=Devolucion;carga=DEVOLUCION;prestamoId=a;ts=100")
            .await;
        assert_eq!(response, Response::Enqueued);
        assert!(fixture.dispatcher.clock().current() > 100);

        let before = fixture.dispatcher.clock().current();
        fixture
            .dispatcher
            .handle("ENQUEUE;type=Control;carga=site=1;event=FAILOVER")
            .await;
        assert!(fixture.dispatcher.clock().current() > before);
        fixture.dispatcher.shutdown().await;
    }
}
