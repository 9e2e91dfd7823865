//! Synchronization controller.
//!
//! Keeps the local header index current against the chain daemon. The
//! controller polls both heights on a fixed interval, asks the
//! [`SyncStateMachine`] what to do, and fans outstanding work out across a
//! bounded number of concurrent [`HeaderDownloadTask`]s owned by the
//! [`TaskRegistry`]. Task completions come back through a single event
//! inbox, so every registry mutation and state transition is serialized
//! through the controller's own context and needs no locking.
//!
//! Status transitions are announced over a broadcast channel:
//! `Synchronizing` whenever a new attempt begins, `UpToDate` exactly once
//! per successful catch-up, and `SyncFailed` once per failed attempt (the
//! next poll retries after a bounded backoff).

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use futures03::future::join_all;
use lodestone_common::{
    dto::SyncStatus,
    models::BlockRange,
    storage::{HeaderGateway, StorageError},
    traits::{ClientListener, NoListener},
};
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::{
    select,
    sync::{broadcast, mpsc, watch},
    time::{interval_at, Instant as TokioInstant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::rpc::{DaemonRpc, RpcError};

pub mod registry;
pub mod state;
pub mod task;

pub use registry::{TaskId, TaskRegistry};
pub use state::{AttemptResolution, BackoffPolicy, SyncAction, SyncPhase, SyncStateMachine};
pub use task::{HeaderDownloadTask, SyncTask, TaskError, TaskEvent, TaskEventKind};

const EVENT_INBOX_SIZE: usize = 256;
const NOTIFY_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("storage unavailable at startup: {0}")]
    Storage(#[from] StorageError),

    #[error("daemon unreachable at startup: {0}")]
    Rpc(#[from] RpcError),
}

/// Status transitions announced to the rest of the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerEvent {
    /// A new catch-up attempt began. May fire again after failures.
    Synchronizing,
    /// The local index caught up with the daemon.
    UpToDate,
    /// A catch-up attempt failed; it is retried on a later poll.
    SyncFailed,
}

impl ControllerEvent {
    fn as_str(&self) -> &'static str {
        match self {
            ControllerEvent::Synchronizing => "synchronizing",
            ControllerEvent::UpToDate => "up-to-date",
            ControllerEvent::SyncFailed => "sync-failure",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SyncOpts {
    /// How often to poll the daemon for new headers.
    pub poll_interval: Duration,
    /// Upper bound on concurrent download tasks per attempt.
    pub max_tasks: NonZeroUsize,
    /// Headers requested per RPC call.
    pub headers_batch: u64,
    /// How long `cleanup` waits for outstanding tasks before discarding
    /// them.
    pub shutdown_grace: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SyncOpts {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            max_tasks: NonZeroUsize::new(4).expect("non-zero"),
            headers_batch: 2000,
            shutdown_grace: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl SyncOpts {
    fn validate(&self) -> Result<(), ControllerError> {
        if self.poll_interval.is_zero() {
            return Err(ControllerError::Config("poll interval must be positive".to_string()));
        }
        if self.headers_batch == 0 {
            return Err(ControllerError::Config("headers batch size must be positive".to_string()));
        }
        if self.backoff.base.is_zero() || self.backoff.base > self.backoff.cap {
            return Err(ControllerError::Config(
                "backoff base must be positive and not exceed the cap".to_string(),
            ));
        }
        Ok(())
    }
}

pub struct Controller<R, G, L> {
    opts: SyncOpts,
    rpc: Arc<R>,
    storage: Arc<G>,
    listener: Option<L>,
    listener_started: bool,
    registry: TaskRegistry,
    machine: SyncStateMachine,
    events_rx: mpsc::Receiver<TaskEvent>,
    notify_tx: broadcast::Sender<ControllerEvent>,
    status_tx: watch::Sender<SyncStatus>,
    /// Headers fully landed by succeeded tasks of the current attempt.
    headers_completed: u64,
}

impl<R, G> Controller<R, G, NoListener>
where
    R: DaemonRpc + 'static,
    G: HeaderGateway + 'static,
{
    pub fn new(opts: SyncOpts, rpc: Arc<R>, storage: Arc<G>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_INBOX_SIZE);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let machine = SyncStateMachine::new(opts.max_tasks, opts.backoff);
        Self {
            opts,
            rpc,
            storage,
            listener: None,
            listener_started: false,
            registry: TaskRegistry::new(events_tx),
            machine,
            events_rx,
            notify_tx,
            status_tx,
            headers_completed: 0,
        }
    }
}

impl<R, G, L> Controller<R, G, L>
where
    R: DaemonRpc + 'static,
    G: HeaderGateway + 'static,
    L: ClientListener,
{
    /// Attaches the client listener started after the first catch-up.
    pub fn with_listener<L2: ClientListener>(self, listener: L2) -> Controller<R, G, L2> {
        Controller {
            opts: self.opts,
            rpc: self.rpc,
            storage: self.storage,
            listener: Some(listener),
            listener_started: false,
            registry: self.registry,
            machine: self.machine,
            events_rx: self.events_rx,
            notify_tx: self.notify_tx,
            status_tx: self.status_tx,
            headers_completed: self.headers_completed,
        }
    }

    /// Notifications of sync status transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.notify_tx.subscribe()
    }

    /// Best-effort sync status snapshots, for introspection only.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    /// Validates configuration, probes both collaborators and performs one
    /// immediate poll. Errors abort server launch.
    pub async fn startup(&mut self) -> Result<(), ControllerError> {
        self.opts.validate()?;
        let local = self.storage.current_height().await?;
        let remote = self.rpc.tip_height().await?;
        info!(?local, remote, "controller starting");
        self.process(false).await;
        Ok(())
    }

    /// Runs the controller until `shutdown` fires, then drains outstanding
    /// tasks under the configured grace period.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ControllerError> {
        self.startup().await?;

        let mut poll =
            interval_at(TokioInstant::now() + self.opts.poll_interval, self.opts.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = poll.tick() => self.process(true).await,
                Some(event) = self.events_rx.recv() => self.on_task_event(event).await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.cleanup().await;
        Ok(())
    }

    /// One poll tick: query heights, consult the state machine, execute.
    pub async fn process(&mut self, be_silent_if_up_to_date: bool) {
        let local = match self.storage.current_height().await {
            Ok(height) => height,
            Err(err) => {
                error!(%err, "local height query failed");
                self.on_poll_failed(err.to_string());
                return;
            }
        };
        let remote = match self.rpc.tip_height().await {
            Ok(height) => height,
            Err(err) => {
                warn!(%err, "remote height query failed");
                self.on_poll_failed(err.to_string());
                return;
            }
        };

        let previous = self.machine.phase();
        match self.machine.on_poll(local, remote, Instant::now()) {
            SyncAction::NoOp => {
                if !be_silent_if_up_to_date && self.machine.phase() == SyncPhase::UpToDate {
                    self.notify(ControllerEvent::UpToDate);
                }
            }
            SyncAction::AwaitOutstanding => {
                debug!(outstanding = self.machine.outstanding(), "attempt in flight")
            }
            SyncAction::RetryAfterBackoff => debug!("failed attempt still cooling down"),
            SyncAction::DeclareUpToDate => self.declare_up_to_date(previous).await,
            SyncAction::DeclareFailure(reason) => self.declare_failure(&reason),
            SyncAction::StartSync(ranges) => self.start_attempt(previous, ranges),
        }
        self.publish_status();
    }

    fn on_poll_failed(&mut self, reason: String) {
        if let SyncAction::DeclareFailure(reason) =
            self.machine.on_poll_error(&reason, Instant::now())
        {
            self.declare_failure(&reason);
        }
        self.publish_status();
    }

    fn start_attempt(&mut self, previous: SyncPhase, ranges: Vec<BlockRange>) {
        self.headers_completed = 0;
        counter!("lodestone_sync_attempts_total").increment(1);
        info!(
            attempt = self.machine.attempt(),
            n_tasks = ranges.len(),
            from = ranges.first().map(|r| r.start),
            to = ranges.last().map(|r| r.end),
            "starting header download"
        );
        for range in ranges {
            let task = HeaderDownloadTask::new(
                range,
                self.opts.headers_batch,
                self.rpc.clone(),
                self.storage.clone(),
            );
            let id = self.registry.spawn(task);
            debug!(%id, %range, "download task scheduled");
        }
        if previous != SyncPhase::Synchronizing {
            self.notify(ControllerEvent::Synchronizing);
        }
    }

    async fn declare_up_to_date(&mut self, previous: SyncPhase) {
        info!(height = ?self.machine.local(), "caught up with daemon");
        if previous == SyncPhase::Synchronizing {
            self.notify(ControllerEvent::UpToDate);
        }
        self.start_listener_once().await;
    }

    async fn start_listener_once(&mut self) {
        if self.listener_started {
            return;
        }
        if let Some(listener) = self.listener.as_mut() {
            match listener.start().await {
                Ok(()) => {
                    self.listener_started = true;
                    info!("client listener started");
                }
                // retried on the next up-to-date transition
                Err(err) => error!(%err, "client listener failed to start"),
            }
        }
    }

    fn declare_failure(&mut self, reason: &str) {
        counter!("lodestone_sync_failures_total").increment(1);
        warn!(reason, "synchronization attempt failed");
        self.notify(ControllerEvent::SyncFailed);
    }

    async fn on_task_event(&mut self, event: TaskEvent) {
        if self.registry.is_deleted(event.id) {
            // delayed callback from a task torn down earlier
            debug!(id = %event.id, ?event.kind, "event for deleted task dropped");
            return;
        }
        match event.kind {
            TaskEventKind::Started => self.registry.mark_started(event.id),
            TaskEventKind::Progress(progress) => {
                self.registry.update_progress(event.id, progress)
            }
            TaskEventKind::Succeeded => {
                if let Some(range) = self.registry.get(event.id).and_then(|e| e.range) {
                    self.headers_completed += range.len();
                }
                self.registry.mark_succeeded(event.id);
                self.machine.on_task_success();
                debug!(id = %event.id, "task succeeded");
            }
            TaskEventKind::Errored(err) => self.on_task_errored(event.id, err),
            TaskEventKind::Finished => {
                self.registry.remove(event.id);
                if let Some(resolution) = self.machine.on_task_finished(Instant::now()) {
                    match resolution {
                        AttemptResolution::AllSucceeded => {
                            debug!("attempt complete, re-evaluating heights");
                            // the remote may have advanced while we were
                            // downloading; publish happens inside
                            self.process(true).await;
                            return;
                        }
                        AttemptResolution::Failed(reason) => self.declare_failure(&reason),
                        AttemptResolution::Aborted => debug!("attempt aborted"),
                    }
                }
            }
        }
        self.publish_status();
    }

    /// Generic handler wired to every task's errored signal: record the
    /// error and fail the attempt, stopping its remaining tasks.
    fn on_task_errored(&mut self, id: TaskId, err: TaskError) {
        warn!(%id, code = err.code, message = %err.message, "task errored");
        self.machine.on_task_error(&err.to_string());
        self.registry.record_error(id, err);
        self.registry.stop_all();
    }

    /// Stops every live task and waits for their finished signals, bounded
    /// by the shutdown grace period. Stragglers are forcibly discarded.
    async fn cleanup(&mut self) {
        info!(live_tasks = self.registry.len(), "controller shutting down");
        self.registry.stop_all();

        let deadline = TokioInstant::now() + self.opts.shutdown_grace;
        while !self.registry.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => {
                    if matches!(event.kind, TaskEventKind::Finished)
                        && !self.registry.is_deleted(event.id)
                    {
                        self.registry.remove(event.id);
                        if self.machine.outstanding() > 0 {
                            let _ = self.machine.on_task_finished(Instant::now());
                        }
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    let remaining = self.registry.len();
                    warn!(remaining, "tasks did not finish within grace period, discarding");
                    let handles = self.registry.abort_all();
                    join_all(handles).await;
                    break;
                }
            }
        }
        info!("controller shut down");
    }

    fn notify(&self, event: ControllerEvent) {
        info!(event = event.as_str(), "sync status transition");
        // nobody listening is fine
        let _ = self.notify_tx.send(event);
    }

    fn publish_status(&self) {
        let local = self.machine.local();
        let remote = self.machine.remote();
        gauge!("lodestone_local_height").set(local.unwrap_or(0) as f64);
        gauge!("lodestone_remote_height").set(remote.unwrap_or(0) as f64);
        gauge!("lodestone_live_tasks").set(self.registry.len() as f64);

        self.status_tx.send_replace(SyncStatus {
            phase: self.machine.phase().as_str().to_string(),
            local_height: local,
            remote_height: remote,
            headers_downloaded: self.headers_completed + self.registry.downloaded_estimate(),
            attempt: self.machine.attempt(),
            tasks: self.registry.statuses(),
            updated_at: Utc::now().naive_utc(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use lodestone_common::models::{BlockHash, HeaderRecord, Height};
    use lodestone_storage::HeaderStore;
    use pretty_assertions::assert_eq;
    use test_log::test;
    use tokio::time::timeout;

    use super::*;

    fn test_hash(height: Height) -> BlockHash {
        let mut bytes = [0u8; 32];
        bytes[..8].copy_from_slice(&height.to_be_bytes());
        bytes[31] = 0xab;
        BlockHash(bytes)
    }

    fn chain(range: BlockRange) -> Vec<HeaderRecord> {
        (range.start..range.end)
            .map(|height| HeaderRecord {
                height,
                hash: test_hash(height),
                prev_hash: if height == 0 {
                    BlockHash::default()
                } else {
                    test_hash(height - 1)
                },
                timestamp: 1_700_000_000 + height,
            })
            .collect()
    }

    /// Scriptable daemon stub. Ranges containing `fail_height` error after
    /// a short delay, so concurrently running sibling tasks commit first
    /// and the test observes deterministic partial progress.
    struct StubRpc {
        remote: AtomicU64,
        tip_fails: AtomicBool,
        fail_height: Mutex<Option<Height>>,
        fail_delay: Duration,
    }

    impl StubRpc {
        fn serving(remote: Height) -> Self {
            Self {
                remote: AtomicU64::new(remote),
                tip_fails: AtomicBool::new(false),
                fail_height: Mutex::new(None),
                fail_delay: Duration::from_millis(100),
            }
        }

        fn failing_range_at(self, height: Height) -> Self {
            *self.fail_height.lock().unwrap() = Some(height);
            self
        }

        fn clear_failures(&self) {
            *self.fail_height.lock().unwrap() = None;
            self.tip_fails.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DaemonRpc for StubRpc {
        async fn tip_height(&self) -> Result<Height, RpcError> {
            if self.tip_fails.load(Ordering::SeqCst) {
                return Err(RpcError::Unreachable("stub: daemon down".to_string()));
            }
            Ok(self.remote.load(Ordering::SeqCst))
        }

        async fn block_headers(&self, range: BlockRange) -> Result<Vec<HeaderRecord>, RpcError> {
            let failing = self
                .fail_height
                .lock()
                .unwrap()
                .map(|h| range.contains(h))
                .unwrap_or(false);
            if failing {
                tokio::time::sleep(self.fail_delay).await;
                return Err(RpcError::Unreachable("stub: connection refused".to_string()));
            }
            Ok(chain(range))
        }
    }

    #[derive(Clone, Default)]
    struct CountingListener {
        starts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ClientListener for CountingListener {
        async fn start(&mut self) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    type TestController = Controller<StubRpc, HeaderStore, CountingListener>;

    fn test_opts() -> SyncOpts {
        SyncOpts {
            poll_interval: Duration::from_millis(50),
            max_tasks: NonZeroUsize::new(3).expect("non-zero"),
            headers_batch: 300,
            shutdown_grace: Duration::from_secs(2),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(2),
            },
        }
    }

    async fn store_at(height: Option<Height>) -> Arc<HeaderStore> {
        let store = HeaderStore::in_memory();
        if let Some(height) = height {
            let range = BlockRange::new(0, height + 1);
            store.append_range(range, chain(range)).await.expect("preload");
        }
        Arc::new(store)
    }

    fn build_controller(
        opts: SyncOpts,
        rpc: StubRpc,
        store: Arc<HeaderStore>,
    ) -> (TestController, CountingListener) {
        let listener = CountingListener::default();
        let controller =
            Controller::new(opts, Arc::new(rpc), store).with_listener(listener.clone());
        (controller, listener)
    }

    /// Handles task events until no task of the current attempt is
    /// outstanding. Follow-up attempts planned on the way are driven too.
    async fn settle(controller: &mut TestController) {
        while controller.machine.outstanding() > 0 {
            let event = timeout(Duration::from_secs(5), controller.events_rx.recv())
                .await
                .expect("event within deadline")
                .expect("inbox open");
            controller.on_task_event(event).await;
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test(tokio::test)]
    async fn catches_up_and_notifies_exactly_once() {
        let store = store_at(Some(100)).await;
        let (mut controller, listener) = build_controller(test_opts(), StubRpc::serving(1000), store.clone());
        let mut notifications = controller.subscribe();
        let status = controller.status();

        controller.process(false).await;
        settle(&mut controller).await;

        assert_eq!(store.current_height().await, Ok(Some(1000)));
        assert_eq!(
            drain(&mut notifications),
            vec![ControllerEvent::Synchronizing, ControllerEvent::UpToDate]
        );
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
        assert!(controller.registry.is_empty());

        let snapshot = status.borrow().clone();
        assert_eq!(snapshot.phase, "up-to-date");
        assert_eq!(snapshot.local_height, Some(1000));
        assert_eq!(snapshot.remote_height, Some(1000));
        assert_eq!(snapshot.headers_downloaded, 900);

        // routine silent polls stay quiet and create no tasks
        for _ in 0..3 {
            controller.process(true).await;
        }
        assert_eq!(drain(&mut notifications), vec![]);
        assert!(controller.registry.is_empty());
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn partial_failure_keeps_progress_and_recovers() {
        let store = store_at(Some(100)).await;
        let rpc = StubRpc::serving(1000).failing_range_at(500);
        let (mut controller, listener) = build_controller(test_opts(), rpc, store.clone());
        let mut notifications = controller.subscribe();

        controller.process(false).await;
        settle(&mut controller).await;

        // the middle range failed; the two successful ranges persist but
        // the contiguous tip stops at the gap
        assert_eq!(store.current_height().await, Ok(Some(400)));
        assert_eq!(
            drain(&mut notifications),
            vec![ControllerEvent::Synchronizing, ControllerEvent::SyncFailed]
        );
        assert_eq!(listener.starts.load(Ordering::SeqCst), 0);

        // next poll after the backoff re-derives work from the new local
        // height and completes
        controller.rpc.clear_failures();
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.process(true).await;
        settle(&mut controller).await;

        assert_eq!(store.current_height().await, Ok(Some(1000)));
        assert_eq!(
            drain(&mut notifications),
            vec![ControllerEvent::Synchronizing, ControllerEvent::UpToDate]
        );
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn already_synced_startup_is_quiet_but_starts_the_listener() {
        let store = store_at(Some(100)).await;
        let (mut controller, listener) = build_controller(test_opts(), StubRpc::serving(100), store);
        let mut notifications = controller.subscribe();

        controller.process(false).await;
        assert_eq!(drain(&mut notifications), vec![]);
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);

        // a later non-silent poll announces the state again; silent polls
        // never do
        controller.process(false).await;
        assert_eq!(drain(&mut notifications), vec![ControllerEvent::UpToDate]);
        for _ in 0..3 {
            controller.process(true).await;
        }
        assert_eq!(drain(&mut notifications), vec![]);
        assert_eq!(listener.starts.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn remote_below_local_is_ignored() {
        let store = store_at(Some(100)).await;
        let (mut controller, listener) = build_controller(test_opts(), StubRpc::serving(90), store);
        let mut notifications = controller.subscribe();

        controller.process(true).await;
        assert_eq!(drain(&mut notifications), vec![]);
        assert!(controller.registry.is_empty());
        assert_eq!(listener.starts.load(Ordering::SeqCst), 0);
        assert_eq!(controller.status().borrow().phase, "idle");
    }

    #[test(tokio::test)]
    async fn poll_failure_notifies_once_then_backs_off() {
        let store = store_at(Some(100)).await;
        let rpc = StubRpc::serving(1000);
        rpc.tip_fails.store(true, Ordering::SeqCst);
        // wide backoff so the immediate re-poll below lands inside it
        let mut opts = test_opts();
        opts.backoff =
            BackoffPolicy { base: Duration::from_secs(60), cap: Duration::from_secs(120) };
        let (mut controller, _listener) = build_controller(opts, rpc, store);
        let mut notifications = controller.subscribe();

        controller.process(true).await;
        assert_eq!(drain(&mut notifications), vec![ControllerEvent::SyncFailed]);

        // immediate re-poll is inside the backoff window
        controller.process(true).await;
        assert_eq!(drain(&mut notifications), vec![]);
        assert_eq!(controller.status().borrow().phase, "failed");
    }

    #[test(tokio::test)]
    async fn storage_failure_fails_the_poll() {
        use lodestone_common::storage::MockHeaderGateway;

        let mut gateway = MockHeaderGateway::new();
        gateway
            .expect_current_height()
            .returning(|| Err(StorageError::Io("disk gone".to_string())));
        let mut controller =
            Controller::new(test_opts(), Arc::new(StubRpc::serving(100)), Arc::new(gateway));
        let mut notifications = controller.subscribe();

        controller.process(true).await;
        assert_eq!(drain(&mut notifications), vec![ControllerEvent::SyncFailed]);
        assert_eq!(controller.status().borrow().phase, "failed");
    }

    #[test(tokio::test)]
    async fn startup_propagates_daemon_errors() {
        let store = store_at(None).await;
        let rpc = StubRpc::serving(0);
        rpc.tip_fails.store(true, Ordering::SeqCst);
        let (mut controller, _listener) = build_controller(test_opts(), rpc, store);

        let err = controller.startup().await.expect_err("must fail");
        assert!(matches!(err, ControllerError::Rpc(_)), "got {err:?}");
    }

    #[test(tokio::test)]
    async fn invalid_options_fail_startup() {
        let store = store_at(None).await;
        let mut opts = test_opts();
        opts.headers_batch = 0;
        let mut controller = Controller::new(opts, Arc::new(StubRpc::serving(0)), store);

        let err = controller.startup().await.expect_err("must fail");
        assert!(matches!(err, ControllerError::Config(_)), "got {err:?}");
    }

    #[test(tokio::test)]
    async fn run_drains_tasks_on_shutdown() {
        let store = store_at(Some(0)).await;
        // the only range hangs until cancelled
        let rpc = StubRpc {
            fail_delay: Duration::from_secs(3600),
            ..StubRpc::serving(1000).failing_range_at(500)
        };
        let mut opts = test_opts();
        opts.max_tasks = NonZeroUsize::new(1).expect("non-zero");
        let (controller, _listener) = build_controller(opts, rpc, store);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(true).expect("receiver alive");
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("drains within deadline")
            .expect("run task completes")
            .expect("run returns ok");
    }
}
