use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use broker_core::{RpcClient, RpcError};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{sync::watch, time};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{JobError, RunState, RunStore};

/// Method the "remote" worker serves: fetch one batch starting at a cursor.
pub const METHOD_FETCH_CVES: &str = "RPCFetchCVEs";
/// Method the "local" worker serves: persist one fetched item.
pub const METHOD_SAVE_CVE_BY_ID: &str = "RPCSaveCVEByID";

/// How the executor reaches other workers. Production hands it the broker's
/// [`RpcClient`]; tests script replies in-process.
pub trait RpcCaller: Send + Sync + 'static {
    fn call(
        &self,
        target: &str,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send;
}

impl RpcCaller for RpcClient {
    fn call(
        &self,
        target: &str,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, RpcError>> + Send {
        async move {
            let reply = self.invoke(target, method, &params).await?;
            Ok(reply.payload.unwrap_or(Value::Null))
        }
    }
}

/// Tunables for the fetch→store loop. The defaults are the production values; tests
/// shrink the delays.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Worker id serving [`METHOD_FETCH_CVES`].
    pub remote_id: String,
    /// Worker id serving [`METHOD_SAVE_CVE_BY_ID`].
    pub local_id: String,
    /// Attempts per item save before it counts as an error.
    pub save_attempts: u32,
    /// First save retry delay; doubles per attempt.
    pub save_backoff_base: Duration,
    pub save_backoff_cap: Duration,
    /// Backoff when the remote end signals rate limiting.
    pub rate_limit_backoff: Duration,
    /// Base of the `2^n` backoff for other retryable fetch failures.
    pub error_backoff_base: Duration,
    pub error_backoff_cap: Duration,
    /// Polite delay between successful batches.
    pub batch_delay: Duration,
    /// How long pause/stop wait for the job task to acknowledge cancellation.
    pub done_wait: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            remote_id: "remote".to_string(),
            local_id: "local".to_string(),
            save_attempts: 3,
            save_backoff_base: Duration::from_millis(100),
            save_backoff_cap: Duration::from_secs(2),
            rate_limit_backoff: Duration::from_secs(30),
            error_backoff_base: Duration::from_secs(1),
            error_backoff_cap: Duration::from_secs(60),
            batch_delay: Duration::from_secs(1),
            done_wait: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
struct ActiveHandle {
    id: String,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

/// Owns the at-most-one active run and drives its fetch→store loop.
///
/// The internal mutex guards only the active-run handle; it is never held across I/O,
/// RPC, or store writes that could block another control call.
pub struct JobExecutor<C: RpcCaller> {
    store: Arc<RunStore>,
    rpc: Arc<C>,
    config: ExecutorConfig,
    active: Arc<Mutex<Option<ActiveHandle>>>,
}

impl<C: RpcCaller> JobExecutor<C> {
    pub fn new(store: Arc<RunStore>, rpc: Arc<C>, config: ExecutorConfig) -> Self {
        Self {
            store,
            rpc,
            config,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// The id of the run this executor currently drives, if any.
    pub fn active_run_id(&self) -> Option<String> {
        self.lock_active().as_ref().map(|handle| handle.id.clone())
    }

    /// Creates a run and starts driving it. `cancel` governs the whole loop: cancelling
    /// it behaves like a pause request without the state transition.
    ///
    /// Both the in-memory handle and the store are consulted before anything is created;
    /// the double check matters because a crashed predecessor may still own the slot on
    /// disk.
    pub fn start(
        &self,
        cancel: &CancellationToken,
        id: &str,
        start_index: u64,
        results_per_batch: u64,
        data_type: &str,
    ) -> Result<(), JobError> {
        let mut active = self.lock_active();
        if let Some(handle) = active.as_ref() {
            return Err(JobError::AlreadyActive {
                id: handle.id.clone(),
            });
        }
        if let Some(run) = self.store.get_active_run()? {
            return Err(JobError::AlreadyActive { id: run.id });
        }

        self.store
            .create_run(id, start_index, results_per_batch, data_type)?;
        self.store.update_state(id, RunState::Running)?;

        let handle = self.launch(cancel, id.to_string(), start_index, results_per_batch);
        *active = Some(handle);
        info!(run = %id, start_index, results_per_batch, data_type, "started run");
        Ok(())
    }

    /// Pauses the active run: cancels the loop, waits (bounded) for it to let go, then
    /// records Running → Paused. Pausing survives restarts — recovery never auto-resumes
    /// a paused run.
    pub async fn pause(&self, id: &str) -> Result<(), JobError> {
        let Some(handle) = self.claim_active(id) else {
            let run = self.store.get_run(id)?;
            return Err(JobError::StateMismatch {
                id: id.to_string(),
                expected: RunState::Running,
                actual: run.state,
            });
        };
        let run = self.store.get_run(id)?;
        if run.state != RunState::Running {
            return Err(JobError::StateMismatch {
                id: id.to_string(),
                expected: RunState::Running,
                actual: run.state,
            });
        }

        handle.cancel.cancel();
        self.wait_done(&handle).await;
        self.store.update_state(id, RunState::Paused)?;
        self.clear_active(id);
        info!(run = %id, "paused run");
        Ok(())
    }

    /// Resumes a paused run from its persisted cursor. Symmetric to [`start`](Self::start),
    /// including the double active check.
    pub fn resume(&self, cancel: &CancellationToken, id: &str) -> Result<(), JobError> {
        let mut active = self.lock_active();
        if let Some(handle) = active.as_ref() {
            return Err(JobError::AlreadyActive {
                id: handle.id.clone(),
            });
        }
        if let Some(run) = self.store.get_active_run()? {
            if run.id != id {
                return Err(JobError::AlreadyActive { id: run.id });
            }
        }
        let run = self.store.get_run(id)?;
        if run.state != RunState::Paused {
            return Err(JobError::StateMismatch {
                id: id.to_string(),
                expected: RunState::Paused,
                actual: run.state,
            });
        }

        self.store.update_state(id, RunState::Running)?;
        let handle = self.launch(cancel, id.to_string(), run.start_index, run.results_per_batch);
        *active = Some(handle);
        info!(run = %id, "resumed run");
        Ok(())
    }

    /// Stops a Running or Paused run for good.
    pub async fn stop(&self, id: &str) -> Result<(), JobError> {
        let run = self.store.get_run(id)?;
        match run.state {
            RunState::Running => {
                if let Some(handle) = self.claim_active(id) {
                    handle.cancel.cancel();
                    self.wait_done(&handle).await;
                }
            }
            RunState::Paused => {}
            other => {
                return Err(JobError::StateMismatch {
                    id: id.to_string(),
                    expected: RunState::Running,
                    actual: other,
                });
            }
        }
        self.store.update_state(id, RunState::Stopped)?;
        self.clear_active(id);
        info!(run = %id, "stopped run");
        Ok(())
    }

    /// Startup pass over the store. A run found Running is adopted and driven again from
    /// its persisted `start_index`; a run found Paused is left for an explicit resume.
    /// Extra active runs (a broken invariant from some earlier life) are stopped.
    ///
    /// Returns the id of the adopted run, if any.
    pub fn recover_runs(&self, cancel: &CancellationToken) -> Result<Option<String>, JobError> {
        let mut active = self.lock_active();
        if let Some(handle) = active.as_ref() {
            return Ok(Some(handle.id.clone()));
        }

        let mut candidates: Vec<_> = self
            .store
            .list_runs()?
            .into_iter()
            .filter(|run| run.state.is_active())
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let adopted = candidates.remove(0);
        for extra in candidates {
            warn!(run = %extra.id, state = %extra.state, "stopping extra active run");
            if let Err(err) = self.store.update_state(&extra.id, RunState::Stopped) {
                warn!(run = %extra.id, error = %err, "failed to stop extra active run");
            }
        }

        match adopted.state {
            RunState::Running => {
                info!(run = %adopted.id, start_index = adopted.start_index, "adopting interrupted run");
                let handle = self.launch(
                    cancel,
                    adopted.id.clone(),
                    adopted.start_index,
                    adopted.results_per_batch,
                );
                *active = Some(handle);
                Ok(Some(adopted.id))
            }
            _ => {
                info!(run = %adopted.id, "paused run awaits explicit resume");
                Ok(None)
            }
        }
    }

    fn launch(
        &self,
        parent: &CancellationToken,
        run_id: String,
        cursor: u64,
        batch_size: u64,
    ) -> ActiveHandle {
        let cancel = parent.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let ctx = LoopContext {
            store: Arc::clone(&self.store),
            rpc: Arc::clone(&self.rpc),
            config: self.config.clone(),
            active: Arc::clone(&self.active),
            run_id: run_id.clone(),
            cursor,
            batch_size,
            cancel: cancel.clone(),
            done: done_tx,
        };
        tokio::spawn(run_loop(ctx));
        ActiveHandle {
            id: run_id,
            cancel,
            done: done_rx,
        }
    }

    fn claim_active(&self, id: &str) -> Option<ActiveHandle> {
        self.lock_active()
            .as_ref()
            .filter(|handle| handle.id == id)
            .cloned()
    }

    fn clear_active(&self, id: &str) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|handle| handle.id == id) {
            *active = None;
        }
    }

    async fn wait_done(&self, handle: &ActiveHandle) {
        let mut done = handle.done.clone();
        let wait = async move {
            loop {
                if *done.borrow_and_update() {
                    return;
                }
                if done.changed().await.is_err() {
                    return;
                }
            }
        };
        if time::timeout(self.config.done_wait, wait).await.is_err() {
            warn!(
                run = %handle.id,
                "job task did not acknowledge cancellation within {:?}",
                self.config.done_wait
            );
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveHandle>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct LoopContext<C: RpcCaller> {
    store: Arc<RunStore>,
    rpc: Arc<C>,
    config: ExecutorConfig,
    active: Arc<Mutex<Option<ActiveHandle>>>,
    run_id: String,
    cursor: u64,
    batch_size: u64,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
}

#[derive(Debug, Deserialize)]
struct FetchReply {
    #[serde(default)]
    cves: Vec<Value>,
}

enum FetchFailure {
    Cancelled,
    Unrecoverable(String),
    Retryable(String),
}

/// One iteration fetches a batch, stores every item, then commits progress; the fetch
/// node strictly precedes the store node and the batch travels between them by value.
async fn run_loop<C: RpcCaller>(mut ctx: LoopContext<C>) {
    let mut consecutive_errors: u32 = 0;

    loop {
        if ctx.cancel.is_cancelled() {
            debug!(run = %ctx.run_id, "job loop cancelled");
            break;
        }

        match fetch_batch(&ctx).await {
            Err(FetchFailure::Cancelled) => break,
            Err(FetchFailure::Unrecoverable(message)) => {
                error!(run = %ctx.run_id, error = %message, "unrecoverable fetch failure");
                if let Err(err) = ctx.store.set_error(&ctx.run_id, &message) {
                    warn!(run = %ctx.run_id, error = %err, "failed to record run failure");
                }
                break;
            }
            Err(FetchFailure::Retryable(message)) => {
                consecutive_errors += 1;
                let backoff = if is_rate_limited(&message) {
                    ctx.config.rate_limit_backoff
                } else {
                    error_backoff(
                        ctx.config.error_backoff_base,
                        consecutive_errors,
                        ctx.config.error_backoff_cap,
                    )
                };
                warn!(
                    run = %ctx.run_id,
                    error = %message,
                    consecutive_errors,
                    ?backoff,
                    "fetch failed; backing off"
                );
                if !sleep_unless_cancelled(&ctx.cancel, backoff).await {
                    break;
                }
            }
            Ok(batch) => {
                consecutive_errors = 0;
                if batch.is_empty() {
                    info!(run = %ctx.run_id, "upstream drained; completing run");
                    if let Err(err) = ctx.store.update_state(&ctx.run_id, RunState::Completed) {
                        warn!(run = %ctx.run_id, error = %err, "failed to record completion");
                    }
                    break;
                }

                let fetched = batch.len() as u64;
                let (stored, errors) = store_batch(&ctx, &batch).await;
                // Counters must trail the durable side effects they describe: progress
                // is committed only after every save in the batch has returned.
                persist_progress(&ctx, fetched, stored, errors).await;

                ctx.cursor += ctx.batch_size;
                if !sleep_unless_cancelled(&ctx.cancel, ctx.config.batch_delay).await {
                    break;
                }
            }
        }
    }

    {
        let mut active = ctx.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if active.as_ref().is_some_and(|handle| handle.id == ctx.run_id) {
            *active = None;
        }
    }
    let _ = ctx.done.send(true);
}

async fn fetch_batch<C: RpcCaller>(ctx: &LoopContext<C>) -> Result<Vec<Value>, FetchFailure> {
    let params = json!({
        "start_index": ctx.cursor,
        "results_per_page": ctx.batch_size,
    });
    let result = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(FetchFailure::Cancelled),
        result = ctx.rpc.call(&ctx.config.remote_id, METHOD_FETCH_CVES, params) => result,
    };
    match result {
        Ok(payload) => match serde_json::from_value::<FetchReply>(payload) {
            Ok(reply) => Ok(reply.cves),
            Err(err) => Err(FetchFailure::Retryable(format!("invalid fetch reply: {err}"))),
        },
        Err(err @ (RpcError::Timeout { .. } | RpcError::Cancelled { .. })) => {
            Err(FetchFailure::Unrecoverable(err.to_string()))
        }
        Err(err) => Err(FetchFailure::Retryable(err.to_string())),
    }
}

async fn store_batch<C: RpcCaller>(ctx: &LoopContext<C>, batch: &[Value]) -> (u64, u64) {
    let mut stored = 0u64;
    let mut errors = 0u64;
    for item in batch {
        let params = json!({ "cve": item });
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match ctx
                .rpc
                .call(&ctx.config.local_id, METHOD_SAVE_CVE_BY_ID, params.clone())
                .await
            {
                Ok(_) => {
                    stored += 1;
                    break;
                }
                Err(err) if attempt < ctx.config.save_attempts => {
                    let backoff = save_backoff(
                        ctx.config.save_backoff_base,
                        attempt,
                        ctx.config.save_backoff_cap,
                    );
                    debug!(run = %ctx.run_id, attempt, error = %err, ?backoff, "save failed; retrying");
                    time::sleep(backoff).await;
                }
                Err(err) => {
                    warn!(run = %ctx.run_id, attempts = attempt, error = %err, "save failed; counting as error");
                    errors += 1;
                    break;
                }
            }
        }
    }
    (stored, errors)
}

/// Commits the batch's deltas. Saves are already durable at this point, so a store
/// hiccup is retried briefly and, as a last resort, logged rather than re-running the
/// batch (which would double-count).
async fn persist_progress<C: RpcCaller>(ctx: &LoopContext<C>, fetched: u64, stored: u64, errors: u64) {
    for attempt in 1..=3u32 {
        match ctx.store.update_progress(&ctx.run_id, fetched, stored, errors) {
            Ok(_) => return,
            Err(err) if attempt < 3 => {
                warn!(run = %ctx.run_id, attempt, error = %err, "progress update failed; retrying");
                time::sleep(Duration::from_millis(100) * attempt).await;
            }
            Err(err) => {
                error!(run = %ctx.run_id, error = %err, "dropping progress update after retries");
            }
        }
    }
}

/// True when `cancel` stayed quiet for the whole sleep.
async fn sleep_unless_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

fn is_rate_limited(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests")
}

/// `base * 2^n`, capped: with the default one-second base that is 2s, 4s, 8s, ... 60s.
fn error_backoff(base: Duration, consecutive_errors: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(consecutive_errors.min(16)).unwrap_or(u32::MAX);
    std::cmp::min(base.saturating_mul(factor), cap)
}

fn save_backoff(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1).min(16)).unwrap_or(u32::MAX);
    std::cmp::min(base.saturating_mul(factor), cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
    };

    enum FetchStep {
        Batch(Vec<Value>),
        Error(String),
        Timeout,
    }

    #[derive(Default)]
    struct ScriptedCaller {
        fetches: Mutex<VecDeque<FetchStep>>,
        fetch_indexes: Mutex<Vec<u64>>,
        save_calls: AtomicU64,
        fail_saves: AtomicBool,
    }

    impl ScriptedCaller {
        fn with_fetches(steps: Vec<FetchStep>) -> Arc<Self> {
            Arc::new(Self {
                fetches: Mutex::new(steps.into_iter().collect()),
                ..Self::default()
            })
        }

        fn batches(batches: &[usize]) -> Arc<Self> {
            let steps = batches
                .iter()
                .map(|n| FetchStep::Batch((0..*n).map(|i| json!({"id": format!("CVE-{i}")})).collect()))
                .collect();
            Self::with_fetches(steps)
        }
    }

    impl RpcCaller for ScriptedCaller {
        fn call(
            &self,
            target: &str,
            method: &str,
            params: Value,
        ) -> impl Future<Output = Result<Value, RpcError>> + Send {
            let target = target.to_string();
            let method = method.to_string();
            async move {
                match method.as_str() {
                    METHOD_FETCH_CVES => {
                        self.fetch_indexes
                            .lock()
                            .unwrap()
                            .push(params["start_index"].as_u64().unwrap_or(0));
                        let step = self.fetches.lock().unwrap().pop_front();
                        match step {
                            Some(FetchStep::Batch(items)) => Ok(json!({"cves": items})),
                            Some(FetchStep::Error(message)) => Err(RpcError::Remote {
                                target,
                                method: method.clone(),
                                message,
                            }),
                            Some(FetchStep::Timeout) => Err(RpcError::Timeout {
                                target,
                                method: method.clone(),
                                timeout: Duration::from_secs(30),
                            }),
                            // Script drained: upstream has no more data.
                            None => Ok(json!({"cves": []})),
                        }
                    }
                    METHOD_SAVE_CVE_BY_ID => {
                        self.save_calls.fetch_add(1, Ordering::SeqCst);
                        if self.fail_saves.load(Ordering::SeqCst) {
                            Err(RpcError::Remote {
                                target,
                                method: method.clone(),
                                message: "db write failed".to_string(),
                            })
                        } else {
                            Ok(json!({"saved": true}))
                        }
                    }
                    other => Err(RpcError::Remote {
                        target,
                        method: other.to_string(),
                        message: "unknown method".to_string(),
                    }),
                }
            }
        }
    }

    fn test_config() -> ExecutorConfig {
        ExecutorConfig {
            save_attempts: 3,
            save_backoff_base: Duration::from_millis(1),
            save_backoff_cap: Duration::from_millis(5),
            rate_limit_backoff: Duration::from_millis(50),
            error_backoff_base: Duration::from_millis(5),
            error_backoff_cap: Duration::from_millis(40),
            batch_delay: Duration::from_millis(5),
            done_wait: Duration::from_secs(2),
            ..ExecutorConfig::default()
        }
    }

    fn executor(
        caller: Arc<ScriptedCaller>,
    ) -> (tempfile::TempDir, Arc<RunStore>, JobExecutor<ScriptedCaller>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::open(dir.path().join("runs.db")).unwrap());
        let exec = JobExecutor::new(Arc::clone(&store), caller, test_config());
        (dir, store, exec)
    }

    async fn wait_for_state(store: &RunStore, id: &str, state: RunState) {
        let deadline = time::Instant::now() + Duration::from_secs(5);
        loop {
            if matches!(store.get_run(id), Ok(run) if run.state == state) {
                return;
            }
            assert!(
                time::Instant::now() < deadline,
                "run `{id}` never reached {state}"
            );
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn empty_upstream_completes_with_zero_counters() {
        let caller = ScriptedCaller::with_fetches(Vec::new());
        let (_dir, store, exec) = executor(caller);
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 0, 1, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Completed).await;

        let run = store.get_run("r").unwrap();
        assert_eq!(
            (run.fetched_count, run.stored_count, run.error_count),
            (0, 0, 0)
        );
        assert!(exec.active_run_id().is_none());
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let caller = ScriptedCaller::batches(&[1; 50]);
        let (_dir, store, exec) = executor(caller);
        let exec = Arc::new(exec);
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for i in 0..3 {
            let exec = Arc::clone(&exec);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                exec.start(&cancel, &format!("r{i}"), 0, 1, "cve")
            }));
        }
        let mut ok = 0;
        let mut already_active = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => ok += 1,
                Err(JobError::AlreadyActive { .. }) => already_active += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!((ok, already_active), (1, 2));

        let winner = exec.active_run_id().unwrap();
        exec.stop(&winner).await.unwrap();
        assert_eq!(store.get_run(&winner).unwrap().state, RunState::Stopped);
    }

    #[tokio::test]
    async fn batches_accumulate_and_cursor_advances_by_batch_size() {
        let caller = ScriptedCaller::batches(&[2, 1]);
        let (_dir, store, exec) = executor(Arc::clone(&caller));
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 100, 2, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Completed).await;

        let run = store.get_run("r").unwrap();
        assert_eq!(run.fetched_count, 3);
        assert_eq!(run.stored_count, 3);
        assert_eq!(run.error_count, 0);
        assert_eq!(run.progress["cve"].stored_count, 3);
        assert_eq!(caller.save_calls.load(Ordering::SeqCst), 3);
        // Cursor starts at start_index and advances by batch size each iteration.
        assert_eq!(*caller.fetch_indexes.lock().unwrap(), vec![100, 102, 104]);
    }

    #[tokio::test]
    async fn exhausted_saves_count_as_errors() {
        let caller = ScriptedCaller::batches(&[2]);
        caller.fail_saves.store(true, Ordering::SeqCst);
        let (_dir, store, exec) = executor(Arc::clone(&caller));
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 0, 2, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Completed).await;

        let run = store.get_run("r").unwrap();
        assert_eq!(run.fetched_count, 2);
        assert_eq!(run.stored_count, 0);
        assert_eq!(run.error_count, 2);
        // Three attempts per item.
        assert_eq!(caller.save_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn rate_limit_backs_off_then_recovers() {
        let caller = ScriptedCaller::with_fetches(vec![FetchStep::Error(
            "429 Too Many Requests".to_string(),
        )]);
        let (_dir, store, exec) = executor(caller);
        let cancel = CancellationToken::new();

        let started = time::Instant::now();
        exec.start(&cancel, "r", 0, 1, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Completed).await;
        // The rate-limit backoff (50ms in tests) must have elapsed before completion.
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(store.get_run("r").unwrap().error_count, 0);
    }

    #[tokio::test]
    async fn transient_fetch_errors_retry_and_then_succeed() {
        let caller = ScriptedCaller::with_fetches(vec![
            FetchStep::Error("connection reset".to_string()),
            FetchStep::Batch(vec![json!({"id": "CVE-1"})]),
        ]);
        let (_dir, store, exec) = executor(caller);
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 0, 1, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Completed).await;
        assert_eq!(store.get_run("r").unwrap().stored_count, 1);
    }

    #[tokio::test]
    async fn deadline_failure_marks_the_run_failed() {
        let caller = ScriptedCaller::with_fetches(vec![FetchStep::Timeout]);
        let (_dir, store, exec) = executor(caller);
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 0, 1, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Failed).await;

        let run = store.get_run("r").unwrap();
        assert!(run.error_message.unwrap().contains("timed out"));
        assert!(exec.active_run_id().is_none());
    }

    #[tokio::test]
    async fn pause_resume_lifecycle() {
        let caller = ScriptedCaller::batches(&[1; 200]);
        let (_dir, store, exec) = executor(Arc::clone(&caller));
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 0, 1, "cve").unwrap();
        time::sleep(Duration::from_millis(30)).await;
        exec.pause("r").await.unwrap();
        assert_eq!(store.get_run("r").unwrap().state, RunState::Paused);
        assert!(exec.active_run_id().is_none());

        // Progress persisted so far stays put while paused.
        let paused_at = store.get_run("r").unwrap().stored_count;

        exec.resume(&cancel, "r").unwrap();
        time::sleep(Duration::from_millis(30)).await;
        exec.stop("r").await.unwrap();

        let run = store.get_run("r").unwrap();
        assert_eq!(run.state, RunState::Stopped);
        assert!(run.stored_count >= paused_at, "counters never decrease");
    }

    #[tokio::test]
    async fn pause_requires_running_and_resume_requires_paused() {
        let caller = ScriptedCaller::with_fetches(Vec::new());
        let (_dir, store, exec) = executor(caller);
        let cancel = CancellationToken::new();

        exec.start(&cancel, "r", 0, 1, "cve").unwrap();
        wait_for_state(&store, "r", RunState::Completed).await;

        let err = exec.pause("r").await.unwrap_err();
        assert!(matches!(
            err,
            JobError::StateMismatch {
                expected: RunState::Running,
                ..
            }
        ));
        let err = exec.resume(&cancel, "r").unwrap_err();
        assert!(matches!(
            err,
            JobError::StateMismatch {
                expected: RunState::Paused,
                ..
            }
        ));
        let err = exec.stop("r").await.unwrap_err();
        assert!(matches!(err, JobError::StateMismatch { .. }));
    }

    #[tokio::test]
    async fn store_active_run_blocks_a_second_executor() {
        let caller = ScriptedCaller::batches(&[1; 100]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::open(dir.path().join("runs.db")).unwrap());
        let cancel = CancellationToken::new();

        let first = JobExecutor::new(Arc::clone(&store), Arc::clone(&caller), test_config());
        first.start(&cancel, "r1", 0, 1, "cve").unwrap();

        // A fresh executor over the same store must observe the durable claim.
        let second = JobExecutor::new(Arc::clone(&store), caller, test_config());
        let err = second.start(&cancel, "r2", 0, 1, "cve").unwrap_err();
        assert!(matches!(err, JobError::AlreadyActive { .. }));

        first.stop("r1").await.unwrap();
    }

    #[tokio::test]
    async fn recovery_adopts_running_runs_from_the_persisted_cursor() {
        let caller = ScriptedCaller::batches(&[1]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::open(dir.path().join("runs.db")).unwrap());

        // A previous life crashed mid-run.
        store.create_run("r", 40, 5, "cve").unwrap();
        store.update_state("r", RunState::Running).unwrap();
        store.update_progress("r", 10, 10, 0).unwrap();

        let exec = JobExecutor::new(Arc::clone(&store), Arc::clone(&caller), test_config());
        let cancel = CancellationToken::new();
        let adopted = exec.recover_runs(&cancel).unwrap();
        assert_eq!(adopted.as_deref(), Some("r"));

        wait_for_state(&store, "r", RunState::Completed).await;
        let run = store.get_run("r").unwrap();
        // Recovery resumes from the persisted start_index; counters stay monotonic.
        assert_eq!(caller.fetch_indexes.lock().unwrap()[0], 40);
        assert_eq!(run.fetched_count, 11);
        assert_eq!(run.stored_count, 11);
    }

    #[tokio::test]
    async fn recovery_leaves_paused_runs_alone() {
        let caller = ScriptedCaller::batches(&[1]);
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RunStore::open(dir.path().join("runs.db")).unwrap());

        store.create_run("r", 0, 5, "cve").unwrap();
        store.update_state("r", RunState::Running).unwrap();
        store.update_state("r", RunState::Paused).unwrap();

        let exec = JobExecutor::new(Arc::clone(&store), caller, test_config());
        let adopted = exec.recover_runs(&CancellationToken::new()).unwrap();
        assert!(adopted.is_none());
        assert!(exec.active_run_id().is_none());

        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get_run("r").unwrap().state, RunState::Paused);
    }

    #[tokio::test]
    async fn recovery_with_nothing_active_is_a_no_op() {
        let caller = ScriptedCaller::with_fetches(Vec::new());
        let (_dir, _store, exec) = executor(caller);
        assert!(exec.recover_runs(&CancellationToken::new()).unwrap().is_none());
    }

    #[test]
    fn backoff_curves() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        assert_eq!(error_backoff(base, 1, cap), Duration::from_secs(2));
        assert_eq!(error_backoff(base, 3, cap), Duration::from_secs(8));
        assert_eq!(error_backoff(base, 10, cap), cap);

        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        assert_eq!(save_backoff(base, 1, cap), Duration::from_millis(100));
        assert_eq!(save_backoff(base, 2, cap), Duration::from_millis(200));
        assert_eq!(save_backoff(base, 3, cap), Duration::from_millis(400));
        assert_eq!(save_backoff(base, 12, cap), cap);
    }

    #[test]
    fn rate_limit_signatures() {
        assert!(is_rate_limited("HTTP 429 from upstream"));
        assert!(is_rate_limited("Rate Limit exceeded"));
        assert!(is_rate_limited("too many requests, slow down"));
        assert!(!is_rate_limited("connection refused"));
    }
}
