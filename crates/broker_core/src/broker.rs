use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStderr, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    codec, handlers,
    process::{spawn_with_retry, ProcessEntry},
    rpc::log_unmatched_reply,
    stats::MessageStats,
    BrokerError, EndpointRegistry, Message, MessageStatsSnapshot, MessageType, PendingReplies,
    ProcessSnapshot, ProcessStatus, RestartPolicy, RpcClient,
};

/// Event id of the exit notification emitted onto the inbound channel when a child dies.
pub const PROCESS_EXITED_EVENT: &str = "process_exited";

const INBOUND_CAPACITY: usize = 1024;
const RPC_OUTBOUND_CAPACITY: usize = 256;
/// Grace between closing a child's stdin and force-killing it.
const KILL_GRACE: Duration = Duration::from_millis(200);
/// How long `kill` and `shutdown` wait for the waiter task to finalize a record.
const KILL_WAIT: Duration = Duration::from_secs(5);
const RESTART_BACKOFF_BASE: Duration = Duration::from_millis(200);
const RESTART_BACKOFF_CAP: Duration = Duration::from_secs(10);

/// The supervisor: spawns and reaps children, owns their pipes, and routes envelopes.
///
/// Cheap to clone-share via the methods taking `&self`; all state lives behind the
/// internal `Arc`.
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    pub(crate) id: String,
    pub(crate) processes: Mutex<HashMap<String, Arc<ProcessEntry>>>,
    pub(crate) endpoints: EndpointRegistry,
    stats: Mutex<MessageStats>,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    rpc: RpcClient,
    pending: Arc<PendingReplies>,
    shutdown: CancellationToken,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    /// Creates a broker named `id` (the id other participants use as `target` to reach it).
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (rpc_tx, mut rpc_rx) = mpsc::channel(RPC_OUTBOUND_CAPACITY);
        let rpc = RpcClient::new(id.clone(), rpc_tx);
        let pending = rpc.pending();

        let inner = Arc::new(BrokerInner {
            id,
            processes: Mutex::new(HashMap::new()),
            endpoints: EndpointRegistry::new(),
            stats: Mutex::new(MessageStats::default()),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            rpc,
            pending,
            shutdown: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        // Drain the broker's own RPC client into the routing path, so composed calls
        // travel the same road as everything else.
        let drain = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        msg = rpc_rx.recv() => match msg {
                            Some(msg) => {
                                let from = inner.id.clone();
                                inner.route_from(msg, &from).await;
                            }
                            None => break,
                        },
                    }
                }
            })
        };
        inner.push_task(drain);

        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// The broker's own RPC client. Calls issued through it ride the routing path like
    /// any child-originated request.
    pub fn rpc(&self) -> RpcClient {
        self.inner.rpc.clone()
    }

    /// Launches a child with piped stdio and starts supervising it. Must be called from
    /// within a tokio runtime (the reader and waiter tasks are spawned here).
    pub fn spawn(
        &self,
        id: impl Into<String>,
        command: impl Into<String>,
        args: &[String],
    ) -> Result<ProcessSnapshot, BrokerError> {
        self.inner
            .spawn_child(id.into(), command.into(), args.to_vec(), None, false, 0)
    }

    /// As [`spawn`](Self::spawn), with auto-restart on unexpected exit while the budget lasts.
    pub fn spawn_with_restart(
        &self,
        id: impl Into<String>,
        command: impl Into<String>,
        max_restarts: u32,
        args: &[String],
    ) -> Result<ProcessSnapshot, BrokerError> {
        self.inner.spawn_child(
            id.into(),
            command.into(),
            args.to_vec(),
            Some(RestartPolicy { max_restarts }),
            false,
            0,
        )
    }

    /// As [`spawn`](Self::spawn), marking the child as an RPC-capable peer whose startup
    /// endpoint registrations are accepted.
    pub fn spawn_rpc(
        &self,
        id: impl Into<String>,
        command: impl Into<String>,
        args: &[String],
    ) -> Result<ProcessSnapshot, BrokerError> {
        self.inner
            .spawn_child(id.into(), command.into(), args.to_vec(), None, true, 0)
    }

    /// Asks the named child to exit: closes its stdin, waits a short grace, force-kills,
    /// and waits (bounded) for the record to be finalized.
    pub async fn kill(&self, id: &str) -> Result<(), BrokerError> {
        self.inner.kill_child(id).await
    }

    pub fn get_process(&self, id: &str) -> Result<ProcessSnapshot, BrokerError> {
        Ok(self.inner.entry(id)?.snapshot())
    }

    pub fn list_processes(&self) -> Vec<ProcessSnapshot> {
        let entries: Vec<Arc<ProcessEntry>> = {
            let processes = self.inner.lock_processes();
            processes.values().cloned().collect()
        };
        let mut snapshots: Vec<ProcessSnapshot> = entries.iter().map(|e| e.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Enqueues a message into the broker's processing path, exactly as if a child had
    /// written it (the source defaults to the broker's own id when absent).
    pub async fn send_message(&self, msg: Message) -> Result<(), BrokerError> {
        if self.inner.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }
        let from = msg
            .source
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.inner.id.clone());
        self.inner.route_from(msg, &from).await;
        Ok(())
    }

    /// Pops one broker-addressed message (events, unhandled requests) from the inbound
    /// channel, honoring broker shutdown and the caller's cancellation token.
    pub async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message, BrokerError> {
        let mut rx = self.inner.inbound_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(BrokerError::ShutDown),
            _ = cancel.cancelled() => Err(BrokerError::Cancelled),
            msg = rx.recv() => msg.ok_or(BrokerError::ShutDown),
        }
    }

    pub fn register_endpoint(&self, process_id: &str, method: &str) -> bool {
        self.inner.endpoints.register(process_id, method)
    }

    pub fn get_endpoints(&self, process_id: &str) -> Vec<String> {
        self.inner.endpoints.endpoints_of(process_id)
    }

    pub fn get_all_endpoints(&self) -> std::collections::BTreeMap<String, Vec<String>> {
        self.inner.endpoints.all()
    }

    pub fn message_count(&self) -> u64 {
        self.inner.lock_stats().total()
    }

    pub fn message_stats(&self) -> MessageStatsSnapshot {
        self.inner.lock_stats().snapshot()
    }

    /// Stops accepting messages, kills all live children, and waits for the supervision
    /// tasks to wind down.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(broker = %self.inner.id, "shutting down");
        self.inner.shutdown.cancel();

        let entries: Vec<Arc<ProcessEntry>> = {
            let processes = self.inner.lock_processes();
            processes.values().cloned().collect()
        };
        for entry in &entries {
            if entry.status() == ProcessStatus::Running {
                entry.mark_killed();
                entry.kill_requested.cancel();
            }
        }
        for entry in &entries {
            if time::timeout(KILL_WAIT, entry.exit_done.cancelled()).await.is_err() {
                warn!(child = %entry.id, "child did not finalize during shutdown");
            }
        }

        self.inner.endpoints.clear();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.lock_tasks();
            tasks.drain(..).collect()
        };
        for mut handle in handles {
            if time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                // Reader/waiter tasks end with their child; anything still alive here is
                // stuck on an external resource.
                handle.abort();
            }
        }
    }
}

impl BrokerInner {
    pub(crate) fn spawn_child(
        self: &Arc<Self>,
        id: String,
        command: String,
        args: Vec<String>,
        restart: Option<RestartPolicy>,
        rpc_peer: bool,
        restarts_so_far: u32,
    ) -> Result<ProcessSnapshot, BrokerError> {
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }

        let mut cmd = Command::new(&command);
        cmd.args(&args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let (entry, stdout, stderr, child) = {
            let mut processes = self.lock_processes();
            if let Some(existing) = processes.get(&id) {
                if existing.status() == ProcessStatus::Running {
                    return Err(BrokerError::DuplicateId { id });
                }
            }

            let mut child = spawn_with_retry(&mut cmd, &command)?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| BrokerError::StdinUnavailable { id: id.clone() })?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BrokerError::StdoutUnavailable { id: id.clone() })?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| BrokerError::StderrUnavailable { id: id.clone() })?;

            let entry = Arc::new(ProcessEntry::new(
                id.clone(),
                command.clone(),
                args.clone(),
                child.id(),
                rpc_peer,
                restart,
                restarts_so_far,
                stdin,
            ));
            processes.insert(id.clone(), Arc::clone(&entry));
            (entry, stdout, stderr, child)
        };

        info!(child = %id, command = %command, pid = ?entry.snapshot().pid, "spawned child");

        let reader = {
            let inner = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move { inner.reader_loop(&id, stdout).await })
        };
        let stderr_task = {
            let id = id.clone();
            tokio::spawn(async move { stderr_loop(&id, stderr).await })
        };
        let waiter = {
            let inner = Arc::clone(self);
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { inner.waiter_loop(entry, child, reader).await })
        };
        self.push_task(stderr_task);
        self.push_task(waiter);

        Ok(entry.snapshot())
    }

    /// Reads framed messages from one child's stdout until EOF. Unparseable lines are
    /// logged and skipped; the channel keeps flowing.
    async fn reader_loop(self: &Arc<Self>, child_id: &str, stdout: ChildStdout) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match codec::decode_frame(&line) {
                    Ok(Some(msg)) => self.route_from(msg, child_id).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(child = %child_id, error = %err, "discarding unparseable frame");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    warn!(child = %child_id, error = %err, "stdout read failed");
                    break;
                }
            }
        }
        debug!(child = %child_id, "stdout drained");
    }

    /// Blocks on child exit, finalizes the record, emits the exit event (after the stdout
    /// reader has drained), and respawns when a restart budget remains.
    async fn waiter_loop(
        self: &Arc<Self>,
        entry: Arc<ProcessEntry>,
        mut child: tokio::process::Child,
        reader: JoinHandle<()>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = entry.kill_requested.cancelled() => {
                // Closing stdin is the polite shutdown signal for stdio workers; only
                // force-kill when the grace expires.
                entry.stdin.lock().await.take();
                match time::timeout(KILL_GRACE, child.wait()).await {
                    Ok(status) => status,
                    Err(_) => {
                        if let Err(err) = child.start_kill() {
                            warn!(child = %entry.id, error = %err, "force kill failed");
                        }
                        child.wait().await
                    }
                }
            }
        };

        // Exit-ordering guarantee: everything the child wrote before dying is routed
        // before its exit event becomes observable.
        let _ = reader.await;
        entry.stdin.lock().await.take();

        let (exit_code, failed) = match status {
            // A kill-signalled exit is the outcome the operator asked for, not a failure.
            Ok(status) => (status.code(), !status.success() && !entry.was_killed()),
            Err(err) => {
                error!(child = %entry.id, error = %err, "failed to reap child");
                (None, true)
            }
        };
        entry.mark_exited(exit_code, failed);

        let dropped = self.pending.fail_peer(&entry.id);
        if dropped > 0 {
            warn!(child = %entry.id, calls = dropped, "failed outstanding calls to exited peer");
        }

        let event = Message::event(
            PROCESS_EXITED_EVENT,
            self.id.clone(),
            Some(json!({
                "id": entry.id,
                "exit_code": exit_code.unwrap_or(-1),
                "status": if failed { "failed" } else { "exited" },
            })),
        );
        let from = self.id.clone();
        self.route_from(event, &from).await;
        entry.exit_done.cancel();
        info!(child = %entry.id, exit_code = ?exit_code, failed, "child exited");

        if self.is_shut_down() || entry.was_killed() {
            return;
        }
        let Some(policy) = entry.restart else { return };
        let restarts = entry.snapshot().restarts;
        if restarts >= policy.max_restarts {
            warn!(child = %entry.id, restarts, "restart budget exhausted");
            return;
        }

        let backoff = restart_backoff(restarts);
        info!(child = %entry.id, restarts, ?backoff, "restarting child");
        tokio::select! {
            _ = time::sleep(backoff) => {}
            _ = self.shutdown.cancelled() => return,
        }
        if let Err(err) = self.spawn_child(
            entry.id.clone(),
            entry.command.clone(),
            entry.args.clone(),
            Some(policy),
            entry.rpc_peer,
            restarts + 1,
        ) {
            error!(child = %entry.id, error = %err, "restart failed");
        }
    }

    /// The routing algorithm: stamp source, count, then deliver by target.
    pub(crate) async fn route_from(self: &Arc<Self>, mut msg: Message, from: &str) {
        msg.source = Some(from.to_string());
        self.lock_stats().record_received(msg.kind);

        let target = msg.target_or_broker().to_string();
        if target.is_empty() || target == self.id {
            self.deliver_to_broker(msg).await;
            return;
        }

        let entry = self.lock_processes().get(&target).cloned();
        match entry {
            Some(entry) if entry.status() == ProcessStatus::Running => {
                match self.write_to_child(&entry, &msg).await {
                    Ok(()) => self.lock_stats().record_sent(),
                    Err(err) => {
                        warn!(child = %target, error = %err, "stdin write failed");
                        self.bounce(msg, format!("failed to deliver to `{target}`: {err}"))
                            .await;
                    }
                }
            }
            Some(_) => {
                self.bounce(msg, format!("target `{target}` has exited")).await;
            }
            None => {
                self.bounce(msg, format!("no route to target `{target}`")).await;
            }
        }
    }

    /// Broker-addressed traffic: built-in method requests are answered; replies go to the
    /// broker's pending table; everything else lands on the inbound channel.
    async fn deliver_to_broker(self: &Arc<Self>, msg: Message) {
        if msg.kind == MessageType::Request && handlers::is_broker_method(&msg.id) {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let reply = handlers::handle_request(&inner, &msg).await;
                inner.deliver_reply(reply).await;
            });
            return;
        }

        if msg.is_reply() {
            match self.pending.dispatch(msg) {
                None => self.lock_stats().record_sent(),
                Some(unmatched) => log_unmatched_reply(&unmatched),
            }
            return;
        }

        match self.inbound_tx.send(msg).await {
            Ok(()) => self.lock_stats().record_sent(),
            Err(_) => debug!("inbound channel closed; dropping broker-addressed message"),
        }
    }

    /// Routes a synthesized ERROR back to the failed message's sender. Errors about
    /// errors are logged, never bounced again.
    async fn bounce(self: &Arc<Self>, original: Message, error_text: String) {
        let Some(source) = original.source.clone().filter(|s| !s.is_empty()) else {
            warn!(error = %error_text, "cannot bounce message with no source");
            return;
        };
        let reply = Message::error_reply(
            original.id.clone(),
            self.id.clone(),
            source,
            original.correlation_id.clone(),
            error_text,
        );
        self.deliver_reply(reply).await;
    }

    /// One-hop delivery of a broker-built reply (no re-bounce on failure).
    async fn deliver_reply(self: &Arc<Self>, msg: Message) {
        self.lock_stats().record_received(msg.kind);
        let target = msg.target_or_broker().to_string();
        if target.is_empty() || target == self.id {
            if msg.is_reply() {
                match self.pending.dispatch(msg) {
                    None => self.lock_stats().record_sent(),
                    Some(unmatched) => log_unmatched_reply(&unmatched),
                }
            } else if self.inbound_tx.send(msg).await.is_ok() {
                self.lock_stats().record_sent();
            }
            return;
        }
        let entry = self.lock_processes().get(&target).cloned();
        match entry {
            Some(entry) if entry.status() == ProcessStatus::Running => {
                match self.write_to_child(&entry, &msg).await {
                    Ok(()) => self.lock_stats().record_sent(),
                    Err(err) => warn!(child = %target, error = %err, "dropping undeliverable reply"),
                }
            }
            _ => warn!(child = %target, "dropping reply to unavailable target"),
        }
    }

    /// Writes one full frame plus newline to a child's stdin, serialized per child by the
    /// stdin mutex so concurrent senders never interleave partial lines.
    async fn write_to_child(&self, entry: &ProcessEntry, msg: &Message) -> Result<(), BrokerError> {
        let line = codec::encode_frame(msg)?;
        let mut guard = entry.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| BrokerError::StdinUnavailable { id: entry.id.clone() })?;
        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        write.await.map_err(|source| BrokerError::StdinWrite {
            id: entry.id.clone(),
            source,
        })
    }

    pub(crate) async fn kill_child(&self, id: &str) -> Result<(), BrokerError> {
        let entry = self.entry(id)?;
        if entry.status() != ProcessStatus::Running {
            return Err(BrokerError::AlreadyExited { id: id.to_string() });
        }
        entry.mark_killed();
        entry.kill_requested.cancel();
        if time::timeout(KILL_WAIT, entry.exit_done.cancelled()).await.is_err() {
            warn!(child = %id, "kill did not finalize within {KILL_WAIT:?}");
        }
        Ok(())
    }

    pub(crate) fn entry(&self, id: &str) -> Result<Arc<ProcessEntry>, BrokerError> {
        self.lock_processes()
            .get(id)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownProcess { id: id.to_string() })
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn push_task(&self, handle: JoinHandle<()>) {
        self.lock_tasks().push(handle);
    }

    pub(crate) fn lock_processes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ProcessEntry>>> {
        self.processes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn lock_stats(&self) -> std::sync::MutexGuard<'_, MessageStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn restart_backoff(restarts: u32) -> Duration {
    let factor = 1u32.checked_shl(restarts).unwrap_or(u32::MAX);
    std::cmp::min(RESTART_BACKOFF_BASE.saturating_mul(factor), RESTART_BACKOFF_CAP)
}

async fn stderr_loop(child_id: &str, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(child = %child_id, "stderr: {line}");
    }
}
