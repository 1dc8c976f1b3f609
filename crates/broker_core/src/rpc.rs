use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Message, MessageType};

/// Per-call deadline applied when the caller does not override it.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure modes of a single RPC, each distinguishable to the caller.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("failed to marshal params for `{method}`: {source}")]
    Marshal {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("transport closed before `{method}` could reach `{target}`")]
    TransportClosed { target: String, method: String },
    #[error("call `{method}` to `{target}` timed out after {timeout:?}")]
    Timeout {
        target: String,
        method: String,
        timeout: Duration,
    },
    #[error("call `{method}` to `{target}` was cancelled")]
    Cancelled { target: String, method: String },
    #[error("`{target}` answered `{method}` with an error: {message}")]
    Remote {
        target: String,
        method: String,
        message: String,
    },
    #[error("peer `{target}` exited with `{method}` outstanding")]
    PeerExited { target: String, method: String },
}

enum SlotMessage {
    Reply(Message),
    PeerExited,
}

struct PendingSlot {
    target: String,
    tx: oneshot::Sender<SlotMessage>,
}

/// Correlation-id-keyed table of outstanding calls.
///
/// The transport owner (broker routing loop or worker reader task) offers every inbound
/// RESPONSE/ERROR to [`dispatch`](Self::dispatch); the handoff is a oneshot send, so a
/// stalled caller can never block the reader.
#[derive(Default)]
pub struct PendingReplies {
    slots: Mutex<HashMap<String, PendingSlot>>,
}

impl PendingReplies {
    fn register(&self, correlation_id: &str, target: &str) -> oneshot::Receiver<SlotMessage> {
        let (tx, rx) = oneshot::channel();
        let slot = PendingSlot {
            target: target.to_string(),
            tx,
        };
        self.lock().insert(correlation_id.to_string(), slot);
        rx
    }

    fn remove(&self, correlation_id: &str) {
        self.lock().remove(correlation_id);
    }

    /// Offers a reply to the table. Returns the message back when no outstanding call
    /// matches its correlation id, so the caller can log and drop it.
    pub fn dispatch(&self, msg: Message) -> Option<Message> {
        if !msg.is_reply() {
            return Some(msg);
        }
        let Some(correlation_id) = msg.correlation_id.clone() else {
            return Some(msg);
        };
        let slot = self.lock().remove(&correlation_id);
        match slot {
            Some(slot) => {
                // The receiver may have given up (timeout/cancel) a moment ago; that
                // reply is dropped here exactly like an unmatched one.
                let _ = slot.tx.send(SlotMessage::Reply(msg));
                None
            }
            None => Some(msg),
        }
    }

    /// Fails every outstanding call addressed to `target`. Invoked when the peer's
    /// `process_exited` event is observed. Returns how many calls were failed.
    pub fn fail_peer(&self, target: &str) -> usize {
        let mut lock = self.lock();
        let dead: Vec<String> = lock
            .iter()
            .filter(|(_, slot)| slot.target == target)
            .map(|(corr, _)| corr.clone())
            .collect();
        for corr in &dead {
            if let Some(slot) = lock.remove(corr) {
                let _ = slot.tx.send(SlotMessage::PeerExited);
            }
        }
        dead.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Correlation-based request/response client over a shared outbound transport.
///
/// The outbound channel is drained by whoever owns the transport: the worker's stdout
/// writer task, or the broker's internal enqueue. Clones share the pending table and
/// correlation counter, so a worker can hand clones to as many tasks as it likes.
#[derive(Clone)]
pub struct RpcClient {
    self_id: String,
    counter: Arc<AtomicU64>,
    pending: Arc<PendingReplies>,
    outbound: mpsc::Sender<Message>,
    default_timeout: Duration,
}

impl RpcClient {
    pub fn new(self_id: impl Into<String>, outbound: mpsc::Sender<Message>) -> Self {
        Self {
            self_id: self_id.into(),
            counter: Arc::new(AtomicU64::new(0)),
            pending: Arc::new(PendingReplies::default()),
            outbound,
            default_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// The pending table, for the transport owner to dispatch replies into.
    pub fn pending(&self) -> Arc<PendingReplies> {
        Arc::clone(&self.pending)
    }

    /// Issues `method` to `target` with the default timeout and no external cancellation.
    pub async fn invoke<P: Serialize + ?Sized>(
        &self,
        target: &str,
        method: &str,
        params: &P,
    ) -> Result<Message, RpcError> {
        self.invoke_with(target, method, params, self.default_timeout, &CancellationToken::new())
            .await
    }

    /// Issues `method` to `target`, blocking until the reply arrives, `timeout` elapses,
    /// or `cancel` fires. The pending slot is removed on every exit path.
    pub async fn invoke_with<P: Serialize + ?Sized>(
        &self,
        target: &str,
        method: &str,
        params: &P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Message, RpcError> {
        // Marshal before a slot exists so a bad params value costs nothing to clean up.
        let payload = serde_json::to_value(params).map_err(|source| RpcError::Marshal {
            method: method.to_string(),
            source,
        })?;
        let payload = if payload.is_null() { None } else { Some(payload) };

        let correlation_id = self.next_correlation_id();
        let rx = self.pending.register(&correlation_id, target);

        let request = Message::request(method, self.self_id.clone(), target, correlation_id.clone(), payload);
        if self.outbound.send(request).await.is_err() {
            self.pending.remove(&correlation_id);
            return Err(RpcError::TransportClosed {
                target: target.to_string(),
                method: method.to_string(),
            });
        }

        let outcome = tokio::select! {
            received = time::timeout(timeout, rx) => received,
            _ = cancel.cancelled() => {
                self.pending.remove(&correlation_id);
                return Err(RpcError::Cancelled {
                    target: target.to_string(),
                    method: method.to_string(),
                });
            }
        };

        match outcome {
            Ok(Ok(SlotMessage::Reply(msg))) => {
                if msg.kind == MessageType::Error {
                    Err(RpcError::Remote {
                        target: target.to_string(),
                        method: method.to_string(),
                        message: msg.error.unwrap_or_else(|| "unspecified error".to_string()),
                    })
                } else {
                    Ok(msg)
                }
            }
            Ok(Ok(SlotMessage::PeerExited)) => Err(RpcError::PeerExited {
                target: target.to_string(),
                method: method.to_string(),
            }),
            Ok(Err(_)) => {
                // Slot dropped without a reply: the pending table went away under us.
                self.pending.remove(&correlation_id);
                Err(RpcError::TransportClosed {
                    target: target.to_string(),
                    method: method.to_string(),
                })
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                Err(RpcError::Timeout {
                    target: target.to_string(),
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    /// `{self_id}-{nanos}-{counter}`: unique within the process, and debuggable enough to
    /// attribute a stray reply to its origin in logs.
    fn next_correlation_id(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.self_id, nanos, seq)
    }
}

/// Logs and drops a reply nobody was waiting for.
pub(crate) fn log_unmatched_reply(msg: &Message) {
    warn!(
        kind = msg.kind.as_str(),
        id = %msg.id,
        correlation_id = msg.correlation_id.as_deref().unwrap_or(""),
        "dropping reply with no outstanding request"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn client() -> (RpcClient, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(16);
        (RpcClient::new("tester", tx), rx)
    }

    #[tokio::test]
    async fn round_trip_resolves_the_caller() {
        let (client, mut outbound) = client();
        let pending = client.pending();

        let responder = tokio::spawn(async move {
            let request = outbound.recv().await.unwrap();
            assert_eq!(request.kind, MessageType::Request);
            assert_eq!(request.id, "Method");
            let reply = Message::response_to(&request, "b", Some(json!({"y": 2})));
            assert!(pending.dispatch(reply).is_none());
        });

        let reply = client.invoke("b", "Method", &json!({"x": 1})).await.unwrap();
        assert_eq!(reply.payload, Some(json!({"y": 2})));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_remote_error() {
        let (client, mut outbound) = client();
        let pending = client.pending();

        tokio::spawn(async move {
            let request = outbound.recv().await.unwrap();
            let reply = Message::error_reply(
                request.id.clone(),
                "b",
                request.source.clone().unwrap(),
                request.correlation_id.clone(),
                "no such method",
            );
            pending.dispatch(reply);
        });

        let err = client.invoke("b", "Missing", &json!({})).await.unwrap_err();
        match err {
            RpcError::Remote { message, .. } => assert_eq!(message, "no such method"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_cleans_up_the_slot() {
        let (client, mut outbound) = client();
        let pending = client.pending();

        let err = client
            .invoke_with("b", "Slow", &json!({}), Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));

        // A late reply now has nothing to match and comes back for drop-with-log.
        let request = outbound.recv().await.unwrap();
        let late = Message::response_to(&request, "b", None);
        assert!(pending.dispatch(late).is_some());
    }

    #[tokio::test]
    async fn cancellation_unblocks_immediately() {
        let (client, _outbound) = client();
        let cancel = CancellationToken::new();
        let payload = json!({});
        let call = client.invoke_with("b", "Slow", &payload, Duration::from_secs(30), &cancel);
        tokio::pin!(call);

        tokio::select! {
            _ = &mut call => panic!("call resolved without a reply"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => cancel.cancel(),
        }
        let err = call.await.unwrap_err();
        assert!(matches!(err, RpcError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn peer_exit_fails_outstanding_calls() {
        let (client, _outbound) = client();
        let pending = client.pending();

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.invoke("remote", "RPCFetchCVEs", &json!({})).await }
        });
        // Give the call a moment to install its slot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pending.fail_peer("remote"), 1);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::PeerExited { .. }));
    }

    #[tokio::test]
    async fn marshal_failure_allocates_no_slot() {
        let (client, mut outbound) = client();
        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], 1);
        let err = client.invoke("b", "Method", &bad).await.unwrap_err();
        assert!(matches!(err, RpcError::Marshal { .. }));
        // Nothing was sent either.
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_correlation_ids_are_unique() {
        let (tx, mut rx) = mpsc::channel(64);
        let client = RpcClient::new("w", tx);
        for _ in 0..32 {
            let client = client.clone();
            tokio::spawn(async move {
                let _ = client
                    .invoke_with("b", "M", &json!({}), Duration::from_millis(50), &CancellationToken::new())
                    .await;
            });
        }
        let mut seen = HashSet::new();
        for _ in 0..32 {
            let msg = rx.recv().await.unwrap();
            assert!(seen.insert(msg.correlation_id.unwrap()));
        }
    }
}
