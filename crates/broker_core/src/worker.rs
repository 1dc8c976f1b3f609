use std::{collections::HashMap, future::Future, pin::Pin, sync::Arc};

use serde_json::{json, Value};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
};
use tracing::{debug, warn};

use crate::{
    codec, handlers::METHOD_REGISTER_ENDPOINT, rpc::log_unmatched_reply, Message, MessageType,
    RpcClient, PROCESS_EXITED_EVENT,
};

/// Boxed future returned by a method handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// An async method handler: params in, reply payload (or a human-readable error) out.
pub type MethodHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("stdin read failed: {0}")]
    Read(#[source] std::io::Error),
}

/// The stdio loop a worker process embeds to talk to the broker.
///
/// Reads line-delimited envelopes from stdin, dispatches requests to registered
/// handlers, offers replies to the worker's own [`RpcClient`], and writes everything
/// outbound (handler replies and the worker's own requests) one frame per line to
/// stdout. Stderr is never touched — it stays free for human logs.
///
/// The loop ends when stdin reaches EOF, which is the broker's polite shutdown signal.
pub struct WorkerRuntime {
    id: String,
    handlers: HashMap<String, MethodHandler>,
    rpc: RpcClient,
    outbound_tx: mpsc::Sender<Message>,
    outbound_rx: mpsc::Receiver<Message>,
    events_tx: mpsc::Sender<Message>,
    events_rx: Option<mpsc::Receiver<Message>>,
}

const OUTBOUND_CAPACITY: usize = 256;
const EVENTS_CAPACITY: usize = 64;

impl WorkerRuntime {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CAPACITY);
        let rpc = RpcClient::new(id.clone(), outbound_tx.clone());
        Self {
            id,
            handlers: HashMap::new(),
            rpc,
            outbound_tx,
            outbound_rx,
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Registers an async handler for `method`. Registered methods are advertised to the
    /// broker when the runtime starts.
    pub fn handle<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.handlers
            .insert(method.into(), Arc::new(move |params| Box::pin(handler(params))));
    }

    /// The worker's RPC client; clones share the runtime's transport.
    pub fn rpc(&self) -> RpcClient {
        self.rpc.clone()
    }

    /// Stream of EVENT envelopes addressed to this worker (e.g. `process_exited`).
    /// May be taken once; events are dropped when nobody is listening.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<Message>> {
        self.events_rx.take()
    }

    /// Runs the loop over the process's real stdin/stdout.
    pub async fn run(self) -> Result<(), WorkerError> {
        self.run_with(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Runs the loop over explicit streams (tests use in-memory duplex pipes).
    pub async fn run_with<R, W>(self, reader: R, writer: W) -> Result<(), WorkerError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let WorkerRuntime {
            id,
            handlers,
            rpc,
            outbound_tx,
            outbound_rx,
            events_tx,
            events_rx: _,
        } = self;

        let writer_task = tokio::spawn(writer_loop(outbound_rx, writer));
        register_endpoints(&id, &handlers, &rpc);

        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match codec::decode_frame(&line) {
                    Ok(Some(msg)) => dispatch(&id, &handlers, &rpc, &outbound_tx, &events_tx, msg),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(worker = %id, error = %err, "discarding unparseable frame");
                    }
                },
                Ok(None) => break,
                Err(err) => {
                    writer_task.abort();
                    return Err(WorkerError::Read(err));
                }
            }
        }

        debug!(worker = %id, "stdin closed; worker loop done");
        // Stdin EOF is the broker telling us to go. Outstanding handler tasks may still
        // hold transport clones (a registration call that never got its reply, say), so
        // the writer is stopped rather than drained.
        writer_task.abort();
        let _ = writer_task.await;
        Ok(())
    }
}

fn dispatch(
    worker_id: &str,
    handlers: &HashMap<String, MethodHandler>,
    rpc: &RpcClient,
    outbound: &mpsc::Sender<Message>,
    events: &mpsc::Sender<Message>,
    msg: Message,
) {
    match msg.kind {
        MessageType::Request => {
            let handler = handlers.get(&msg.id).cloned();
            serve_request(worker_id.to_string(), handler, outbound.clone(), msg);
        }
        MessageType::Response | MessageType::Error => {
            if let Some(unmatched) = rpc.pending().dispatch(msg) {
                log_unmatched_reply(&unmatched);
            }
        }
        MessageType::Event => {
            if msg.id == PROCESS_EXITED_EVENT {
                if let Some(peer) = msg
                    .payload
                    .as_ref()
                    .and_then(|p| p.get("id"))
                    .and_then(Value::as_str)
                {
                    let failed = rpc.pending().fail_peer(peer);
                    if failed > 0 {
                        warn!(worker = %worker_id, peer, calls = failed, "peer exited");
                    }
                }
            }
            if events.try_send(msg).is_err() {
                debug!(worker = %worker_id, "dropping event; nobody is listening");
            }
        }
    }
}

fn serve_request(
    worker_id: String,
    handler: Option<MethodHandler>,
    outbound: mpsc::Sender<Message>,
    req: Message,
) {
    tokio::spawn(async move {
        let reply = match handler {
            Some(handler) => {
                let params = req.payload.clone().unwrap_or(Value::Null);
                match (handler.as_ref())(params).await {
                    Ok(payload) => Message::response_to(&req, worker_id, Some(payload)),
                    Err(error) => Message::error_reply(
                        req.id.clone(),
                        worker_id,
                        req.source.clone().unwrap_or_default(),
                        req.correlation_id.clone(),
                        error,
                    ),
                }
            }
            None => Message::error_reply(
                req.id.clone(),
                worker_id,
                req.source.clone().unwrap_or_default(),
                req.correlation_id.clone(),
                format!("unknown method `{}`", req.id),
            ),
        };
        if outbound.send(reply).await.is_err() {
            debug!("outbound closed before reply could be sent");
        }
    });
}

/// Advertises every registered method to the broker. Failures are logged, not fatal:
/// the broker may not be draining yet, and registration is idempotent on restart.
fn register_endpoints(worker_id: &str, handlers: &HashMap<String, MethodHandler>, rpc: &RpcClient) {
    for method in handlers.keys().cloned() {
        let rpc = rpc.clone();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let params = json!({"process_id": worker_id, "endpoint": &method});
            if let Err(err) = rpc.invoke("", METHOD_REGISTER_ENDPOINT, &params).await {
                warn!(method = %method, error = %err, "endpoint registration failed");
            }
        });
    }
}

async fn writer_loop<W>(mut outbound: mpsc::Receiver<Message>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(msg) = outbound.recv().await {
        let line = match codec::encode_frame(&msg) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "dropping unencodable outbound message");
                continue;
            }
        };
        if writer.write_all(line.as_bytes()).await.is_err()
            || writer.write_all(b"\n").await.is_err()
            || writer.flush().await.is_err()
        {
            warn!("stdout write failed; stopping writer");
            break;
        }
    }
}
