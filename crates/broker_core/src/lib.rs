#![forbid(unsafe_code)]
//! Supervised multi-process message broker with line-delimited JSON RPC over child stdio.
//!
//! The [`Broker`] spawns worker subprocesses with piped stdio, is the sole reader of each
//! child's stdout and the sole writer of each child's stdin, and routes one-JSON-object-per-line
//! [`Message`] envelopes between children by their `target` field. Messages addressed to the
//! broker itself are either answered by the built-in control surface (`RPCSpawn`,
//! `RPCListProcesses`, `RPCRegisterEndpoint`, ... — see [`handlers`]) or surfaced through
//! [`Broker::receive_message`].
//!
//! Request/response pairing rides on opaque correlation ids: [`RpcClient`] keeps a pending
//! table of outstanding calls, enforces a per-call timeout (30 s by default) and honors a
//! [`CancellationToken`](tokio_util::sync::CancellationToken), and surfaces remote `error`
//! envelopes, timeouts, cancellation, and peer exits as distinct [`RpcError`] variants.
//!
//! On the other side of the pipe, a child embeds [`WorkerRuntime`]: a stdin/stdout loop that
//! decodes the same envelopes, dispatches requests to registered async method handlers,
//! self-registers its endpoints with the broker at startup, and shares the transport with its
//! own [`RpcClient`] for outbound calls. Stderr is never used for framing — it stays available
//! for human logs.
//!
//! Supervision guarantees:
//! - a child's `process_exited` event is emitted only after its stdout has been drained to EOF,
//!   so everything the child wrote before dying is delivered first;
//! - children spawned with [`Broker::spawn_with_restart`] are respawned with capped exponential
//!   backoff until their restart budget is exhausted;
//! - killing a child closes its stdin (the polite shutdown signal for stdio workers), waits a
//!   short grace, then force-kills.
//!
//! ```rust,no_run
//! use broker_core::Broker;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new("broker");
//! broker.spawn("fetcher", "./remote-worker", &[])?;
//! let reply = broker
//!     .rpc()
//!     .invoke("fetcher", "RPCFetchCVEs", &serde_json::json!({"start_index": 0}))
//!     .await?;
//! println!("{:?}", reply.payload);
//! # Ok(()) }
//! ```

mod broker;
mod codec;
mod error;
pub mod handlers;
mod message;
mod process;
mod registry;
mod rpc;
mod stats;
mod worker;

pub use broker::{Broker, PROCESS_EXITED_EVENT};
pub use codec::{decode_frame, encode_frame, CodecError};
pub use error::BrokerError;
pub use message::{Message, MessageType};
pub use process::{ProcessSnapshot, ProcessStatus, RestartPolicy};
pub use registry::EndpointRegistry;
pub use rpc::{PendingReplies, RpcClient, RpcError, DEFAULT_RPC_TIMEOUT};
pub use stats::MessageStatsSnapshot;
pub use worker::{HandlerFuture, MethodHandler, WorkerError, WorkerRuntime};
