//! The broker's own RPC surface.
//!
//! Requests addressed to the broker whose `id` names one of the methods below are
//! answered in-process; the reply rides the normal routing path back to the caller.
//! Parameter and reply shapes are part of the wire contract, so they are plain serde
//! structs rather than ad-hoc JSON.

use std::{collections::BTreeMap, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    broker::BrokerInner, Message, MessageStatsSnapshot, ProcessSnapshot, ProcessStatus,
};

pub const METHOD_SPAWN: &str = "RPCSpawn";
pub const METHOD_SPAWN_RPC: &str = "RPCSpawnRPC";
pub const METHOD_GET_PROCESS: &str = "RPCGetProcess";
pub const METHOD_LIST_PROCESSES: &str = "RPCListProcesses";
pub const METHOD_KILL: &str = "RPCKill";
pub const METHOD_GET_MESSAGE_COUNT: &str = "RPCGetMessageCount";
pub const METHOD_GET_MESSAGE_STATS: &str = "RPCGetMessageStats";
pub const METHOD_REGISTER_ENDPOINT: &str = "RPCRegisterEndpoint";
pub const METHOD_GET_ENDPOINTS: &str = "RPCGetEndpoints";
pub const METHOD_GET_ALL_ENDPOINTS: &str = "RPCGetAllEndpoints";

/// Every method the broker answers itself.
pub const BROKER_METHODS: &[&str] = &[
    METHOD_SPAWN,
    METHOD_SPAWN_RPC,
    METHOD_GET_PROCESS,
    METHOD_LIST_PROCESSES,
    METHOD_KILL,
    METHOD_GET_MESSAGE_COUNT,
    METHOD_GET_MESSAGE_STATS,
    METHOD_REGISTER_ENDPOINT,
    METHOD_GET_ENDPOINTS,
    METHOD_GET_ALL_ENDPOINTS,
];

pub fn is_broker_method(method: &str) -> bool {
    BROKER_METHODS.contains(&method)
}

#[derive(Debug, Deserialize)]
pub struct SpawnParams {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SpawnReply {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub status: ProcessStatus,
}

#[derive(Debug, Deserialize)]
pub struct ProcessIdParams {
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessReply {
    pub id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
}

impl From<ProcessSnapshot> for ProcessReply {
    fn from(snap: ProcessSnapshot) -> Self {
        Self {
            id: snap.id,
            pid: snap.pid,
            command: snap.command,
            status: snap.status,
            exit_code: snap.exit_code,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListProcessesReply {
    pub processes: Vec<ProcessReply>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KillReply {
    pub success: bool,
    pub id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageCountReply {
    pub total_count: u64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterEndpointParams {
    pub process_id: String,
    pub endpoint: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterEndpointReply {
    pub success: bool,
    pub process_id: String,
    pub endpoint: String,
}

#[derive(Debug, Deserialize)]
pub struct GetEndpointsParams {
    pub process_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EndpointsReply {
    pub process_id: String,
    pub endpoints: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AllEndpointsReply {
    pub endpoints: BTreeMap<String, Vec<String>>,
    pub count: usize,
}

/// Answers one broker-addressed request. Always returns a reply envelope — either a
/// RESPONSE carrying the method's reply shape or an ERROR with the caller's
/// correlation id.
pub(crate) async fn handle_request(inner: &Arc<BrokerInner>, req: &Message) -> Message {
    debug!(method = %req.id, source = req.source.as_deref().unwrap_or(""), "handling broker request");
    match dispatch(inner, req).await {
        Ok(payload) => Message::response_to(req, inner.id.clone(), Some(payload)),
        Err(error) => error_reply_to(inner, req, error),
    }
}

async fn dispatch(
    inner: &Arc<BrokerInner>,
    req: &Message,
) -> Result<serde_json::Value, String> {
    match req.id.as_str() {
        METHOD_SPAWN => {
            let params: SpawnParams = parse_params(req)?;
            let snap = inner
                .spawn_child(params.id, params.command, params.args, None, false, 0)
                .map_err(|err| err.to_string())?;
            reply_value(SpawnReply {
                id: snap.id,
                pid: snap.pid,
                command: snap.command,
                status: snap.status,
            })
        }
        METHOD_SPAWN_RPC => {
            let params: SpawnParams = parse_params(req)?;
            let snap = inner
                .spawn_child(params.id, params.command, params.args, None, true, 0)
                .map_err(|err| err.to_string())?;
            reply_value(SpawnReply {
                id: snap.id,
                pid: snap.pid,
                command: snap.command,
                status: snap.status,
            })
        }
        METHOD_GET_PROCESS => {
            let params: ProcessIdParams = parse_params(req)?;
            let snap = inner
                .entry(&params.id)
                .map_err(|err| err.to_string())?
                .snapshot();
            reply_value(ProcessReply::from(snap))
        }
        METHOD_LIST_PROCESSES => {
            let mut processes: Vec<ProcessReply> = {
                let entries = inner.lock_processes();
                entries.values().map(|e| ProcessReply::from(e.snapshot())).collect()
            };
            processes.sort_by(|a, b| a.id.cmp(&b.id));
            let count = processes.len();
            reply_value(ListProcessesReply { processes, count })
        }
        METHOD_KILL => {
            let params: ProcessIdParams = parse_params(req)?;
            inner
                .kill_child(&params.id)
                .await
                .map_err(|err| err.to_string())?;
            reply_value(KillReply {
                success: true,
                id: params.id,
            })
        }
        METHOD_GET_MESSAGE_COUNT => {
            let total_count = inner.lock_stats().total();
            reply_value(MessageCountReply { total_count })
        }
        METHOD_GET_MESSAGE_STATS => {
            let snapshot: MessageStatsSnapshot = inner.lock_stats().snapshot();
            reply_value(snapshot)
        }
        METHOD_REGISTER_ENDPOINT => {
            let params: RegisterEndpointParams = parse_params(req)?;
            // A known child must have been spawned as an RPC peer to advertise methods;
            // ids not in the process table may pre-register (workers spawned out of band).
            if let Ok(entry) = inner.entry(&params.process_id) {
                if !entry.rpc_peer {
                    return Err(format!(
                        "process `{}` is not an RPC peer",
                        params.process_id
                    ));
                }
            }
            inner.endpoints.register(&params.process_id, &params.endpoint);
            reply_value(RegisterEndpointReply {
                success: true,
                process_id: params.process_id,
                endpoint: params.endpoint,
            })
        }
        METHOD_GET_ENDPOINTS => {
            let params: GetEndpointsParams = parse_params(req)?;
            let endpoints = inner.endpoints.endpoints_of(&params.process_id);
            let count = endpoints.len();
            reply_value(EndpointsReply {
                process_id: params.process_id,
                endpoints,
                count,
            })
        }
        METHOD_GET_ALL_ENDPOINTS => {
            let endpoints = inner.endpoints.all();
            let count = endpoints.len();
            reply_value(AllEndpointsReply { endpoints, count })
        }
        other => Err(format!("unknown broker method `{other}`")),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(req: &Message) -> Result<T, String> {
    req.payload_as::<T>()
        .map_err(|err| format!("invalid params for `{}`: {err}", req.id))
}

fn reply_value<T: Serialize>(reply: T) -> Result<serde_json::Value, String> {
    serde_json::to_value(reply).map_err(|err| format!("failed to encode reply: {err}"))
}

fn error_reply_to(inner: &Arc<BrokerInner>, req: &Message, error: String) -> Message {
    Message::error_reply(
        req.id.clone(),
        inner.id.clone(),
        req.source.clone().unwrap_or_default(),
        req.correlation_id.clone(),
        error,
    )
}
