#![forbid(unsafe_code)]
//! Durable "fetch batch → store batch" job runs on top of the broker.
//!
//! A [`JobRun`] is one instance of the pipeline: a cursor into a remote data set, a
//! batch size, and monotonic progress counters, persisted as JSON in an embedded sled
//! tree so runs survive process restarts. Run state moves through a validated machine
//! ([`can_transition`]): `Queued → Running ⇄ Paused`, ending in one of the terminal
//! states `Completed`, `Failed`, or `Stopped`.
//!
//! The [`JobExecutor`] enforces that at most one run is active (Running or Paused)
//! at a time, drives the fetch→store loop over any [`RpcCaller`] (the broker's
//! [`RpcClient`](broker_core::RpcClient) in production, scripted fakes in tests),
//! classifies failures into rate-limit, transient, and unrecoverable, backs off
//! accordingly, and adopts interrupted runs at startup: a run found Running is
//! resumed automatically, a run found Paused stays paused until an operator says
//! otherwise.

mod error;
mod executor;
mod run;
mod state;
mod store;

pub use error::JobError;
pub use executor::{
    ExecutorConfig, JobExecutor, RpcCaller, METHOD_FETCH_CVES, METHOD_SAVE_CVE_BY_ID,
};
pub use run::{JobRun, TypeProgress};
pub use state::{can_transition, RunState};
pub use store::{RunStore, RUNS_TREE};
