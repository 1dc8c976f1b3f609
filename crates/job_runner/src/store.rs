use std::path::Path;

use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::{debug, warn};

use crate::{can_transition, JobError, JobRun, RunState};

/// Name of the sled tree holding serialized runs, keyed by run id.
pub const RUNS_TREE: &str = "job_runs";

/// Durable store of job runs backed by an embedded sled database.
///
/// All mutations run inside sled transactions, which serialize concurrent writers per
/// key; that transaction discipline is the only concurrency control durable state needs.
pub struct RunStore {
    db: sled::Db,
    tree: sled::Tree,
}

impl RunStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(RUNS_TREE)?;
        Ok(Self { db, tree })
    }

    /// Creates a new run in state Queued with zeroed counters. Fails when the id is taken.
    pub fn create_run(
        &self,
        id: &str,
        start_index: u64,
        results_per_batch: u64,
        data_type: &str,
    ) -> Result<JobRun, JobError> {
        if results_per_batch == 0 {
            return Err(JobError::InvalidBatchSize);
        }
        let run = self
            .tree
            .transaction(|tx| {
                if tx.get(id.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(JobError::DuplicateRun {
                        id: id.to_string(),
                    }));
                }
                let run = JobRun::new(
                    id.to_string(),
                    start_index,
                    results_per_batch,
                    data_type.to_string(),
                );
                let raw = encode(&run).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(id.as_bytes(), raw)?;
                Ok(run)
            })
            .map_err(flatten)?;
        debug!(run = %id, start_index, results_per_batch, data_type, "created run");
        Ok(run)
    }

    /// Loads one run; absence is its own error so callers can tell "no such run" from
    /// storage failures.
    pub fn get_run(&self, id: &str) -> Result<JobRun, JobError> {
        match self.tree.get(id.as_bytes())? {
            Some(raw) => decode(id, &raw),
            None => Err(JobError::RunNotFound { id: id.to_string() }),
        }
    }

    /// Every run in the store, in key order. Undecodable records are logged and skipped
    /// so one corrupt value cannot hide the rest.
    pub fn list_runs(&self) -> Result<Vec<JobRun>, JobError> {
        let mut runs = Vec::new();
        for item in self.tree.iter() {
            let (key, raw) = item?;
            let id = String::from_utf8_lossy(&key).into_owned();
            match decode(&id, &raw) {
                Ok(run) => runs.push(run),
                Err(err) => warn!(run = %id, error = %err, "skipping undecodable run record"),
            }
        }
        Ok(runs)
    }

    /// The unique run in {Running, Paused}, or `None`. When the invariant is violated the
    /// first one encountered wins and a warning is logged; the executor repairs the rest.
    pub fn get_active_run(&self) -> Result<Option<JobRun>, JobError> {
        let active: Vec<JobRun> = self
            .list_runs()?
            .into_iter()
            .filter(|run| run.state.is_active())
            .collect();
        if active.len() > 1 {
            warn!(
                count = active.len(),
                kept = %active[0].id,
                "more than one active run in the store"
            );
        }
        Ok(active.into_iter().next())
    }

    /// The run with the greatest `updated_at`, or `None` for an empty store.
    pub fn get_latest_run(&self) -> Result<Option<JobRun>, JobError> {
        Ok(self
            .list_runs()?
            .into_iter()
            .max_by_key(|run| run.updated_at))
    }

    /// Moves a run to `to` after checking the transition table; illegal transitions leave
    /// the record untouched.
    pub fn update_state(&self, id: &str, to: RunState) -> Result<JobRun, JobError> {
        let run = self
            .tree
            .transaction(|tx| {
                let mut run = load_in_tx(tx, id)?;
                if !can_transition(run.state, to) {
                    return Err(ConflictableTransactionError::Abort(
                        JobError::IllegalTransition {
                            id: id.to_string(),
                            from: run.state,
                            to,
                        },
                    ));
                }
                run.state = to;
                run.updated_at = chrono::Utc::now();
                let raw = encode(&run).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(id.as_bytes(), raw)?;
                Ok(run)
            })
            .map_err(flatten)?;
        debug!(run = %id, state = %to, "updated run state");
        Ok(run)
    }

    /// Adds non-negative deltas to the run's counters (cumulative, never replacing).
    pub fn update_progress(
        &self,
        id: &str,
        fetched: u64,
        stored: u64,
        errors: u64,
    ) -> Result<JobRun, JobError> {
        self.tree
            .transaction(|tx| {
                let mut run = load_in_tx(tx, id)?;
                run.apply_progress(fetched, stored, errors);
                run.updated_at = chrono::Utc::now();
                let raw = encode(&run).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(id.as_bytes(), raw)?;
                Ok(run)
            })
            .map_err(flatten)
    }

    /// Fails the run with a message. The transition to Failed still goes through the
    /// table, so a terminal run cannot be re-failed.
    pub fn set_error(&self, id: &str, message: &str) -> Result<JobRun, JobError> {
        self.tree
            .transaction(|tx| {
                let mut run = load_in_tx(tx, id)?;
                if !can_transition(run.state, RunState::Failed) {
                    return Err(ConflictableTransactionError::Abort(
                        JobError::IllegalTransition {
                            id: id.to_string(),
                            from: run.state,
                            to: RunState::Failed,
                        },
                    ));
                }
                run.state = RunState::Failed;
                run.error_message = Some(message.to_string());
                run.updated_at = chrono::Utc::now();
                let raw = encode(&run).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(id.as_bytes(), raw)?;
                Ok(run)
            })
            .map_err(flatten)
    }

    pub fn delete_run(&self, id: &str) -> Result<(), JobError> {
        match self.tree.remove(id.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(JobError::RunNotFound { id: id.to_string() }),
        }
    }

    /// Flushes dirty pages to disk. Dropping the store also flushes; this is for
    /// explicit barriers (shutdown, checkpoints).
    pub fn flush(&self) -> Result<(), JobError> {
        self.db.flush()?;
        Ok(())
    }
}

fn load_in_tx(
    tx: &sled::transaction::TransactionalTree,
    id: &str,
) -> Result<JobRun, ConflictableTransactionError<JobError>> {
    let raw = tx
        .get(id.as_bytes())?
        .ok_or_else(|| ConflictableTransactionError::Abort(JobError::RunNotFound { id: id.to_string() }))?;
    decode(id, &raw).map_err(ConflictableTransactionError::Abort)
}

fn encode(run: &JobRun) -> Result<Vec<u8>, JobError> {
    serde_json::to_vec(run).map_err(|source| JobError::Serialize {
        id: run.id.clone(),
        source,
    })
}

fn decode(id: &str, raw: &[u8]) -> Result<JobRun, JobError> {
    serde_json::from_slice(raw).map_err(|source| JobError::Decode {
        id: id.to_string(),
        source,
    })
}

fn flatten(err: TransactionError<JobError>) -> JobError {
    match err {
        TransactionError::Abort(job) => job,
        TransactionError::Storage(storage) => JobError::Store(storage),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::open(dir.path().join("runs.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn create_then_get_round_trips() {
        let (_dir, store) = store();
        let created = store.create_run("r1", 0, 200, "cve").unwrap();
        let loaded = store.get_run("r1").unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.state, RunState::Queued);
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let (_dir, store) = store();
        store.create_run("r1", 0, 200, "cve").unwrap();
        let err = store.create_run("r1", 0, 200, "cve").unwrap_err();
        assert!(matches!(err, JobError::DuplicateRun { .. }));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let (_dir, store) = store();
        let err = store.create_run("r1", 0, 0, "cve").unwrap_err();
        assert!(matches!(err, JobError::InvalidBatchSize));
    }

    #[test]
    fn missing_run_is_a_distinct_error() {
        let (_dir, store) = store();
        assert!(matches!(
            store.get_run("ghost").unwrap_err(),
            JobError::RunNotFound { .. }
        ));
        assert!(matches!(
            store.delete_run("ghost").unwrap_err(),
            JobError::RunNotFound { .. }
        ));
    }

    #[test]
    fn illegal_transition_leaves_the_record_untouched() {
        let (_dir, store) = store();
        store.create_run("r1", 0, 200, "cve").unwrap();
        let err = store.update_state("r1", RunState::Paused).unwrap_err();
        assert!(matches!(
            err,
            JobError::IllegalTransition {
                from: RunState::Queued,
                to: RunState::Paused,
                ..
            }
        ));
        assert_eq!(store.get_run("r1").unwrap().state, RunState::Queued);
    }

    #[test]
    fn progress_deltas_accumulate_exactly() {
        let (_dir, store) = store();
        store.create_run("r1", 0, 200, "cve").unwrap();
        store.update_progress("r1", 200, 195, 5).unwrap();
        let run = store.update_progress("r1", 100, 100, 0).unwrap();
        assert_eq!(
            (run.fetched_count, run.stored_count, run.error_count),
            (300, 295, 5)
        );
        assert_eq!(run.progress["cve"].stored_count, 295);
    }

    #[test]
    fn concurrent_progress_updates_serialize() {
        let (_dir, store) = store();
        store.create_run("r1", 0, 200, "cve").unwrap();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.update_progress("r1", 1, 1, 0).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let run = store.get_run("r1").unwrap();
        assert_eq!((run.fetched_count, run.stored_count), (10, 10));
    }

    #[test]
    fn active_run_is_found_and_unique() {
        let (_dir, store) = store();
        assert!(store.get_active_run().unwrap().is_none());
        store.create_run("r1", 0, 200, "cve").unwrap();
        assert!(store.get_active_run().unwrap().is_none());

        store.update_state("r1", RunState::Running).unwrap();
        assert_eq!(store.get_active_run().unwrap().unwrap().id, "r1");

        store.update_state("r1", RunState::Paused).unwrap();
        assert_eq!(store.get_active_run().unwrap().unwrap().id, "r1");

        store.update_state("r1", RunState::Stopped).unwrap();
        assert!(store.get_active_run().unwrap().is_none());
    }

    #[test]
    fn latest_run_tracks_updated_at() {
        let (_dir, store) = store();
        store.create_run("r1", 0, 200, "cve").unwrap();
        store.create_run("r2", 0, 200, "cve").unwrap();
        store.update_state("r2", RunState::Running).unwrap();
        assert_eq!(store.get_latest_run().unwrap().unwrap().id, "r2");
        store.update_progress("r1", 0, 0, 0).unwrap();
        assert_eq!(store.get_latest_run().unwrap().unwrap().id, "r1");
    }

    #[test]
    fn set_error_fails_the_run_with_message() {
        let (_dir, store) = store();
        store.create_run("r1", 0, 200, "cve").unwrap();
        store.update_state("r1", RunState::Running).unwrap();
        let run = store.set_error("r1", "upstream went away").unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error_message.as_deref(), Some("upstream went away"));

        // Terminal: cannot fail twice.
        let err = store.set_error("r1", "again").unwrap_err();
        assert!(matches!(err, JobError::IllegalTransition { .. }));
    }

    #[test]
    fn runs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.db");
        {
            let store = RunStore::open(&path).unwrap();
            store.create_run("r1", 40, 25, "cve").unwrap();
            store.update_state("r1", RunState::Running).unwrap();
            store.update_progress("r1", 25, 25, 0).unwrap();
            store.flush().unwrap();
        }
        let store = RunStore::open(&path).unwrap();
        let run = store.get_run("r1").unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.fetched_count, 25);
        assert_eq!(run.start_index, 40);
    }
}
