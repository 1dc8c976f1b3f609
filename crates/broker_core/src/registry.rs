use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

/// Maps worker id → set of method names that worker serves.
///
/// Registration is additive and idempotent. Entries are kept when a worker exits (the
/// registry documents what a worker served; routing consults the process table) and are
/// cleared only by broker shutdown.
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    inner: Mutex<BTreeMap<String, BTreeSet<String>>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `method` for `process_id`. Returns false when the pair was already known.
    pub fn register(&self, process_id: &str, method: &str) -> bool {
        let mut inner = self.lock();
        inner
            .entry(process_id.to_string())
            .or_default()
            .insert(method.to_string())
    }

    /// Snapshot of the methods `process_id` serves, sorted.
    pub fn endpoints_of(&self, process_id: &str) -> Vec<String> {
        self.lock()
            .get(process_id)
            .map(|methods| methods.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every registration, keyed by worker id.
    pub fn all(&self) -> BTreeMap<String, Vec<String>> {
        self.lock()
            .iter()
            .map(|(id, methods)| (id.clone(), methods.iter().cloned().collect()))
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BTreeSet<String>>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
