use std::collections::hash_map::Entry;
use std::collections::HashMap;
use uuid::Uuid;

/// Maps caller-supplied idempotency keys to job ids.
///
/// Entries are insert-only: once a key points at a job it never moves.
/// Callers must hold the same lock that guards job creation so the lookup
/// and the insert form one atomic unit.
#[derive(Debug, Default)]
pub struct IdempotencyIndex {
    keys: HashMap<String, Uuid>,
}

impl IdempotencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Uuid> {
        self.keys.get(key).copied()
    }

    /// Returns `(job_id, inserted)`. `make_id` only runs when the key is new.
    pub fn get_or_insert_with(&mut self, key: &str, make_id: impl FnOnce() -> Uuid) -> (Uuid, bool) {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(e) => (*e.get(), false),
            Entry::Vacant(e) => (*e.insert(make_id()), true),
        }
    }
}
