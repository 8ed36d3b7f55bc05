//! The session interface steps read and write.

use crate::continuation::Continuation;
use async_trait::async_trait;
use musubi_core::{Value, WorkflowError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// A session object whose fields can be read and written.
///
/// Storage is someone else's concern; the engine only needs get/set and an
/// optional asynchronous save.
#[async_trait]
pub trait Session: Send + Sync {
    /// Returns the field `key`.
    fn get(&self, key: &str) -> Option<Value>;

    /// Sets the field `key`.
    fn set(&self, key: &str, value: Value);

    /// Persists the session. The default does nothing.
    async fn save(&self) -> Result<(), WorkflowError> {
        Ok(())
    }
}

/// Saves `session`, then fulfills with `values`.
///
/// Return this from a handler to advance only once the session is persisted.
pub fn save_then(session: Arc<dyn Session>, values: Vec<Value>) -> Continuation {
    Continuation::spawn(async move {
        session.save().await?;
        Ok(values)
    })
}

/// An in-memory [`Session`].
#[derive(Debug, Default)]
pub struct MemorySession {
    fields: Mutex<HashMap<String, Value>>,
    saves: AtomicUsize,
}

impl MemorySession {
    /// Creates an empty session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for MemorySession {
    fn get(&self, key: &str) -> Option<Value> {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: Value) {
        self.fields
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    async fn save(&self) -> Result<(), WorkflowError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
