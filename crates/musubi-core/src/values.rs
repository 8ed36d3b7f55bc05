//! Name-keyed value storage shared by the steps of one sequence instance.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// A type-erased, cheaply cloneable value.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Wraps any `Send + Sync` value into a [`Value`].
///
/// # Examples
///
/// ```
/// use musubi_core::value;
///
/// let v = value(42u32);
/// assert_eq!(v.downcast_ref::<u32>(), Some(&42));
/// ```
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// Downcasts a [`Value`] and clones the result out.
pub fn downcast<T: Any + Clone>(v: &Value) -> Option<T> {
    v.downcast_ref::<T>().cloned()
}

/// The accumulated named values of one running sequence.
///
/// `Values` is a handle: clones share the same underlying mapping, so every
/// step of an instance sees what earlier steps wrote. A new mapping is only
/// created with [`Values::new`].
///
/// # Examples
///
/// ```
/// use musubi_core::Values;
///
/// let values = Values::new();
/// values.insert("code", "abc".to_string());
///
/// let shared = values.clone();
/// assert_eq!(shared.get::<String>("code"), Some("abc".to_string()));
///
/// // Wrong type returns None
/// assert_eq!(values.get::<u64>("code"), None);
/// ```
#[derive(Clone)]
pub struct Values {
    inner: Arc<Mutex<HashMap<String, Value>>>,
    started_at: Instant,
}

impl fmt::Debug for Values {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys = self.keys();
        keys.sort();
        f.debug_struct("Values")
            .field("keys", &keys)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl Default for Values {
    fn default() -> Self {
        Self::new()
    }
}

impl Values {
    /// Creates a new, empty mapping.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            started_at: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts a typed value under `name`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&self, name: impl Into<String>, v: T) {
        self.lock().insert(name.into(), Arc::new(v));
    }

    /// Inserts an already type-erased value under `name`.
    pub fn insert_value(&self, name: impl Into<String>, v: Value) {
        self.lock().insert(name.into(), v);
    }

    /// Returns a clone of the value under `name`.
    ///
    /// Returns `None` if the name is absent or the type doesn't match.
    pub fn get<T: Any + Clone>(&self, name: &str) -> Option<T> {
        self.lock().get(name).and_then(downcast::<T>)
    }

    /// Returns the type-erased value under `name`.
    pub fn get_value(&self, name: &str) -> Option<Value> {
        self.lock().get(name).cloned()
    }

    /// Removes the value under `name` and returns it.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.lock().remove(name)
    }

    /// Returns `true` if a value is stored under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Returns the stored names, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Returns the number of stored values.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns `true` if both handles refer to the same mapping.
    pub fn same_as(&self, other: &Values) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns the time elapsed since the mapping was created.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
