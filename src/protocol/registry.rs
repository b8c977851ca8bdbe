//! Procedure registry with per-method instance pools.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use tracing::{debug, trace};

use super::procedure::{DeferredProcedure, FnProcedure};
use super::{Arity, Fault, Procedure, Value};

/// Default number of idle instances kept per method.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Name of the built-in method-listing procedure.
pub const LIST_METHODS: &str = "system.listMethods";

/// Creates fresh procedure instances for one method.
pub trait ProcedureFactory: Send + Sync {
    /// Build a new instance.
    fn create(&self) -> Box<dyn Procedure>;
}

impl<F> ProcedureFactory for F
where
    F: Fn() -> Box<dyn Procedure> + Send + Sync,
{
    fn create(&self) -> Box<dyn Procedure> {
        self()
    }
}

struct Entry {
    name: String,
    factory: Box<dyn ProcedureFactory>,
    idle: Mutex<Vec<Box<dyn Procedure>>>,
    outstanding: AtomicUsize,
    capacity: usize,
}

impl Entry {
    fn acquire(self: &Arc<Self>) -> ProcedureHandle {
        let pooled = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let procedure = pooled.unwrap_or_else(|| {
            trace!(method = %self.name, "creating procedure instance");
            self.factory.create()
        });
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        ProcedureHandle {
            procedure: Some(procedure),
            entry: Arc::clone(self),
        }
    }
}

/// Maps method names to procedure factories.
///
/// The name map is only locked while looking up or registering a method.
/// Instances handed out by [`Registry::resolve`] go back to a bounded idle
/// pool when their [`ProcedureHandle`] drops.
pub struct Registry {
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    pool_capacity: usize,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Empty registry with the default pool capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_pool_capacity(DEFAULT_POOL_CAPACITY)
    }

    /// Empty registry keeping at most `pool_capacity` idle instances per method.
    #[must_use]
    pub fn with_pool_capacity(pool_capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pool_capacity,
        }
    }

    /// Idle instances kept per method.
    #[must_use]
    pub const fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Register `factory` under `name`. Returns `true` if it replaced an existing method.
    pub fn register(&self, name: impl Into<String>, factory: impl ProcedureFactory + 'static) -> bool {
        let name = name.into();
        let entry = Arc::new(Entry {
            name: name.clone(),
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
            capacity: self.pool_capacity,
        });
        debug!(method = %name, "register procedure");
        self.write().insert(name, entry).is_some()
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&self, name: impl Into<String>, arity: Arity, handler: F) -> bool
    where
        F: Fn(&[Value]) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move || -> Box<dyn Procedure> {
            Box::new(FnProcedure::from_shared(arity, handler.clone()))
        })
    }

    /// Register a closure run as a scheduled job.
    pub fn register_deferred<F>(&self, name: impl Into<String>, arity: Arity, handler: F) -> bool
    where
        F: Fn(Vec<Value>) -> Result<Value, Fault> + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        self.register(name, move || -> Box<dyn Procedure> {
            Box::new(DeferredProcedure::from_shared(arity, handler.clone()))
        })
    }

    /// Register `system.listMethods`, returning the sorted method names.
    pub fn register_introspection(self: &Arc<Self>) -> bool {
        let registry: Weak<Self> = Arc::downgrade(self);
        self.register_fn(LIST_METHODS, Arity::NONE, move |_| {
            let registry = registry
                .upgrade()
                .ok_or_else(|| Fault::internal("registry dropped"))?;
            Ok(Value::Array(
                registry.method_names().into_iter().map(Value::Str).collect(),
            ))
        })
    }

    /// Remove `name`. Outstanding handles stay valid until dropped.
    pub fn unregister(&self, name: &str) -> bool {
        self.write().remove(name).is_some()
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered method names in sorted order.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Check out an instance of `name`.
    pub fn resolve(&self, name: &str) -> Option<ProcedureHandle> {
        let entry = self.read().get(name).cloned()?;
        Some(entry.acquire())
    }

    /// Return `handle` to its pool.
    pub fn release(&self, handle: ProcedureHandle) {
        drop(handle);
    }

    /// Handles for `name` currently checked out.
    #[must_use]
    pub fn outstanding(&self, name: &str) -> usize {
        self.read()
            .get(name)
            .map_or(0, |entry| entry.outstanding.load(Ordering::Relaxed))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Entry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("methods", &self.method_names())
            .field("pool_capacity", &self.pool_capacity)
            .finish()
    }
}

/// Procedure instance leased from the registry.
pub struct ProcedureHandle {
    procedure: Option<Box<dyn Procedure>>,
    entry: Arc<Entry>,
}

impl ProcedureHandle {
    /// Method name this instance was resolved under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    /// The leased procedure.
    pub fn procedure(&mut self) -> &mut dyn Procedure {
        self.procedure
            .as_deref_mut()
            .expect("procedure already returned to pool")
    }
}

impl fmt::Debug for ProcedureHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureHandle")
            .field("name", &self.entry.name)
            .finish_non_exhaustive()
    }
}

impl Drop for ProcedureHandle {
    fn drop(&mut self) {
        if let Some(procedure) = self.procedure.take() {
            self.entry.outstanding.fetch_sub(1, Ordering::Relaxed);
            let mut idle = self
                .entry
                .idle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if idle.len() < self.entry.capacity {
                idle.push(procedure);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_registry() -> Registry {
        let registry = Registry::with_pool_capacity(1);
        registry.register_fn("echo", Arity::exactly(1), |args| Ok(args[0].clone()));
        registry
    }

    #[test]
    fn test_resolve_unknown_method() {
        let registry = echo_registry();
        assert!(registry.resolve("nope").is_none());
        assert_eq!(registry.outstanding("nope"), 0);
    }

    #[test]
    fn test_handles_are_counted_and_released() {
        let registry = echo_registry();
        let first = registry.resolve("echo").unwrap();
        let second = registry.resolve("echo").unwrap();
        assert_eq!(first.name(), "echo");
        assert_eq!(registry.outstanding("echo"), 2);

        registry.release(first);
        drop(second);
        assert_eq!(registry.outstanding("echo"), 0);
    }

    #[test]
    fn test_idle_pool_is_bounded() {
        let registry = echo_registry();
        let handles: Vec<_> = (0..3).map(|_| registry.resolve("echo").unwrap()).collect();
        drop(handles);
        let entry = registry.read().get("echo").cloned().unwrap();
        assert_eq!(entry.idle.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_method_names_sorted() {
        let registry = Arc::new(echo_registry());
        registry.register_fn("add", Arity::exactly(2), |_| Ok(Value::Void));
        assert!(!registry.register_introspection());
        assert_eq!(registry.method_names(), ["add", "echo", LIST_METHODS]);
        assert!(registry.unregister("add"));
        assert!(!registry.contains("add"));
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = echo_registry();
        assert!(registry.register_fn("echo", Arity::NONE, |_| Ok(Value::Void)));
        let mut handle = registry.resolve("echo").unwrap();
        assert_eq!(handle.procedure().begin_arguments(), Arity::NONE);
    }
}
