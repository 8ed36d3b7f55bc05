//! Modules: the owners of steps, sequences, handlers and configuration.

use crate::builder::SequenceBuilder;
use crate::config::ModuleConfig;
use crate::route::{Method, Next, RouteTriggeredSequence, NEXT};
use crate::sequence::{SequenceDecl, StepSequence};
use crate::step::{FailureHandler, Handler, Jump, Outcome, Step};
use musubi_core::{downcast, FromArgs, StepArgs, StepName, Value, Values, WorkflowError};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tracing::{debug, error};

/// Turns a structured remote error payload into a [`WorkflowError`].
pub type Normalizer = Arc<dyn Fn(&serde_json::Value) -> WorkflowError + Send + Sync>;

/// Terminates a request by redirecting its response to a location.
pub type RedirectHook = Arc<dyn Fn(&Value, &str) -> Result<(), WorkflowError> + Send + Sync>;

/// Runs once before a module is first used.
pub type InitHook = Arc<dyn Fn(&Module) -> Result<(), WorkflowError> + Send + Sync>;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ModuleInner {
    name: String,
    parent: Option<Module>,
    steps: RwLock<HashMap<StepName, Step>>,
    sequences: RwLock<HashMap<String, SequenceDecl>>,
    handlers: RwLock<HashMap<StepName, Handler>>,
    configurables: RwLock<BTreeMap<String, String>>,
    settings: RwLock<HashMap<String, Value>>,
    submodules: RwLock<BTreeMap<String, Weak<ModuleInner>>>,
    timeout: RwLock<Option<Option<Duration>>>,
    debug: RwLock<Option<bool>>,
    errback: RwLock<Option<FailureHandler>>,
    normalizer: RwLock<Option<Normalizer>>,
    redirect: RwLock<Option<RedirectHook>>,
    init: RwLock<Option<InitHook>>,
    initializing: AtomicBool,
    initialized: OnceLock<Result<(), WorkflowError>>,
    validated: RwLock<HashMap<String, Result<(), WorkflowError>>>,
}

/// A named owner of steps, sequences, handlers and configurable properties.
///
/// A submodule keeps a live reference to its parent. Steps and sequences
/// are copied into the submodule when it is created, so it can change them
/// without touching the parent. Everything else (handlers, configurables,
/// settings, hooks, and any step or sequence the parent declares later) is
/// looked up through the parent until the submodule overrides it.
///
/// Clones share state.
///
/// # Examples
///
/// ```
/// use musubi::prelude::*;
///
/// let oauth2 = Module::new("oauth2");
/// oauth2
///     .declare_configurable("appId", "the client id issued by the provider")
///     .declare_sequence("token")
///     .step("exchange")
///     .accepts(["code"])
///     .promises(["accessToken"])
///     .commit()
///     .unwrap();
/// oauth2.handle("exchange", |_, args| {
///     let code = args.arg::<String>(0)?;
///     Ok(Outcome::value(format!("token-for-{code}")))
/// });
///
/// let github = oauth2.create_submodule("github");
/// github.set("appId", "gh-123".to_string()).unwrap();
/// assert_eq!(github.get::<String>("appId").unwrap(), "gh-123");
/// assert!(oauth2.get::<String>("appId").is_err());
/// ```
#[derive(Clone)]
pub struct Module {
    inner: Arc<ModuleInner>,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.inner.name)
            .field("parent", &self.inner.parent.as_ref().map(Module::name))
            .field("steps", &self.step_names())
            .field("sequences", &self.sequence_names())
            .finish()
    }
}

/// Forwards a failure to the instance's [`Next`] callback, or logs it.
fn forward_to_next(module: &Module, failure: &WorkflowError, values: &Values) {
    match values.get::<Next>(NEXT) {
        Some(next) => next.call(failure.clone()),
        None => error!(module = %module.name(), error = %failure, "unhandled step failure"),
    }
}

impl Module {
    /// Creates a root module.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ModuleInner {
                name: name.into(),
                ..ModuleInner::default()
            }),
        }
    }

    /// The module name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The module this one delegates to.
    pub fn parent(&self) -> Option<&Module> {
        self.inner.parent.as_ref()
    }

    /// Finds the first value `f` produces, walking from this module up to the root.
    fn lookup<T>(&self, f: impl Fn(&ModuleInner) -> Option<T>) -> Option<T> {
        let mut current = Some(self);
        while let Some(module) = current {
            if let Some(found) = f(&module.inner) {
                return Some(found);
            }
            current = module.inner.parent.as_ref();
        }
        None
    }

    /// The modules from the root down to this one.
    fn lineage(&self) -> Vec<&Module> {
        let mut chain = Vec::new();
        let mut current = Some(self);
        while let Some(module) = current {
            chain.push(module);
            current = module.inner.parent.as_ref();
        }
        chain.reverse();
        chain
    }

    /// Applies `config` to this module.
    pub fn with_config(&self, config: &ModuleConfig) -> &Self {
        self.set_timeout(config.timeout()).set_debug(config.debug)
    }

    /// Sets the default step timeout. `None` means never.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> &Self {
        *write(&self.inner.timeout) = Some(timeout);
        self
    }

    /// The default step timeout.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.lookup(|m| *read(&m.timeout))
            .unwrap_or_else(|| ModuleConfig::default().timeout())
    }

    /// Enables or disables step logging at `info` level.
    pub fn set_debug(&self, debug: bool) -> &Self {
        *write(&self.inner.debug) = Some(debug);
        self
    }

    /// Whether step logging is at `info` level.
    pub fn debug(&self) -> bool {
        self.lookup(|m| *read(&m.debug)).unwrap_or(false)
    }

    /// Declares a configurable property with a human-readable description.
    pub fn declare_configurable(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> &Self {
        write(&self.inner.configurables).insert(name.into(), description.into());
        self
    }

    /// The description of `name`, if declared here or by an ancestor.
    pub fn describe(&self, name: &str) -> Option<String> {
        self.lookup(|m| read(&m.configurables).get(name).cloned())
    }

    /// Every declared configurable with its description.
    pub fn configurables(&self) -> BTreeMap<String, String> {
        let mut all = BTreeMap::new();
        for module in self.lineage() {
            all.extend(read(&module.inner.configurables).clone());
        }
        all
    }

    /// Stores `value` for the configurable `name`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `name` was never declared.
    pub fn set<T: Any + Send + Sync>(&self, name: &str, value: T) -> Result<&Self, WorkflowError> {
        if self.describe(name).is_none() {
            return Err(WorkflowError::Configuration(format!(
                "'{name}' is not a configurable of module '{}'",
                self.name()
            )));
        }
        write(&self.inner.settings).insert(name.to_string(), Arc::new(value));
        Ok(self)
    }

    /// Reads the configurable `name`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::Unconfigured`] if nothing was ever set, and a
    /// configuration error if `name` is undeclared or holds another type.
    pub fn get<T: Any + Clone>(&self, name: &str) -> Result<T, WorkflowError> {
        if self.describe(name).is_none() {
            return Err(WorkflowError::Configuration(format!(
                "'{name}' is not a configurable of module '{}'",
                self.name()
            )));
        }
        let stored = self
            .lookup(|m| read(&m.settings).get(name).cloned())
            .ok_or_else(|| WorkflowError::Unconfigured(name.to_string()))?;
        downcast::<T>(&stored).ok_or_else(|| {
            WorkflowError::Configuration(format!(
                "configurable '{name}' is not a {}",
                std::any::type_name::<T>()
            ))
        })
    }

    /// Returns `true` if `name` has a value here or on an ancestor.
    pub fn is_set(&self, name: &str) -> bool {
        self.lookup(|m| read(&m.settings).get(name).map(|_| ()))
            .is_some()
    }

    /// Registers the handler of `step` on this module.
    pub fn handle<F>(&self, step: impl Into<StepName>, handler: F) -> &Self
    where
        F: Fn(&Module, StepArgs) -> Result<Outcome, WorkflowError> + Send + Sync + 'static,
    {
        write(&self.inner.handlers).insert(step.into(), Arc::new(handler));
        self.invalidate();
        self
    }

    /// Registers a handler that receives its accepted inputs as a typed tuple.
    pub fn handle_typed<I, F>(&self, step: impl Into<StepName>, handler: F) -> &Self
    where
        I: FromArgs,
        F: Fn(&Module, I, &Values) -> Result<Outcome, WorkflowError> + Send + Sync + 'static,
    {
        self.handle(step, move |module, args| {
            let input = I::from_args(&args)?;
            handler(module, input, args.values())
        })
    }

    /// The handler for `step`, resolved through the parent chain.
    pub fn handler(&self, step: &str) -> Option<Handler> {
        self.lookup(|m| read(&m.handlers).get(step).cloned())
    }

    /// Starts declaring a new sequence, replacing any sequence of that name.
    pub fn declare_sequence(&self, name: impl Into<String>) -> SequenceBuilder {
        SequenceBuilder::new(self.clone(), name.into(), None)
    }

    /// Starts declaring a sequence mounted on `method` at the path held by
    /// the configurable `alias`.
    pub fn declare_route(&self, method: Method, alias: impl Into<String>) -> SequenceBuilder {
        let alias = alias.into();
        SequenceBuilder::new(self.clone(), route_name(method, &alias), Some((method, alias)))
    }

    /// Starts appending steps to an existing sequence.
    pub fn extend_sequence(&self, name: &str) -> SequenceBuilder {
        SequenceBuilder::extending(self.clone(), name, self.sequence_decl(name))
    }

    /// The step declaration `name`.
    pub fn step(&self, name: &str) -> Option<Step> {
        self.lookup(|m| read(&m.steps).get(name).cloned())
    }

    /// Every visible step name, sorted.
    pub fn step_names(&self) -> Vec<StepName> {
        let mut names = BTreeSet::new();
        for module in self.lineage() {
            names.extend(read(&module.inner.steps).keys().cloned());
        }
        names.into_iter().collect()
    }

    pub(crate) fn insert_step(&self, step: Step) {
        write(&self.inner.steps).insert(step.name().clone(), step);
        self.invalidate();
    }

    pub(crate) fn sequence_decl(&self, name: &str) -> Option<SequenceDecl> {
        self.lookup(|m| read(&m.sequences).get(name).cloned())
    }

    pub(crate) fn insert_sequence(&self, decl: SequenceDecl) {
        debug!(module = %self.name(), sequence = %decl.name, steps = ?decl.steps, "declared sequence");
        write(&self.inner.sequences).insert(decl.name.clone(), decl);
        self.invalidate();
    }

    /// The sequence `name`, bound to this module.
    pub fn sequence(&self, name: &str) -> Option<StepSequence> {
        self.sequence_decl(name)
            .map(|decl| StepSequence::bind(decl, self.clone()))
    }

    /// Every visible sequence name, sorted.
    pub fn sequence_names(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for module in self.lineage() {
            names.extend(read(&module.inner.sequences).keys().cloned());
        }
        names.into_iter().collect()
    }

    /// The route sequence for `method` and `alias`.
    pub fn route(&self, method: Method, alias: &str) -> Option<RouteTriggeredSequence> {
        self.sequence(&route_name(method, alias))
            .map(|sequence| RouteTriggeredSequence::new(sequence, method, alias))
    }

    /// Every route sequence, sorted by name.
    pub fn routes(&self) -> Vec<RouteTriggeredSequence> {
        self.sequence_names()
            .iter()
            .filter_map(|name| self.sequence(name))
            .filter_map(|sequence| {
                let (method, alias) = sequence.route()?;
                let alias = alias.to_string();
                Some(RouteTriggeredSequence::new(sequence, method, alias))
            })
            .collect()
    }

    /// Builds a jump to the sequence `target`, started with `args`.
    ///
    /// Return the result from a handler to abandon the running sequence.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::SequenceNotFound`] for an unknown target.
    pub fn break_to(&self, target: &str, args: Vec<Value>) -> Result<Outcome, WorkflowError> {
        let sequence = self
            .sequence(target)
            .ok_or_else(|| WorkflowError::SequenceNotFound(target.to_string()))?;
        Ok(Outcome::Jump(Jump::new(sequence, args)))
    }

    /// Registers the init hook, run once before first validation.
    pub fn on_init<F>(&self, hook: F) -> &Self
    where
        F: Fn(&Module) -> Result<(), WorkflowError> + Send + Sync + 'static,
    {
        *write(&self.inner.init) = Some(Arc::new(hook));
        self
    }

    /// Runs the init hook the first time it is called.
    ///
    /// The hook runs outside the result cell, so it may validate or start
    /// sequences of this module. Calls made while it runs see the module as
    /// initialized.
    pub(crate) fn ensure_initialized(&self) -> Result<(), WorkflowError> {
        if let Some(done) = self.inner.initialized.get() {
            return done.clone();
        }
        if self.inner.initializing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = match self.lookup(|m| read(&m.init).clone()) {
            Some(hook) => {
                debug!(module = %self.name(), "running init hook");
                hook(self)
            }
            None => Ok(()),
        };
        self.inner.initialized.get_or_init(|| result).clone()
    }

    /// Drops cached validation results here and in every live submodule.
    fn invalidate(&self) {
        write(&self.inner.validated).clear();
        for submodule in self.submodules() {
            submodule.invalidate();
        }
    }

    pub(crate) fn cached_validation(
        &self,
        sequence: &str,
        validate: impl FnOnce() -> Result<(), WorkflowError>,
    ) -> Result<(), WorkflowError> {
        if let Some(cached) = read(&self.inner.validated).get(sequence) {
            return cached.clone();
        }
        let result = validate();
        write(&self.inner.validated).insert(sequence.to_string(), result.clone());
        result
    }

    /// Validates every visible sequence, failing on the first error.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        self.ensure_initialized()?;
        for name in self.sequence_names() {
            if let Some(sequence) = self.sequence(&name) {
                sequence.validate()?;
            }
        }
        Ok(())
    }

    /// Sets the default failure handler for steps without their own.
    ///
    /// The built-in default forwards the failure to the instance's
    /// [`Next`] callback.
    pub fn on_error<F>(&self, errback: F) -> &Self
    where
        F: Fn(&Module, &WorkflowError, &Values) + Send + Sync + 'static,
    {
        *write(&self.inner.errback) = Some(Arc::new(errback));
        self
    }

    /// Sets the hook that turns remote error payloads into errors.
    pub fn normalize_errors_with<F>(&self, normalizer: F) -> &Self
    where
        F: Fn(&serde_json::Value) -> WorkflowError + Send + Sync + 'static,
    {
        *write(&self.inner.normalizer) = Some(Arc::new(normalizer));
        self
    }

    /// Routes a failure: normalizer first, then the step handler if given,
    /// otherwise the module errback. Exactly one handler runs.
    pub(crate) fn dispatch_failure(
        &self,
        step_handler: Option<&FailureHandler>,
        failure: &WorkflowError,
        values: &Values,
    ) {
        let failure = match failure {
            WorkflowError::Payload(payload) => {
                match self.lookup(|m| read(&m.normalizer).clone()) {
                    Some(normalize) => normalize(payload),
                    None => failure.clone(),
                }
            }
            other => other.clone(),
        };
        match step_handler {
            Some(handler) => handler(self, &failure, values),
            None => match self.lookup(|m| read(&m.errback).clone()) {
                Some(errback) => errback(self, &failure, values),
                None => forward_to_next(self, &failure, values),
            },
        }
    }

    /// Sets the hook [`Module::redirect`] calls.
    pub fn redirect_with<F>(&self, hook: F) -> &Self
    where
        F: Fn(&Value, &str) -> Result<(), WorkflowError> + Send + Sync + 'static,
    {
        *write(&self.inner.redirect) = Some(Arc::new(hook));
        self
    }

    /// Redirects `response` to `location` through the configured hook.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no hook is configured, or the
    /// hook's own error.
    pub fn redirect(&self, response: &Value, location: &str) -> Result<(), WorkflowError> {
        let hook = self
            .lookup(|m| read(&m.redirect).clone())
            .ok_or_else(|| {
                WorkflowError::Configuration(format!(
                    "module '{}' has no redirect hook",
                    self.name()
                ))
            })?;
        debug!(module = %self.name(), location, "redirecting");
        hook(response, location)
    }

    /// Creates a submodule delegating to this module.
    ///
    /// Every visible step and sequence is copied into the submodule.
    pub fn create_submodule(&self, name: impl Into<String>) -> Module {
        let name = name.into();
        let mut steps = HashMap::new();
        let mut sequences = HashMap::new();
        for module in self.lineage() {
            steps.extend(read(&module.inner.steps).clone());
            sequences.extend(read(&module.inner.sequences).clone());
        }

        let child = Module {
            inner: Arc::new(ModuleInner {
                name: name.clone(),
                parent: Some(self.clone()),
                steps: RwLock::new(steps),
                sequences: RwLock::new(sequences),
                ..ModuleInner::default()
            }),
        };
        write(&self.inner.submodules).insert(name, Arc::downgrade(&child.inner));
        debug!(parent = %self.name(), submodule = %child.name(), "created submodule");
        child
    }

    /// The live submodule `name`.
    pub fn submodule(&self, name: &str) -> Option<Module> {
        read(&self.inner.submodules)
            .get(name)
            .and_then(Weak::upgrade)
            .map(|inner| Module { inner })
    }

    /// Every live submodule, sorted by name.
    pub fn submodules(&self) -> Vec<Module> {
        read(&self.inner.submodules)
            .values()
            .filter_map(Weak::upgrade)
            .map(|inner| Module { inner })
            .collect()
    }

    /// Returns `true` if both handles refer to the same module.
    pub fn same_as(&self, other: &Module) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn route_name(method: Method, alias: &str) -> String {
    format!("{method} {alias}")
}
