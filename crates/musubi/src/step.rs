//! Step declarations and their execution.

use crate::continuation::Continuation;
use crate::module::Module;
use crate::sequence::{SequenceInstance, StepSequence};
use musubi_core::{value, StepArgs, StepContract, StepName, Value, Values, WorkflowError};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The body of a step, resolved by name from the executing module.
pub type Handler = Arc<dyn Fn(&Module, StepArgs) -> Result<Outcome, WorkflowError> + Send + Sync>;

/// Receives a step failure together with the values of the failed instance.
pub type FailureHandler = Arc<dyn Fn(&Module, &WorkflowError, &Values) + Send + Sync>;

/// What a handler hands back when it does not fail.
///
/// - `Value` fulfills with a single value.
/// - `List` fulfills with each element as its own value, except when the
///   step promises exactly one output: then the whole list (a `Vec<Value>`)
///   becomes that output.
/// - `Deferred` settles later, when the continuation does.
/// - `Jump` abandons the running sequence and starts another one.
/// - `Done` produces nothing; only valid for steps that promise nothing.
pub enum Outcome {
    /// A single value.
    Value(Value),
    /// An ordered list of values.
    List(Vec<Value>),
    /// A continuation settled by asynchronous work.
    Deferred(Continuation),
    /// A transfer to another sequence, built by [`Module::break_to`].
    Jump(Jump),
    /// Nothing.
    Done,
}

impl Outcome {
    /// Wraps a single typed value.
    pub fn value<T: Any + Send + Sync>(v: T) -> Self {
        Outcome::Value(value(v))
    }

    /// Collects already-erased values into a list.
    pub fn list<I: IntoIterator<Item = Value>>(values: I) -> Self {
        Outcome::List(values.into_iter().collect())
    }
}

impl From<Continuation> for Outcome {
    fn from(c: Continuation) -> Self {
        Outcome::Deferred(c)
    }
}

impl From<Jump> for Outcome {
    fn from(jump: Jump) -> Self {
        Outcome::Jump(jump)
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Value(_) => f.write_str("Value"),
            Outcome::List(list) => write!(f, "List(len = {})", list.len()),
            Outcome::Deferred(c) => f.debug_tuple("Deferred").field(c).finish(),
            Outcome::Jump(jump) => f.debug_tuple("Jump").field(jump).finish(),
            Outcome::Done => f.write_str("Done"),
        }
    }
}

/// A pending transfer of control to another sequence of the same module.
#[derive(Clone)]
pub struct Jump {
    sequence: StepSequence,
    args: Vec<Value>,
}

impl fmt::Debug for Jump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jump")
            .field("target", &self.sequence.name())
            .field("args", &self.args.len())
            .finish()
    }
}

impl Jump {
    pub(crate) fn new(sequence: StepSequence, args: Vec<Value>) -> Self {
        Self { sequence, args }
    }

    /// Name of the target sequence.
    pub fn target(&self) -> &str {
        self.sequence.name()
    }

    /// Arguments the target sequence is started with.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    fn run(self, abandoned: &Values) {
        let target = self.sequence.name().to_string();
        let instance = self.sequence.materialize();
        instance.inherit_request(abandoned);
        if let Err(error) = instance.start(self.args) {
            warn!(sequence = %target, %error, "jump target failed to start");
            let module = self.sequence.module();
            module.dispatch_failure(None, &error, abandoned);
        }
    }
}

/// One named unit of work with a declared input/output contract.
///
/// The handler is not stored here: it is looked up on the executing module
/// by step name, so a submodule can swap the handler while keeping the
/// contract.
#[derive(Clone)]
pub struct Step {
    name: StepName,
    contract: StepContract,
    on_failure: Option<FailureHandler>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("contract", &self.contract)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

impl Step {
    /// Creates a step with no failure handler.
    pub fn new(name: impl Into<StepName>, contract: StepContract) -> Self {
        Self {
            name: name.into(),
            contract,
            on_failure: None,
        }
    }

    /// Returns the step name.
    pub fn name(&self) -> &StepName {
        &self.name
    }

    /// Returns the declared contract.
    pub fn contract(&self) -> &StepContract {
        &self.contract
    }

    pub(crate) fn contract_mut(&mut self) -> &mut StepContract {
        &mut self.contract
    }

    /// Returns `true` if the step has its own failure handler.
    pub fn has_failure_handler(&self) -> bool {
        self.on_failure.is_some()
    }

    pub(crate) fn set_failure_handler(&mut self, handler: FailureHandler) {
        self.on_failure = Some(handler);
    }

    /// Runs the step against `instance`.
    ///
    /// Returns `None` when the handler jumped to another sequence; the
    /// instance is then aborted and the target has already been started.
    /// Otherwise the returned continuation settles once the promised values
    /// have been written to the instance, or once the failure has been
    /// dispatched.
    pub fn execute(&self, instance: &SequenceInstance) -> Option<Continuation> {
        let module = instance.module();
        let values = instance.values();
        if module.debug() {
            info!(module = %module.name(), step = %self.name, "executing step");
        } else {
            debug!(module = %module.name(), step = %self.name, "executing step");
        }

        let produced = match module.handler(self.name.as_str()) {
            Some(handler) => {
                let args = StepArgs::extract(self.name.clone(), self.contract.accepted(), values);
                match handler(module, args) {
                    Ok(Outcome::Jump(jump)) => match instance.sequence().check_jump(jump.target()) {
                        Ok(()) => {
                            info!(
                                module = %module.name(),
                                step = %self.name,
                                target = jump.target(),
                                "abandoning sequence"
                            );
                            instance.abort();
                            jump.run(values);
                            return None;
                        }
                        Err(error) => Err(error),
                    },
                    Ok(outcome) => self.coerce(outcome),
                    Err(error) => Err(error),
                }
            }
            None => Err(WorkflowError::HandlerNotFound(self.name.clone())),
        };

        let result = Continuation::new();
        self.route_failures(&result, module, values);
        self.bind_outputs(&result, values);

        let pending = match produced {
            Ok(pending) => pending,
            Err(error) => {
                result.fail(error);
                return Some(result);
            }
        };
        pending.arm(self.contract.timeout.or(module.default_timeout()));

        let expected = self.contract.promised().len();
        let fulfilled = result.clone();
        let step = self.name.clone();
        pending.on_success(move |produced| {
            if expected > 0 && produced.len() != expected {
                fulfilled.fail(WorkflowError::ContractViolation {
                    step,
                    expected,
                    actual: produced.len(),
                });
            } else {
                fulfilled.fulfill(produced.to_vec());
            }
        });
        let failed = result.clone();
        pending.on_failure(move |error| {
            failed.fail(error.clone());
        });
        let timed_out = result.clone();
        let timeout = WorkflowError::Timeout {
            step_name: self.name.clone(),
            module: module.name().to_string(),
        };
        pending.on_timeout(move || {
            timed_out.fail(timeout);
        });

        Some(result)
    }

    fn coerce(&self, outcome: Outcome) -> Result<Continuation, WorkflowError> {
        let promised = self.contract.promised().len();
        match outcome {
            Outcome::Deferred(c) => Ok(c),
            Outcome::Value(v) => Ok(Continuation::fulfilled(vec![v])),
            Outcome::List(list) if promised == 1 => Ok(Continuation::fulfilled(vec![value(list)])),
            Outcome::List(list) => Ok(Continuation::fulfilled(list)),
            Outcome::Done if promised > 0 => Err(WorkflowError::Configuration(format!(
                "step '{}' promises {:?} but its handler returned nothing",
                self.name,
                self.contract.promised()
            ))),
            Outcome::Done => Ok(Continuation::fulfilled(Vec::new())),
            Outcome::Jump(jump) => Err(WorkflowError::Configuration(format!(
                "step '{}' produced a jump to '{}' outside of execution",
                self.name,
                jump.target()
            ))),
        }
    }

    fn bind_outputs(&self, result: &Continuation, values: &Values) {
        let promised = self.contract.promised().to_vec();
        let values = values.clone();
        result.on_success(move |produced| {
            for (name, v) in promised.iter().zip(produced) {
                values.insert_value(name.clone(), v.clone());
            }
        });
    }

    fn route_failures(&self, result: &Continuation, module: &Module, values: &Values) {
        let module = module.clone();
        let values = values.clone();
        let handler = self.on_failure.clone();
        let step = self.name.clone();
        result.on_failure(move |error| {
            warn!(module = %module.name(), step = %step, %error, "step failed");
            module.dispatch_failure(handler.as_ref(), error, &values);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use std::sync::Mutex;

    fn captured_errors(module: &Module) -> Arc<Mutex<Vec<WorkflowError>>> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        module.on_error(move |_, error, _| sink.lock().unwrap().push(error.clone()));
        errors
    }

    #[test]
    fn test_list_wraps_for_single_promise() {
        let module = Module::new("lists");
        module
            .declare_sequence("seq")
            .step("pair")
            .accepts(Vec::<String>::new())
            .promises(["pair"])
            .commit()
            .unwrap();
        module.handle("pair", |_, _| Ok(Outcome::list([value(1), value(2)])));

        let instance = module.sequence("seq").unwrap().materialize();
        instance.start(Vec::new()).unwrap();
        let pair = instance.values().get::<Vec<Value>>("pair").unwrap();
        assert_eq!(pair.len(), 2);
    }

    #[test]
    fn test_list_spreads_over_promises() {
        let module = Module::new("lists");
        module
            .declare_sequence("seq")
            .step("split")
            .accepts(Vec::<String>::new())
            .promises(["token", "secret"])
            .commit()
            .unwrap();
        module.handle("split", |_, _| {
            Ok(Outcome::list([value("t".to_string()), value("s".to_string())]))
        });

        let instance = module.sequence("seq").unwrap().materialize();
        instance.start(Vec::new()).unwrap();
        assert_eq!(instance.values().get::<String>("token").as_deref(), Some("t"));
        assert_eq!(instance.values().get::<String>("secret").as_deref(), Some("s"));
    }

    #[test]
    fn test_wrong_value_count_is_a_contract_violation() {
        let module = Module::new("contract");
        let errors = captured_errors(&module);
        module
            .declare_sequence("seq")
            .step("short")
            .accepts(Vec::<String>::new())
            .promises(["a", "b"])
            .commit()
            .unwrap();
        module.handle("short", |_, _| Ok(Outcome::list([value(1)])));

        let done = module.sequence("seq").unwrap().start(Vec::new()).unwrap();
        assert!(done.is_failed());
        assert!(matches!(
            errors.lock().unwrap()[0],
            WorkflowError::ContractViolation {
                expected: 2,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_returning_nothing_when_promising_is_a_configuration_error() {
        let module = Module::new("contract");
        let errors = captured_errors(&module);
        module
            .declare_sequence("seq")
            .step("silent")
            .accepts(Vec::<String>::new())
            .promises(["user"])
            .commit()
            .unwrap();
        module.handle("silent", |_, _| Ok(Outcome::Done));

        module.sequence("seq").unwrap().start(Vec::new()).unwrap();
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_configuration());
    }

    #[test]
    fn test_step_failure_handler_takes_precedence() {
        let module = Module::new("handlers");
        let module_errors = captured_errors(&module);
        let step_errors = Arc::new(Mutex::new(Vec::new()));
        let sink = step_errors.clone();
        module
            .declare_sequence("seq")
            .step("fragile")
            .accepts(Vec::<String>::new())
            .promises(Vec::<String>::new())
            .on_failure(move |_, error, _| sink.lock().unwrap().push(error.clone()))
            .commit()
            .unwrap();
        module.handle("fragile", |_, _| Err("remote said no".into()));

        module.sequence("seq").unwrap().start(Vec::new()).unwrap();
        assert_eq!(step_errors.lock().unwrap().len(), 1);
        assert!(module_errors.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_step_timeout_names_step_and_module() {
        let module = Module::new("slowpoke");
        let errors = captured_errors(&module);
        module
            .declare_sequence("seq")
            .step("hang")
            .accepts(Vec::<String>::new())
            .promises(["never"])
            .timeout(std::time::Duration::from_millis(20))
            .commit()
            .unwrap();
        module.handle("hang", |_, _| Ok(Outcome::Deferred(Continuation::new())));

        let done = module.sequence("seq").unwrap().start(Vec::new()).unwrap();
        let settled = tokio::time::timeout(std::time::Duration::from_secs(1), done.settled())
            .await
            .unwrap();
        let error = settled.error().cloned().unwrap();
        assert!(error.is_timeout());
        assert_eq!(error.to_string(), "Step hang of module slowpoke timed out");
        assert_eq!(errors.lock().unwrap().len(), 1);
    }
}
