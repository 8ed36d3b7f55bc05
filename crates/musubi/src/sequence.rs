//! Ordered step sequences, their validation, and per-invocation instances.

use crate::continuation::Continuation;
use crate::module::Module;
use crate::route::{Method, NEXT, REQUEST, RESPONSE};
use crate::step::Step;
use musubi_core::{StepName, Value, Values, WorkflowError};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

/// The stored declaration of a sequence: a name and an ordered list of step names.
#[derive(Debug, Clone)]
pub(crate) struct SequenceDecl {
    pub(crate) name: String,
    pub(crate) steps: Vec<StepName>,
    pub(crate) route: Option<(Method, String)>,
    pub(crate) jump_targets: Option<Vec<String>>,
}

/// A declared sequence bound to the module that runs it.
///
/// Looking a sequence up on a submodule binds it to that submodule, so its
/// steps resolve handlers there even when the declaration is inherited.
#[derive(Clone)]
pub struct StepSequence {
    decl: Arc<SequenceDecl>,
    module: Module,
}

impl fmt::Debug for StepSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepSequence")
            .field("name", &self.decl.name)
            .field("module", &self.module.name())
            .field("steps", &self.decl.steps)
            .finish()
    }
}

impl StepSequence {
    pub(crate) fn bind(decl: SequenceDecl, module: Module) -> Self {
        Self {
            decl: Arc::new(decl),
            module,
        }
    }

    /// Returns the sequence name.
    pub fn name(&self) -> &str {
        &self.decl.name
    }

    /// Returns the step names, in execution order.
    pub fn step_names(&self) -> &[StepName] {
        &self.decl.steps
    }

    /// Returns the module the sequence runs on.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Returns the HTTP method and path alias when this is a route sequence.
    pub fn route(&self) -> Option<(Method, &str)> {
        self.decl
            .route
            .as_ref()
            .map(|(method, alias)| (*method, alias.as_str()))
    }

    /// Returns the declared jump targets, if the sequence restricts them.
    pub fn jump_targets(&self) -> Option<&[String]> {
        self.decl.jump_targets.as_deref()
    }

    pub(crate) fn check_jump(&self, target: &str) -> Result<(), WorkflowError> {
        match &self.decl.jump_targets {
            Some(targets) if !targets.iter().any(|t| t == target) => {
                Err(WorkflowError::Configuration(format!(
                    "sequence '{}' cannot break to undeclared target '{}'",
                    self.decl.name, target
                )))
            }
            _ => Ok(()),
        }
    }

    /// Validates the accepts/promises contract across the steps.
    ///
    /// Runs the module's init hook first. The result is computed once per
    /// module and declaration, then cached.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending step.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        self.module.ensure_initialized()?;
        self.module
            .cached_validation(&self.decl.name, || self.check_steps())
    }

    fn check_steps(&self) -> Result<(), WorkflowError> {
        let steps = self.resolve_steps()?;
        let Some(first) = steps.first() else {
            return Err(WorkflowError::Configuration(format!(
                "sequence '{}' has no steps",
                self.decl.name
            )));
        };

        let mut seen = HashSet::new();
        for step in &steps {
            let contract = step.contract();
            if !seen.insert(step.name().clone()) {
                return Err(WorkflowError::Configuration(format!(
                    "step '{}' appears twice in sequence '{}'",
                    step.name(),
                    self.decl.name
                )));
            }
            if !contract.declares_accepts() {
                return Err(WorkflowError::Configuration(format!(
                    "step '{}' has no accepts declaration",
                    step.name()
                )));
            }
            if !contract.declares_promises() {
                return Err(WorkflowError::Configuration(format!(
                    "step '{}' has no promises declaration",
                    step.name()
                )));
            }
            if self.module.handler(step.name().as_str()).is_none() {
                return Err(WorkflowError::HandlerNotFound(step.name().clone()));
            }
        }

        if self.decl.route.is_some() {
            let reserved = [REQUEST, RESPONSE, NEXT];
            let foreign: Vec<String> = first
                .contract()
                .accepted()
                .iter()
                .filter(|name| !reserved.contains(&name.as_str()))
                .cloned()
                .collect();
            if !foreign.is_empty() {
                return Err(WorkflowError::MissingInputs {
                    sequence: self.decl.name.clone(),
                    step: first.name().clone(),
                    missing: foreign,
                });
            }
        }

        let mut available: HashSet<&str> = first
            .contract()
            .accepted()
            .iter()
            .map(String::as_str)
            .collect();
        if self.decl.route.is_some() {
            available.extend([REQUEST, RESPONSE, NEXT]);
        }
        available.extend(first.contract().promised().iter().map(String::as_str));

        for step in steps.iter().skip(1) {
            let missing: Vec<String> = step
                .contract()
                .accepted()
                .iter()
                .filter(|name| !available.contains(name.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(WorkflowError::MissingInputs {
                    sequence: self.decl.name.clone(),
                    step: step.name().clone(),
                    missing,
                });
            }
            available.extend(step.contract().promised().iter().map(String::as_str));
        }

        for target in self.decl.jump_targets.iter().flatten() {
            if self.module.sequence(target).is_none() {
                return Err(WorkflowError::SequenceNotFound(target.clone()));
            }
        }
        Ok(())
    }

    fn resolve_steps(&self) -> Result<Vec<Step>, WorkflowError> {
        self.decl
            .steps
            .iter()
            .map(|name| {
                self.module
                    .step(name.as_str())
                    .ok_or_else(|| WorkflowError::StepNotFound(name.clone()))
            })
            .collect()
    }

    /// Creates an isolated instance with its own empty [`Values`].
    pub fn materialize(&self) -> SequenceInstance {
        debug!(module = %self.module.name(), sequence = %self.decl.name, "materializing sequence");
        SequenceInstance {
            sequence: self.clone(),
            values: Values::new(),
            state: Arc::new(Mutex::new(SequenceState::Pending)),
        }
    }

    /// Materializes a fresh instance and starts it with `args`.
    pub fn start(&self, args: Vec<Value>) -> Result<Continuation, WorkflowError> {
        self.materialize().start(args)
    }
}

/// Where a [`SequenceInstance`] is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Materialized, not started.
    Pending,
    /// Running the step at this index.
    Running(usize),
    /// Every step succeeded.
    Completed,
    /// A step failed or timed out.
    Failed,
    /// A step jumped to another sequence.
    Aborted,
}

impl SequenceState {
    /// Returns `true` for `Completed`, `Failed`, and `Aborted`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SequenceState::Completed | SequenceState::Failed | SequenceState::Aborted
        )
    }
}

/// One run of a [`StepSequence`] with private state.
///
/// Concurrent instances of the same sequence never share values.
#[derive(Clone)]
pub struct SequenceInstance {
    sequence: StepSequence,
    values: Values,
    state: Arc<Mutex<SequenceState>>,
}

impl fmt::Debug for SequenceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceInstance")
            .field("sequence", &self.sequence.name())
            .field("state", &self.state())
            .field("values", &self.values)
            .finish()
    }
}

impl SequenceInstance {
    /// The sequence this instance runs.
    pub fn sequence(&self) -> &StepSequence {
        &self.sequence
    }

    /// The module this instance runs on.
    pub fn module(&self) -> &Module {
        self.sequence.module()
    }

    /// The values accumulated so far.
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// The current state.
    pub fn state(&self) -> SequenceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SequenceState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_terminal() {
            *state = next;
        }
    }

    pub(crate) fn abort(&self) {
        self.transition(SequenceState::Aborted);
    }

    /// Copies the request values `req`, `res` and `next` over from `from`.
    pub(crate) fn inherit_request(&self, from: &Values) {
        for name in [REQUEST, RESPONSE, NEXT] {
            if let Some(v) = from.get_value(name) {
                self.values.insert_value(name, v);
            }
        }
    }

    /// Binds `args` to the first step's accepted names and runs the chain.
    ///
    /// The returned continuation settles after the last step succeeded, or
    /// fails with the first step failure. It stays pending if a step jumped
    /// to another sequence.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if validation fails, the instance was
    /// already started, or `args` does not match the first step's accepted
    /// names one for one.
    pub fn start(&self, args: Vec<Value>) -> Result<Continuation, WorkflowError> {
        self.sequence.validate()?;
        if self.state() != SequenceState::Pending {
            return Err(WorkflowError::Configuration(format!(
                "instance of sequence '{}' was already started",
                self.sequence.name()
            )));
        }
        let mut steps = self.sequence.resolve_steps()?.into_iter().enumerate();
        let Some((_, first)) = steps.next() else {
            return Err(WorkflowError::Configuration(format!(
                "sequence '{}' has no steps",
                self.sequence.name()
            )));
        };

        let accepted = first.contract().accepted();
        if args.len() != accepted.len() {
            return Err(WorkflowError::Configuration(format!(
                "sequence '{}' takes {} argument(s) {:?} but was started with {}",
                self.sequence.name(),
                accepted.len(),
                accepted,
                args.len()
            )));
        }
        for (name, arg) in accepted.iter().zip(args) {
            self.values.insert_value(name.clone(), arg);
        }
        debug!(
            module = %self.module().name(),
            sequence = %self.sequence.name(),
            "starting sequence"
        );

        self.transition(SequenceState::Running(0));
        let Some(mut tail) = first.execute(self) else {
            return Ok(Continuation::new());
        };

        for (index, step) in steps {
            let next = Continuation::new();
            let instance = self.clone();
            let relay = next.clone();
            tail.on_success(move |_| {
                instance.transition(SequenceState::Running(index));
                if let Some(done) = step.execute(&instance) {
                    let failed = relay.clone();
                    done.on_success(move |produced| {
                        relay.fulfill(produced.to_vec());
                    })
                    .on_failure(move |error| {
                        failed.fail(error.clone());
                    });
                }
            });
            let failed = next.clone();
            tail.on_failure(move |error| {
                failed.fail(error.clone());
            });
            tail = next;
        }

        let completed = self.clone();
        let failed = self.clone();
        tail.on_success(move |_| {
            completed.transition(SequenceState::Completed);
            info!(
                module = %completed.module().name(),
                sequence = %completed.sequence.name(),
                elapsed = ?completed.values.elapsed(),
                "sequence completed"
            );
        })
        .on_failure(move |_| failed.transition(SequenceState::Failed));
        Ok(tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::Outcome;
    use musubi_core::value;

    fn arithmetic() -> Module {
        let module = Module::new("arithmetic");
        module
            .declare_sequence("sum")
            .step("one")
            .accepts(Vec::<String>::new())
            .promises(["a"])
            .step("increment")
            .accepts(["a"])
            .promises(["b"])
            .commit()
            .unwrap();
        module
            .handle("one", |_, _| Ok(Outcome::value(1i64)))
            .handle("increment", |_, args| Ok(Outcome::value(args.arg::<i64>(0)? + 1)));
        module
    }

    #[test]
    fn test_consistent_contract_validates() {
        let module = arithmetic();
        assert!(module.sequence("sum").unwrap().validate().is_ok());
    }

    #[test]
    fn test_gap_in_contract_names_step_and_inputs() {
        let module = arithmetic();
        module
            .declare_sequence("broken")
            .step("one")
            .step("needs_token")
            .accepts(["a", "token"])
            .promises(Vec::<String>::new())
            .commit()
            .unwrap();
        module.handle("needs_token", |_, _| Ok(Outcome::Done));

        match module.sequence("broken").unwrap().validate() {
            Err(WorkflowError::MissingInputs { step, missing, .. }) => {
                assert_eq!(step, "needs_token");
                assert_eq!(missing, vec!["token".to_string()]);
            }
            other => panic!("unexpected validation result: {other:?}"),
        }
    }

    #[test]
    fn test_missing_declarations_are_rejected() {
        let module = Module::new("partial");
        module
            .declare_sequence("seq")
            .step("half")
            .accepts(["x"])
            .commit()
            .unwrap();
        module.handle("half", |_, _| Ok(Outcome::Done));

        let error = module.sequence("seq").unwrap().validate().unwrap_err();
        assert!(error.is_configuration());
        assert!(error.to_string().contains("promises"));

        module
            .declare_sequence("unhandled")
            .step("orphan")
            .accepts(Vec::<String>::new())
            .promises(Vec::<String>::new())
            .commit()
            .unwrap();
        assert_eq!(
            module.sequence("unhandled").unwrap().validate(),
            Err(WorkflowError::HandlerNotFound(StepName::new("orphan")))
        );
    }

    #[test]
    fn test_start_threads_values_and_completes() {
        let module = arithmetic();
        let instance = module.sequence("sum").unwrap().materialize();
        assert_eq!(instance.state(), SequenceState::Pending);

        let done = instance.start(Vec::new()).unwrap();
        assert!(done.is_fulfilled());
        assert_eq!(instance.state(), SequenceState::Completed);
        assert_eq!(instance.values().get::<i64>("b"), Some(2));
    }

    #[test]
    fn test_instance_cannot_start_twice() {
        let module = arithmetic();
        let instance = module.sequence("sum").unwrap().materialize();
        instance.start(Vec::new()).unwrap();
        assert!(instance.start(Vec::new()).is_err());
    }

    #[test]
    fn test_initial_args_bind_to_first_step() {
        let module = Module::new("echo");
        module
            .declare_sequence("echo")
            .step("repeat")
            .accepts(["word"])
            .promises(["echoed"])
            .commit()
            .unwrap();
        module.handle("repeat", |_, args| {
            let word = args.arg::<String>(0)?;
            Ok(Outcome::value(format!("{word} {word}")))
        });

        let instance = module.sequence("echo").unwrap().materialize();
        instance.start(vec![value("hey".to_string())]).unwrap();
        assert_eq!(
            instance.values().get::<String>("echoed").as_deref(),
            Some("hey hey")
        );
    }

    #[test]
    fn test_argument_count_must_match_first_step() {
        let module = Module::new("pairs");
        module
            .declare_sequence("pair")
            .step("join")
            .accepts(["x", "y"])
            .promises(["joined"])
            .commit()
            .unwrap();
        module.handle_typed("join", |_, (x, y): (String, String), _| {
            Ok(Outcome::value(format!("{x}{y}")))
        });
        let sequence = module.sequence("pair").unwrap();

        let short = sequence.materialize();
        let error = short.start(vec![value("x".to_string())]).unwrap_err();
        assert!(error.is_configuration());
        assert_eq!(short.state(), SequenceState::Pending);

        let long = vec![value("a".to_string()), value("b".to_string()), value(3)];
        assert!(sequence.start(long).is_err());

        let exact = sequence.materialize();
        exact
            .start(vec![value("a".to_string()), value("b".to_string())])
            .unwrap();
        assert_eq!(exact.values().get::<String>("joined").as_deref(), Some("ab"));
    }

    #[test]
    fn test_failure_stops_the_chain() {
        let module = arithmetic();
        module.on_error(|_, _, _| {});
        module.handle("one", |_, _| Err("no".into()));

        let instance = module.sequence("sum").unwrap().materialize();
        let done = instance.start(Vec::new()).unwrap();
        assert!(done.is_failed());
        assert_eq!(instance.state(), SequenceState::Failed);
        assert!(!instance.values().contains("b"));
    }
}
