//! Fluent declaration of sequences and their steps.

use crate::module::Module;
use crate::route::Method;
use crate::sequence::{SequenceDecl, StepSequence};
use crate::step::{FailureHandler, Step};
use musubi_core::{StepContract, StepName, Values, WorkflowError};
use std::sync::Arc;
use std::time::Duration;

struct PendingStep {
    name: StepName,
    contract: StepContract,
    on_failure: Option<FailureHandler>,
}

/// Accumulates steps for one sequence and writes them into the module on
/// [`commit`](SequenceBuilder::commit).
///
/// Contract calls (`accepts`, `promises`, `timeout`, `on_failure`) apply to
/// the most recent [`step`](SequenceBuilder::step). Declarations merge over
/// an existing step of the same name, so a step declared fully in one
/// sequence can be referenced by name alone in another.
///
/// Nothing touches the module until `commit`.
#[must_use = "a sequence is only declared once `commit` is called"]
pub struct SequenceBuilder {
    module: Module,
    name: String,
    base: Vec<StepName>,
    route: Option<(Method, String)>,
    jump_targets: Option<Vec<String>>,
    steps: Vec<PendingStep>,
    error: Option<WorkflowError>,
}

impl SequenceBuilder {
    pub(crate) fn new(module: Module, name: String, route: Option<(Method, String)>) -> Self {
        Self {
            module,
            name,
            base: Vec::new(),
            route,
            jump_targets: None,
            steps: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn extending(module: Module, name: &str, existing: Option<SequenceDecl>) -> Self {
        let mut builder = Self::new(module, name.to_string(), None);
        match existing {
            Some(decl) => {
                builder.base = decl.steps;
                builder.route = decl.route;
                builder.jump_targets = decl.jump_targets;
            }
            None => builder.error = Some(WorkflowError::SequenceNotFound(name.to_string())),
        }
        builder
    }

    /// Appends the step `name` and makes it the target of contract calls.
    pub fn step(mut self, name: impl Into<StepName>) -> Self {
        self.steps.push(PendingStep {
            name: name.into(),
            contract: StepContract::new(),
            on_failure: None,
        });
        self
    }

    fn current(&mut self, call: &str) -> Option<&mut PendingStep> {
        if self.steps.is_empty() && self.error.is_none() {
            self.error = Some(WorkflowError::Configuration(format!(
                "`{call}` called before any step of sequence '{}'",
                self.name
            )));
        }
        self.steps.last_mut()
    }

    /// Declares the accepted input names of the current step.
    pub fn accepts<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(step) = self.current("accepts") {
            step.contract = std::mem::take(&mut step.contract).accepts(names);
        }
        self
    }

    /// Declares the promised output names of the current step.
    pub fn promises<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(step) = self.current("promises") {
            step.contract = std::mem::take(&mut step.contract).promises(names);
        }
        self
    }

    /// Overrides the module's default timeout for the current step.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Some(step) = self.current("timeout") {
            step.contract.timeout = Some(timeout);
        }
        self
    }

    /// Gives the current step its own failure handler.
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Module, &WorkflowError, &Values) + Send + Sync + 'static,
    {
        if let Some(step) = self.current("on_failure") {
            step.on_failure = Some(Arc::new(handler));
        }
        self
    }

    /// Restricts the sequences the steps of this sequence may jump to.
    pub fn can_break_to<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.jump_targets
            .get_or_insert_with(Vec::new)
            .extend(targets.into_iter().map(Into::into));
        self
    }

    /// Writes the steps and the sequence into the module.
    ///
    /// # Errors
    ///
    /// Returns the first declaration mistake recorded by the builder.
    pub fn commit(self) -> Result<StepSequence, WorkflowError> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let mut names = self.base;
        for pending in self.steps {
            let mut step = self
                .module
                .step(pending.name.as_str())
                .unwrap_or_else(|| Step::new(pending.name.clone(), StepContract::new()));
            step.contract_mut().merge(&pending.contract);
            if let Some(handler) = pending.on_failure {
                step.set_failure_handler(handler);
            }
            self.module.insert_step(step);
            names.push(pending.name);
        }

        if let Some((_, alias)) = &self.route {
            if self.module.describe(alias).is_none() {
                self.module
                    .declare_configurable(alias.clone(), format!("path of the '{}' route", self.name));
            }
        }

        let decl = SequenceDecl {
            name: self.name.clone(),
            steps: names,
            route: self.route,
            jump_targets: self.jump_targets,
        };
        self.module.insert_sequence(decl.clone());
        Ok(StepSequence::bind(decl, self.module))
    }
}
