//! Positional step arguments and typed marshaling.

use crate::error::WorkflowError;
use crate::step::StepName;
use crate::values::{downcast, Value, Values};
use std::any::{type_name, Any};

/// What a step handler receives.
///
/// `args` holds the accepted inputs in declaration order. `values` is the
/// whole mapping of the running instance, for data outside the declared
/// contract (the request/response pair, for example).
#[derive(Debug, Clone)]
pub struct StepArgs {
    step: StepName,
    args: Vec<Option<Value>>,
    values: Values,
}

impl StepArgs {
    /// Extracts `accepts` from `values`, position for position.
    pub fn extract(step: impl Into<StepName>, accepts: &[String], values: &Values) -> Self {
        Self {
            step: step.into(),
            args: accepts.iter().map(|name| values.get_value(name)).collect(),
            values: values.clone(),
        }
    }

    /// The step being executed.
    pub fn step(&self) -> &StepName {
        &self.step
    }

    /// Number of positional arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Returns `true` if the step accepts nothing.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// The raw value at `index`, `None` if the name was never bound.
    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.args.get(index).and_then(Option::as_ref)
    }

    /// Clones the argument at `index` out as a `T`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkflowError::StepError`] when the argument is unbound or
    /// holds another type.
    pub fn arg<T: Any + Clone>(&self, index: usize) -> Result<T, WorkflowError> {
        let raw = self.raw(index).ok_or_else(|| {
            WorkflowError::step(&self.step, format!("argument {index} is not bound"))
        })?;
        downcast::<T>(raw).ok_or_else(|| {
            WorkflowError::step(
                &self.step,
                format!("argument {index} is not a {}", type_name::<T>()),
            )
        })
    }

    /// The full value mapping of the running instance.
    pub fn values(&self) -> &Values {
        &self.values
    }
}

/// Decodes positional step arguments into a typed tuple.
///
/// # Examples
///
/// ```
/// use musubi_core::{FromArgs, StepArgs, Values};
///
/// let values = Values::new();
/// values.insert("code", "abc".to_string());
/// values.insert("attempt", 2u32);
///
/// let args = StepArgs::extract("exchange", &["code".into(), "attempt".into()], &values);
/// let (code, attempt) = <(String, u32)>::from_args(&args).unwrap();
/// assert_eq!(code, "abc");
/// assert_eq!(attempt, 2);
/// ```
pub trait FromArgs: Sized {
    /// Decodes `args`.
    fn from_args(args: &StepArgs) -> Result<Self, WorkflowError>;
}

impl FromArgs for () {
    fn from_args(_args: &StepArgs) -> Result<Self, WorkflowError> {
        Ok(())
    }
}

macro_rules! impl_from_args {
    ($($idx:tt => $ty:ident),+) => {
        impl<$($ty: Any + Clone),+> FromArgs for ($($ty,)+) {
            fn from_args(args: &StepArgs) -> Result<Self, WorkflowError> {
                Ok(($(args.arg::<$ty>($idx)?,)+))
            }
        }
    };
}

impl_from_args!(0 => A);
impl_from_args!(0 => A, 1 => B);
impl_from_args!(0 => A, 1 => B, 2 => C);
impl_from_args!(0 => A, 1 => B, 2 => C, 3 => D);
