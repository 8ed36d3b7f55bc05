//! Step names and declared input/output contracts.

use std::fmt;
use std::time::Duration;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&StepName> for StepName {
    fn from(s: &StepName) -> Self {
        s.clone()
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for StepName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for StepName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// The named inputs a step consumes and the named outputs it must produce.
///
/// Both lists start undeclared (`None`). A step is only runnable once both
/// have been declared, even if as empty lists.
///
/// # Examples
///
/// ```
/// use musubi_core::StepContract;
///
/// let contract = StepContract::new()
///     .accepts(["code"])
///     .promises(["accessToken", "extra"]);
///
/// assert_eq!(contract.accepted(), &["code".to_string()]);
/// assert_eq!(contract.promised().len(), 2);
/// assert!(contract.is_complete());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContract {
    accepts: Option<Vec<String>>,
    promises: Option<Vec<String>>,
    /// Step-specific timeout. `None` falls back to the module default.
    pub timeout: Option<Duration>,
}

impl StepContract {
    /// Creates a contract with nothing declared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the accepted input names, in positional order.
    pub fn accepts<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepts = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Declares the promised output names, in positional order.
    pub fn promises<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.promises = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the step-specific timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Accepted input names, empty when undeclared.
    pub fn accepted(&self) -> &[String] {
        self.accepts.as_deref().unwrap_or(&[])
    }

    /// Promised output names, empty when undeclared.
    pub fn promised(&self) -> &[String] {
        self.promises.as_deref().unwrap_or(&[])
    }

    /// Returns `true` once `accepts` has been declared.
    pub fn declares_accepts(&self) -> bool {
        self.accepts.is_some()
    }

    /// Returns `true` once `promises` has been declared.
    pub fn declares_promises(&self) -> bool {
        self.promises.is_some()
    }

    /// Returns `true` when both lists have been declared.
    pub fn is_complete(&self) -> bool {
        self.declares_accepts() && self.declares_promises()
    }

    pub(crate) fn set_accepts(&mut self, names: Vec<String>) {
        self.accepts = Some(names);
    }

    pub(crate) fn set_promises(&mut self, names: Vec<String>) {
        self.promises = Some(names);
    }

    /// Merges the declared parts of `other` over this contract.
    pub fn merge(&mut self, other: &StepContract) {
        if let Some(accepts) = &other.accepts {
            self.set_accepts(accepts.clone());
        }
        if let Some(promises) = &other.promises {
            self.set_promises(promises.clone());
        }
        if other.timeout.is_some() {
            self.timeout = other.timeout;
        }
    }
}
