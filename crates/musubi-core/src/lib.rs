//! Core types for the musubi step-sequence engine.
//!
//! This crate has no runtime dependencies. It holds the data shared by the
//! engine and by the modules plugged into it.
//!
//! # Core Types
//!
//! - [`StepName`] and [`StepContract`] - step identity and its accepts/promises contract
//! - [`Values`] and [`Value`] - the name-keyed store a sequence instance threads through its steps
//! - [`StepArgs`] and [`FromArgs`] - what a handler receives, and typed decoding of it
//! - [`WorkflowError`] - configuration and run-time errors

mod args;
mod error;
mod step;
mod values;

pub use args::{FromArgs, StepArgs};
pub use error::WorkflowError;
pub use step::{StepContract, StepName};
pub use values::{downcast, value, Value, Values};
