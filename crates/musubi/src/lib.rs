//! A continuation-driven step-sequence engine with inheritable modules.
//!
//! A [`Module`] declares named steps with an accepts/promises contract,
//! orders them into sequences, and supplies a handler per step. Starting a
//! sequence materializes an isolated instance whose steps pass values to
//! each other by name. A submodule inherits everything from its parent and
//! can override single handlers, configurables or sequences.
//!
//! # Example
//!
//! ```
//! use musubi::prelude::*;
//! use std::sync::{Arc, Mutex};
//!
//! let sum = Arc::new(Mutex::new(0));
//! let sink = sum.clone();
//!
//! let module = Module::new("arithmetic");
//! module
//!     .declare_sequence("add")
//!     .step("one")
//!     .accepts(Vec::<String>::new())
//!     .promises(["a"])
//!     .step("increment")
//!     .accepts(["a"])
//!     .promises(["b"])
//!     .step("record")
//!     .accepts(["a", "b"])
//!     .promises(Vec::<String>::new())
//!     .commit()
//!     .unwrap();
//!
//! module
//!     .handle("one", |_, _| Ok(Outcome::value(1)))
//!     .handle_typed("increment", |_, (a,): (i32,), _| Ok(Outcome::value(a + 1)))
//!     .handle_typed("record", move |_, (a, b): (i32, i32), _| {
//!         *sink.lock().unwrap() = a + b;
//!         Ok(Outcome::Done)
//!     });
//!
//! let done = module.sequence("add").unwrap().start(Vec::new()).unwrap();
//! assert!(done.is_fulfilled());
//! assert_eq!(*sum.lock().unwrap(), 3);
//! ```

mod builder;
mod config;
mod continuation;
mod module;
mod route;
mod sequence;
mod session;
mod step;

// Re-export core types
pub use musubi_core::*;

pub use builder::SequenceBuilder;
pub use config::{ModuleConfig, DEFAULT_TIMEOUT_MS};
pub use continuation::{Continuation, Settled};
pub use module::{InitHook, Module, Normalizer, RedirectHook};
pub use route::{Method, Next, RouteTriggeredSequence, NEXT, REQUEST, RESPONSE};
pub use sequence::{SequenceInstance, SequenceState, StepSequence};
pub use session::{save_then, MemorySession, Session};
pub use step::{FailureHandler, Handler, Jump, Outcome, Step};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        value, Continuation, Method, Module, ModuleConfig, Next, Outcome, SequenceState, Session,
        Settled, StepArgs, StepName, Value, Values, WorkflowError,
    };
}
