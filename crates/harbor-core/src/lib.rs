//! Core types shared by every Harbor crate.
//!
//! - [`HarborError`], the error taxonomy surfaced by the runtime.
//! - [`InstanceState`] and friends, the lifecycle vocabulary.
//! - [`SessionRecord`], the serializable session container.
//! - [`Capabilities`], the optional-collaborator registry.
//! - [`Supervisor`], per-request execution isolation.

pub mod capability;
pub mod error;
pub mod instance;
pub mod request;
pub mod session;
pub mod supervisor;

pub use capability::Capabilities;
pub use error::{HarborError, StepFailure};
pub use instance::{BackendState, InstanceKey, InstanceSnapshot, InstanceState};
pub use request::{Request, Response};
pub use session::SessionRecord;
pub use supervisor::{ExecutionContext, SharedPool, Supervisor, TeardownReport, WorkHandle};
