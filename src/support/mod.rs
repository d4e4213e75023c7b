//! Support Session Module
//!
//! The session orchestrator and its collaborators: extension hooks and
//! companion process supervision.

mod companion;
mod error;
mod extender;
mod session;

pub use companion::{
    build_companion_argv, is_process_gone, CompanionProcess, ProcessSupervisor,
    TokioProcessSupervisor, PORT_MARKER,
};
pub use error::{HookError, SupportError};
pub use extender::{NoopExtender, SessionContext, SupportExtender};
pub use session::{SessionState, SupportSession};
