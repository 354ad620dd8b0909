//! Sandboxed execution of model-supplied code and shell commands.
//!
//! Execution happens in a subprocess whose current directory is the
//! conversation's working directory. The module contributes three things on
//! top of plain subprocess spawning:
//!
//! - a denylist for shell commands (defense in depth, not a security
//!   perimeter),
//! - a Python preamble injected after the leading imports that fixes the
//!   runtime environment (locale, CJK fonts for plotting, conversation id),
//! - change-set detection: the files created *or overwritten* during the
//!   run, found by mtime comparison plus an explicit stdout sentinel.

mod changeset;
mod executor;
mod preamble;

pub use changeset::{changed_files, FILE_SENTINEL};
pub use executor::{ExecError, ExecResult, SandboxExecutor};
