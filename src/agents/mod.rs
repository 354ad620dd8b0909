//! Turn orchestration.

/// Progress event channel between a turn and the HTTP surface.
pub mod progress;
/// The ReAct turn driver.
pub mod react;

pub use progress::{progress_channel, ProgressEvent, ProgressSender};
pub use react::{ReactAgent, TurnOutcome};
