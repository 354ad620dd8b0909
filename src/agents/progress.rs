//! Turn progress events.
//!
//! The orchestrator emits these on a bounded channel; the HTTP surface is
//! the sole consumer and forwards them as SSE. A slow client applies
//! backpressure through the channel; a disconnected client closes the
//! receiver, after which sends fail fast and the turn runs on to completion
//! regardless.

use tokio::sync::mpsc;

/// Default channel capacity. Small: the consumer either keeps up or the
/// producer should slow down with it.
const CHANNEL_CAPACITY: usize = 64;

/// One progress event within a turn, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A chunk of assistant text from the model.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// A tool is about to run.
    ToolCallStarted {
        /// Tool name as the model issued it.
        name: String,
        /// Raw argument string.
        arguments: String,
    },
    /// A tool finished.
    ToolCallResult {
        /// Tool name.
        name: String,
        /// "success" or "failed".
        status: String,
        /// Files this invocation added to the working directory.
        files_added: Vec<String>,
    },
    /// Union update of all files generated so far this turn.
    FilesGenerated {
        /// Full first-seen-order union.
        files: Vec<String>,
    },
    /// Terminal event.
    Done {
        /// "completed" or "failed".
        status: String,
        /// Final assistant text.
        final_content: String,
        /// All generated files for the turn.
        files: Vec<String>,
    },
}

/// Sending half used by the orchestrator.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressSender {
    /// Emit an event. Returns quietly when the consumer is gone — the turn
    /// must finish and persist either way.
    pub async fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event).await;
    }
}

/// Create the progress channel for one turn.
pub fn progress_channel() -> (ProgressSender, mpsc::Receiver<ProgressEvent>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (ProgressSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_preserve_order() {
        let (tx, mut rx) = progress_channel();
        tx.emit(ProgressEvent::TextDelta {
            text: "a".to_string(),
        })
        .await;
        tx.emit(ProgressEvent::TextDelta {
            text: "b".to_string(),
        })
        .await;
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::TextDelta {
                text: "a".to_string()
            })
        );
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::TextDelta {
                text: "b".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_emit_survives_dropped_receiver() {
        let (tx, rx) = progress_channel();
        drop(rx);
        // Must not hang or panic
        tx.emit(ProgressEvent::FilesGenerated { files: vec![] }).await;
    }
}
