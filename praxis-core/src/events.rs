//! Tool-call lifecycle events emitted during a turn.

use tokio::sync::mpsc;

/// Lifecycle of one tool invocation, keyed by its call id. `Delta` carries
/// incremental human-readable output for UIs that surface progress.
#[derive(Debug, Clone)]
pub enum ToolCallEvent {
    Start {
        call_id: String,
        server: String,
        tool: String,
    },
    Delta {
        call_id: String,
        content: String,
    },
    Stop {
        call_id: String,
        is_error: bool,
        duration_ms: u64,
    },
}

/// Fan-out point for tool events. Without a subscriber, emission is a no-op.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    sender: Option<mpsc::UnboundedSender<ToolCallEvent>>,
}

impl EventSink {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new() -> (Self, mpsc::UnboundedReceiver<ToolCallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn emit(&self, event: ToolCallEvent) {
        if let Some(sender) = &self.sender {
            // A dropped receiver just means nobody is listening anymore.
            let _ = sender.send(event);
        }
    }
}
