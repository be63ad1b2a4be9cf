//! Engine events
//!
//! Every state change or I/O milestone of a [`crate::Process`] is published as
//! a [`ProcessEvent`]. Listeners either register a callback with
//! [`crate::Process::on_event`], which runs synchronously inside the handler
//! that produced the event, or take a channel receiver from
//! [`crate::Process::subscribe`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProcessError;
use crate::types::{ExitStatus, ProcessState};

/// Engine lifecycle and I/O events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessEvent {
    /// The engine moved to a new state
    StateChanged {
        /// New state
        state: ProcessState,
    },
    /// The child exec'd successfully
    Started,
    /// New data arrived on the current read channel
    ReadyRead,
    /// New data arrived on the child's stdout
    ReadyReadStandardOutput,
    /// New data arrived on the child's stderr
    ReadyReadStandardError,
    /// Queued input was written to the child
    BytesWritten {
        /// Bytes written by this write
        bytes: usize,
    },
    /// An error was recorded
    ErrorOccurred {
        /// Kind of error
        error: ProcessError,
    },
    /// No more data will arrive from the child
    ReadChannelFinished,
    /// The child was reaped after running
    Finished {
        /// Exit code, or the signal number for a crash
        exit_code: i32,
        /// How the child terminated
        exit_status: ExitStatus,
    },
    /// `close()` is about to tear the engine down
    AboutToClose,
}

type Callback = Box<dyn FnMut(&ProcessEvent) + Send>;

/// Fan-out of events to callbacks and channel subscribers
#[derive(Default)]
pub(crate) struct EventBus {
    callbacks: Vec<Callback>,
    subscribers: Vec<mpsc::UnboundedSender<ProcessEvent>>,
}

impl EventBus {
    pub(crate) fn on_event(&mut self, callback: impl FnMut(&ProcessEvent) + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ProcessEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Delivers `event` to every listener, dropping subscribers whose
    /// receiver has gone away
    pub(crate) fn emit(&mut self, event: ProcessEvent) {
        for callback in &mut self.callbacks {
            callback(&event);
        }
        self.subscribers.retain(|tx| tx.send(event).is_ok());
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("callbacks", &self.callbacks.len())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_event_serialization() {
        let event = ProcessEvent::Finished {
            exit_code: 3,
            exit_status: ExitStatus::NormalExit,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"finished\""));
        let deserialized: ProcessEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, deserialized);
    }

    #[test]
    fn test_callbacks_see_events_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::default();
        let sink = Arc::clone(&seen);
        bus.on_event(move |event| sink.lock().unwrap().push(*event));

        bus.emit(ProcessEvent::Started);
        bus.emit(ProcessEvent::BytesWritten { bytes: 4 });
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ProcessEvent::Started, ProcessEvent::BytesWritten { bytes: 4 }]
        );
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut bus = EventBus::default();
        let mut kept = bus.subscribe();
        drop(bus.subscribe());

        bus.emit(ProcessEvent::ReadyRead);
        assert_eq!(bus.subscribers.len(), 1);
        assert_eq!(kept.try_recv().unwrap(), ProcessEvent::ReadyRead);
    }
}
