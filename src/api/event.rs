//! Purpose: Application-facing events and the sink they are delivered through.
//! Exports: `Event`, `Operation`, `EventSink`.
//! Role: Replaces UI-thread callbacks with an explicit delivery context.
//! Invariants: Sinks never block the caller; a closed sink drops events silently.
use crate::core::error::{Error, ErrorKind};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    StoreValue,
    AppendValueToList,
    ClearTag,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::StoreValue => "StoreValue",
            Operation::AppendValueToList => "AppendValueToList",
            Operation::ClearTag => "ClearTag",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    UpdateDone { tag: String, operation: Operation },
    GotValue { tag: String, value: Value },
    DataChanged { tag: String, value: Value },
    FirstRemoved { tag: String, value: Value },
    TagList { tags: Vec<String> },
    Error { kind: ErrorKind, message: String },
}

impl Event {
    pub fn from_error(err: &Error) -> Self {
        Event::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Event::UpdateDone { tag, .. }
            | Event::GotValue { tag, .. }
            | Event::DataChanged { tag, .. }
            | Event::FirstRemoved { tag, .. } => Some(tag),
            Event::TagList { .. } | Event::Error { .. } => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Event::Error { .. })
    }
}

/// Where the client delivers events. Called from background tasks.
pub trait EventSink: Send + Sync + 'static {
    fn deliver(&self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn deliver(&self, event: Event) {
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventSink, Operation};
    use crate::core::error::{Error, ErrorKind};
    use tokio::sync::mpsc;

    #[test]
    fn error_event_carries_kind_and_display() {
        let err = Error::new(ErrorKind::Offline)
            .with_message("no connectivity")
            .with_tag("x");
        let event = Event::from_error(&err);
        assert_eq!(
            event,
            Event::Error {
                kind: ErrorKind::Offline,
                message: "Offline: no connectivity (tag: x)".to_string(),
            }
        );
        assert!(event.is_error());
        assert_eq!(event.tag(), None);
    }

    #[test]
    fn closed_channel_sink_drops_silently() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        tx.deliver(Event::UpdateDone {
            tag: "t".to_string(),
            operation: Operation::StoreValue,
        });
    }
}
