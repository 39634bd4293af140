use crate::domain::models::{CompleteMessage, ConnectionState, Diagnostic, SessionEvent};
use tokio::sync::mpsc;

/// Per-session handle on the observer channel.
///
/// Sends never fail from the session's point of view: once the observer has
/// dropped its receiver, events are discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    address: String,
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(address: impl Into<String>, sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            address: address.into(),
            sender,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state_changed(&self, state: ConnectionState) {
        self.send(SessionEvent::StateChanged {
            address: self.address.clone(),
            state,
        });
    }

    pub fn capture_changed(&self, capturing: bool) {
        self.send(SessionEvent::CaptureChanged {
            address: self.address.clone(),
            capturing,
        });
    }

    pub fn message(&self, message: CompleteMessage) {
        self.send(SessionEvent::Message {
            address: self.address.clone(),
            message,
        });
    }

    pub fn diagnostic(&self, diagnostic: Diagnostic) {
        self.send(SessionEvent::Diagnostic {
            address: self.address.clone(),
            diagnostic,
        });
    }

    fn send(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}
