use crate::domain::models::{CompleteMessage, Diagnostic};
use crate::domain::reassembler::FrameReassembler;
use crate::error::FrameError;
use crate::infrastructure::bluetooth::command::CommandChannel;
use crate::infrastructure::bluetooth::protocol::{CharacteristicRole, RoleMap};
use crate::infrastructure::bluetooth::transport::Notification;
use tokio::time::Instant;
use tracing::{debug, warn};

/// What a notification turned into after routing.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Message(CompleteMessage),
    /// The peripheral reported its capture state.
    Capture(bool),
    Diagnostic(Diagnostic),
}

/// Dispatches incoming notifications by characteristic role.
///
/// Data fragments are decoded as UTF-8 and fed to the reassembler. Capture
/// echoes update the command channel. Anything else is reported and dropped.
///
/// Fragments are stamped with the runtime clock, the same one the session's
/// stale-frame sweep reads.
#[derive(Debug, Clone)]
pub struct NotificationRouter {
    roles: RoleMap,
}

impl NotificationRouter {
    pub fn new(roles: RoleMap) -> Self {
        Self { roles }
    }

    /// Route one notification. `None` means it was absorbed with nothing to
    /// report: a buffered fragment, or an echo that left the capture state as is.
    pub fn route(
        &self,
        notification: &Notification,
        reassembler: &mut FrameReassembler,
        command: &mut CommandChannel,
    ) -> Option<Routed> {
        let characteristic = notification.characteristic;
        match self.roles.role_of(&characteristic) {
            CharacteristicRole::DataNotify => {
                let text = match std::str::from_utf8(&notification.value) {
                    Ok(text) => text,
                    Err(source) => {
                        warn!("Dropping undecodable fragment on {}", characteristic);
                        return Some(Routed::Diagnostic(Diagnostic::Frame(
                            FrameError::DecodeFailure {
                                characteristic,
                                source,
                            },
                        )));
                    }
                };
                match reassembler.process_fragment_at(text, Instant::now().into_std()) {
                    Ok(Some(message)) => Some(Routed::Message(message)),
                    Ok(None) => None,
                    Err(e) => Some(Routed::Diagnostic(Diagnostic::Frame(e))),
                }
            }
            CharacteristicRole::Command => {
                if notification.value.is_empty() {
                    warn!("Empty capture echo on {}", characteristic);
                    return Some(Routed::Diagnostic(Diagnostic::EmptyCaptureEcho));
                }
                command.apply_echo(&notification.value).map(Routed::Capture)
            }
            CharacteristicRole::Unclassified => {
                debug!("Ignoring notification on unclassified {}", characteristic);
                Some(Routed::Diagnostic(Diagnostic::Unclassified { characteristic }))
            }
        }
    }
}
