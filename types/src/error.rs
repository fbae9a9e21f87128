use thiserror::Error;

use crate::envelope::SenderRole;

/// Protocol-level faults (§7): an unknown sender role, or a payload a
/// participant has no handler for. Fatal — callers promote these to a STOP
/// broadcast rather than recovering locally.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unexpected sender role {sender} for this participant's mailbox")]
    UnexpectedSender { sender: SenderRole },
    #[error("payload from {sender} did not match any known envelope shape")]
    MalformedPayload { sender: SenderRole },
}
