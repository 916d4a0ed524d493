//! Inbound notifications.

use crate::core::ReceivedMessage;
use crate::error::Error;

/// Something that happened on a link, in the order it happened.
///
/// Each layer hands these out through an explicit channel
/// (`take_events()`); the reliable manager consumes the driver's channel and
/// republishes only what the application should see.
#[derive(Debug)]
pub enum Event {
    /// The link was opened and the node address applied.
    Initialized,
    /// The receiver started consuming the link.
    Started,
    /// The receiver stopped, because the link was closed or hit end of stream.
    Stopped,
    /// A validated frame addressed to this node (or any node, in promiscuous mode).
    Message(ReceivedMessage),
    /// A transport fault.
    Error(Error),
}

impl Event {
    /// Returns the message carried by this event, if any.
    pub fn into_message(self) -> Option<ReceivedMessage> {
        match self {
            Event::Message(msg) => Some(msg),
            _ => None,
        }
    }
}
