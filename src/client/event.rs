/// Events emitted by the client to the application.
use crate::error::ConnectionError;
use crate::forms::Form;
use crate::roster::RosterItem;
use crate::stanza::{MessageStanza, PresenceStanza};

use super::ConnectionState;

/// Everything observable flows through one channel, handed out by
/// [`Client::new`](super::Client::new).
#[derive(Debug)]
pub enum XmppEvent {
    /// The connection state machine moved.
    StateChanged(ConnectionState),
    /// The connection died (stream error, transport failure, SASL).
    ConnectionError(ConnectionError),
    /// A non-fatal error, e.g. a panicking handler.
    Error(String),

    RosterItemAdded(RosterItem),
    RosterItemUpdated(RosterItem),
    /// Carries the removed bare JID.
    RosterItemRemoved(String),

    /// Available or unavailable presence from a peer.
    Presence(PresenceStanza),
    /// A peer asks to see our presence (carries the sender address).
    SubscriptionRequest(String),
    /// A peer approved our subscription request.
    Subscribed(String),
    /// A peer stops watching our presence.
    UnsubscribeRequest(String),
    /// A peer revoked our subscription.
    Unsubscribed(String),
    PresenceProbe(PresenceStanza),
    PresenceError(PresenceStanza),

    ChatMessage(MessageStanza),
    GroupChatMessage(MessageStanza),
    HeadlineMessage(MessageStanza),
    NormalMessage(MessageStanza),
    ErrorMessage(MessageStanza),

    /// The server requires a form to complete in-band registration.
    RegistrationForm(Form),
    /// The server requires a form to complete a password change.
    PasswordChangeForm(Form),
    PasswordChanged,
    /// A dynamic data form pushed over a message stanza.
    DynamicFormUpdated {
        from: Option<String>,
        form: Form,
    },
}
