//! An XMPP client library (RFC 6120/6121/6122) with a three-level
//! message delivery QoS extension (`urn:xmpp:qos`).
//!
//! The connection core is a long-lived full-duplex XML stream machine:
//! a hand-written tokenizer frames the never-ending stream document, a
//! sans-io negotiation engine drives TCP → STARTTLS → SASL → resource
//! binding, and a dispatcher routes iq/message/presence stanzas to
//! pluggable handlers keyed by `(local-name, namespace)`. Outbound iq
//! requests are correlated with retries and exponential drop-off;
//! assured delivery adds per-source and global admission control.
//!
//! ```no_run
//! use fluux_xmpp::{Client, ClientConfig, XmppEvent};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ClientConfig::from_toml_file("client.toml")?;
//! let (client, mut events) = Client::new(config);
//! client.connect().await?;
//!
//! client.send_message("friend@example.org", "hello", None)?;
//! while let Some(event) = events.recv().await {
//!     if let XmppEvent::ChatMessage(message) = event {
//!         println!("{:?}: {:?}", message.from, message.body);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod disco;
pub mod error;
pub mod forms;
pub mod jid;
pub mod ns;
pub mod register;
pub mod retry;
pub mod roster;
pub mod sasl;
pub mod search;
pub mod stanza;
pub mod version;
pub mod xml;

pub use client::{
    Client, ConnectionState, DeliveryCallback, HandlerId, IqCallback, IqHandler,
    IqHandlerOutcome, IqRequest, IqResponse, MessageHandler, XmppEvent,
};
pub use config::ClientConfig;
pub use error::{
    ConnectionError, SaslError, SaslErrorCondition, StanzaError, StanzaErrorCondition,
    StreamError, StreamErrorCondition,
};
pub use forms::{FieldType, Form, FormField, FormType};
pub use jid::{bare_of, Jid};
pub use roster::{RosterItem, Subscription};
pub use stanza::{MessageStanza, MessageType, PresenceStanza, PresenceType};
