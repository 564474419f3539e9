//! Namespace URIs used on the wire.

/// RFC 6120 client streams
pub const CLIENT: &str = "jabber:client";
pub const STREAMS: &str = "http://etherx.jabber.org/streams";
pub const STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
/// Stream-features advertisement of XEP-0077 support
pub const FEATURE_REGISTER: &str = "http://jabber.org/features/iq-register";

/// RFC 6121 roster management
pub const ROSTER: &str = "jabber:iq:roster";

/// XEP-0004: Data Forms
pub const DATA_FORMS: &str = "jabber:x:data";
/// XEP-0030: Service Discovery
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
/// XEP-0055: Jabber Search
pub const SEARCH: &str = "jabber:iq:search";
/// XEP-0077: In-Band Registration
pub const REGISTER: &str = "jabber:iq:register";
/// XEP-0092: Software Version
pub const VERSION: &str = "jabber:iq:version";

/// Three-level message delivery QoS
pub const QOS: &str = "urn:xmpp:qos";
