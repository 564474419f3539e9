/// Stanza building and parsing.
///
/// Outbound traffic is built as text (the pending-request table keeps
/// the serialised form verbatim for retransmission); inbound stanzas
/// arrive as [`Element`] trees and are viewed through the thin structs
/// below.
use crate::error::StanzaError;
use crate::ns;
use crate::xml::Element;

pub const STREAM_FOOTER: &str = "</stream:stream>";

/// Escapes text/attribute content.
pub fn escape(text: &str) -> String {
    quick_xml::escape::escape(text).into_owned()
}

/// The initial stream preamble, sent on connect and after every stream
/// restart.
pub fn build_stream_open(from: Option<&str>, to: &str, lang: &str) -> String {
    let from_attr = from
        .map(|f| format!(" from='{}'", escape(f)))
        .unwrap_or_default();
    format!(
        "<?xml version='1.0'?>\
         <stream:stream{from_attr} to='{}' version='1.0' xml:lang='{}' \
         xmlns='{}' xmlns:stream='{}'>",
        escape(to),
        escape(lang),
        ns::CLIENT,
        ns::STREAMS
    )
}

pub fn build_starttls() -> String {
    format!("<starttls xmlns='{}'/>", ns::TLS)
}

pub fn build_auth(mechanism: &str, initial_b64: Option<&str>) -> String {
    match initial_b64 {
        Some(payload) => format!(
            "<auth xmlns='{}' mechanism='{mechanism}'>{payload}</auth>",
            ns::SASL
        ),
        None => format!("<auth xmlns='{}' mechanism='{mechanism}'/>", ns::SASL),
    }
}

pub fn build_sasl_response(payload_b64: &str) -> String {
    format!("<response xmlns='{}'>{payload_b64}</response>", ns::SASL)
}

/// An iq request. `to` is omitted when empty (addressed to the server).
pub fn build_iq(iq_type: &str, id: &str, to: &str, payload: &str) -> String {
    let to_attr = if to.is_empty() {
        String::new()
    } else {
        format!(" to='{}'", escape(to))
    };
    format!("<iq type='{iq_type}' id='{id}'{to_attr}>{payload}</iq>")
}

pub fn build_iq_result(id: &str, to: Option<&str>, payload: Option<&str>) -> String {
    let to_attr = to
        .map(|t| format!(" to='{}'", escape(t)))
        .unwrap_or_default();
    match payload {
        Some(payload) => format!("<iq type='result' id='{}'{to_attr}>{payload}</iq>", escape(id)),
        None => format!("<iq type='result' id='{}'{to_attr}/>", escape(id)),
    }
}

pub fn build_iq_error(id: &str, to: Option<&str>, error: &StanzaError) -> String {
    let to_attr = to
        .map(|t| format!(" to='{}'", escape(t)))
        .unwrap_or_default();
    format!(
        "<iq type='error' id='{}'{to_attr}>{}</iq>",
        escape(id),
        error.to_xml()
    )
}

/// A chat message. Used directly for unacknowledged delivery and as
/// the inner payload of the QoS wrappers.
pub fn build_message(to: &str, id: Option<&str>, body: &str) -> String {
    let id_attr = id
        .map(|i| format!(" id='{}'", escape(i)))
        .unwrap_or_default();
    format!(
        "<message to='{}' type='chat'{id_attr}><body>{}</body></message>",
        escape(to),
        escape(body)
    )
}

pub fn build_presence(to: Option<&str>, presence_type: Option<&str>) -> String {
    let to_attr = to
        .map(|t| format!(" to='{}'", escape(t)))
        .unwrap_or_default();
    let type_attr = presence_type
        .map(|t| format!(" type='{t}'"))
        .unwrap_or_default();
    format!("<presence{to_attr}{type_attr}/>")
}

/// Available presence with optional show/status.
pub fn build_presence_with_status(show: Option<&str>, status: Option<&str>) -> String {
    let mut children = String::new();
    if let Some(show) = show {
        children.push_str(&format!("<show>{}</show>", escape(show)));
    }
    if let Some(status) = status {
        children.push_str(&format!("<status>{}</status>", escape(status)));
    }
    if children.is_empty() {
        "<presence/>".to_string()
    } else {
        format!("<presence>{children}</presence>")
    }
}

pub fn build_bind(resource: Option<&str>) -> String {
    match resource {
        Some(resource) => format!(
            "<bind xmlns='{}'><resource>{}</resource></bind>",
            ns::BIND,
            escape(resource)
        ),
        None => format!("<bind xmlns='{}'/>", ns::BIND),
    }
}

// ── Parsed inbound views ─────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Chat,
    Error,
    GroupChat,
    Headline,
    Normal,
}

impl MessageType {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("chat") => Self::Chat,
            Some("error") => Self::Error,
            Some("groupchat") => Self::GroupChat,
            Some("headline") => Self::Headline,
            _ => Self::Normal,
        }
    }
}

/// Parsed incoming message. The full tree stays available in
/// `element` for handlers that need more than the common fields.
#[derive(Debug, Clone)]
pub struct MessageStanza {
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub message_type: MessageType,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub thread: Option<String>,
    pub element: Element,
}

impl MessageStanza {
    pub fn from_element(element: Element) -> Self {
        let text_child = |name: &str| {
            element
                .child(name, ns::CLIENT)
                .map(|child| child.text())
                .filter(|text| !text.is_empty())
        };
        Self {
            from: element.attr("from").map(str::to_string),
            to: element.attr("to").map(str::to_string),
            id: element.attr("id").map(str::to_string),
            message_type: MessageType::from_attr(element.attr("type")),
            subject: text_child("subject"),
            body: text_child("body"),
            thread: text_child("thread"),
            element,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
    Available,
    Unavailable,
    Subscribe,
    Subscribed,
    Unsubscribe,
    Unsubscribed,
    Probe,
    Error,
}

impl PresenceType {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("unavailable") => Self::Unavailable,
            Some("subscribe") => Self::Subscribe,
            Some("subscribed") => Self::Subscribed,
            Some("unsubscribe") => Self::Unsubscribe,
            Some("unsubscribed") => Self::Unsubscribed,
            Some("probe") => Self::Probe,
            Some("error") => Self::Error,
            _ => Self::Available,
        }
    }
}

/// Parsed incoming presence.
#[derive(Debug, Clone)]
pub struct PresenceStanza {
    pub from: Option<String>,
    pub to: Option<String>,
    pub presence_type: PresenceType,
    pub show: Option<String>,
    pub status: Option<String>,
    pub element: Element,
}

impl PresenceStanza {
    pub fn from_element(element: Element) -> Self {
        let text_child = |name: &str| {
            element
                .child(name, ns::CLIENT)
                .map(|child| child.text())
                .filter(|text| !text.is_empty())
        };
        Self {
            from: element.attr("from").map(str::to_string),
            to: element.attr("to").map(str::to_string),
            presence_type: PresenceType::from_attr(element.attr("type")),
            show: text_child("show"),
            status: text_child("status"),
            element,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    #[test]
    fn test_build_stream_open() {
        let xml = build_stream_open(Some("alice@example.org"), "example.org", "en");
        assert!(xml.starts_with("<?xml version='1.0'?>"));
        assert!(xml.contains("from='alice@example.org'"));
        assert!(xml.contains("to='example.org'"));
        assert!(xml.contains("version='1.0'"));
        assert!(xml.contains("xml:lang='en'"));
        assert!(xml.contains("xmlns='jabber:client'"));
        assert!(xml.contains("xmlns:stream='http://etherx.jabber.org/streams'"));
        assert!(xml.ends_with('>'));
    }

    #[test]
    fn test_build_stream_open_without_from() {
        let xml = build_stream_open(None, "example.org", "en");
        assert!(!xml.contains("from="));
    }

    #[test]
    fn test_build_iq_omits_empty_to() {
        let xml = build_iq("get", "7", "", "<ping xmlns='urn:xmpp:ping'/>");
        assert_eq!(xml, "<iq type='get' id='7'><ping xmlns='urn:xmpp:ping'/></iq>");
    }

    #[test]
    fn test_build_iq_with_to() {
        let xml = build_iq("set", "8", "peer@x", "<a/>");
        assert_eq!(xml, "<iq type='set' id='8' to='peer@x'><a/></iq>");
    }

    #[test]
    fn test_build_iq_result_empty() {
        assert_eq!(
            build_iq_result("3", Some("a@b/r"), None),
            "<iq type='result' id='3' to='a@b/r'/>"
        );
    }

    #[test]
    fn test_build_iq_error() {
        use crate::error::{StanzaError, StanzaErrorCondition};
        let xml = build_iq_error(
            "9",
            None,
            &StanzaError::new(StanzaErrorCondition::FeatureNotImplemented),
        );
        assert_eq!(
            xml,
            "<iq type='error' id='9'><error type='cancel'>\
             <feature-not-implemented xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/>\
             </error></iq>"
        );
    }

    #[test]
    fn test_build_message_escapes_body() {
        let xml = build_message("a@b", None, "1 < 2 & 3");
        assert!(xml.contains("<body>1 &lt; 2 &amp; 3</body>"));
    }

    #[test]
    fn test_build_auth() {
        assert_eq!(
            build_auth("PLAIN", Some("AGZvbwBiYXI=")),
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='PLAIN'>AGZvbwBiYXI=</auth>"
        );
        assert_eq!(
            build_auth("DIGEST-MD5", None),
            "<auth xmlns='urn:ietf:params:xml:ns:xmpp-sasl' mechanism='DIGEST-MD5'/>"
        );
    }

    #[test]
    fn test_build_bind() {
        assert!(build_bind(Some("mobile")).contains("<resource>mobile</resource>"));
        assert_eq!(
            build_bind(None),
            "<bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/>"
        );
    }

    #[test]
    fn test_build_presence() {
        assert_eq!(build_presence(None, None), "<presence/>");
        assert_eq!(
            build_presence(Some("a@b"), Some("subscribe")),
            "<presence to='a@b' type='subscribe'/>"
        );
    }

    #[test]
    fn test_message_stanza_fields() {
        let element = Element::parse_stanza(
            HEADER,
            "<message from='u@l/res' to='me@l' type='chat' id='m1'>\
             <subject>s</subject><body>Hello</body><thread>t9</thread></message>",
        )
        .unwrap();
        let msg = MessageStanza::from_element(element);
        assert_eq!(msg.from.as_deref(), Some("u@l/res"));
        assert_eq!(msg.message_type, MessageType::Chat);
        assert_eq!(msg.subject.as_deref(), Some("s"));
        assert_eq!(msg.body.as_deref(), Some("Hello"));
        assert_eq!(msg.thread.as_deref(), Some("t9"));
    }

    #[test]
    fn test_message_type_defaults_to_normal() {
        let element =
            Element::parse_stanza(HEADER, "<message from='u@l'><body>x</body></message>").unwrap();
        let msg = MessageStanza::from_element(element);
        assert_eq!(msg.message_type, MessageType::Normal);
    }

    #[test]
    fn test_presence_stanza_fields() {
        let element = Element::parse_stanza(
            HEADER,
            "<presence from='u@l/mobile'><show>away</show><status>BRB</status></presence>",
        )
        .unwrap();
        let pres = PresenceStanza::from_element(element);
        assert_eq!(pres.presence_type, PresenceType::Available);
        assert_eq!(pres.show.as_deref(), Some("away"));
        assert_eq!(pres.status.as_deref(), Some("BRB"));
    }

    #[test]
    fn test_presence_types() {
        for (attr, expected) in [
            ("subscribe", PresenceType::Subscribe),
            ("subscribed", PresenceType::Subscribed),
            ("unsubscribe", PresenceType::Unsubscribe),
            ("unsubscribed", PresenceType::Unsubscribed),
            ("unavailable", PresenceType::Unavailable),
            ("probe", PresenceType::Probe),
            ("error", PresenceType::Error),
        ] {
            let element = Element::parse_stanza(
                HEADER,
                &format!("<presence from='u@l' type='{attr}'/>"),
            )
            .unwrap();
            assert_eq!(
                PresenceStanza::from_element(element).presence_type,
                expected
            );
        }
    }
}
