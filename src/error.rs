/// Protocol error taxonomy.
///
/// Three vocabularies of defined conditions (stream, stanza, SASL),
/// each mapped to and from its wire form, plus the `ConnectionError`
/// kind reported through the event channel when a connection dies.
use std::fmt;

use crate::ns;
use crate::xml::Element;

macro_rules! conditions {
    ($name:ident { $($variant:ident => $wire:literal,)* }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant,)*
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)*
                }
            }

            pub fn from_str(s: &str) -> Option<Self> {
                match s {
                    $($wire => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

conditions!(StreamErrorCondition {
    BadFormat => "bad-format",
    BadNamespacePrefix => "bad-namespace-prefix",
    Conflict => "conflict",
    ConnectionTimeout => "connection-timeout",
    HostGone => "host-gone",
    HostUnknown => "host-unknown",
    ImproperAddressing => "improper-addressing",
    InternalServerError => "internal-server-error",
    InvalidFrom => "invalid-from",
    InvalidNamespace => "invalid-namespace",
    InvalidXml => "invalid-xml",
    NotAuthorized => "not-authorized",
    NotWellFormed => "not-well-formed",
    PolicyViolation => "policy-violation",
    RemoteConnectionFailed => "remote-connection-failed",
    Reset => "reset",
    ResourceConstraint => "resource-constraint",
    RestrictedXml => "restricted-xml",
    SeeOtherHost => "see-other-host",
    SystemShutdown => "system-shutdown",
    UndefinedCondition => "undefined-condition",
    UnsupportedEncoding => "unsupported-encoding",
    UnsupportedFeature => "unsupported-feature",
    UnsupportedStanzaType => "unsupported-stanza-type",
    UnsupportedVersion => "unsupported-version",
});

conditions!(StanzaErrorCondition {
    BadRequest => "bad-request",
    Conflict => "conflict",
    FeatureNotImplemented => "feature-not-implemented",
    Forbidden => "forbidden",
    Gone => "gone",
    InternalServerError => "internal-server-error",
    ItemNotFound => "item-not-found",
    JidMalformed => "jid-malformed",
    NotAcceptable => "not-acceptable",
    NotAllowed => "not-allowed",
    NotAuthorized => "not-authorized",
    PolicyViolation => "policy-violation",
    RecipientUnavailable => "recipient-unavailable",
    Redirect => "redirect",
    RegistrationRequired => "registration-required",
    RemoteServerNotFound => "remote-server-not-found",
    RemoteServerTimeout => "remote-server-timeout",
    ResourceConstraint => "resource-constraint",
    ServiceUnavailable => "service-unavailable",
    SubscriptionRequired => "subscription-required",
    UndefinedCondition => "undefined-condition",
    UnexpectedRequest => "unexpected-request",
});

conditions!(SaslErrorCondition {
    Aborted => "aborted",
    AccountDisabled => "account-disabled",
    CredentialsExpired => "credentials-expired",
    EncryptionRequired => "encryption-required",
    IncorrectEncoding => "incorrect-encoding",
    InvalidAuthzid => "invalid-authzid",
    InvalidMechanism => "invalid-mechanism",
    MalformedRequest => "malformed-request",
    MechanismTooWeak => "mechanism-too-weak",
    NotAuthorized => "not-authorized",
    TemporaryAuthFailure => "temporary-auth-failure",
});

/// The `type` attribute of a stanza `<error/>` element (RFC 6120 §8.3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    Auth,
    Cancel,
    Continue,
    Modify,
    Wait,
}

impl StanzaErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Cancel => "cancel",
            Self::Continue => "continue",
            Self::Modify => "modify",
            Self::Wait => "wait",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "auth" => Some(Self::Auth),
            "cancel" => Some(Self::Cancel),
            "continue" => Some(Self::Continue),
            "modify" => Some(Self::Modify),
            "wait" => Some(Self::Wait),
            _ => None,
        }
    }
}

/// A stanza-level error, serialisable to the `<error/>` child of an
/// iq/message/presence reply.
#[derive(Debug, Clone, PartialEq)]
pub struct StanzaError {
    pub error_type: StanzaErrorType,
    pub condition: StanzaErrorCondition,
    pub text: Option<String>,
}

impl StanzaError {
    /// Builds an error with the default type RFC 6120 associates with
    /// the condition.
    pub fn new(condition: StanzaErrorCondition) -> Self {
        use StanzaErrorCondition::*;
        let error_type = match condition {
            BadRequest | JidMalformed | NotAcceptable | Redirect | Gone => {
                StanzaErrorType::Modify
            }
            Forbidden | NotAuthorized | RegistrationRequired | SubscriptionRequired => {
                StanzaErrorType::Auth
            }
            RecipientUnavailable | RemoteServerTimeout | ResourceConstraint
            | UnexpectedRequest => StanzaErrorType::Wait,
            _ => StanzaErrorType::Cancel,
        };
        Self {
            error_type,
            condition,
            text: None,
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    /// Serialises the `<error/>` element.
    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<error type='{}'><{} xmlns='{}'/>",
            self.error_type.as_str(),
            self.condition.as_str(),
            ns::STANZA_ERRORS
        );
        if let Some(text) = &self.text {
            xml.push_str(&format!(
                "<text xmlns='{}'>{}</text>",
                ns::STANZA_ERRORS,
                crate::stanza::escape(text)
            ));
        }
        xml.push_str("</error>");
        xml
    }

    /// Reads a stanza error out of an `<error/>` element. Unknown
    /// conditions map to `undefined-condition`.
    pub fn from_element(error: &Element) -> Self {
        let error_type = error
            .attr("type")
            .and_then(StanzaErrorType::from_str)
            .unwrap_or(StanzaErrorType::Cancel);
        let mut condition = StanzaErrorCondition::UndefinedCondition;
        let mut text = None;
        for child in error.child_elements() {
            if child.ns() != ns::STANZA_ERRORS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else if let Some(c) = StanzaErrorCondition::from_str(child.name()) {
                condition = c;
            }
        }
        Self {
            error_type,
            condition,
            text,
        }
    }
}

impl fmt::Display for StanzaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition.as_str())?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StanzaError {}

/// A stream-level error (`<stream:error/>`). Always fatal except for
/// `see-other-host`, which carries the replacement host.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    pub condition: StreamErrorCondition,
    pub text: Option<String>,
    /// Payload of `see-other-host`.
    pub other_host: Option<String>,
}

impl StreamError {
    pub fn new(condition: StreamErrorCondition) -> Self {
        Self {
            condition,
            text: None,
            other_host: None,
        }
    }

    pub fn from_element(error: &Element) -> Self {
        let mut condition = StreamErrorCondition::UndefinedCondition;
        let mut text = None;
        let mut other_host = None;
        for child in error.child_elements() {
            if child.ns() != ns::STREAM_ERRORS {
                continue;
            }
            if child.name() == "text" {
                text = Some(child.text());
            } else if let Some(c) = StreamErrorCondition::from_str(child.name()) {
                condition = c;
                if c == StreamErrorCondition::SeeOtherHost {
                    other_host = Some(child.text());
                }
            }
        }
        Self {
            condition,
            text,
            other_host,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition.as_str())?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

impl std::error::Error for StreamError {}

/// A SASL `<failure/>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SaslError {
    pub condition: SaslErrorCondition,
    pub text: Option<String>,
}

impl SaslError {
    pub fn from_element(failure: &Element) -> Self {
        let mut condition = SaslErrorCondition::NotAuthorized;
        let mut text = None;
        for child in failure.child_elements() {
            if child.name() == "text" {
                text = Some(child.text());
            } else if let Some(c) = SaslErrorCondition::from_str(child.name()) {
                condition = c;
            }
        }
        Self { condition, text }
    }
}

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.condition.as_str())?;
        if let Some(text) = &self.text {
            write!(f, " ({text})")?;
        }
        Ok(())
    }
}

impl std::error::Error for SaslError {}

/// Why a connection left the Connected (or a handshake) state. Carried
/// by the connection-error event; everything here is fatal for the
/// current stream.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    /// A `<stream:error/>` from the server.
    Stream(StreamError),
    /// SASL authentication failed and no fallback applied.
    Sasl(SaslError),
    /// No offered mechanism is acceptable under the configured policy.
    NoMechanism(Vec<String>),
    /// TLS handshake failure.
    Tls(String),
    /// Transport I/O failure.
    Io(String),
    /// The inbound byte stream violated the framing rules.
    Parse(String),
    /// A handshake step did not complete in time.
    Timeout(String),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stream(e) => write!(f, "stream error: {e}"),
            Self::Sasl(e) => write!(f, "SASL failure: {e}"),
            Self::NoMechanism(offered) => {
                write!(f, "no acceptable SASL mechanism (offered: {offered:?})")
            }
            Self::Tls(e) => write!(f, "TLS handshake failed: {e}"),
            Self::Io(e) => write!(f, "transport failure: {e}"),
            Self::Parse(e) => write!(f, "stream parse error: {e}"),
            Self::Timeout(e) => write!(f, "timeout: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {}
