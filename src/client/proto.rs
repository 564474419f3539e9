/// Stream negotiation engine.
///
/// Drives the handshake purely on parsed elements: the caller feeds
/// stream headers and stanzas in, and executes the returned steps
/// (writes, TLS upgrade, stream restarts) against the socket. Keeping
/// the transport out makes every branch of the handshake testable with
/// literal XML.
use base64::Engine;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{
    ConnectionError, SaslError, SaslErrorCondition, StreamError, StreamErrorCondition,
};
use crate::ns;
use crate::register;
use crate::sasl::{self, Credentials, Mechanism, MechanismPolicy};
use crate::stanza::{build_auth, build_iq, build_sasl_response, build_starttls, build_stream_open};
use crate::xml::Element;

use super::event::XmppEvent;
use super::ConnectionState;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Fixed iq ids for the registration exchange that runs before the
/// pending-request table exists.
const REG_FETCH_ID: &str = "reg-form";
const REG_SUBMIT_ID: &str = "reg-submit";

/// One instruction for the connection driver.
pub enum ProtoStep {
    /// Write this text to the transport.
    Send(String),
    /// Upgrade the socket to TLS, then call `on_tls_established`.
    StartTls,
    /// Reset the tokenizer and send a fresh preamble.
    RestartStream,
    SetState(ConnectionState),
    /// Negotiation is complete; hand the stream to the session.
    Established,
    /// `see-other-host`: reconnect against this host.
    Redirect(String),
    Failed(ConnectionError),
    /// Forward to the application event channel.
    Event(XmppEvent),
}

pub struct Negotiation {
    domain: String,
    bare_jid: String,
    lang: String,
    policy: MechanismPolicy,
    credentials: Credentials,
    allow_registration: bool,
    form_signature: Option<(String, String)>,
    tls_active: bool,
    authenticated: bool,
    tried_registration: bool,
    registering: bool,
    offered: Vec<String>,
    server_offers_register: bool,
    mechanism: Option<Mechanism>,
    stream_id: Option<String>,
}

impl Negotiation {
    pub fn new(config: &ClientConfig) -> Self {
        let form_signature = match (&config.form_signature_key, &config.form_signature_secret) {
            (Some(key), Some(secret)) => Some((key.clone(), secret.clone())),
            _ => None,
        };
        Self {
            domain: config.domain().to_string(),
            bare_jid: config.bare_jid(),
            lang: config.language.clone(),
            policy: config.mechanism_policy(),
            credentials: config.credentials(),
            allow_registration: config.allow_registration,
            form_signature,
            tls_active: false,
            authenticated: false,
            tried_registration: false,
            registering: false,
            offered: Vec::new(),
            server_offers_register: false,
            mechanism: None,
            stream_id: None,
        }
    }

    pub fn preamble(&self) -> String {
        build_stream_open(Some(&self.bare_jid), &self.domain, &self.lang)
    }

    pub fn start(&self) -> Vec<ProtoStep> {
        vec![
            ProtoStep::Send(self.preamble()),
            ProtoStep::SetState(ConnectionState::StreamNegotiation),
        ]
    }

    pub fn on_stream_header(&mut self, header: &str) {
        self.stream_id = extract_attr(header, "id");
        debug!("stream open, id={:?}", self.stream_id);
    }

    pub fn on_tls_established(&mut self) -> Vec<ProtoStep> {
        self.tls_active = true;
        vec![
            ProtoStep::RestartStream,
            ProtoStep::SetState(ConnectionState::StreamNegotiation),
        ]
    }

    /// The server closed the stream mid-handshake.
    pub fn on_stream_end(&self) -> Vec<ProtoStep> {
        vec![ProtoStep::Failed(ConnectionError::Io(
            "stream closed during negotiation".to_string(),
        ))]
    }

    /// The SCRAM salted password derived during this handshake, for
    /// the caller to record as `(password_hash, hash_method)`.
    pub fn negotiated_hash(&self) -> Option<(String, &'static str)> {
        let mechanism = self.mechanism.as_ref()?;
        mechanism
            .salted_password()
            .map(|salted| (hex::encode(salted), mechanism.name()))
    }

    pub fn on_element(&mut self, element: &Element) -> Vec<ProtoStep> {
        match (element.name(), element.ns()) {
            ("features", ns::STREAMS) => self.on_features(element),
            ("proceed", ns::TLS) => vec![ProtoStep::StartTls],
            ("failure", ns::TLS) => vec![ProtoStep::Failed(ConnectionError::Tls(
                "server refused STARTTLS".to_string(),
            ))],
            ("challenge", ns::SASL) => self.on_challenge(element),
            ("success", ns::SASL) => self.on_success(element),
            ("failure", ns::SASL) => self.on_sasl_failure(element),
            ("iq", ns::CLIENT) if self.registering => self.on_registration_iq(element),
            ("error", ns::STREAMS) => self.on_stream_error(element),
            (name, namespace) => {
                warn!("ignoring {name} ({namespace}) during negotiation");
                Vec::new()
            }
        }
    }

    /// Feature negotiation, in priority order: STARTTLS, then SASL,
    /// then handover for resource binding. A features element with
    /// nothing pending but mechanisms already announced (re-entry
    /// after TLS) starts authentication.
    fn on_features(&mut self, features: &Element) -> Vec<ProtoStep> {
        if features
            .child("register", ns::FEATURE_REGISTER)
            .is_some()
        {
            self.server_offers_register = true;
        }

        if !self.tls_active && features.child("starttls", ns::TLS).is_some() {
            return vec![
                ProtoStep::Send(build_starttls()),
                ProtoStep::SetState(ConnectionState::StartingEncryption),
            ];
        }

        if let Some(mechanisms) = features.child("mechanisms", ns::SASL) {
            self.offered = mechanisms
                .child_elements()
                .filter(|e| e.name() == "mechanism")
                .map(|e| e.text())
                .collect();
        }

        if self.authenticated {
            return vec![ProtoStep::Established];
        }
        if !self.offered.is_empty() {
            return self.start_auth();
        }
        vec![ProtoStep::Failed(ConnectionError::NoMechanism(Vec::new()))]
    }

    fn start_auth(&mut self) -> Vec<ProtoStep> {
        self.registering = false;
        let Some(name) = sasl::select(&self.offered, &self.policy) else {
            return vec![ProtoStep::Failed(ConnectionError::NoMechanism(
                self.offered.clone(),
            ))];
        };
        let mut mechanism = match Mechanism::create(name, &self.credentials) {
            Ok(mechanism) => mechanism,
            Err(e) => return vec![ProtoStep::Failed(ConnectionError::Parse(e.to_string()))],
        };
        let initial = mechanism
            .initial_response()
            .map(|bytes| B64.encode(bytes));
        self.mechanism = Some(mechanism);
        vec![
            ProtoStep::SetState(ConnectionState::Authenticating),
            ProtoStep::Send(build_auth(name, initial.as_deref())),
        ]
    }

    fn on_challenge(&mut self, element: &Element) -> Vec<ProtoStep> {
        let Some(mechanism) = self.mechanism.as_mut() else {
            return vec![ProtoStep::Failed(ConnectionError::Parse(
                "SASL challenge before auth".to_string(),
            ))];
        };
        let text = element.text();
        let decoded = match B64.decode(text.trim()) {
            Ok(decoded) => decoded,
            Err(e) => {
                return vec![ProtoStep::Failed(ConnectionError::Parse(format!(
                    "bad challenge encoding: {e}"
                )))]
            }
        };
        match mechanism.respond(&decoded) {
            Ok(response) => vec![ProtoStep::Send(build_sasl_response(
                &B64.encode(response),
            ))],
            Err(e) => vec![ProtoStep::Failed(ConnectionError::Sasl(SaslError {
                condition: SaslErrorCondition::NotAuthorized,
                text: Some(e.to_string()),
            }))],
        }
    }

    fn on_success(&mut self, element: &Element) -> Vec<ProtoStep> {
        let Some(mechanism) = self.mechanism.as_mut() else {
            return vec![ProtoStep::Failed(ConnectionError::Parse(
                "SASL success before auth".to_string(),
            ))];
        };
        let text = element.text();
        let data = if text.trim().is_empty() || text.trim() == "=" {
            Vec::new()
        } else {
            match B64.decode(text.trim()) {
                Ok(data) => data,
                Err(e) => {
                    return vec![ProtoStep::Failed(ConnectionError::Parse(format!(
                        "bad success encoding: {e}"
                    )))]
                }
            }
        };
        match mechanism.check_success(&data) {
            Ok(()) => {
                // Only the negotiated identity survives the restart.
                self.authenticated = true;
                vec![
                    ProtoStep::RestartStream,
                    ProtoStep::SetState(ConnectionState::StreamNegotiation),
                ]
            }
            Err(e) => vec![ProtoStep::Failed(ConnectionError::Sasl(SaslError {
                condition: SaslErrorCondition::NotAuthorized,
                text: Some(e.to_string()),
            }))],
        }
    }

    /// Authentication failed. When the server advertised in-band
    /// registration and the configuration opted in, register the
    /// account and retry; otherwise the failure is fatal.
    fn on_sasl_failure(&mut self, element: &Element) -> Vec<ProtoStep> {
        let error = SaslError::from_element(element);
        if self.allow_registration
            && self.server_offers_register
            && !self.tried_registration
            && !self.credentials.password.is_empty()
        {
            debug!("SASL failed ({error}), falling back to in-band registration");
            self.tried_registration = true;
            self.registering = true;
            return vec![
                ProtoStep::SetState(ConnectionState::Registering),
                ProtoStep::Send(build_iq(
                    "get",
                    REG_FETCH_ID,
                    "",
                    &register::build_query_get(),
                )),
            ];
        }
        vec![ProtoStep::Failed(ConnectionError::Sasl(error))]
    }

    fn on_registration_iq(&mut self, element: &Element) -> Vec<ProtoStep> {
        let id = element.attr("id").unwrap_or("");
        let iq_type = element.attr("type").unwrap_or("");
        match (id, iq_type) {
            (REG_FETCH_ID, "result") => {
                let Some(query) = element.child("query", ns::REGISTER) else {
                    return vec![ProtoStep::Failed(ConnectionError::Parse(
                        "registration result without query".to_string(),
                    ))];
                };
                let signature = self
                    .form_signature
                    .as_ref()
                    .map(|(k, s)| (k.as_str(), s.as_str()));
                let (payload, form) = register::build_submit_payload(
                    &self.credentials.username,
                    &self.credentials.password,
                    query,
                    signature,
                );
                let mut steps = Vec::new();
                if let Some(form) = form {
                    steps.push(ProtoStep::Event(XmppEvent::RegistrationForm(form)));
                }
                steps.push(ProtoStep::Send(build_iq(
                    "set",
                    REG_SUBMIT_ID,
                    "",
                    &payload,
                )));
                steps
            }
            (REG_SUBMIT_ID, "result") => self.start_auth(),
            (_, "error") => vec![ProtoStep::Failed(ConnectionError::Sasl(SaslError {
                condition: SaslErrorCondition::NotAuthorized,
                text: Some("in-band registration failed".to_string()),
            }))],
            _ => Vec::new(),
        }
    }

    fn on_stream_error(&self, element: &Element) -> Vec<ProtoStep> {
        let error = StreamError::from_element(element);
        if error.condition == StreamErrorCondition::SeeOtherHost {
            if let Some(host) = &error.other_host {
                return vec![ProtoStep::Redirect(host.clone())];
            }
        }
        vec![ProtoStep::Failed(ConnectionError::Stream(error))]
    }
}

/// Pulls one attribute out of a raw (possibly unclosed) tag.
fn extract_attr(xml: &str, attr: &str) -> Option<String> {
    for quote in ['\'', '"'] {
        let pattern = format!("{attr}={quote}");
        if let Some(start) = xml.find(&pattern) {
            let after = &xml[start + pattern.len()..];
            if let Some(end) = after.find(quote) {
                return Some(after[..end].to_string());
            }
        }
    }
    None
}
