/// XMPP C2S connection core.
///
/// A [`Client`] is a cheap cloneable handle over the shared connection
/// state. `connect` drives the handshake (TCP, STARTTLS, SASL,
/// resource binding, roster, presence) and then hands the socket to
/// three tasks: a read loop feeding the tokenizer and dispatcher, the
/// single-writer loop, and a 1-second tick for retries and
/// keep-alives. Everything observable arrives on the event channel
/// returned by [`Client::new`].
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_native_tls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{ConnectionError, StanzaError, StanzaErrorCondition, StreamError,
    StreamErrorCondition};
use crate::jid::Jid;
use crate::ns;
use crate::retry::RetrySchedule;
use crate::roster::{RosterCache, RosterItem};
use crate::stanza::{
    build_bind, build_iq, build_presence, build_presence_with_status, MessageStanza,
    STREAM_FOOTER,
};
use crate::xml::{Element, StreamToken, Tokenizer};

pub mod dispatch;
pub mod event;
pub mod pending;
pub mod proto;
pub mod qos;
pub mod registry;
pub mod writer;

pub use event::XmppEvent;
pub use pending::{IqCallback, IqResponse};
pub use qos::DeliveryCallback;
pub use registry::{HandlerId, IqHandler, IqHandlerOutcome, IqRequest, MessageHandler};

use pending::{PendingTable, TickAction};
use proto::{Negotiation, ProtoStep};
use qos::AssuredInventory;
use registry::HandlerRegistry;
use writer::WirePacket;

/// Where the connection currently stands. Every transition is emitted
/// as a `StateChanged` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    StreamNegotiation,
    StartingEncryption,
    Authenticating,
    Registering,
    Binding,
    FetchingRoster,
    SettingPresence,
    Connected,
    Offline,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::StreamNegotiation => "stream-negotiation",
            Self::StartingEncryption => "starting-encryption",
            Self::Authenticating => "authenticating",
            Self::Registering => "registering",
            Self::Binding => "binding",
            Self::FetchingRoster => "fetching-roster",
            Self::SettingPresence => "setting-presence",
            Self::Connected => "connected",
            Self::Offline => "offline",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Bound on chained `see-other-host` redirects.
const MAX_REDIRECTS: usize = 3;

pub(crate) struct Inner {
    config: Mutex<ClientConfig>,
    state: Mutex<ConnectionState>,
    events: mpsc::UnboundedSender<XmppEvent>,
    writer: Mutex<Option<mpsc::UnboundedSender<WirePacket>>>,
    pending: Mutex<PendingTable>,
    registry: Mutex<HandlerRegistry>,
    roster: Mutex<RosterCache>,
    assured: Mutex<AssuredInventory>,
    full_jid: Mutex<Option<Jid>>,
    roster_fetched: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

enum DriveEnd {
    NeedTls,
    Established { leftover: Vec<StreamToken> },
    Redirect(String),
}

enum ConnectOutcome {
    Done,
    Redirect(String),
}

impl Client {
    /// Builds a client and its event receiver. Nothing happens on the
    /// network until [`connect`](Self::connect).
    pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<XmppEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let keep_alive = Duration::from_secs(config.keep_alive_seconds);
        let assured = AssuredInventory::new(
            config.max_assured_messages_pending_from_source,
            config.max_assured_messages_pending_total,
        );
        let client = Self {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                state: Mutex::new(ConnectionState::Offline),
                events,
                writer: Mutex::new(None),
                pending: Mutex::new(PendingTable::new(keep_alive)),
                registry: Mutex::new(HandlerRegistry::default()),
                roster: Mutex::new(RosterCache::default()),
                assured: Mutex::new(assured),
                full_jid: Mutex::new(None),
                roster_fetched: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        client.install_default_handlers();
        (client, events_rx)
    }

    // ── Accessors ────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().unwrap()
    }

    /// The full JID established by resource binding.
    pub fn full_jid(&self) -> Option<Jid> {
        self.inner.full_jid.lock().unwrap().clone()
    }

    /// The advertised Service Discovery feature set.
    pub fn features(&self) -> BTreeSet<String> {
        self.inner.registry.lock().unwrap().features()
    }

    pub fn roster_items(&self) -> Vec<RosterItem> {
        self.inner.roster.lock().unwrap().snapshot()
    }

    /// The recorded `(password_hash, hash_method)` pair after a
    /// successful SCRAM exchange, for callers persisting credentials.
    pub fn password_hash(&self) -> Option<(String, String)> {
        let config = self.config_lock();
        match (&config.password_hash, &config.hash_method) {
            (Some(hash), Some(method)) => Some((hash.clone(), method.clone())),
            _ => None,
        }
    }

    pub(crate) fn config_lock(&self) -> MutexGuard<'_, ClientConfig> {
        self.inner.config.lock().unwrap()
    }

    pub(crate) fn registry_lock(&self) -> MutexGuard<'_, HandlerRegistry> {
        self.inner.registry.lock().unwrap()
    }

    pub(crate) fn roster_lock(&self) -> MutexGuard<'_, RosterCache> {
        self.inner.roster.lock().unwrap()
    }

    pub(crate) fn pending_lock(&self) -> MutexGuard<'_, PendingTable> {
        self.inner.pending.lock().unwrap()
    }

    pub(crate) fn assured_lock(&self) -> MutexGuard<'_, AssuredInventory> {
        self.inner.assured.lock().unwrap()
    }

    pub(crate) fn emit(&self, event: XmppEvent) {
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        {
            let mut current = self.inner.state.lock().unwrap();
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!("connection state: {state}");
        self.emit(XmppEvent::StateChanged(state));
    }

    // ── Handler registration ─────────────────────────────

    pub fn register_iq_get_handler(
        &self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<HandlerId> {
        self.registry_lock()
            .register_iq_get(local, namespace, handler, publish_as_feature)
    }

    pub fn register_iq_set_handler(
        &self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<HandlerId> {
        self.registry_lock()
            .register_iq_set(local, namespace, handler, publish_as_feature)
    }

    pub fn register_message_handler(
        &self,
        local: &str,
        namespace: &str,
        handler: MessageHandler,
        publish_as_feature: bool,
    ) -> Result<HandlerId> {
        self.registry_lock()
            .register_message(local, namespace, handler, publish_as_feature)
    }

    pub fn unregister_iq_get_handler(&self, local: &str, namespace: &str, id: HandlerId) -> bool {
        self.registry_lock().unregister_iq_get(local, namespace, id)
    }

    pub fn unregister_iq_set_handler(&self, local: &str, namespace: &str, id: HandlerId) -> bool {
        self.registry_lock().unregister_iq_set(local, namespace, id)
    }

    pub fn unregister_message_handler(&self, local: &str, namespace: &str, id: HandlerId) -> bool {
        self.registry_lock().unregister_message(local, namespace, id)
    }

    fn install_default_handlers(&self) {
        let mut registry = self.registry_lock();
        registry
            .register_iq_set(
                "query",
                ns::ROSTER,
                Arc::new(crate::roster::handle_roster_push),
                false,
            )
            .expect("fresh registry");
        registry
            .register_iq_get(
                "query",
                ns::DISCO_INFO,
                Arc::new(crate::disco::handle_disco_info),
                true,
            )
            .expect("fresh registry");
        registry
            .register_iq_get(
                "query",
                ns::VERSION,
                Arc::new(crate::version::handle_version_query),
                true,
            )
            .expect("fresh registry");
        registry
            .register_iq_set("acknowledged", ns::QOS, Arc::new(qos::handle_acknowledged), true)
            .expect("fresh registry");
        registry
            .register_iq_set("assured", ns::QOS, Arc::new(qos::handle_assured), true)
            .expect("fresh registry");
        registry
            .register_iq_set("deliver", ns::QOS, Arc::new(qos::handle_deliver), true)
            .expect("fresh registry");
        registry
            .register_message(
                "x",
                ns::DATA_FORMS,
                Arc::new(
                    |client: &Client, message: &MessageStanza, content: &Element| {
                        if let Some(form) = crate::forms::Form::from_element(content) {
                            client.emit(XmppEvent::DynamicFormUpdated {
                                from: message.from.clone(),
                                form,
                            });
                        }
                    },
                ),
                true,
            )
            .expect("fresh registry");
    }

    // ── Outbound plumbing ────────────────────────────────

    pub(crate) fn send_raw_with_callback(
        &self,
        xml: String,
        done: Option<writer::WriteCallback>,
    ) -> Result<()> {
        let writer = self.inner.writer.lock().unwrap().clone();
        let Some(writer) = writer else {
            if let Some(done) = done {
                done(false);
            }
            bail!("not connected");
        };
        writer
            .send(WirePacket { xml, done })
            .map_err(|_| anyhow!("write queue closed"))
    }

    pub(crate) fn send_raw(&self, xml: String) -> Result<()> {
        self.send_raw_with_callback(xml, None)
    }

    /// Escape hatch: submits pre-serialised stanza text to the write
    /// queue.
    pub fn send_stanza(&self, xml: String) -> Result<()> {
        self.send_raw(xml)
    }

    /// Sends a tracked iq request with the configured retry defaults.
    /// The callback fires exactly once: on the response, or with a
    /// synthesised `recipient-unavailable` when retries run out.
    pub fn send_iq(
        &self,
        iq_type: &str,
        to: &str,
        payload: &str,
        callback: IqCallback,
    ) -> Result<u32> {
        let schedule = {
            let config = self.config_lock();
            RetrySchedule::new(
                config.retry_timeout(),
                config.default_nr_retries,
                config.default_drop_off,
                config.max_retry_timeout(),
            )
        };
        self.send_iq_with_retry(iq_type, to, payload, callback, schedule)
    }

    pub fn send_iq_with_retry(
        &self,
        iq_type: &str,
        to: &str,
        payload: &str,
        callback: IqCallback,
        schedule: RetrySchedule,
    ) -> Result<u32> {
        let writer = self.inner.writer.lock().unwrap().clone();
        let Some(writer) = writer else {
            invoke_iq_callback(self, callback, unavailable_response(to, "not connected"));
            bail!("not connected");
        };
        let (seq, xml) = {
            let mut pending = self.pending_lock();
            pending.insert(
                Instant::now(),
                to,
                |seq| build_iq(iq_type, &seq.to_string(), to, payload),
                callback,
                schedule,
            )
        };
        writer
            .send(WirePacket::plain(xml))
            .map_err(|_| anyhow!("write queue closed"))?;
        Ok(seq)
    }

    /// Request/response in one await: sends the iq and gates on a
    /// single-shot channel with the given timeout.
    pub async fn iq_request(
        &self,
        iq_type: &str,
        to: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<IqResponse> {
        let (tx, rx) = oneshot::channel();
        self.send_iq(
            iq_type,
            to,
            payload,
            Box::new(move |_, response| {
                let _ = tx.send(response);
            }),
        )?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => bail!("iq request dropped"),
            Err(_) => bail!("iq request timed out after {timeout:?}"),
        }
    }

    /// Sends an iq-get and returns the result payload, or an error for
    /// iq-error responses and timeouts.
    pub async fn iq_get(
        &self,
        to: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Option<Element>> {
        let response = self.iq_request("get", to, payload, timeout).await?;
        into_payload(response)
    }

    pub async fn iq_set(
        &self,
        to: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Option<Element>> {
        let response = self.iq_request("set", to, payload, timeout).await?;
        into_payload(response)
    }

    /// Builds and sends an iq-result replying to a handled request.
    pub(crate) fn reply_result(&self, request: &IqRequest, payload: Option<&str>) {
        let xml = crate::stanza::build_iq_result(&request.id, request.from.as_deref(), payload);
        if let Err(e) = self.send_raw(xml) {
            warn!("cannot send iq result: {e}");
        }
    }

    // ── Presence and roster operations ───────────────────

    /// Sends available presence with optional show/status.
    pub fn set_presence(&self, show: Option<&str>, status: Option<&str>) -> Result<()> {
        self.send_raw(build_presence_with_status(show, status))
    }

    pub fn subscribe(&self, to: &str) -> Result<()> {
        self.send_raw(build_presence(Some(to), Some("subscribe")))
    }

    pub fn subscribed(&self, to: &str) -> Result<()> {
        self.send_raw(build_presence(Some(to), Some("subscribed")))
    }

    pub fn unsubscribe(&self, to: &str) -> Result<()> {
        self.send_raw(build_presence(Some(to), Some("unsubscribe")))
    }

    pub fn unsubscribed(&self, to: &str) -> Result<()> {
        self.send_raw(build_presence(Some(to), Some("unsubscribed")))
    }

    /// Adds or updates a roster item; the confirming push maintains
    /// the local cache.
    pub async fn roster_set(
        &self,
        jid: &str,
        name: Option<&str>,
        groups: &[String],
        timeout: Duration,
    ) -> Result<()> {
        self.iq_set("", &crate::roster::build_roster_set(jid, name, groups), timeout)
            .await?;
        Ok(())
    }

    pub async fn roster_remove(&self, jid: &str, timeout: Duration) -> Result<()> {
        self.iq_set("", &crate::roster::build_roster_remove(jid), timeout)
            .await?;
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────

    /// Connects and drives the handshake to completion. Returns once
    /// the session tasks are running (resource binding onwards
    /// proceeds through the normal dispatch machinery). Follows
    /// `see-other-host` redirects.
    pub async fn connect(&self) -> Result<()> {
        for _ in 0..=MAX_REDIRECTS {
            match self.connect_once().await? {
                ConnectOutcome::Done => return Ok(()),
                ConnectOutcome::Redirect(host) => {
                    info!("redirected to {host}");
                    self.config_lock().host = host;
                }
            }
        }
        self.set_state(ConnectionState::Error);
        bail!("too many see-other-host redirects");
    }

    async fn connect_once(&self) -> Result<ConnectOutcome> {
        let config = self.config_lock().clone();
        self.set_state(ConnectionState::Connecting);

        let address = (config.host.as_str(), config.port);
        let mut tcp = match TcpStream::connect(address).await {
            Ok(tcp) => tcp,
            Err(e) => {
                return Err(self.fail(ConnectionError::Io(format!(
                    "cannot connect to {}:{}: {e}",
                    config.host, config.port
                ))))
            }
        };
        info!("TCP connected to {}:{}", config.host, config.port);

        let mut proto = Negotiation::new(&config);
        let mut tokenizer = Tokenizer::new();
        let mut header = String::new();

        let initial = proto.start();
        let end = self
            .drive(&mut tcp, &mut proto, &mut tokenizer, &mut header, initial)
            .await?;
        match end {
            DriveEnd::Redirect(host) => Ok(ConnectOutcome::Redirect(host)),
            DriveEnd::Established { leftover } => {
                self.start_session(tcp, proto, tokenizer, header, leftover);
                Ok(ConnectOutcome::Done)
            }
            DriveEnd::NeedTls => {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(config.trust_server)
                    .build()
                    .map_err(|e| self.fail(ConnectionError::Tls(e.to_string())))?;
                let connector = TlsConnector::from(connector);
                let mut tls = connector
                    .connect(config.domain(), tcp)
                    .await
                    .map_err(|e| self.fail(ConnectionError::Tls(e.to_string())))?;
                info!("TLS established with {}", config.domain());

                let initial = proto.on_tls_established();
                let end = self
                    .drive(&mut tls, &mut proto, &mut tokenizer, &mut header, initial)
                    .await?;
                match end {
                    DriveEnd::Redirect(host) => Ok(ConnectOutcome::Redirect(host)),
                    DriveEnd::Established { leftover } => {
                        self.start_session(tls, proto, tokenizer, header, leftover);
                        Ok(ConnectOutcome::Done)
                    }
                    DriveEnd::NeedTls => {
                        Err(self.fail(ConnectionError::Tls("STARTTLS offered twice".into())))
                    }
                }
            }
        }
    }

    /// Executes negotiation steps against the socket until the
    /// handshake needs a TLS upgrade, completes, or fails.
    async fn drive<S>(
        &self,
        stream: &mut S,
        proto: &mut Negotiation,
        tokenizer: &mut Tokenizer,
        header: &mut String,
        initial: Vec<ProtoStep>,
    ) -> Result<DriveEnd>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some(end) = self
            .apply_steps(stream, proto, tokenizer, initial, &mut Vec::new())
            .await?
        {
            return Ok(end);
        }

        let mut buf = vec![0u8; 8192];
        loop {
            let read = tokio::time::timeout(NEGOTIATION_TIMEOUT, stream.read(&mut buf)).await;
            let n = match read {
                Ok(Ok(0)) => {
                    return Err(self.fail(ConnectionError::Io(
                        "connection closed during negotiation".into(),
                    )))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(self.fail(ConnectionError::Io(e.to_string()))),
                Err(_) => {
                    return Err(self.fail(ConnectionError::Timeout(
                        "no answer during negotiation".into(),
                    )))
                }
            };

            let tokens = match tokenizer.push(&buf[..n]) {
                Ok(tokens) => tokens,
                Err(e) => return Err(self.fail(ConnectionError::Parse(e.to_string()))),
            };

            let mut queue = tokens;
            let mut index = 0;
            while index < queue.len() {
                let token = queue[index].clone();
                index += 1;
                let steps = match token {
                    StreamToken::Header(h) => {
                        debug!("XMPP <<< {h}");
                        *header = h.clone();
                        proto.on_stream_header(&h);
                        continue;
                    }
                    StreamToken::Fragment(f) => {
                        debug!("XMPP <<< {f}");
                        let element = match Element::parse_stanza(header, &f) {
                            Ok(element) => element,
                            Err(e) => {
                                return Err(
                                    self.fail(ConnectionError::Parse(e.to_string()))
                                )
                            }
                        };
                        proto.on_element(&element)
                    }
                    StreamToken::End => proto.on_stream_end(),
                };
                let mut leftover = queue.split_off(index);
                if let Some(mut end) = self
                    .apply_steps(stream, proto, tokenizer, steps, &mut leftover)
                    .await?
                {
                    if let DriveEnd::Established {
                        leftover: ref mut left,
                    } = end
                    {
                        *left = leftover;
                    }
                    return Ok(end);
                }
                queue.extend(leftover.drain(..));
            }
        }
    }

    /// Applies proto steps. Returns Some when the drive loop must
    /// stop. A stream restart throws away tokens queued before it.
    async fn apply_steps<S>(
        &self,
        stream: &mut S,
        proto: &mut Negotiation,
        tokenizer: &mut Tokenizer,
        steps: Vec<ProtoStep>,
        queued: &mut Vec<StreamToken>,
    ) -> Result<Option<DriveEnd>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        for step in steps {
            match step {
                ProtoStep::Send(xml) => {
                    debug!("XMPP >>> {xml}");
                    stream
                        .write_all(xml.as_bytes())
                        .await
                        .map_err(|e| self.fail(ConnectionError::Io(e.to_string())))?;
                }
                ProtoStep::SetState(state) => self.set_state(state),
                ProtoStep::StartTls => return Ok(Some(DriveEnd::NeedTls)),
                ProtoStep::RestartStream => {
                    *tokenizer = Tokenizer::new();
                    queued.clear();
                    let preamble = proto.preamble();
                    debug!("XMPP >>> {preamble}");
                    stream
                        .write_all(preamble.as_bytes())
                        .await
                        .map_err(|e| self.fail(ConnectionError::Io(e.to_string())))?;
                }
                ProtoStep::Established => {
                    return Ok(Some(DriveEnd::Established {
                        leftover: Vec::new(),
                    }))
                }
                ProtoStep::Redirect(host) => return Ok(Some(DriveEnd::Redirect(host))),
                ProtoStep::Failed(error) => return Err(self.fail(error)),
                ProtoStep::Event(event) => self.emit(event),
            }
        }
        Ok(None)
    }

    /// Marks the connection failed and returns the error for `?`.
    fn fail(&self, error: ConnectionError) -> anyhow::Error {
        self.teardown(ConnectionState::Error);
        self.emit(XmppEvent::ConnectionError(error.clone()));
        anyhow!(error)
    }

    fn start_session<S>(
        &self,
        stream: S,
        proto: Negotiation,
        tokenizer: Tokenizer,
        header: String,
        leftover: Vec<StreamToken>,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Some((hash, method)) = proto.negotiated_hash() {
            let mut config = self.config_lock();
            config.password_hash = Some(hash);
            config.hash_method = Some(method.to_string());
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.writer.lock().unwrap() = Some(tx);
        self.pending_lock().reset_ping(Instant::now());

        let mut tasks = self.inner.tasks.lock().unwrap();
        tasks.push(tokio::spawn(writer::write_loop(
            write_half,
            rx,
            self.clone(),
        )));
        tasks.push(tokio::spawn(read_loop(
            read_half,
            self.clone(),
            tokenizer,
            header,
            leftover,
        )));
        tasks.push(tokio::spawn(tick_loop(self.clone())));
        drop(tasks);

        self.set_state(ConnectionState::Binding);
        let resource = self.config_lock().resource.clone();
        let result = self.send_iq(
            "set",
            "",
            &build_bind(resource.as_deref()),
            Box::new(bind_done),
        );
        if let Err(e) = result {
            error!("cannot start resource binding: {e}");
        }
    }

    /// Post-bind advance: fetch the roster unless already cached from
    /// a previous session, then announce presence.
    fn advance_to_roster(&self) {
        let wants_roster = self.config_lock().request_roster_on_startup;
        if wants_roster && !self.inner.roster_fetched.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::FetchingRoster);
            let result = self.send_iq(
                "get",
                "",
                &crate::roster::build_roster_get(),
                Box::new(roster_done),
            );
            if let Err(e) = result {
                error!("cannot fetch roster: {e}");
            }
        } else {
            self.advance_to_presence();
        }
    }

    fn advance_to_presence(&self) {
        self.set_state(ConnectionState::SettingPresence);
        let client = self.clone();
        let result = self.send_raw_with_callback(
            build_presence(None, None),
            Some(Box::new(move |ok| {
                if ok {
                    client.set_state(ConnectionState::Connected);
                }
            })),
        );
        if let Err(e) = result {
            error!("cannot send initial presence: {e}");
        }
    }

    /// Soft teardown: emits the stream footer, drains the write queue,
    /// then closes. The client ends Offline and can `reconnect`.
    pub async fn dispose(&self) {
        let writer = self.inner.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let (done_tx, done_rx) = oneshot::channel();
            let _ = writer.send(WirePacket {
                xml: STREAM_FOOTER.to_string(),
                done: Some(Box::new(move |_| {
                    let _ = done_tx.send(());
                })),
            });
            let _ = tokio::time::timeout(Duration::from_secs(5), done_rx).await;
        }
        self.teardown(ConnectionState::Offline);
    }

    /// Abrupt teardown without the stream footer.
    pub fn hard_offline(&self) {
        self.teardown(ConnectionState::Offline);
    }

    /// Reconnects from Offline/Error, reusing the previously
    /// established resource so the roster needs no fresh fetch.
    pub async fn reconnect(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Offline | ConnectionState::Error => self.connect().await,
            state => bail!("cannot reconnect while {state}"),
        }
    }

    fn teardown(&self, state: ConnectionState) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        *self.inner.writer.lock().unwrap() = None;
        self.set_state(state);

        // Resolve whatever was still in flight so every send_iq
        // callback fires exactly once.
        let drained = self.pending_lock().drain();
        for (callback, to) in drained {
            invoke_iq_callback(self, callback, unavailable_response(&to, "connection closed"));
        }
    }

    /// Transport or framing failure: everything stops, the error is
    /// reported, the client ends in the Error state.
    pub(crate) fn connection_failed(&self, error: ConnectionError) {
        match self.state() {
            ConnectionState::Offline | ConnectionState::Error => return,
            _ => {}
        }
        warn!("connection failed: {error}");
        self.teardown(ConnectionState::Error);
        self.emit(XmppEvent::ConnectionError(error));
    }

    /// A `<stream:error/>` during the session. `see-other-host` tears
    /// down and reconnects against the carried host, preserving all
    /// other configuration; everything else is fatal.
    pub(crate) fn on_session_stream_error(&self, element: &Element) {
        let error = StreamError::from_element(element);
        if error.condition == StreamErrorCondition::SeeOtherHost {
            if let Some(host) = error.other_host {
                info!("see-other-host: reconnecting to {host}");
                self.config_lock().host = host;
                let client = self.clone();
                tokio::spawn(async move {
                    client.hard_offline();
                    if let Err(e) = client.connect().await {
                        error!("redirect reconnect failed: {e}");
                    }
                });
                return;
            }
        }
        self.connection_failed(ConnectionError::Stream(error));
    }

    /// The server closed the stream (footer received).
    pub(crate) fn stream_ended(&self) {
        info!("stream closed by server");
        self.teardown(ConnectionState::Offline);
    }
}

fn unavailable_response(to: &str, reason: &str) -> IqResponse {
    IqResponse {
        ok: false,
        payload: None,
        error: Some(
            StanzaError::new(StanzaErrorCondition::RecipientUnavailable).with_text(reason),
        ),
        from: None,
        to: if to.is_empty() {
            None
        } else {
            Some(to.to_string())
        },
    }
}

pub(crate) fn invoke_iq_callback(client: &Client, callback: IqCallback, response: IqResponse) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        callback(client, response)
    }));
    if result.is_err() {
        error!("iq callback panicked");
        client.emit(XmppEvent::Error("iq callback panicked".to_string()));
    }
}

fn bind_done(client: &Client, response: IqResponse) {
    if !response.ok {
        client.connection_failed(ConnectionError::Parse(format!(
            "resource binding failed: {}",
            response
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error".to_string())
        )));
        return;
    }
    let jid = response
        .payload
        .as_ref()
        .filter(|bind| bind.name() == "bind" && bind.ns() == ns::BIND)
        .and_then(|bind| bind.child("jid", ns::BIND))
        .map(|jid| jid.text())
        .and_then(|text| text.parse::<Jid>().ok());
    let Some(jid) = jid else {
        client.connection_failed(ConnectionError::Parse(
            "bind result carries no usable jid".to_string(),
        ));
        return;
    };
    info!("bound as {jid}");
    if let Some(resource) = jid.resource() {
        client.config_lock().resource = Some(resource.to_string());
    }
    *client.inner.full_jid.lock().unwrap() = Some(jid);
    client.advance_to_roster();
}

fn roster_done(client: &Client, response: IqResponse) {
    if response.ok {
        if let Some(query) = response
            .payload
            .as_ref()
            .filter(|q| q.name() == "query" && q.ns() == ns::ROSTER)
        {
            client.roster_lock().replace_all(query);
            client
                .inner
                .roster_fetched
                .store(true, Ordering::SeqCst);
            info!("roster holds {} contact(s)", client.roster_lock().len());
        }
    } else {
        warn!("roster fetch failed, continuing without roster");
    }
    client.advance_to_presence();
}

async fn read_loop<R>(
    mut reader: R,
    client: Client,
    mut tokenizer: Tokenizer,
    header: String,
    leftover: Vec<StreamToken>,
) where
    R: AsyncRead + Unpin,
{
    for token in leftover {
        if !handle_token(&client, &header, token) {
            return;
        }
    }

    let mut buf = vec![0u8; 65536];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                client.connection_failed(ConnectionError::Io(
                    "connection closed by server".to_string(),
                ));
                return;
            }
            Ok(n) => match tokenizer.push(&buf[..n]) {
                Ok(tokens) => {
                    for token in tokens {
                        if !handle_token(&client, &header, token) {
                            return;
                        }
                    }
                }
                Err(e) => {
                    client.connection_failed(ConnectionError::Parse(e.to_string()));
                    return;
                }
            },
            Err(e) => {
                client.connection_failed(ConnectionError::Io(e.to_string()));
                return;
            }
        }
    }
}

/// Returns false when the read loop must stop.
fn handle_token(client: &Client, header: &str, token: StreamToken) -> bool {
    match token {
        StreamToken::Header(h) => {
            warn!("unexpected stream header mid-session: {h}");
            true
        }
        StreamToken::Fragment(fragment) => {
            debug!("XMPP <<< {fragment}");
            match Element::parse_stanza(header, &fragment) {
                Ok(element) => {
                    dispatch::dispatch(client, element);
                    true
                }
                Err(e) => {
                    client.connection_failed(ConnectionError::Parse(e.to_string()));
                    false
                }
            }
        }
        StreamToken::End => {
            client.stream_ended();
            false
        }
    }
}

/// The 1-second tick: retransmits and expires pending requests and
/// keeps the connection alive with whitespace pings.
async fn tick_loop(client: Client) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        match client.state() {
            ConnectionState::Offline | ConnectionState::Error => return,
            _ => {}
        }
        let actions = client.pending_lock().on_tick(Instant::now());
        for action in actions {
            match action {
                TickAction::Retransmit(xml) => {
                    debug!("retransmitting pending request");
                    let _ = client.send_raw(xml);
                }
                TickAction::Expire { callback, to } => {
                    debug!("pending request to {to:?} ran out of retries");
                    invoke_iq_callback(
                        &client,
                        callback,
                        unavailable_response(&to, "no response after retries"),
                    );
                }
                TickAction::Ping => {
                    let _ = client.send_raw(" ".to_string());
                }
            }
        }
    }
}

fn into_payload(response: IqResponse) -> Result<Option<Element>> {
    if response.ok {
        Ok(response.payload)
    } else {
        Err(anyhow!(
            "iq error: {}",
            response
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error condition".to_string())
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    fn client() -> (Client, mpsc::UnboundedReceiver<XmppEvent>) {
        let config: ClientConfig =
            toml::from_str("host = \"example.org\"\nuser = \"me\"\npassword = \"p\"\n").unwrap();
        Client::new(config)
    }

    #[test]
    fn test_state_change_emits_event_once() {
        let (client, mut rx) = client();
        assert_eq!(client.state(), ConnectionState::Offline);
        client.set_state(ConnectionState::Connecting);
        client.set_state(ConnectionState::Connecting);
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let XmppEvent::StateChanged(state) = event {
                seen.push(state);
            }
        }
        assert_eq!(seen, vec![ConnectionState::Connecting]);
    }

    #[test]
    fn test_handle_token_dispatches_fragment() {
        let (client, mut rx) = client();
        let keep_going = handle_token(
            &client,
            HEADER,
            StreamToken::Fragment(
                "<message from='a@b' type='chat'><body>hi</body></message>".to_string(),
            ),
        );
        assert!(keep_going);
        let mut chat = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, XmppEvent::ChatMessage(_)) {
                chat += 1;
            }
        }
        assert_eq!(chat, 1);
    }

    #[test]
    fn test_stream_end_token_goes_offline() {
        let (client, _rx) = client();
        client.set_state(ConnectionState::Connected);
        let keep_going = handle_token(&client, HEADER, StreamToken::End);
        assert!(!keep_going);
        assert_eq!(client.state(), ConnectionState::Offline);
    }

    #[test]
    fn test_send_iq_offline_fails_callback_exactly_once() {
        let (client, _rx) = client();
        let fired = Arc::new(AtomicUsize::new(0));
        let count = fired.clone();
        let result = client.send_iq(
            "get",
            "peer@x",
            "<ping xmlns='urn:xmpp:ping'/>",
            Box::new(move |_, response| {
                assert!(!response.ok);
                assert!(response.error.is_some());
                count.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert!(result.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(client.pending_lock().is_empty());
    }

    #[test]
    fn test_reconnect_refused_while_connected() {
        let (client, _rx) = client();
        client.set_state(ConnectionState::Connected);
        let error = futures::executor::block_on(client.reconnect()).unwrap_err();
        assert!(error.to_string().contains("cannot reconnect"));
    }

    #[test]
    fn test_unavailable_response_shape() {
        let response = unavailable_response("peer@x", "gone");
        assert!(!response.ok);
        assert_eq!(response.to.as_deref(), Some("peer@x"));
        assert_eq!(
            response.error.unwrap().condition,
            StanzaErrorCondition::RecipientUnavailable
        );
        assert_eq!(unavailable_response("", "gone").to, None);
    }
}
