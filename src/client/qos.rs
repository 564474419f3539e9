/// Three-level message delivery QoS (`urn:xmpp:qos`).
///
/// Unacknowledged delivery is a plain `<message/>` whose completion
/// fires on write completion. Acknowledged delivery wraps the message
/// in a `<qos:acknowledged/>` iq-set and completes on the iq result.
/// Assured delivery adds a receive/deliver two-phase exchange keyed by
/// a random `msgId`, with per-source and global admission control on
/// the receiving side.
use std::collections::HashMap;

use anyhow::Result;
use rand::Rng;
use tracing::debug;

use crate::error::{StanzaError, StanzaErrorCondition};
use crate::jid::bare_of;
use crate::ns;
use crate::retry::RetrySchedule;
use crate::stanza::escape;
use crate::xml::Element;

use super::dispatch;
use super::registry::{IqHandlerOutcome, IqRequest};
use super::Client;

/// Fires once with the delivery outcome.
pub type DeliveryCallback = Box<dyn FnOnce(bool) + Send + 'static>;

/// Acknowledged/assured requests retry for as long as it takes: 2 s
/// initial, doubling, capped at an hour.
fn qos_retry_schedule() -> RetrySchedule {
    RetrySchedule::new(
        std::time::Duration::from_secs(2),
        u32::MAX,
        true,
        Some(std::time::Duration::from_secs(3600)),
    )
}

fn fresh_msg_id() -> String {
    hex::encode(rand::thread_rng().gen::<[u8; 16]>())
}

/// The inner message wrapped by a QoS element, with an explicit
/// namespace so it survives re-parsing outside the stream context.
fn build_inner_message(to: &str, body: &str) -> String {
    format!(
        "<message xmlns='{}' to='{}' type='chat'><body>{}</body></message>",
        ns::CLIENT,
        escape(to),
        escape(body)
    )
}

/// Senders that wrap without re-declaring leave the inner message in
/// the QoS namespace; give it (and its subtree) back to the client
/// vocabulary before local dispatch.
fn adopt_client_namespace(element: &Element) -> Element {
    let mut adopted = element.clone();
    adopt_in_place(&mut adopted);
    adopted
}

fn adopt_in_place(element: &mut Element) {
    if element.ns() == ns::QOS {
        element.set_ns(ns::CLIENT);
    }
    for child in element.child_elements_mut() {
        adopt_in_place(child);
    }
}

// ── Outbound ─────────────────────────────────────────────

impl Client {
    /// Unacknowledged delivery: fire and forget. The callback reports
    /// write completion only.
    pub fn send_message(
        &self,
        to: &str,
        body: &str,
        done: Option<DeliveryCallback>,
    ) -> Result<()> {
        let xml = crate::stanza::build_message(to, None, body);
        self.send_raw_with_callback(xml, done)
    }

    /// Acknowledged delivery: completes when the receiving client
    /// confirms the iq-set, or with `false` when retries run out.
    pub fn send_message_acknowledged(
        &self,
        to: &str,
        body: &str,
        done: DeliveryCallback,
    ) -> Result<u32> {
        let payload = format!(
            "<acknowledged xmlns='{}'>{}</acknowledged>",
            ns::QOS,
            build_inner_message(to, body)
        );
        self.send_iq_with_retry(
            "set",
            to,
            &payload,
            Box::new(move |_, response| done(response.ok)),
            qos_retry_schedule(),
        )
    }

    /// Assured delivery: the peer first confirms receipt of the
    /// message under a fresh `msgId`, then a `<deliver/>` commits it.
    /// The callback completes on the deliver result.
    pub fn send_message_assured(
        &self,
        to: &str,
        body: &str,
        done: DeliveryCallback,
    ) -> Result<u32> {
        let msg_id = fresh_msg_id();
        let payload = format!(
            "<assured xmlns='{}' msgId='{}'>{}</assured>",
            ns::QOS,
            msg_id,
            build_inner_message(to, body)
        );
        let destination = to.to_string();
        self.send_iq_with_retry(
            "set",
            to,
            &payload,
            Box::new(move |client, response| {
                let received = response.ok
                    && response
                        .payload
                        .as_ref()
                        .map(|el| {
                            el.name() == "received"
                                && el.ns() == ns::QOS
                                && el.attr("msgId") == Some(msg_id.as_str())
                        })
                        .unwrap_or(false);
                if !received {
                    done(false);
                    return;
                }
                let deliver =
                    format!("<deliver xmlns='{}' msgId='{}'/>", ns::QOS, msg_id);
                // On a dead connection the callback fires immediately
                // with the synthesised failure.
                let _ = client.send_iq_with_retry(
                    "set",
                    &destination,
                    &deliver,
                    Box::new(move |_, response| done(response.ok)),
                    qos_retry_schedule(),
                );
            }),
            qos_retry_schedule(),
        )
    }
}

// ── Inbound ──────────────────────────────────────────────

/// `<qos:acknowledged/>` iq-set: confirm first, then hand the inner
/// message to the local dispatch.
pub(crate) fn handle_acknowledged(
    client: &Client,
    request: &IqRequest,
) -> Result<IqHandlerOutcome, StanzaError> {
    let Some(message) = request.payload.child_named("message") else {
        return Err(StanzaError::new(StanzaErrorCondition::BadRequest));
    };
    client.reply_result(request, None);
    dispatch::dispatch_message(client, adopt_client_namespace(message));
    Ok(IqHandlerOutcome::Handled)
}

/// `<qos:assured/>` iq-set: admission control, then confirm receipt
/// with a matching `<received/>` and park the message until
/// `<deliver/>`.
pub(crate) fn handle_assured(
    client: &Client,
    request: &IqRequest,
) -> Result<IqHandlerOutcome, StanzaError> {
    let Some(msg_id) = request.payload.attr("msgId") else {
        return Err(StanzaError::new(StanzaErrorCondition::BadRequest));
    };
    let Some(from) = request.from.as_deref() else {
        return Err(StanzaError::new(StanzaErrorCondition::BadRequest));
    };
    let Some(message) = request.payload.child_named("message") else {
        return Err(StanzaError::new(StanzaErrorCondition::BadRequest));
    };

    let bare = bare_of(from).to_string();
    let in_roster = client.roster_lock().contains(&bare);
    client.assured_lock().admit(
        &bare,
        msg_id,
        adopt_client_namespace(message),
        in_roster,
    )?;
    debug!("assured message {msg_id} from {bare} parked");
    Ok(IqHandlerOutcome::Reply(Some(format!(
        "<received xmlns='{}' msgId='{}'/>",
        ns::QOS,
        escape(msg_id)
    ))))
}

/// `<qos:deliver/>` iq-set: pop the parked message, confirm, then
/// dispatch it exactly once.
pub(crate) fn handle_deliver(
    client: &Client,
    request: &IqRequest,
) -> Result<IqHandlerOutcome, StanzaError> {
    let Some(msg_id) = request.payload.attr("msgId") else {
        return Err(StanzaError::new(StanzaErrorCondition::BadRequest));
    };
    let Some(from) = request.from.as_deref() else {
        return Err(StanzaError::new(StanzaErrorCondition::BadRequest));
    };
    let bare = bare_of(from);
    let Some(message) = client.assured_lock().take(bare, msg_id) else {
        return Err(StanzaError::new(StanzaErrorCondition::ItemNotFound));
    };
    client.reply_result(request, None);
    dispatch::dispatch_message(client, message);
    Ok(IqHandlerOutcome::Handled)
}

// ── Assured inventory ────────────────────────────────────

/// Messages awaiting `<deliver/>`, keyed by `(sender bare JID,
/// msgId)`. The per-source and global counters always equal the
/// stored cardinality.
pub struct AssuredInventory {
    pending: HashMap<(String, String), Element>,
    per_source: HashMap<String, usize>,
    max_per_source: usize,
    max_total: usize,
}

impl AssuredInventory {
    pub fn new(max_per_source: usize, max_total: usize) -> Self {
        Self {
            pending: HashMap::new(),
            per_source: HashMap::new(),
            max_per_source,
            max_total,
        }
    }

    /// Admission: the sender must be in the roster and neither its
    /// per-source slot nor the global inventory may be full. A
    /// rejected message leaves the inventory untouched.
    pub fn admit(
        &mut self,
        bare_from: &str,
        msg_id: &str,
        message: Element,
        sender_in_roster: bool,
    ) -> Result<(), StanzaError> {
        if !sender_in_roster {
            return Err(StanzaError::new(StanzaErrorCondition::NotAllowed));
        }
        let key = (bare_from.to_string(), msg_id.to_string());
        if self.pending.contains_key(&key) {
            // Retransmitted assured wrapper: already parked.
            return Ok(());
        }
        let source_count = self.per_source.get(bare_from).copied().unwrap_or(0);
        if source_count >= self.max_per_source {
            return Err(StanzaError::new(StanzaErrorCondition::ResourceConstraint));
        }
        if self.pending.len() >= self.max_total {
            return Err(StanzaError::new(StanzaErrorCondition::ResourceConstraint));
        }
        self.pending.insert(key, message);
        *self.per_source.entry(bare_from.to_string()).or_insert(0) += 1;
        Ok(())
    }

    pub fn take(&mut self, bare_from: &str, msg_id: &str) -> Option<Element> {
        let key = (bare_from.to_string(), msg_id.to_string());
        let message = self.pending.remove(&key)?;
        if let Some(count) = self.per_source.get_mut(bare_from) {
            *count -= 1;
            if *count == 0 {
                self.per_source.remove(bare_from);
            }
        }
        Some(message)
    }

    pub fn total_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_from(&self, bare_from: &str) -> usize {
        self.per_source.get(bare_from).copied().unwrap_or(0)
    }
}
