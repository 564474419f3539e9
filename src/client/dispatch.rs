/// Stanza routing.
///
/// Inbound iq-get/iq-set go to the handler registry keyed by the first
/// registered child element; iq-result/iq-error resolve the pending
/// table; messages and presence fan out to handlers or the general
/// events. Handlers run after the registry lock is released, and a
/// panicking handler is logged without taking the connection down.
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::{debug, error, warn};

use crate::error::{StanzaError, StanzaErrorCondition};
use crate::ns;
use crate::stanza::{build_iq_error, MessageStanza, MessageType, PresenceStanza, PresenceType};
use crate::xml::Element;

use super::pending::IqResponse;
use super::registry::{IqHandlerOutcome, IqRequest};
use super::{invoke_iq_callback, Client, XmppEvent};

pub(crate) fn dispatch(client: &Client, element: Element) {
    match (element.name(), element.ns()) {
        ("iq", ns::CLIENT) => dispatch_iq(client, element),
        ("message", ns::CLIENT) => dispatch_message(client, element),
        ("presence", ns::CLIENT) => dispatch_presence(client, element),
        ("error", ns::STREAMS) => client.on_session_stream_error(&element),
        (name, namespace) => warn!("ignoring top-level {name} ({namespace})"),
    }
}

fn dispatch_iq(client: &Client, element: Element) {
    let iq_type = element.attr("type").unwrap_or("").to_string();
    match iq_type.as_str() {
        "get" | "set" => dispatch_iq_request(client, element, iq_type == "get"),
        "result" | "error" => dispatch_iq_response(client, element, iq_type == "result"),
        other => warn!("iq with unsupported type {other:?}"),
    }
}

fn dispatch_iq_request(client: &Client, element: Element, is_get: bool) {
    let id = element.attr("id").unwrap_or("").to_string();
    let from = element.attr("from").map(str::to_string);
    let to = element.attr("to").map(str::to_string);

    // Find the first child whose dispatch key is registered; clone the
    // handler out so no lock is held while it runs.
    let matched = {
        let registry = client.registry_lock();
        element.child_elements().find_map(|child| {
            registry
                .find_iq(is_get, &child.key())
                .map(|handler| (handler, child.clone()))
        })
    };

    let Some((handler, payload)) = matched else {
        let error = StanzaError::new(StanzaErrorCondition::FeatureNotImplemented);
        let _ = client.send_raw(build_iq_error(&id, from.as_deref(), &error));
        return;
    };

    let request = IqRequest {
        id: id.clone(),
        from: from.clone(),
        to,
        payload,
    };
    match catch_unwind(AssertUnwindSafe(|| handler(client, &request))) {
        Ok(Ok(IqHandlerOutcome::Reply(payload))) => {
            client.reply_result(&request, payload.as_deref());
        }
        Ok(Ok(IqHandlerOutcome::Handled)) => {}
        Ok(Err(stanza_error)) => {
            let _ = client.send_raw(build_iq_error(&id, from.as_deref(), &stanza_error));
        }
        Err(_) => {
            error!("iq handler panicked");
            client.emit(XmppEvent::Error("iq handler panicked".to_string()));
            let error = StanzaError::new(StanzaErrorCondition::InternalServerError);
            let _ = client.send_raw(build_iq_error(&id, from.as_deref(), &error));
        }
    }
}

fn dispatch_iq_response(client: &Client, element: Element, ok: bool) {
    let Some(seq) = element.attr("id").and_then(|id| id.parse::<u32>().ok()) else {
        debug!("ignoring iq response with non-numeric id");
        return;
    };
    let Some((callback, to)) = client.pending_lock().take(seq) else {
        debug!("ignoring late or spurious iq response {seq}");
        return;
    };
    let error = element
        .child("error", ns::CLIENT)
        .map(StanzaError::from_element);
    let payload = element
        .child_elements()
        .find(|child| child.name() != "error")
        .cloned();
    let response = IqResponse {
        ok,
        payload,
        error,
        from: element.attr("from").map(str::to_string),
        to: Some(to),
    };
    invoke_iq_callback(client, callback, response);
}

pub(crate) fn dispatch_message(client: &Client, element: Element) {
    let matched = {
        let registry = client.registry_lock();
        element.child_elements().find_map(|child| {
            registry
                .find_message(&child.key())
                .map(|handler| (handler, child.clone()))
        })
    };

    let message = MessageStanza::from_element(element);
    if let Some((handler, content)) = matched {
        if catch_unwind(AssertUnwindSafe(|| handler(client, &message, &content))).is_err() {
            error!("message handler panicked");
            client.emit(XmppEvent::Error("message handler panicked".to_string()));
        }
        return;
    }

    let event = match message.message_type {
        MessageType::Chat => XmppEvent::ChatMessage(message),
        MessageType::GroupChat => XmppEvent::GroupChatMessage(message),
        MessageType::Headline => XmppEvent::HeadlineMessage(message),
        MessageType::Normal => XmppEvent::NormalMessage(message),
        MessageType::Error => XmppEvent::ErrorMessage(message),
    };
    client.emit(event);
}

fn dispatch_presence(client: &Client, element: Element) {
    let presence = PresenceStanza::from_element(element);
    let from = presence.from.clone().unwrap_or_default();
    match presence.presence_type {
        PresenceType::Available | PresenceType::Unavailable => {
            client.roster_lock().update_presence(&presence);
            client.emit(XmppEvent::Presence(presence));
        }
        PresenceType::Subscribe => client.emit(XmppEvent::SubscriptionRequest(from)),
        PresenceType::Subscribed => client.emit(XmppEvent::Subscribed(from)),
        PresenceType::Unsubscribe => client.emit(XmppEvent::UnsubscribeRequest(from)),
        PresenceType::Unsubscribed => client.emit(XmppEvent::Unsubscribed(from)),
        PresenceType::Probe => client.emit(XmppEvent::PresenceProbe(presence)),
        PresenceType::Error => client.emit(XmppEvent::PresenceError(presence)),
    }
}
