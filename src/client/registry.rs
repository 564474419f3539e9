/// Handler registry.
///
/// Inbound iq-get, iq-set and message payloads are dispatched by the
/// `(local-name, namespace)` of the first registered child element.
/// Registrations may publish their namespace as a Service Discovery
/// feature; the advertised set is always the union of the core
/// defaults and the opted-in registrations.
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{bail, Result};

use crate::error::StanzaError;
use crate::ns;
use crate::stanza::MessageStanza;
use crate::xml::Element;

use super::Client;

/// Opaque registration handle; unregistration requires it, so one
/// registrant cannot remove another's handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// An inbound iq-get or iq-set, as seen by a handler.
#[derive(Debug, Clone)]
pub struct IqRequest {
    pub id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// The child element whose dispatch key matched.
    pub payload: Element,
}

/// What the dispatcher should do after a handler returns.
pub enum IqHandlerOutcome {
    /// Send `<iq type='result'>` with this payload (None for empty).
    Reply(Option<String>),
    /// The handler already produced its own reply.
    Handled,
}

pub type IqHandler =
    Arc<dyn Fn(&Client, &IqRequest) -> Result<IqHandlerOutcome, StanzaError> + Send + Sync>;

/// Message handlers receive the parsed message plus the matched child
/// (its "content" element).
pub type MessageHandler = Arc<dyn Fn(&Client, &MessageStanza, &Element) + Send + Sync>;

struct IqRegistration {
    id: HandlerId,
    handler: IqHandler,
    feature: Option<String>,
}

struct MessageRegistration {
    id: HandlerId,
    handler: MessageHandler,
    feature: Option<String>,
}

/// Features advertised even with no opted-in handlers.
const CORE_FEATURES: [&str; 1] = [ns::DISCO_INFO];

#[derive(Default)]
pub struct HandlerRegistry {
    iq_get: HashMap<String, IqRegistration>,
    iq_set: HashMap<String, IqRegistration>,
    message: HashMap<String, MessageRegistration>,
    next_id: u64,
}

fn key(local: &str, namespace: &str) -> String {
    format!("{local} {namespace}")
}

impl HandlerRegistry {
    fn allocate(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }

    pub fn register_iq_get(
        &mut self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<HandlerId> {
        let key = key(local, namespace);
        if self.iq_get.contains_key(&key) {
            bail!("iq-get handler already registered for {key}");
        }
        let id = self.allocate();
        self.iq_get.insert(
            key,
            IqRegistration {
                id,
                handler,
                feature: publish_as_feature.then(|| namespace.to_string()),
            },
        );
        Ok(id)
    }

    pub fn register_iq_set(
        &mut self,
        local: &str,
        namespace: &str,
        handler: IqHandler,
        publish_as_feature: bool,
    ) -> Result<HandlerId> {
        let key = key(local, namespace);
        if self.iq_set.contains_key(&key) {
            bail!("iq-set handler already registered for {key}");
        }
        let id = self.allocate();
        self.iq_set.insert(
            key,
            IqRegistration {
                id,
                handler,
                feature: publish_as_feature.then(|| namespace.to_string()),
            },
        );
        Ok(id)
    }

    pub fn register_message(
        &mut self,
        local: &str,
        namespace: &str,
        handler: MessageHandler,
        publish_as_feature: bool,
    ) -> Result<HandlerId> {
        let key = key(local, namespace);
        if self.message.contains_key(&key) {
            bail!("message handler already registered for {key}");
        }
        let id = self.allocate();
        self.message.insert(
            key,
            MessageRegistration {
                id,
                handler,
                feature: publish_as_feature.then(|| namespace.to_string()),
            },
        );
        Ok(id)
    }

    /// Removes a registration. The id must match the one returned at
    /// registration time.
    pub fn unregister_iq_get(&mut self, local: &str, namespace: &str, id: HandlerId) -> bool {
        let key = key(local, namespace);
        match self.iq_get.get(&key) {
            Some(registration) if registration.id == id => {
                self.iq_get.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn unregister_iq_set(&mut self, local: &str, namespace: &str, id: HandlerId) -> bool {
        let key = key(local, namespace);
        match self.iq_set.get(&key) {
            Some(registration) if registration.id == id => {
                self.iq_set.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn unregister_message(&mut self, local: &str, namespace: &str, id: HandlerId) -> bool {
        let key = key(local, namespace);
        match self.message.get(&key) {
            Some(registration) if registration.id == id => {
                self.message.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn find_iq(&self, is_get: bool, dispatch_key: &str) -> Option<IqHandler> {
        let map = if is_get { &self.iq_get } else { &self.iq_set };
        map.get(dispatch_key).map(|r| r.handler.clone())
    }

    pub fn find_message(&self, dispatch_key: &str) -> Option<MessageHandler> {
        self.message.get(dispatch_key).map(|r| r.handler.clone())
    }

    /// The advertised feature set: core defaults plus every namespace
    /// a registration opted in with.
    pub fn features(&self) -> BTreeSet<String> {
        let mut features: BTreeSet<String> =
            CORE_FEATURES.iter().map(|f| f.to_string()).collect();
        features.extend(
            self.iq_get
                .values()
                .filter_map(|r| r.feature.clone()),
        );
        features.extend(
            self.iq_set
                .values()
                .filter_map(|r| r.feature.clone()),
        );
        features.extend(
            self.message
                .values()
                .filter_map(|r| r.feature.clone()),
        );
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_iq() -> IqHandler {
        Arc::new(|_, _| Ok(IqHandlerOutcome::Reply(None)))
    }

    #[test]
    fn test_register_and_find() {
        let mut registry = HandlerRegistry::default();
        registry
            .register_iq_get("ping", "urn:xmpp:ping", noop_iq(), false)
            .unwrap();
        assert!(registry.find_iq(true, "ping urn:xmpp:ping").is_some());
        assert!(registry.find_iq(false, "ping urn:xmpp:ping").is_none());
        assert!(registry.find_iq(true, "ping other").is_none());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::default();
        registry
            .register_iq_set("query", "jabber:iq:roster", noop_iq(), false)
            .unwrap();
        assert!(registry
            .register_iq_set("query", "jabber:iq:roster", noop_iq(), false)
            .is_err());
    }

    #[test]
    fn test_unregister_requires_matching_id() {
        let mut registry = HandlerRegistry::default();
        let id = registry
            .register_iq_get("a", "ns:a", noop_iq(), false)
            .unwrap();
        let other = registry
            .register_iq_get("b", "ns:b", noop_iq(), false)
            .unwrap();
        assert!(!registry.unregister_iq_get("a", "ns:a", other));
        assert!(registry.find_iq(true, "a ns:a").is_some());
        assert!(registry.unregister_iq_get("a", "ns:a", id));
        assert!(registry.find_iq(true, "a ns:a").is_none());
    }

    #[test]
    fn test_feature_set_tracks_opt_ins() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.features().contains(ns::DISCO_INFO));

        registry
            .register_iq_get("query", "jabber:iq:version", noop_iq(), true)
            .unwrap();
        registry
            .register_iq_set("acknowledged", "urn:xmpp:qos", noop_iq(), true)
            .unwrap();
        registry
            .register_iq_set("assured", "urn:xmpp:qos", noop_iq(), true)
            .unwrap();
        registry
            .register_iq_set("query", "jabber:iq:roster", noop_iq(), false)
            .unwrap();

        let features = registry.features();
        assert!(features.contains("jabber:iq:version"));
        assert!(features.contains("urn:xmpp:qos"));
        // Two QoS registrations, one feature entry.
        assert_eq!(features.iter().filter(|f| *f == "urn:xmpp:qos").count(), 1);
        assert!(!features.contains("jabber:iq:roster"));
    }

    #[test]
    fn test_id_reuse_after_unregister_finds_new_handler() {
        let mut registry = HandlerRegistry::default();
        let id = registry
            .register_message("x", "jabber:x:data", Arc::new(|_, _, _| {}), true)
            .unwrap();
        assert!(registry.unregister_message("x", "jabber:x:data", id));
        assert!(!registry.features().contains("jabber:x:data"));
        registry
            .register_message("x", "jabber:x:data", Arc::new(|_, _, _| {}), false)
            .unwrap();
        assert!(registry.find_message("x jabber:x:data").is_some());
    }
}
