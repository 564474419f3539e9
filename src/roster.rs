/// Roster management (RFC 6121) and the per-contact presence cache.
use std::collections::HashMap;

use crate::client::{Client, IqHandlerOutcome, IqRequest, XmppEvent};
use crate::error::{StanzaError, StanzaErrorCondition};
use crate::jid::bare_of;
use crate::ns;
use crate::stanza::{escape, PresenceStanza, PresenceType};
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("to") => Self::To,
            Some("from") => Self::From,
            Some("both") => Self::Both,
            Some("remove") => Self::Remove,
            _ => Self::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RosterItem {
    /// Bare JID of the contact.
    pub jid: String,
    pub name: Option<String>,
    pub groups: Vec<String>,
    pub subscription: Subscription,
    /// An outbound subscription request is awaiting approval
    /// (`ask='subscribe'`).
    pub pending_subscription: bool,
    /// Latest available presence seen from this contact.
    pub last_presence: Option<PresenceStanza>,
}

impl RosterItem {
    pub fn from_element(item: &Element) -> Option<Self> {
        let jid = item.attr("jid")?.to_string();
        let groups = item
            .child_elements()
            .filter(|e| e.name() == "group")
            .map(|e| e.text())
            .collect();
        Some(Self {
            jid,
            name: item.attr("name").map(str::to_string),
            groups,
            subscription: Subscription::from_attr(item.attr("subscription")),
            pending_subscription: item.attr("ask") == Some("subscribe"),
            last_presence: None,
        })
    }
}

/// What a roster push did to the cache.
#[derive(Debug, Clone)]
pub enum RosterChange {
    Added(RosterItem),
    Updated(RosterItem),
    Removed(String),
}

/// Client-side copy of the server roster, keyed by bare JID.
#[derive(Default)]
pub struct RosterCache {
    items: HashMap<String, RosterItem>,
}

impl RosterCache {
    /// Installs the result of a full roster fetch.
    pub fn replace_all(&mut self, query: &Element) {
        self.items.clear();
        for item in query.child_elements().filter(|e| e.name() == "item") {
            if let Some(item) = RosterItem::from_element(item) {
                self.items.insert(item.jid.clone(), item);
            }
        }
    }

    pub fn contains(&self, bare_jid: &str) -> bool {
        self.items.contains_key(bare_jid)
    }

    pub fn get(&self, bare_jid: &str) -> Option<&RosterItem> {
        self.items.get(bare_jid)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> Vec<RosterItem> {
        self.items.values().cloned().collect()
    }

    /// Applies one `<item/>` of a roster push.
    pub fn apply_push(&mut self, item: &Element) -> Option<RosterChange> {
        let parsed = RosterItem::from_element(item)?;
        if parsed.subscription == Subscription::Remove {
            return self
                .items
                .remove(&parsed.jid)
                .map(|removed| RosterChange::Removed(removed.jid));
        }
        match self.items.get_mut(&parsed.jid) {
            Some(existing) => {
                // The presence cache survives metadata updates.
                let last_presence = existing.last_presence.take();
                let mut updated = parsed;
                updated.last_presence = last_presence;
                *existing = updated.clone();
                Some(RosterChange::Updated(updated))
            }
            None => {
                self.items.insert(parsed.jid.clone(), parsed.clone());
                Some(RosterChange::Added(parsed))
            }
        }
    }

    /// Updates the presence cache from an inbound available or
    /// unavailable presence. Returns true when a roster slot changed.
    pub fn update_presence(&mut self, presence: &PresenceStanza) -> bool {
        let Some(from) = presence.from.as_deref() else {
            return false;
        };
        let Some(item) = self.items.get_mut(bare_of(from)) else {
            return false;
        };
        match presence.presence_type {
            PresenceType::Available => {
                item.last_presence = Some(presence.clone());
                true
            }
            PresenceType::Unavailable => {
                // Only the resource we cached going away clears the slot.
                let cached_from = item
                    .last_presence
                    .as_ref()
                    .and_then(|p| p.from.as_deref());
                if cached_from == Some(from) {
                    item.last_presence = None;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

/// Default iq-set handler for roster pushes. Only the own server may
/// push (an absent `from`, the bare account address, or the domain);
/// anything else is answered `not-allowed`. Each accepted item
/// updates the cache and raises the matching roster event, then an
/// empty iq-result confirms the push.
pub(crate) fn handle_roster_push(
    client: &Client,
    request: &IqRequest,
) -> Result<IqHandlerOutcome, StanzaError> {
    if let Some(from) = request.from.as_deref() {
        let (bare, domain) = {
            let config = client.config_lock();
            (config.bare_jid(), config.domain().to_string())
        };
        if bare_of(from) != bare && from != domain {
            return Err(StanzaError::new(StanzaErrorCondition::NotAllowed));
        }
    }
    let changes: Vec<RosterChange> = {
        let mut roster = client.roster_lock();
        request
            .payload
            .child_elements()
            .filter(|child| child.name() == "item")
            .filter_map(|item| roster.apply_push(item))
            .collect()
    };
    for change in changes {
        let event = match change {
            RosterChange::Added(item) => XmppEvent::RosterItemAdded(item),
            RosterChange::Updated(item) => XmppEvent::RosterItemUpdated(item),
            RosterChange::Removed(jid) => XmppEvent::RosterItemRemoved(jid),
        };
        client.emit(event);
    }
    Ok(IqHandlerOutcome::Reply(None))
}

// ── Wire builders ────────────────────────────────────────

pub fn build_roster_get() -> String {
    format!("<query xmlns='{}'/>", ns::ROSTER)
}

pub fn build_roster_set(jid: &str, name: Option<&str>, groups: &[String]) -> String {
    let name_attr = name
        .map(|n| format!(" name='{}'", escape(n)))
        .unwrap_or_default();
    let mut groups_xml = String::new();
    for group in groups {
        groups_xml.push_str(&format!("<group>{}</group>", escape(group)));
    }
    if groups_xml.is_empty() {
        format!(
            "<query xmlns='{}'><item jid='{}'{name_attr}/></query>",
            ns::ROSTER,
            escape(jid)
        )
    } else {
        format!(
            "<query xmlns='{}'><item jid='{}'{name_attr}>{groups_xml}</item></query>",
            ns::ROSTER,
            escape(jid)
        )
    }
}

pub fn build_roster_remove(jid: &str) -> String {
    format!(
        "<query xmlns='{}'><item jid='{}' subscription='remove'/></query>",
        ns::ROSTER,
        escape(jid)
    )
}
