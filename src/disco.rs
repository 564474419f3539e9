/// Service Discovery (XEP-0030).
///
/// Query side for disco#info and disco#items, plus the default
/// disco#info responder advertising the registry's feature set.
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::client::{Client, IqHandlerOutcome, IqRequest};
use crate::error::StanzaError;
use crate::ns;
use crate::stanza::escape;
use crate::xml::Element;

#[derive(Debug, Clone)]
pub struct DiscoIdentity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscoInfo {
    pub identities: Vec<DiscoIdentity>,
    pub features: Vec<String>,
}

impl DiscoInfo {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    fn from_query(query: &Element) -> Self {
        let identities = query
            .child_elements()
            .filter(|e| e.name() == "identity")
            .map(|identity| DiscoIdentity {
                category: identity.attr("category").unwrap_or("").to_string(),
                kind: identity.attr("type").unwrap_or("").to_string(),
                name: identity.attr("name").map(str::to_string),
            })
            .collect();
        let features = query
            .child_elements()
            .filter(|e| e.name() == "feature")
            .filter_map(|feature| feature.attr("var").map(str::to_string))
            .collect();
        Self {
            identities,
            features,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscoItem {
    pub jid: String,
    pub node: Option<String>,
    pub name: Option<String>,
}

fn query_payload(namespace: &str, node: Option<&str>) -> String {
    match node {
        Some(node) => format!("<query xmlns='{namespace}' node='{}'/>", escape(node)),
        None => format!("<query xmlns='{namespace}'/>"),
    }
}

impl Client {
    /// Asks a peer what it is and which features it implements.
    pub async fn disco_info(
        &self,
        to: &str,
        node: Option<&str>,
        timeout: Duration,
    ) -> Result<DiscoInfo> {
        let response = self
            .iq_get(to, &query_payload(ns::DISCO_INFO, node), timeout)
            .await?
            .ok_or_else(|| anyhow!("empty disco#info result"))?;
        if response.name() != "query" || response.ns() != ns::DISCO_INFO {
            return Err(anyhow!("unexpected disco#info payload"));
        }
        Ok(DiscoInfo::from_query(&response))
    }

    /// Asks a peer which items it hosts.
    pub async fn disco_items(
        &self,
        to: &str,
        node: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<DiscoItem>> {
        let response = self
            .iq_get(to, &query_payload(ns::DISCO_ITEMS, node), timeout)
            .await?
            .ok_or_else(|| anyhow!("empty disco#items result"))?;
        if response.name() != "query" || response.ns() != ns::DISCO_ITEMS {
            return Err(anyhow!("unexpected disco#items payload"));
        }
        Ok(response
            .child_elements()
            .filter(|e| e.name() == "item")
            .filter_map(|item| {
                item.attr("jid").map(|jid| DiscoItem {
                    jid: jid.to_string(),
                    node: item.attr("node").map(str::to_string),
                    name: item.attr("name").map(str::to_string),
                })
            })
            .collect())
    }
}

/// Default iq-get responder for disco#info: one client identity plus
/// the current feature set.
pub(crate) fn handle_disco_info(
    client: &Client,
    request: &IqRequest,
) -> Result<IqHandlerOutcome, StanzaError> {
    let node_attr = request
        .payload
        .attr("node")
        .map(|node| format!(" node='{}'", escape(node)))
        .unwrap_or_default();
    let mut xml = format!("<query xmlns='{}'{node_attr}>", ns::DISCO_INFO);
    xml.push_str(&format!(
        "<identity category='client' type='pc' name='{}'/>",
        crate::version::CLIENT_NAME
    ));
    for feature in client.features() {
        xml.push_str(&format!("<feature var='{}'/>", escape(&feature)));
    }
    xml.push_str("</query>");
    Ok(IqHandlerOutcome::Reply(Some(xml)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    #[test]
    fn test_parse_disco_info() {
        let iq = Element::parse_stanza(
            HEADER,
            "<iq type='result' id='1'>\
             <query xmlns='http://jabber.org/protocol/disco#info'>\
             <identity category='server' type='im' name='ejabberd'/>\
             <feature var='jabber:iq:version'/>\
             <feature var='urn:xmpp:qos'/>\
             </query></iq>",
        )
        .unwrap();
        let info = DiscoInfo::from_query(iq.first_child().unwrap());
        assert_eq!(info.identities.len(), 1);
        assert_eq!(info.identities[0].category, "server");
        assert!(info.has_feature("urn:xmpp:qos"));
        assert!(!info.has_feature("jabber:iq:search"));
    }

    #[test]
    fn test_query_payload_with_node() {
        assert_eq!(
            query_payload(ns::DISCO_ITEMS, Some("music")),
            "<query xmlns='http://jabber.org/protocol/disco#items' node='music'/>"
        );
    }

    #[test]
    fn test_responder_advertises_feature_set() {
        let config: ClientConfig =
            toml::from_str("host = \"example.org\"\nuser = \"a\"\npassword = \"p\"\n").unwrap();
        let (client, _rx) = Client::new(config);
        let iq = Element::parse_stanza(
            HEADER,
            "<iq type='get' id='1' from='peer@x'>\
             <query xmlns='http://jabber.org/protocol/disco#info'/></iq>",
        )
        .unwrap();
        let request = IqRequest {
            id: "1".to_string(),
            from: Some("peer@x".to_string()),
            to: None,
            payload: iq.first_child().unwrap().clone(),
        };
        let outcome = handle_disco_info(&client, &request).unwrap();
        let IqHandlerOutcome::Reply(Some(xml)) = outcome else {
            panic!("expected a reply payload");
        };
        // Defaults registered at construction: disco#info, version,
        // qos and data forms.
        assert!(xml.contains("<feature var='http://jabber.org/protocol/disco#info'/>"));
        assert!(xml.contains("<feature var='jabber:iq:version'/>"));
        assert!(xml.contains("<feature var='urn:xmpp:qos'/>"));
        assert!(xml.contains("<feature var='jabber:x:data'/>"));
        assert!(xml.contains("<identity category='client'"));
    }
}
