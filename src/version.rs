/// Software Version (XEP-0092).
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::client::{Client, IqHandlerOutcome, IqRequest};
use crate::error::StanzaError;
use crate::ns;
use crate::stanza::escape;

pub(crate) const CLIENT_NAME: &str = "fluux-xmpp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub os: Option<String>,
}

impl Client {
    /// Asks a peer for its software version.
    pub async fn query_version(&self, to: &str, timeout: Duration) -> Result<VersionInfo> {
        let payload = format!("<query xmlns='{}'/>", ns::VERSION);
        let response = self
            .iq_get(to, &payload, timeout)
            .await?
            .ok_or_else(|| anyhow!("empty version result"))?;
        if response.name() != "query" || response.ns() != ns::VERSION {
            return Err(anyhow!("unexpected version payload"));
        }
        let text_child = |name: &str| {
            response
                .child(name, ns::VERSION)
                .map(|child| child.text())
                .filter(|text| !text.is_empty())
        };
        Ok(VersionInfo {
            name: text_child("name").unwrap_or_default(),
            version: text_child("version").unwrap_or_default(),
            os: text_child("os"),
        })
    }
}

/// Default iq-get responder for `jabber:iq:version`.
pub(crate) fn handle_version_query(
    _client: &Client,
    _request: &IqRequest,
) -> Result<IqHandlerOutcome, StanzaError> {
    let xml = format!(
        "<query xmlns='{}'><name>{}</name><version>{}</version><os>{}</os></query>",
        ns::VERSION,
        CLIENT_NAME,
        env!("CARGO_PKG_VERSION"),
        escape(std::env::consts::OS)
    );
    Ok(IqHandlerOutcome::Reply(Some(xml)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::xml::Element;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    #[test]
    fn test_version_reply_structure() {
        let config: ClientConfig =
            toml::from_str("host = \"example.org\"\nuser = \"a\"\npassword = \"p\"\n").unwrap();
        let (client, _rx) = Client::new(config);
        let iq = Element::parse_stanza(
            HEADER,
            "<iq type='get' id='1' from='peer@x'>\
             <query xmlns='jabber:iq:version'/></iq>",
        )
        .unwrap();
        let request = IqRequest {
            id: "1".to_string(),
            from: Some("peer@x".to_string()),
            to: None,
            payload: iq.first_child().unwrap().clone(),
        };
        let IqHandlerOutcome::Reply(Some(xml)) = handle_version_query(&client, &request).unwrap()
        else {
            panic!("expected a reply payload");
        };
        assert!(xml.starts_with("<query xmlns='jabber:iq:version'>"));
        assert!(xml.contains("<name>fluux-xmpp</name>"));
        assert!(xml.contains("<version>"));
        assert!(xml.contains("<os>"));
    }
}
