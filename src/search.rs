/// Jabber Search (XEP-0055).
///
/// Directories either prompt with the classic fixed fields
/// (first/last/nick/email) or attach a data form; results arrive as
/// `<item/>` rows or as a result form with `<reported/>` columns.
/// Both shapes collapse into [`SearchItem`] rows here.
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::client::Client;
use crate::forms::Form;
use crate::ns;
use crate::stanza::escape;
use crate::xml::Element;

#[derive(Debug, Clone)]
pub struct SearchFields {
    pub instructions: Option<String>,
    /// Classic field names the directory accepts.
    pub fields: Vec<String>,
    /// Data form, when the directory prefers one.
    pub form: Option<Form>,
}

#[derive(Debug, Clone)]
pub struct SearchItem {
    pub jid: String,
    /// Column/value pairs in reported order.
    pub values: Vec<(String, String)>,
}

fn parse_fields(query: &Element) -> SearchFields {
    let mut instructions = None;
    let mut fields = Vec::new();
    let mut form = None;
    for child in query.child_elements() {
        match (child.name(), child.ns()) {
            ("instructions", _) => instructions = Some(child.text()),
            ("x", ns_uri) if ns_uri == ns::DATA_FORMS => form = Form::from_element(child),
            (name, ns_uri) if ns_uri == ns::SEARCH => fields.push(name.to_string()),
            _ => {}
        }
    }
    SearchFields {
        instructions,
        fields,
        form,
    }
}

fn parse_results(query: &Element) -> Vec<SearchItem> {
    // Result form rows take precedence when present.
    if let Some(x) = query.child("x", ns::DATA_FORMS) {
        return x
            .child_elements()
            .filter(|e| e.name() == "item")
            .map(|item| {
                let values: Vec<(String, String)> = item
                    .child_elements()
                    .filter(|e| e.name() == "field")
                    .filter_map(|field| {
                        let var = field.attr("var")?;
                        let value = field.child_named("value")?.text();
                        Some((var.to_string(), value))
                    })
                    .collect();
                let jid = values
                    .iter()
                    .find(|(var, _)| var == "jid")
                    .map(|(_, value)| value.clone())
                    .unwrap_or_default();
                SearchItem { jid, values }
            })
            .collect();
    }

    query
        .child_elements()
        .filter(|e| e.name() == "item")
        .filter_map(|item| {
            let jid = item.attr("jid")?.to_string();
            let values = item
                .child_elements()
                .map(|field| (field.name().to_string(), field.text()))
                .collect();
            Some(SearchItem { jid, values })
        })
        .collect()
}

impl Client {
    /// Fetches what a directory lets us search by.
    pub async fn search_fields(&self, to: &str, timeout: Duration) -> Result<SearchFields> {
        let payload = format!("<query xmlns='{}'/>", ns::SEARCH);
        let response = self
            .iq_get(to, &payload, timeout)
            .await?
            .ok_or_else(|| anyhow!("empty search fields result"))?;
        if response.name() != "query" || response.ns() != ns::SEARCH {
            return Err(anyhow!("unexpected search payload"));
        }
        Ok(parse_fields(&response))
    }

    /// Runs a search with the classic fixed fields.
    pub async fn search(
        &self,
        to: &str,
        values: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Vec<SearchItem>> {
        let mut payload = format!("<query xmlns='{}'>", ns::SEARCH);
        for (field, value) in values {
            payload.push_str(&format!("<{field}>{}</{field}>", escape(value)));
        }
        payload.push_str("</query>");
        self.run_search(to, &payload, timeout).await
    }

    /// Runs a search by submitting a data form.
    pub async fn search_with_form(
        &self,
        to: &str,
        form: Form,
        timeout: Duration,
    ) -> Result<Vec<SearchItem>> {
        let payload = format!("<query xmlns='{}'>{}</query>", ns::SEARCH, form.to_xml());
        self.run_search(to, &payload, timeout).await
    }

    async fn run_search(
        &self,
        to: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Vec<SearchItem>> {
        let response = self
            .iq_set(to, payload, timeout)
            .await?
            .ok_or_else(|| anyhow!("empty search result"))?;
        if response.name() != "query" || response.ns() != ns::SEARCH {
            return Err(anyhow!("unexpected search payload"));
        }
        Ok(parse_results(&response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    fn query(inner: &str) -> Element {
        let iq = Element::parse_stanza(
            HEADER,
            &format!(
                "<iq type='result' id='1'><query xmlns='jabber:iq:search'>{inner}</query></iq>"
            ),
        )
        .unwrap();
        iq.first_child().unwrap().clone()
    }

    #[test]
    fn test_parse_classic_fields() {
        let fields = parse_fields(&query(
            "<instructions>Fill in a field</instructions>\
             <first/><last/><nick/><email/>",
        ));
        assert_eq!(fields.instructions.as_deref(), Some("Fill in a field"));
        assert_eq!(fields.fields, vec!["first", "last", "nick", "email"]);
        assert!(fields.form.is_none());
    }

    #[test]
    fn test_parse_form_prompt() {
        let fields = parse_fields(&query(
            "<x xmlns='jabber:x:data' type='form'>\
             <field var='last' type='text-single'/></x>",
        ));
        assert!(fields.fields.is_empty());
        assert!(fields.form.unwrap().field("last").is_some());
    }

    #[test]
    fn test_parse_classic_results() {
        let items = parse_results(&query(
            "<item jid='juliet@capulet.com'>\
             <first>Juliet</first><last>Capulet</last></item>\
             <item jid='tybalt@capulet.com'><first>Tybalt</first></item>",
        ));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].jid, "juliet@capulet.com");
        assert!(items[0]
            .values
            .contains(&("first".to_string(), "Juliet".to_string())));
    }

    #[test]
    fn test_parse_form_results() {
        let items = parse_results(&query(
            "<x xmlns='jabber:x:data' type='result'>\
             <reported><field var='jid'/><field var='nick'/></reported>\
             <item>\
             <field var='jid'><value>romeo@montague.net</value></field>\
             <field var='nick'><value>Romeo</value></field>\
             </item></x>",
        ));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].jid, "romeo@montague.net");
        assert!(items[0]
            .values
            .contains(&("nick".to_string(), "Romeo".to_string())));
    }

    #[test]
    fn test_empty_results() {
        assert!(parse_results(&query("")).is_empty());
    }
}
