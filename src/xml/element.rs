/// Stanza trees.
///
/// A fragment framed by the tokenizer is parsed as a whole document by
/// wrapping it between the captured stream header and the matching
/// footer, so stream-level namespace declarations (`stream:`, the
/// default `jabber:client`) resolve per the usual XML rules. The
/// result is a plain tree; no XMPP semantics live here.
use anyhow::{anyhow, bail, Context, Result};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::ResolveResult;
use quick_xml::reader::NsReader;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An XML element with its resolved namespace URI. Attribute names are
/// kept as written (`xml:lang` stays qualified); namespace
/// declarations are consumed during parsing and re-synthesised when
/// serialising.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str, ns: &str) -> Self {
        Self {
            name: name.to_string(),
            ns: ns.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn set_ns(&mut self, ns: &str) {
        self.ns = ns.to_string();
    }

    /// The handler dispatch key: `"<local-name> <namespace-uri>"`.
    pub fn key(&self) -> String {
        format!("{} {}", self.name, self.ns)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.children.iter()
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn child_elements_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child element with the given local name and namespace.
    pub fn child(&self, name: &str, ns: &str) -> Option<&Element> {
        self.child_elements()
            .find(|e| e.name == name && e.ns == ns)
    }

    /// First child element with the given local name, any namespace.
    pub fn child_named(&self, name: &str) -> Option<&Element> {
        self.child_elements().find(|e| e.name == name)
    }

    pub fn first_child(&self) -> Option<&Element> {
        self.child_elements().next()
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn push_text(&mut self, text: &str) {
        self.children.push(Node::Text(text.to_string()));
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Serialises the subtree. A fresh `xmlns` is emitted wherever the
    /// namespace changes relative to the parent; prefixes seen on input
    /// are not preserved.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_into(&mut out, "");
        out
    }

    fn write_into(&self, out: &mut String, parent_ns: &str) {
        out.push('<');
        out.push_str(&self.name);
        if self.ns != parent_ns && !self.ns.is_empty() {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.ns.as_str()));
            out.push('\'');
        }
        for (k, v) in &self.attrs {
            out.push(' ');
            out.push_str(k);
            out.push_str("='");
            out.push_str(&escape(v.as_str()));
            out.push('\'');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                Node::Element(e) => e.write_into(out, &self.ns),
                Node::Text(t) => out.push_str(&escape(t.as_str())),
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    /// Parses a complete standalone document and returns its root.
    pub fn parse_document(xml: &str) -> Result<Element> {
        parse_tree(xml)?.ok_or_else(|| anyhow!("document has no root element"))
    }

    /// Parses one stream fragment in the context of the captured
    /// stream header, returning the stanza (the single child of the
    /// stream root).
    pub fn parse_stanza(stream_header: &str, fragment: &str) -> Result<Element> {
        let root_tag = header_tag_name(stream_header)
            .ok_or_else(|| anyhow!("malformed stream header: {stream_header}"))?;
        let doc = format!("{stream_header}{fragment}</{root_tag}>");
        let root = Element::parse_document(&doc)
            .with_context(|| format!("unparseable stanza: {fragment}"))?;
        root.children
            .into_iter()
            .find_map(|node| match node {
                Node::Element(e) => Some(e),
                Node::Text(_) => None,
            })
            .ok_or_else(|| anyhow!("fragment holds no element: {fragment}"))
    }
}

/// Qualified name of the tag a stream header opens, e.g. `stream:stream`.
fn header_tag_name(header: &str) -> Option<&str> {
    let rest = header.strip_prefix('<')?;
    let end = rest.find(|c: char| c.is_whitespace() || c == '>' || c == '/')?;
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

fn parse_tree(xml: &str) -> Result<Option<Element>> {
    let mut reader = NsReader::from_str(xml);
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (resolved, event) = reader
            .read_resolved_event()
            .context("malformed XML")?;
        let empty = matches!(event, Event::Empty(_));
        match event {
            Event::Start(start) | Event::Empty(start) => {
                let ns = match resolved {
                    ResolveResult::Bound(ns) => std::str::from_utf8(ns.into_inner())
                        .context("non-UTF-8 namespace")?
                        .to_string(),
                    ResolveResult::Unbound => String::new(),
                    ResolveResult::Unknown(prefix) => {
                        bail!(
                            "unknown namespace prefix {:?}",
                            String::from_utf8_lossy(&prefix)
                        )
                    }
                };
                let name = std::str::from_utf8(start.local_name().as_ref())
                    .context("non-UTF-8 element name")?
                    .to_string();
                let mut element = Element {
                    name,
                    ns,
                    attrs: Vec::new(),
                    children: Vec::new(),
                };
                for attr in start.attributes() {
                    let attr = attr.context("malformed attribute")?;
                    let key = attr.key.as_ref();
                    if key == b"xmlns" || key.starts_with(b"xmlns:") {
                        continue;
                    }
                    let key = std::str::from_utf8(key)
                        .context("non-UTF-8 attribute name")?
                        .to_string();
                    let value = attr
                        .unescape_value()
                        .context("malformed attribute value")?
                        .into_owned();
                    element.attrs.push((key, value));
                }
                if empty {
                    attach(&mut stack, &mut root, element);
                } else {
                    stack.push(element);
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| anyhow!("unbalanced closing tag"))?;
                attach(&mut stack, &mut root, element);
            }
            Event::Text(text) => {
                let text = text.unescape().context("malformed text")?;
                if let Some(top) = stack.last_mut() {
                    top.children.push(Node::Text(text.into_owned()));
                }
            }
            Event::CData(data) => {
                let data = data.into_inner();
                let text = std::str::from_utf8(&data)
                    .context("non-UTF-8 CDATA")?
                    .to_string();
                if let Some(top) = stack.last_mut() {
                    top.children.push(Node::Text(text));
                }
            }
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => break,
        }
    }
    if !stack.is_empty() {
        bail!("unterminated element");
    }
    Ok(root)
}

fn attach(stack: &mut Vec<Element>, root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(Node::Element(element)),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    #[test]
    fn test_parse_stanza_resolves_default_namespace() {
        let stanza = Element::parse_stanza(
            HEADER,
            "<message to='a@b' type='chat'><body>hi</body></message>",
        )
        .unwrap();
        assert_eq!(stanza.name(), "message");
        assert_eq!(stanza.ns(), "jabber:client");
        assert_eq!(stanza.attr("to"), Some("a@b"));
        let body = stanza.child("body", "jabber:client").unwrap();
        assert_eq!(body.text(), "hi");
    }

    #[test]
    fn test_parse_stanza_resolves_stream_prefix() {
        let stanza = Element::parse_stanza(
            HEADER,
            "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
        )
        .unwrap();
        assert_eq!(stanza.name(), "features");
        assert_eq!(stanza.ns(), "http://etherx.jabber.org/streams");
        assert!(stanza
            .child("bind", "urn:ietf:params:xml:ns:xmpp-bind")
            .is_some());
    }

    #[test]
    fn test_child_namespace_inherited() {
        let stanza = Element::parse_stanza(
            HEADER,
            "<iq type='set' id='5'><query xmlns='jabber:iq:roster'>\
             <item jid='a@b'/></query></iq>",
        )
        .unwrap();
        let query = stanza.child("query", "jabber:iq:roster").unwrap();
        let item = query.child("item", "jabber:iq:roster").unwrap();
        assert_eq!(item.attr("jid"), Some("a@b"));
    }

    #[test]
    fn test_dispatch_key() {
        let stanza =
            Element::parse_stanza(HEADER, "<iq><ping xmlns='urn:xmpp:ping'/></iq>").unwrap();
        let ping = stanza.first_child().unwrap();
        assert_eq!(ping.key(), "ping urn:xmpp:ping");
    }

    #[test]
    fn test_text_entities_unescaped() {
        let stanza = Element::parse_stanza(
            HEADER,
            "<message><body>a &lt;b&gt; &amp;c</body></message>",
        )
        .unwrap();
        assert_eq!(stanza.child_named("body").unwrap().text(), "a <b> &c");
    }

    #[test]
    fn test_xml_lang_attribute_kept_qualified() {
        let stanza = Element::parse_stanza(
            HEADER,
            "<message xml:lang='en'><body>hi</body></message>",
        )
        .unwrap();
        assert_eq!(stanza.attr("xml:lang"), Some("en"));
    }

    #[test]
    fn test_to_xml_round_trip() {
        let stanza = Element::parse_stanza(
            HEADER,
            "<iq type='get' id='1'><query xmlns='jabber:iq:version'/></iq>",
        )
        .unwrap();
        let xml = stanza.to_xml();
        assert_eq!(
            xml,
            "<iq xmlns='jabber:client' type='get' id='1'>\
             <query xmlns='jabber:iq:version'/></iq>"
        );
    }

    #[test]
    fn test_to_xml_escapes() {
        let mut element = Element::new("body", "jabber:client");
        element.push_text("a < b & c");
        assert_eq!(
            element.to_xml(),
            "<body xmlns='jabber:client'>a &lt; b &amp; c</body>"
        );
    }

    #[test]
    fn test_unknown_prefix_rejected() {
        assert!(Element::parse_stanza(HEADER, "<foo:bar/>").is_err());
    }

    #[test]
    fn test_fragment_with_only_text_rejected() {
        assert!(Element::parse_stanza(HEADER, "   ").is_err());
    }

    #[test]
    fn test_parse_document_root() {
        let root = Element::parse_document("<a xmlns='x'><b/><b/></a>").unwrap();
        assert_eq!(root.child_elements().count(), 2);
    }

    #[test]
    fn test_header_tag_name() {
        assert_eq!(header_tag_name(HEADER), Some("stream:stream"));
        assert_eq!(header_tag_name("<s>"), Some("s"));
        assert_eq!(header_tag_name("no-tag"), None);
    }
}
