/// Data Forms (XEP-0004), plus OAuth-style form signing (XEP-0348)
/// used by servers that require signed registration submissions.
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::ns;
use crate::stanza::escape;
use crate::xml::Element;

const SIGNATURE_FORM_TYPE: &str = "urn:xmpp:xdata:signature:oauth1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormType {
    Form,
    Submit,
    Cancel,
    Result,
}

impl FormType {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("submit") => Self::Submit,
            Some("cancel") => Self::Cancel,
            Some("result") => Self::Result,
            _ => Self::Form,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Form => "form",
            Self::Submit => "submit",
            Self::Cancel => "cancel",
            Self::Result => "result",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Boolean,
    Fixed,
    Hidden,
    JidMulti,
    JidSingle,
    ListMulti,
    ListSingle,
    TextMulti,
    TextPrivate,
    TextSingle,
}

impl FieldType {
    fn from_attr(value: Option<&str>) -> Self {
        match value {
            Some("boolean") => Self::Boolean,
            Some("fixed") => Self::Fixed,
            Some("hidden") => Self::Hidden,
            Some("jid-multi") => Self::JidMulti,
            Some("jid-single") => Self::JidSingle,
            Some("list-multi") => Self::ListMulti,
            Some("list-single") => Self::ListSingle,
            Some("text-multi") => Self::TextMulti,
            Some("text-private") => Self::TextPrivate,
            _ => Self::TextSingle,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Boolean => "boolean",
            Self::Fixed => "fixed",
            Self::Hidden => "hidden",
            Self::JidMulti => "jid-multi",
            Self::JidSingle => "jid-single",
            Self::ListMulti => "list-multi",
            Self::ListSingle => "list-single",
            Self::TextMulti => "text-multi",
            Self::TextPrivate => "text-private",
            Self::TextSingle => "text-single",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FormField {
    pub var: String,
    pub label: Option<String>,
    pub field_type: FieldType,
    pub values: Vec<String>,
    /// `(label, value)` pairs for list fields.
    pub options: Vec<(Option<String>, String)>,
    pub required: bool,
}

impl FormField {
    pub fn new(var: &str, value: &str) -> Self {
        Self {
            var: var.to_string(),
            label: None,
            field_type: FieldType::TextSingle,
            values: vec![value.to_string()],
            options: Vec::new(),
            required: false,
        }
    }

    fn hidden(var: &str, value: &str) -> Self {
        let mut field = Self::new(var, value);
        field.field_type = FieldType::Hidden;
        field
    }

    pub fn value(&self) -> Option<&str> {
        self.values.first().map(String::as_str)
    }

    fn from_element(element: &Element) -> Option<Self> {
        let var = element.attr("var")?.to_string();
        let values = element
            .child_elements()
            .filter(|e| e.name() == "value")
            .map(|e| e.text())
            .collect();
        let options = element
            .child_elements()
            .filter(|e| e.name() == "option")
            .filter_map(|option| {
                option
                    .child_named("value")
                    .map(|v| (option.attr("label").map(str::to_string), v.text()))
            })
            .collect();
        Some(Self {
            var,
            label: element.attr("label").map(str::to_string),
            field_type: FieldType::from_attr(element.attr("type")),
            values,
            options,
            required: element.child_named("required").is_some(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Form {
    pub form_type: FormType,
    pub title: Option<String>,
    pub instructions: Option<String>,
    pub fields: Vec<FormField>,
}

impl Form {
    pub fn new_submit() -> Self {
        Self {
            form_type: FormType::Submit,
            title: None,
            instructions: None,
            fields: Vec::new(),
        }
    }

    /// Reads an `<x xmlns='jabber:x:data'/>` element.
    pub fn from_element(element: &Element) -> Option<Self> {
        if element.name() != "x" || element.ns() != ns::DATA_FORMS {
            return None;
        }
        let text_child = |name: &str| {
            element
                .child(name, ns::DATA_FORMS)
                .map(|c| c.text())
                .filter(|t| !t.is_empty())
        };
        Some(Self {
            form_type: FormType::from_attr(element.attr("type")),
            title: text_child("title"),
            instructions: text_child("instructions"),
            fields: element
                .child_elements()
                .filter(|e| e.name() == "field")
                .filter_map(FormField::from_element)
                .collect(),
        })
    }

    pub fn field(&self, var: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.var == var)
    }

    /// Sets (or adds) a single-valued field.
    pub fn set_value(&mut self, var: &str, value: &str) {
        match self.fields.iter_mut().find(|f| f.var == var) {
            Some(field) => field.values = vec![value.to_string()],
            None => self.fields.push(FormField::new(var, value)),
        }
    }

    /// Turns a received `form` into the matching `submit`, keeping
    /// hidden fields (FORM_TYPE and friends travel back verbatim).
    pub fn into_submit(mut self) -> Form {
        self.form_type = FormType::Submit;
        self.title = None;
        self.instructions = None;
        self.fields.retain(|f| f.field_type != FieldType::Fixed);
        self
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<x xmlns='{}' type='{}'>",
            ns::DATA_FORMS,
            self.form_type.as_str()
        );
        if let Some(title) = &self.title {
            xml.push_str(&format!("<title>{}</title>", escape(title)));
        }
        if let Some(instructions) = &self.instructions {
            xml.push_str(&format!(
                "<instructions>{}</instructions>",
                escape(instructions)
            ));
        }
        for field in &self.fields {
            xml.push_str(&format!(
                "<field var='{}' type='{}'>",
                escape(&field.var),
                field.field_type.as_str()
            ));
            for value in &field.values {
                xml.push_str(&format!("<value>{}</value>", escape(value)));
            }
            xml.push_str("</field>");
        }
        xml.push_str("</x>");
        xml
    }

    /// Signs a submission with the configured key pair (XEP-0348,
    /// OAuth 1.0 HMAC-SHA1 over the sorted field values).
    pub fn sign(&mut self, key: &str, secret: &str) {
        use base64::Engine;
        use rand::Rng;

        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let nonce = hex::encode(rand::thread_rng().gen::<[u8; 16]>());

        self.fields
            .retain(|f| !f.var.starts_with("oauth_") && f.var != "FORM_TYPE");
        self.fields
            .insert(0, FormField::hidden("FORM_TYPE", SIGNATURE_FORM_TYPE));
        self.fields.push(FormField::hidden("oauth_version", "1.0"));
        self.fields
            .push(FormField::hidden("oauth_signature_method", "HMAC-SHA1"));
        self.fields.push(FormField::hidden("oauth_token", ""));
        self.fields.push(FormField::hidden("oauth_consumer_key", key));
        self.fields
            .push(FormField::hidden("oauth_timestamp", &timestamp.to_string()));
        self.fields.push(FormField::hidden("oauth_nonce", &nonce));

        let mut params: Vec<(String, String)> = self
            .fields
            .iter()
            .map(|f| (f.var.clone(), f.value().unwrap_or("").to_string()))
            .collect();
        params.sort();
        let base_string = params
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let signing_key = format!("{}&", percent_encode(secret));
        let mut mac = Hmac::<Sha1>::new_from_slice(signing_key.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(base_string.as_bytes());
        let signature =
            base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());

        self.fields
            .push(FormField::hidden("oauth_signature", &signature));
    }
}

/// RFC 3986 percent-encoding with the unreserved set.
fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<stream:stream from='example.org' id='X' version='1.0' \
         xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams'>";

    fn parse_form(xml: &str) -> Form {
        let message =
            Element::parse_stanza(HEADER, &format!("<message from='a@b'>{xml}</message>")).unwrap();
        Form::from_element(message.first_child().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_registration_form() {
        let form = parse_form(
            "<x xmlns='jabber:x:data' type='form'>\
             <title>Register</title>\
             <instructions>Fill this in</instructions>\
             <field var='FORM_TYPE' type='hidden'><value>jabber:iq:register</value></field>\
             <field var='username' type='text-single' label='User'><required/></field>\
             <field var='password' type='text-private'/>\
             </x>",
        );
        assert_eq!(form.form_type, FormType::Form);
        assert_eq!(form.title.as_deref(), Some("Register"));
        assert_eq!(form.instructions.as_deref(), Some("Fill this in"));
        assert_eq!(form.fields.len(), 3);
        let username = form.field("username").unwrap();
        assert!(username.required);
        assert_eq!(username.label.as_deref(), Some("User"));
        assert_eq!(
            form.field("password").unwrap().field_type,
            FieldType::TextPrivate
        );
        assert_eq!(
            form.field("FORM_TYPE").unwrap().value(),
            Some("jabber:iq:register")
        );
    }

    #[test]
    fn test_parse_list_options() {
        let form = parse_form(
            "<x xmlns='jabber:x:data' type='form'>\
             <field var='plan' type='list-single'>\
             <option label='Small'><value>s</value></option>\
             <option><value>l</value></option>\
             </field></x>",
        );
        let plan = form.field("plan").unwrap();
        assert_eq!(
            plan.options,
            vec![
                (Some("Small".to_string()), "s".to_string()),
                (None, "l".to_string())
            ]
        );
    }

    #[test]
    fn test_non_form_element_rejected() {
        let message =
            Element::parse_stanza(HEADER, "<message from='a@b'><body>x</body></message>").unwrap();
        assert!(Form::from_element(message.first_child().unwrap()).is_none());
    }

    #[test]
    fn test_into_submit_drops_fixed_and_decor() {
        let form = parse_form(
            "<x xmlns='jabber:x:data' type='form'>\
             <title>T</title>\
             <field var='note' type='fixed'><value>read me</value></field>\
             <field var='username' type='text-single'/>\
             </x>",
        );
        let submit = form.into_submit();
        assert_eq!(submit.form_type, FormType::Submit);
        assert!(submit.title.is_none());
        assert!(submit.field("note").is_none());
        assert!(submit.field("username").is_some());
    }

    #[test]
    fn test_to_xml_round_trip() {
        let mut form = Form::new_submit();
        form.set_value("username", "alice");
        form.set_value("password", "s3cret");
        let xml = form.to_xml();
        assert!(xml.starts_with("<x xmlns='jabber:x:data' type='submit'>"));
        assert!(xml.contains("<field var='username' type='text-single'><value>alice</value></field>"));

        let parsed = parse_form(&xml);
        assert_eq!(parsed.field("password").unwrap().value(), Some("s3cret"));
    }

    #[test]
    fn test_set_value_replaces() {
        let mut form = Form::new_submit();
        form.set_value("a", "1");
        form.set_value("a", "2");
        assert_eq!(form.fields.len(), 1);
        assert_eq!(form.field("a").unwrap().value(), Some("2"));
    }

    #[test]
    fn test_sign_adds_oauth_fields() {
        let mut form = Form::new_submit();
        form.set_value("username", "alice");
        form.sign("key", "secret");
        assert_eq!(
            form.field("FORM_TYPE").unwrap().value(),
            Some(SIGNATURE_FORM_TYPE)
        );
        assert_eq!(form.field("oauth_consumer_key").unwrap().value(), Some("key"));
        assert_eq!(
            form.field("oauth_signature_method").unwrap().value(),
            Some("HMAC-SHA1")
        );
        let signature = form.field("oauth_signature").unwrap().value().unwrap();
        assert!(!signature.is_empty());
    }

    #[test]
    fn test_sign_is_idempotent_on_field_set() {
        let mut form = Form::new_submit();
        form.set_value("username", "alice");
        form.sign("key", "secret");
        let count = form.fields.len();
        form.sign("key", "secret");
        assert_eq!(form.fields.len(), count);
    }

    #[test]
    fn test_percent_encode() {
        assert_eq!(percent_encode("a b&c"), "a%20b%26c");
        assert_eq!(percent_encode("safe-._~"), "safe-._~");
    }
}
