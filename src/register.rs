/// In-Band Registration (XEP-0077).
///
/// Used two ways: automatically, when authentication fails and the
/// configuration allows registering the account on the fly (driven by
/// the stream negotiation), and explicitly through the account
/// management calls below (fetch fields, submit, change password,
/// delete account).
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::client::{Client, XmppEvent};
use crate::forms::Form;
use crate::ns;
use crate::stanza::escape;
use crate::xml::Element;

pub(crate) fn build_query_get() -> String {
    format!("<query xmlns='{}'/>", ns::REGISTER)
}

/// Builds the iq-set payload answering a registration prompt. Servers
/// either list plain fields or attach a data form; with a form, the
/// configured signature key pair (when present) signs the submission.
/// Returns the payload plus the parsed form for observers.
pub(crate) fn build_submit_payload(
    username: &str,
    password: &str,
    query: &Element,
    signature: Option<(&str, &str)>,
) -> (String, Option<Form>) {
    if let Some(x) = query.child("x", ns::DATA_FORMS) {
        if let Some(form) = Form::from_element(x) {
            let mut submit = form.clone().into_submit();
            submit.set_value("username", username);
            submit.set_value("password", password);
            if let Some((key, secret)) = signature {
                submit.sign(key, secret);
            }
            return (
                format!("<query xmlns='{}'>{}</query>", ns::REGISTER, submit.to_xml()),
                Some(form),
            );
        }
    }
    (
        format!(
            "<query xmlns='{}'><username>{}</username><password>{}</password></query>",
            ns::REGISTER,
            escape(username),
            escape(password)
        ),
        None,
    )
}

/// What a registration prompt asked for.
#[derive(Debug, Clone)]
pub struct RegistrationFields {
    pub instructions: Option<String>,
    /// The account is already registered.
    pub registered: bool,
    /// Plain field names requested (username, password, email, ...).
    pub fields: Vec<String>,
    /// Data form, when the server prefers one.
    pub form: Option<Form>,
}

impl RegistrationFields {
    pub(crate) fn from_query(query: &Element) -> Self {
        let mut instructions = None;
        let mut registered = false;
        let mut fields = Vec::new();
        let mut form = None;
        for child in query.child_elements() {
            match (child.name(), child.ns()) {
                ("instructions", _) => instructions = Some(child.text()),
                ("registered", _) => registered = true,
                ("x", ns_uri) if ns_uri == ns::DATA_FORMS => form = Form::from_element(child),
                (name, ns_uri) if ns_uri == ns::REGISTER => fields.push(name.to_string()),
                _ => {}
            }
        }
        Self {
            instructions,
            registered,
            fields,
            form,
        }
    }
}

impl Client {
    /// Fetches the registration fields of a service (None targets the
    /// own server).
    pub async fn fetch_registration_fields(
        &self,
        to: Option<&str>,
        timeout: Duration,
    ) -> Result<RegistrationFields> {
        let response = self
            .iq_get(to.unwrap_or(""), &build_query_get(), timeout)
            .await?
            .ok_or_else(|| anyhow!("empty registration result"))?;
        if response.name() != "query" || response.ns() != ns::REGISTER {
            return Err(anyhow!("unexpected registration payload"));
        }
        Ok(RegistrationFields::from_query(&response))
    }

    /// Submits plain registration fields to a service.
    pub async fn submit_registration(
        &self,
        to: Option<&str>,
        values: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<()> {
        let mut payload = format!("<query xmlns='{}'>", ns::REGISTER);
        for (field, value) in values {
            payload.push_str(&format!(
                "<{field}>{}</{field}>",
                escape(value)
            ));
        }
        payload.push_str("</query>");
        self.iq_set(to.unwrap_or(""), &payload, timeout).await?;
        Ok(())
    }

    /// Changes the account password (RFC 6121 / XEP-0077 §3.3). On
    /// success the stored plaintext is replaced and the recorded
    /// salted-password hash cleared, so the next authentication
    /// re-derives it.
    pub async fn change_password(&self, new_password: &str, timeout: Duration) -> Result<()> {
        let (username, domain) = {
            let config = self.config_lock();
            (config.user.clone(), config.domain().to_string())
        };
        let payload = format!(
            "<query xmlns='{}'><username>{}</username><password>{}</password></query>",
            ns::REGISTER,
            escape(&username),
            escape(new_password)
        );
        let response = self.iq_request("set", &domain, &payload, timeout).await?;
        if response.ok {
            {
                let mut config = self.config_lock();
                config.password = new_password.to_string();
                config.password_hash = None;
                config.hash_method = None;
            }
            self.emit(XmppEvent::PasswordChanged);
            return Ok(());
        }
        // The server may answer with a form asking for more data.
        if let Some(form) = response
            .payload
            .as_ref()
            .and_then(|query| query.child("x", ns::DATA_FORMS))
            .and_then(Form::from_element)
        {
            self.emit(XmppEvent::PasswordChangeForm(form));
        }
        Err(anyhow!(
            "password change rejected: {}",
            response
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error condition".to_string())
        ))
    }

    /// Cancels the account registration at the own server.
    pub async fn delete_account(&self, timeout: Duration) -> Result<()> {
        let payload = format!("<query xmlns='{}'><remove/></query>", ns::REGISTER);
        self.iq_set("", &payload, timeout).await?;
        Ok(())
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
            &format!("<iq type='result' id='1'><query xmlns='jabber:iq:register'>{inner}</query></iq>"),
        )
        .unwrap();
        iq.child("query", ns::REGISTER).unwrap().clone()
    }

    #[test]
    fn test_fields_from_plain_query() {
        let fields = RegistrationFields::from_query(&query(
            "<instructions>Choose a name</instructions><username/><password/><email/>",
        ));
        assert_eq!(fields.instructions.as_deref(), Some("Choose a name"));
        assert_eq!(fields.fields, vec!["username", "password", "email"]);
        assert!(!fields.registered);
        assert!(fields.form.is_none());
    }

    #[test]
    fn test_fields_detect_registered() {
        let fields =
            RegistrationFields::from_query(&query("<registered/><username/><password/>"));
        assert!(fields.registered);
    }

    #[test]
    fn test_submit_payload_plain() {
        let (payload, form) =
            build_submit_payload("alice", "s3cret", &query("<username/><password/>"), None);
        assert_eq!(
            payload,
            "<query xmlns='jabber:iq:register'>\
             <username>alice</username><password>s3cret</password></query>"
        );
        assert!(form.is_none());
    }

    #[test]
    fn test_submit_payload_escapes() {
        let (payload, _) =
            build_submit_payload("alice", "a<b&c", &query("<username/><password/>"), None);
        assert!(payload.contains("<password>a&lt;b&amp;c</password>"));
    }

    #[test]
    fn test_submit_payload_with_form() {
        let (payload, form) = build_submit_payload(
            "alice",
            "pw",
            &query(
                "<x xmlns='jabber:x:data' type='form'>\
                 <field var='username' type='text-single'/>\
                 <field var='password' type='text-private'/>\
                 </x>",
            ),
            None,
        );
        assert!(payload.contains("type='submit'"));
        assert!(payload.contains("<value>alice</value>"));
        assert!(payload.contains("<value>pw</value>"));
        assert!(form.is_some());
    }

    #[test]
    fn test_submit_payload_signed() {
        let (payload, _) = build_submit_payload(
            "alice",
            "pw",
            &query(
                "<x xmlns='jabber:x:data' type='form'>\
                 <field var='username' type='text-single'/>\
                 </x>",
            ),
            Some(("key", "secret")),
        );
        assert!(payload.contains("oauth_signature"));
        assert!(payload.contains("oauth_consumer_key"));
    }
}
