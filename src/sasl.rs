/// SASL authentication mechanisms.
///
/// The four supported algorithms form a closed variant behind one
/// contract: an optional initial response, a challenge/response
/// exchange, and a final check of the server's success data. The
/// mechanism layer works on raw bytes; base64 framing belongs to the
/// stream negotiation.
use anyhow::{anyhow, bail, Result};
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;
type HmacMd5 = Hmac<Md5>;

/// What a mechanism authenticates with.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// The XMPP domain, needed for the DIGEST-MD5 digest-uri.
    pub domain: String,
    /// SCRAM-SHA-1 salted password recorded from an earlier exchange;
    /// lets a client authenticate without keeping the plaintext.
    pub salted_sha1: Option<Vec<u8>>,
}

/// Which mechanisms the configuration permits.
#[derive(Debug, Clone, Copy)]
pub struct MechanismPolicy {
    pub allow_plain: bool,
    pub allow_cram_md5: bool,
    pub allow_digest_md5: bool,
    pub allow_scram_sha1: bool,
}

impl MechanismPolicy {
    fn permits(&self, name: &str) -> bool {
        match name {
            "PLAIN" => self.allow_plain,
            "CRAM-MD5" => self.allow_cram_md5,
            "DIGEST-MD5" => self.allow_digest_md5,
            "SCRAM-SHA-1" => self.allow_scram_sha1,
            _ => false,
        }
    }
}

/// Preference order when several offered mechanisms are permitted.
const PRIORITY: [&str; 4] = ["SCRAM-SHA-1", "DIGEST-MD5", "CRAM-MD5", "PLAIN"];

/// Picks the strongest permitted mechanism among those the server
/// offered, or None when nothing is acceptable.
pub fn select(offered: &[String], policy: &MechanismPolicy) -> Option<&'static str> {
    PRIORITY
        .iter()
        .find(|name| policy.permits(name) && offered.iter().any(|o| o == *name))
        .copied()
}

pub enum Mechanism {
    Plain(Plain),
    CramMd5(CramMd5),
    DigestMd5(DigestMd5),
    ScramSha1(ScramSha1),
}

impl Mechanism {
    pub fn create(name: &str, credentials: &Credentials) -> Result<Self> {
        match name {
            "PLAIN" => Ok(Self::Plain(Plain {
                username: credentials.username.clone(),
                password: credentials.password.clone(),
            })),
            "CRAM-MD5" => Ok(Self::CramMd5(CramMd5 {
                username: credentials.username.clone(),
                password: credentials.password.clone(),
            })),
            "DIGEST-MD5" => Ok(Self::DigestMd5(DigestMd5::new(credentials))),
            "SCRAM-SHA-1" => Ok(Self::ScramSha1(ScramSha1::new(credentials))),
            _ => Err(anyhow!("unsupported SASL mechanism: {name}")),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain(_) => "PLAIN",
            Self::CramMd5(_) => "CRAM-MD5",
            Self::DigestMd5(_) => "DIGEST-MD5",
            Self::ScramSha1(_) => "SCRAM-SHA-1",
        }
    }

    /// Payload of the `<auth/>` element, when the mechanism starts the
    /// exchange.
    pub fn initial_response(&mut self) -> Option<Vec<u8>> {
        match self {
            Self::Plain(m) => Some(m.initial()),
            Self::CramMd5(_) | Self::DigestMd5(_) => None,
            Self::ScramSha1(m) => Some(m.initial()),
        }
    }

    /// Answers a `<challenge/>`.
    pub fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Plain(_) => bail!("PLAIN expects no challenge"),
            Self::CramMd5(m) => m.respond(challenge),
            Self::DigestMd5(m) => m.respond(challenge),
            Self::ScramSha1(m) => m.respond(challenge),
        }
    }

    /// Verifies the data carried by `<success/>`, if any.
    pub fn check_success(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(_) | Self::CramMd5(_) => Ok(()),
            Self::DigestMd5(m) => m.check_success(data),
            Self::ScramSha1(m) => m.check_success(data),
        }
    }

    /// The SCRAM salted password derived during this exchange, for the
    /// caller to record.
    pub fn salted_password(&self) -> Option<&[u8]> {
        match self {
            Self::ScramSha1(m) => m.salted.as_deref(),
            _ => None,
        }
    }
}

fn generate_nonce() -> String {
    use base64::Engine;
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..24).map(|_| rng.gen()).collect();
    base64::engine::general_purpose::STANDARD.encode(&bytes)
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha1::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

// ── PLAIN (RFC 4616) ─────────────────────────────────────

pub struct Plain {
    username: String,
    password: String,
}

impl Plain {
    fn initial(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.push(0);
        payload.extend_from_slice(self.username.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        payload
    }
}

// ── CRAM-MD5 (RFC 2195) ──────────────────────────────────

pub struct CramMd5 {
    username: String,
    password: String,
}

impl CramMd5 {
    fn respond(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let mut mac = HmacMd5::new_from_slice(self.password.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(challenge);
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{} {digest}", self.username).into_bytes())
    }
}

// ── DIGEST-MD5 (RFC 2831) ────────────────────────────────

pub struct DigestMd5 {
    username: String,
    password: String,
    domain: String,
    cnonce: String,
    /// Set once the digest-response is sent; the server must echo this
    /// back as `rspauth`.
    expected_rspauth: Option<String>,
    verified: bool,
}

impl DigestMd5 {
    fn new(credentials: &Credentials) -> Self {
        Self {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
            domain: credentials.domain.clone(),
            cnonce: generate_nonce(),
            expected_rspauth: None,
            verified: false,
        }
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        let challenge = std::str::from_utf8(challenge)
            .map_err(|_| anyhow!("non-UTF-8 DIGEST-MD5 challenge"))?;
        let directives = parse_directives(challenge);

        if self.expected_rspauth.is_some() {
            // Second challenge: the mutual-authentication token.
            let rspauth = directives
                .iter()
                .find(|(k, _)| k == "rspauth")
                .map(|(_, v)| v.clone())
                .ok_or_else(|| anyhow!("expected rspauth, got: {challenge}"))?;
            self.verify_rspauth(&rspauth)?;
            return Ok(Vec::new());
        }

        let get = |key: &str| {
            directives
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        let nonce = get("nonce").ok_or_else(|| anyhow!("missing nonce in challenge"))?;
        let realm = get("realm").unwrap_or_default();
        if let Some(qop) = get("qop") {
            if !qop.split(',').any(|q| q.trim() == "auth") {
                bail!("server requires unsupported qop: {qop}");
            }
        }

        let digest_uri = format!("xmpp/{}", self.domain);
        let nc = "00000001";

        // A1 = H(user:realm:pass) : nonce : cnonce, with the inner hash raw.
        let inner = Md5::digest(format!("{}:{realm}:{}", self.username, self.password));
        let mut a1 = inner.to_vec();
        a1.extend_from_slice(format!(":{nonce}:{}", self.cnonce).as_bytes());
        let ha1 = hex::encode(Md5::digest(&a1));

        let ha2 = hex::encode(Md5::digest(format!("AUTHENTICATE:{digest_uri}")));
        let response = hex::encode(Md5::digest(format!(
            "{ha1}:{nonce}:{nc}:{}:auth:{ha2}",
            self.cnonce
        )));

        // rspauth uses A2 without the method.
        let ha2_resp = hex::encode(Md5::digest(format!(":{digest_uri}")));
        self.expected_rspauth = Some(hex::encode(Md5::digest(format!(
            "{ha1}:{nonce}:{nc}:{}:auth:{ha2_resp}",
            self.cnonce
        ))));

        let reply = format!(
            "username=\"{}\",realm=\"{realm}\",nonce=\"{nonce}\",cnonce=\"{}\",\
             nc={nc},qop=auth,digest-uri=\"{digest_uri}\",response={response},charset=utf-8",
            self.username, self.cnonce
        );
        Ok(reply.into_bytes())
    }

    fn verify_rspauth(&mut self, rspauth: &str) -> Result<()> {
        match &self.expected_rspauth {
            Some(expected) if expected == rspauth => {
                self.verified = true;
                Ok(())
            }
            Some(_) => bail!("DIGEST-MD5 rspauth mismatch (server does not know the password)"),
            None => bail!("rspauth before digest-response"),
        }
    }

    fn check_success(&mut self, data: &[u8]) -> Result<()> {
        if self.verified {
            return Ok(());
        }
        // Some servers carry rspauth in <success/> instead of a second
        // challenge.
        if let Ok(text) = std::str::from_utf8(data) {
            if let Some((_, value)) = parse_directives(text)
                .into_iter()
                .find(|(k, _)| k == "rspauth")
            {
                return self.verify_rspauth(&value);
            }
        }
        Ok(())
    }
}

/// Splits `key=value,key="value"` directive lists.
fn parse_directives(input: &str) -> Vec<(String, String)> {
    let mut directives = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[(end + 1).min(rest.len())..].trim_start();
        }
        directives.push((key, value));
    }
    directives
}

// ── SCRAM-SHA-1 (RFC 5802) ───────────────────────────────

pub struct ScramSha1 {
    password: String,
    client_nonce: String,
    client_first_bare: String,
    salted: Option<Vec<u8>>,
    server_signature: Option<Vec<u8>>,
    sent_final: bool,
}

impl ScramSha1 {
    fn new(credentials: &Credentials) -> Self {
        Self::with_nonce(credentials, generate_nonce())
    }

    fn with_nonce(credentials: &Credentials, client_nonce: String) -> Self {
        let username = credentials
            .username
            .replace('=', "=3D")
            .replace(',', "=2C");
        let client_first_bare = format!("n={username},r={client_nonce}");
        Self {
            password: credentials.password.clone(),
            client_nonce,
            client_first_bare,
            salted: credentials.salted_sha1.clone(),
            server_signature: None,
            sent_final: false,
        }
    }

    fn initial(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>> {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;

        if self.sent_final {
            bail!("unexpected extra SCRAM challenge");
        }
        let server_first = std::str::from_utf8(challenge)
            .map_err(|_| anyhow!("non-UTF-8 SCRAM challenge"))?
            .to_string();
        let (combined_nonce, salt_b64, iterations) = parse_server_first(&server_first)?;

        if !combined_nonce.starts_with(&self.client_nonce) {
            bail!("server nonce does not extend client nonce");
        }

        let salt = b64.decode(&salt_b64)?;
        if self.salted.is_none() {
            let mut salted = [0u8; 20];
            pbkdf2::pbkdf2_hmac::<Sha1>(
                self.password.as_bytes(),
                &salt,
                iterations,
                &mut salted,
            );
            self.salted = Some(salted.to_vec());
        }
        let salted = self.salted.as_ref().unwrap();

        let client_key = hmac_sha1(salted, b"Client Key");
        let stored_key = Sha1::digest(&client_key);

        let channel_binding = b64.encode(b"n,,");
        let client_final_without_proof =
            format!("c={channel_binding},r={combined_nonce}");
        let auth_message = format!(
            "{},{server_first},{client_final_without_proof}",
            self.client_first_bare
        );

        let client_signature = hmac_sha1(&stored_key, auth_message.as_bytes());
        let client_proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let server_key = hmac_sha1(salted, b"Server Key");
        self.server_signature = Some(hmac_sha1(&server_key, auth_message.as_bytes()));
        self.sent_final = true;

        Ok(format!(
            "{client_final_without_proof},p={}",
            b64.encode(&client_proof)
        )
        .into_bytes())
    }

    fn check_success(&mut self, data: &[u8]) -> Result<()> {
        use base64::Engine;
        let b64 = base64::engine::general_purpose::STANDARD;

        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| anyhow!("SCRAM success before client-final"))?;
        let text = std::str::from_utf8(data)
            .map_err(|_| anyhow!("non-UTF-8 SCRAM server-final"))?;
        let signature = text
            .split(',')
            .find_map(|part| part.strip_prefix("v="))
            .ok_or_else(|| anyhow!("missing server signature in: {text}"))?;
        if b64.decode(signature)? != *expected {
            bail!("SCRAM server signature mismatch (server does not know the password)");
        }
        Ok(())
    }
}

/// Parses SCRAM server-first-message: r=nonce,s=salt,i=iterations
fn parse_server_first(msg: &str) -> Result<(String, String, u32)> {
    let mut nonce = None;
    let mut salt = None;
    let mut iterations = None;

    for part in msg.split(',') {
        if let Some(val) = part.strip_prefix("r=") {
            nonce = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("s=") {
            salt = Some(val.to_string());
        } else if let Some(val) = part.strip_prefix("i=") {
            iterations = Some(val.parse::<u32>()?);
        }
    }

    Ok((
        nonce.ok_or_else(|| anyhow!("missing nonce in server-first"))?,
        salt.ok_or_else(|| anyhow!("missing salt in server-first"))?,
        iterations.ok_or_else(|| anyhow!("missing iterations in server-first"))?,
    ))
}
