use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::sasl::{Credentials, MechanismPolicy};

/// Connection and policy settings for one client account.
///
/// Every field except `host` and `user` has a working default, so a
/// minimal TOML section is just the account coordinates.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Account localpart.
    pub user: String,
    /// Plaintext password. May be empty when `password_hash` is set.
    #[serde(default)]
    pub password: String,
    /// Hex salted password recorded from an earlier SCRAM-SHA-1
    /// exchange; used instead of the plaintext when `hash_method`
    /// matches the negotiated mechanism.
    #[serde(default)]
    pub password_hash: Option<String>,
    #[serde(default)]
    pub hash_method: Option<String>,
    /// XMPP domain when it differs from `host`.
    #[serde(default)]
    pub domain: Option<String>,
    /// Requested resource; the server assigns one when omitted.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Accept certificates that fail policy validation (dev servers).
    #[serde(default)]
    pub trust_server: bool,

    #[serde(default)]
    pub allow_plain: bool,
    #[serde(default = "default_true")]
    pub allow_cram_md5: bool,
    #[serde(default = "default_true")]
    pub allow_digest_md5: bool,
    #[serde(default = "default_true")]
    pub allow_scram_sha1: bool,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_seconds: u64,
    #[serde(default = "default_retry_timeout")]
    pub default_retry_timeout_ms: u64,
    #[serde(default = "default_nr_retries")]
    pub default_nr_retries: u32,
    #[serde(default = "default_true")]
    pub default_drop_off: bool,
    /// Ceiling for the doubling retry interval; None means unbounded.
    #[serde(default)]
    pub default_max_retry_timeout_ms: Option<u64>,

    #[serde(default = "default_max_assured_per_source")]
    pub max_assured_messages_pending_from_source: usize,
    #[serde(default = "default_max_assured_total")]
    pub max_assured_messages_pending_total: usize,

    #[serde(default = "default_true")]
    pub request_roster_on_startup: bool,
    /// Fall back to in-band registration when authentication fails.
    #[serde(default)]
    pub allow_registration: bool,

    #[serde(default)]
    pub form_signature_key: Option<String>,
    #[serde(default)]
    pub form_signature_secret: Option<String>,
}

fn default_port() -> u16 {
    5222
}

fn default_language() -> String {
    "en".to_string()
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    30
}

fn default_retry_timeout() -> u64 {
    2000
}

fn default_nr_retries() -> u32 {
    5
}

fn default_max_assured_per_source() -> usize {
    5
}

fn default_max_assured_total() -> usize {
    100
}

impl ClientConfig {
    /// Loads a bare config file (the whole document is the client
    /// section).
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// The XMPP domain: explicit setting, else the host name.
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }

    /// The account's bare address.
    pub fn bare_jid(&self) -> String {
        format!("{}@{}", self.user, self.domain())
    }

    pub fn mechanism_policy(&self) -> MechanismPolicy {
        MechanismPolicy {
            allow_plain: self.allow_plain,
            allow_cram_md5: self.allow_cram_md5,
            allow_digest_md5: self.allow_digest_md5,
            allow_scram_sha1: self.allow_scram_sha1,
        }
    }

    pub fn credentials(&self) -> Credentials {
        let salted_sha1 = match (&self.password_hash, self.hash_method.as_deref()) {
            (Some(hash), Some("SCRAM-SHA-1")) => hex::decode(hash).ok(),
            _ => None,
        };
        Credentials {
            username: self.user.clone(),
            password: self.password.clone(),
            domain: self.domain().to_string(),
            salted_sha1,
        }
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.default_retry_timeout_ms)
    }

    pub fn max_retry_timeout(&self) -> Option<Duration> {
        self.default_max_retry_timeout_ms.map(Duration::from_millis)
    }
}
