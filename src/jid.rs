/// Jabber Identifiers (RFC 6122).
///
/// A JID is `localpart@domainpart[/resourcepart]`. We keep the raw
/// string plus the offsets of the separators, so formatting a parsed
/// JID reproduces the input byte for byte.
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};

/// Characters that terminate a part. `@` and `/` are separators,
/// the rest are forbidden by the address format.
const FORBIDDEN: &[char] = &['<', '>', '\'', '"', '@', '/'];

/// A parsed JID. Always has local and domain parts; the resource is
/// optional (a JID without one is a *bare* JID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: String,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Builds a bare JID from its two parts.
    pub fn bare(local: &str, domain: &str) -> Result<Self> {
        check_part(local)?;
        check_part(domain)?;
        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
            resource: None,
        })
    }

    /// Builds a full JID from its three parts.
    pub fn full(local: &str, domain: &str, resource: &str) -> Result<Self> {
        check_part(local)?;
        check_part(domain)?;
        check_part(resource)?;
        Ok(Self {
            local: local.to_string(),
            domain: domain.to_string(),
            resource: Some(resource.to_string()),
        })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// Strips the resource, if any.
    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Returns a new JID with the given resource attached.
    pub fn with_resource(&self, resource: &str) -> Result<Jid> {
        check_part(resource)?;
        Ok(Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        })
    }
}

/// Strips everything after the first `/` of a raw address. Works on
/// unparsed strings so it can be applied to `from` attributes as-is.
pub fn bare_of(address: &str) -> &str {
    match address.find('/') {
        Some(pos) => &address[..pos],
        None => address,
    }
}

fn check_part(part: &str) -> Result<()> {
    if part.is_empty() {
        return Err(anyhow!("empty JID part"));
    }
    if let Some(c) = part
        .chars()
        .find(|c| c.is_whitespace() || FORBIDDEN.contains(c))
    {
        return Err(anyhow!("forbidden character {c:?} in JID part {part:?}"));
    }
    Ok(())
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let at = s
            .find('@')
            .ok_or_else(|| anyhow!("invalid JID (missing @): {s}"))?;
        let local = &s[..at];
        let rest = &s[at + 1..];
        match rest.find('/') {
            Some(slash) => Jid::full(local, &rest[..slash], &rest[slash + 1..]),
            None => Jid::bare(local, rest),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare() {
        let jid: Jid = "alice@example.org".parse().unwrap();
        assert_eq!(jid.local(), "alice");
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), None);
        assert!(!jid.is_full());
    }

    #[test]
    fn test_parse_full() {
        let jid: Jid = "alice@example.org/mobile".parse().unwrap();
        assert_eq!(jid.local(), "alice");
        assert_eq!(jid.domain(), "example.org");
        assert_eq!(jid.resource(), Some("mobile"));
        assert!(jid.is_full());
    }

    #[test]
    fn test_roundtrip_reproduces_input() {
        for s in ["bob@x.net", "bob@x.net/laptop", "a@b/c"] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
        }
    }

    #[test]
    fn test_missing_at_rejected() {
        assert!("example.org".parse::<Jid>().is_err());
    }

    #[test]
    fn test_forbidden_characters_rejected() {
        assert!("al ice@example.org".parse::<Jid>().is_err());
        assert!("alice@exa<mple.org".parse::<Jid>().is_err());
        assert!("alice@example.org/re'source".parse::<Jid>().is_err());
        assert!("al\"ice@example.org".parse::<Jid>().is_err());
    }

    #[test]
    fn test_empty_parts_rejected() {
        assert!("@example.org".parse::<Jid>().is_err());
        assert!("alice@".parse::<Jid>().is_err());
        assert!("alice@example.org/".parse::<Jid>().is_err());
    }

    #[test]
    fn test_extra_separators_rejected() {
        // The second @ lands inside the domain part
        assert!("alice@b@c".parse::<Jid>().is_err());
    }

    #[test]
    fn test_to_bare() {
        let jid: Jid = "alice@example.org/mobile".parse().unwrap();
        assert_eq!(jid.to_bare().to_string(), "alice@example.org");
    }

    #[test]
    fn test_bare_of_idempotent() {
        for s in ["a@b/c", "a@b", "a@b/c/d"] {
            assert_eq!(bare_of(bare_of(s)), bare_of(s));
        }
        assert_eq!(bare_of("a@b/c"), "a@b");
        assert_eq!(bare_of("a@b"), "a@b");
    }

    #[test]
    fn test_with_resource() {
        let jid: Jid = "alice@example.org".parse().unwrap();
        let full = jid.with_resource("pc").unwrap();
        assert_eq!(full.to_string(), "alice@example.org/pc");
        assert!(jid.with_resource("a/b").is_err());
    }
}
