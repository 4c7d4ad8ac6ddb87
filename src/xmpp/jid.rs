use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

/// The literal that makes a JID component match anything when the JID is
/// used as a route pattern. Never valid in a JID that appears on the wire.
pub const WILDCARD: &str = "*";

#[derive(thiserror::Error, Debug)]
pub enum JidError {
    #[error("malformed JID: {0:?}")]
    Malformed(String),
}

/// A Jabber identifier, `local@domain/resource` with optional local and
/// resource parts. Equality and hashing are componentwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    local: Option<String>,
    domain: String,
    resource: Option<String>,
}

fn jid_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new("^(?:(?P<local>[^@/]+)@)?(?P<domain>[^@/]+)(?:/(?P<resource>.+))?$").unwrap()
    })
}

impl Jid {
    pub fn new(local: Option<&str>, domain: &str, resource: Option<&str>) -> Self {
        Self {
            local: local.map(|s| s.to_string()),
            domain: domain.to_string(),
            resource: resource.map(|s| s.to_string()),
        }
    }

    pub fn local(&self) -> Option<&str> {
        self.local.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    pub fn to_bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: &str) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_string()),
        }
    }

    /// Wildcard match of `self`, a route pattern, against an on-wire
    /// target. A `"*"` component matches a present or absent counterpart;
    /// an absent pattern component matches only an absent one. The
    /// pattern's resource is not consulted for a bare target, so a stanza
    /// addressed to a bare JID reaches the route of whichever resource is
    /// bound under it.
    pub fn matches(&self, target: &Jid) -> bool {
        if self.domain != WILDCARD && self.domain != target.domain {
            return false;
        }

        match (self.local.as_deref(), target.local.as_deref()) {
            (Some(WILDCARD), _) => {}
            (Some(pattern), Some(local)) if pattern == local => {}
            (None, None) => {}
            _ => return false,
        }

        if target.resource.is_none() {
            return true;
        }

        match (self.resource.as_deref(), target.resource.as_deref()) {
            (Some(WILDCARD), _) => true,
            (Some(pattern), Some(resource)) => pattern == resource,
            _ => false,
        }
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = jid_regex()
            .captures(s)
            .ok_or_else(|| JidError::Malformed(s.to_string()))?;

        let local = captures.name("local").map(|m| m.as_str().to_string());
        let domain = captures
            .name("domain")
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| JidError::Malformed(s.to_string()))?;
        let resource = captures.name("resource").map(|m| m.as_str().to_string());

        Ok(Jid {
            local,
            domain,
            resource,
        })
    }
}

impl Display for Jid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(local) = &self.local {
            write!(f, "{}@", local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}
