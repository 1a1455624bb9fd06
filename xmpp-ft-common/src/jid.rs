//! XMPP addresses
//!
//! A parsed `node@domain/resource` triple. Domains compare case-insensitively
//! and are stored lowercased; node and resource are kept as given.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::validators::{JidError, validate_jid};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Parse and validate a JID string
    ///
    /// # Errors
    ///
    /// Returns the `JidError` from validation.
    pub fn parse(s: &str) -> Result<Self, JidError> {
        validate_jid(s)?;
        let (node, domain, resource) = crate::validators::split_jid_parts(s);
        Ok(Self {
            node: node.map(str::to_string),
            domain: domain.to_lowercase(),
            resource: resource.map(str::to_string),
        })
    }

    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// True when a resource is present
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// The same address without its resource
    #[must_use]
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Compare ignoring resources
    #[must_use]
    pub fn same_bare(&self, other: &Jid) -> bool {
        self.node == other.node && self.domain == other.domain
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

impl fmt::Display for JidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Empty => "empty address",
            Self::EmptyDomain => "missing domain",
            Self::EmptyNode => "empty node before '@'",
            Self::EmptyResource => "empty resource after '/'",
            Self::TooLong => "address part too long",
            Self::InvalidCharacters => "address contains invalid characters",
        };
        f.write_str(text)
    }
}

impl std::error::Error for JidError {}
