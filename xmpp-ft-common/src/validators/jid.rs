//! JID validation
//!
//! Structural checks for `node@domain/resource` addresses. Full stringprep
//! is left to the XMPP stream layer; this only rejects what would corrupt
//! stanza routing or the SOCKS5 destination hash.

/// Maximum length of the node part in bytes
pub const MAX_NODE_LENGTH: usize = 1023;

/// Maximum length of the domain part in bytes
pub const MAX_DOMAIN_LENGTH: usize = 1023;

/// Maximum length of the resource part in bytes
pub const MAX_RESOURCE_LENGTH: usize = 1023;

/// Characters that may not appear in a node part
const FORBIDDEN_NODE_CHARS: &[char] = &['"', '&', '\'', '/', ':', '<', '>', '@'];

/// Validation error for JIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JidError {
    /// JID is empty
    Empty,
    /// Domain part is missing
    EmptyDomain,
    /// `@` present with nothing before it
    EmptyNode,
    /// `/` present with nothing after it
    EmptyResource,
    /// One of the parts exceeds its maximum length
    TooLong,
    /// Whitespace, control or forbidden characters
    InvalidCharacters,
}

/// Split a JID string into node, domain and resource without validating
pub(crate) fn split_jid_parts(jid: &str) -> (Option<&str>, &str, Option<&str>) {
    let (bare, resource) = match jid.split_once('/') {
        Some((bare, resource)) => (bare, Some(resource)),
        None => (jid, None),
    };
    match bare.split_once('@') {
        Some((node, domain)) => (Some(node), domain, resource),
        None => (None, bare, resource),
    }
}

/// Validate a JID
///
/// Checks:
/// - Not empty, non-empty domain
/// - Node and resource, when delimited, are non-empty
/// - Each part at most 1023 bytes
/// - No whitespace or control characters in node or domain
/// - No `"&'/:<>@` in the node
///
/// # Errors
///
/// Returns a `JidError` variant describing the validation failure.
pub fn validate_jid(jid: &str) -> Result<(), JidError> {
    if jid.is_empty() {
        return Err(JidError::Empty);
    }
    let (node, domain, resource) = split_jid_parts(jid);

    if domain.is_empty() {
        return Err(JidError::EmptyDomain);
    }
    if domain.len() > MAX_DOMAIN_LENGTH {
        return Err(JidError::TooLong);
    }
    if domain.chars().any(|ch| ch.is_whitespace() || ch.is_control() || ch == '@') {
        return Err(JidError::InvalidCharacters);
    }

    if let Some(node) = node {
        if node.is_empty() {
            return Err(JidError::EmptyNode);
        }
        if node.len() > MAX_NODE_LENGTH {
            return Err(JidError::TooLong);
        }
        if node
            .chars()
            .any(|ch| ch.is_whitespace() || ch.is_control() || FORBIDDEN_NODE_CHARS.contains(&ch))
        {
            return Err(JidError::InvalidCharacters);
        }
    }

    if let Some(resource) = resource {
        if resource.is_empty() {
            return Err(JidError::EmptyResource);
        }
        if resource.len() > MAX_RESOURCE_LENGTH {
            return Err(JidError::TooLong);
        }
        if resource.chars().any(char::is_control) {
            return Err(JidError::InvalidCharacters);
        }
    }

    Ok(())
}
