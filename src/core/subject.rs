//! Channel-name and client-id grammar.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubjectError {
    #[error("invalid channel name {name:?}: {reason}")]
    InvalidChannel { name: String, reason: &'static str },
    #[error("invalid client id {id:?}")]
    InvalidClientId { id: String },
}

/// Validate a channel name against the subject grammar: ASCII dot-separated
/// non-empty tokens, no wildcards, no whitespace.
pub fn validate_channel_name(name: &str) -> Result<(), SubjectError> {
    let fail = |reason| SubjectError::InvalidChannel {
        name: name.to_string(),
        reason,
    };
    if name.is_empty() {
        return Err(fail("empty"));
    }
    if !name.is_ascii() {
        return Err(fail("not ascii"));
    }
    for token in name.split('.') {
        if token.is_empty() {
            return Err(fail("empty token"));
        }
        if token == "*" || token == ">" {
            return Err(fail("wildcard token"));
        }
        if token
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '*' || c == '>')
        {
            return Err(fail("forbidden character"));
        }
    }
    Ok(())
}

/// Client ids must be non-empty and match `[A-Za-z0-9_-]+`.
pub fn validate_client_id(id: &str) -> Result<(), SubjectError> {
    let ok = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if ok {
        Ok(())
    } else {
        Err(SubjectError::InvalidClientId { id: id.to_string() })
    }
}
