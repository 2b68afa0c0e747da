// src/sys/validate.rs
//
// 🛡️ Zero-Trust: every identifier that reaches a zone file, an admin shell
// script or a docker argv passes through here first.

use crate::error::BackendError;

/// Environment usernames are lowercase ASCII alphanumerics only.
pub fn validate_username(username: &str) -> Result<(), BackendError> {
    if username.is_empty() {
        return Err(BackendError::invalid("username cannot be empty"));
    }
    if username.len() > 32 {
        return Err(BackendError::invalid(format!("username '{}' is longer than 32 characters", username)));
    }
    if !username.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()) {
        return Err(BackendError::invalid(format!(
            "username '{}' must be lowercase alphanumeric",
            username
        )));
    }
    Ok(())
}

/// Strictly validates hostnames to prevent zone-file injection.
pub fn validate_hostname(hostname: &str) -> Result<(), BackendError> {
    if hostname.is_empty() {
        return Err(BackendError::invalid("hostname cannot be empty"));
    }
    if hostname.contains("..") || hostname.contains('/') || hostname.contains('\\') {
        return Err(BackendError::invalid(format!("path traversal detected in hostname: '{}'", hostname)));
    }
    if hostname.starts_with('.') || hostname.ends_with('.') || hostname.starts_with('-') {
        return Err(BackendError::invalid(format!("malformed hostname: '{}'", hostname)));
    }
    // Alphanumerics, dots and hyphens. Everything else (spaces, quotes,
    // newlines, '=') could splice a second directive into the config.
    if !hostname.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-') {
        return Err(BackendError::invalid(format!("invalid characters in hostname: '{}'", hostname)));
    }
    Ok(())
}
