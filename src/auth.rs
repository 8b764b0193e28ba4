/*!
 * # Authentication Module
 *
 * Validates `Proxy-Authorization: Basic` headers against a single fixed
 * credential pair.
 */

use std::collections::HashMap;

use base64::Engine;

use crate::error::{ProxyError, Result};

/// Proxy authentication against one configured credential pair
#[derive(Debug, Clone)]
pub struct ProxyAuth {
    username: String,
    password: String,
}

impl ProxyAuth {
    /// Create an authenticator
    ///
    /// Both fields must be non-empty; construction fails with
    /// `InvalidCredential` otherwise.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let username = username.into();
        let password = password.into();
        if username.is_empty() || password.is_empty() {
            return Err(ProxyError::InvalidCredential);
        }
        Ok(Self { username, password })
    }

    /// True iff both values are non-empty and match the configured pair
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        self.username == username && self.password == password
    }

    /// Check a parsed header map for a valid Basic authorization
    ///
    /// The scheme token is matched case-insensitively; the parameter must
    /// Base64-decode to UTF-8 text of the form `user:pass`. Any decoding
    /// error yields false.
    pub fn is_authorized(&self, headers: &HashMap<String, String>) -> bool {
        let Some(auth_header) = headers.get("Proxy-Authorization") else {
            return false;
        };

        let (scheme, param) = match auth_header.split_once(' ') {
            Some(parts) => parts,
            None => return false,
        };
        if !scheme.eq_ignore_ascii_case("basic") || param.is_empty() {
            return false;
        }

        let decoded = match base64::engine::general_purpose::STANDARD.decode(param) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let decoded = match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(_) => return false,
        };

        let (username, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
        self.authenticate(username, password)
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}
