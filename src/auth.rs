//! HTTP Basic proxy authentication.

use std::collections::HashMap;

use base64::Engine;

/// Validates proxy credentials. Presence of an authenticator on the proxy is
/// what switches the 407 gate on.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;

    /// Realm advertised in `Proxy-Authenticate`.
    fn realm(&self) -> &str {
        "Restricted Files"
    }
}

/// Fixed user/password table from the config file.
pub struct StaticUserAuthenticator {
    users: HashMap<String, String>,
}

impl StaticUserAuthenticator {
    pub fn new(users: HashMap<String, String>) -> StaticUserAuthenticator {
        StaticUserAuthenticator { users }
    }
}

impl ProxyAuthenticator for StaticUserAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.users.get(username).map(String::as_str) == Some(password)
    }
}

/// Decode a `Proxy-Authorization: Basic <b64>` value into user and password.
pub fn parse_basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.trim().strip_prefix("Basic ")?.trim();
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_basic_credentials() {
        // "user:pass"
        assert_eq!(
            parse_basic_credentials("Basic dXNlcjpwYXNz"),
            Some(("user".into(), "pass".into()))
        );
    }

    #[test]
    fn rejects_other_schemes() {
        assert_eq!(parse_basic_credentials("Digest abc"), None);
        assert_eq!(parse_basic_credentials("Basic !!!"), None);
    }

    #[test]
    fn static_table_checks_both_fields() {
        let auth = StaticUserAuthenticator::new(
            [("user".to_string(), "pass".to_string())].into_iter().collect(),
        );
        assert!(auth.authenticate("user", "pass"));
        assert!(!auth.authenticate("user", "nope"));
        assert!(!auth.authenticate("other", "pass"));
    }
}
