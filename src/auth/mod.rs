//! Proxy authentication

use crate::config::AuthConfig;
use crate::http::RequestHead;
use base64::Engine;

/// Validates proxy credentials.
pub trait ProxyAuthenticator: Send + Sync {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// Authenticator backed by a single configured username/password pair.
pub struct BasicAuthenticator {
    username: String,
    password: String,
}

impl BasicAuthenticator {
    pub fn new(config: &AuthConfig) -> Self {
        BasicAuthenticator {
            username: config.username.clone(),
            password: config.password.clone(),
        }
    }
}

impl ProxyAuthenticator for BasicAuthenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        username == self.username && password == self.password
    }
}

/// Extract the credentials of a `Proxy-Authorization: Basic …` header.
pub fn parse_basic_credentials(request: &RequestHead) -> Option<(String, String)> {
    let value = request.headers.get("Proxy-Authorization")?;
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let creds = String::from_utf8(decoded).ok()?;
    let colon = creds.find(':')?;
    Some((creds[..colon].to_string(), creds[colon + 1..].to_string()))
}

/// Build a `Basic …` header value for outbound credentials.
pub fn basic_header(username: &str, password: &str) -> String {
    let credentials = format!("{}:{}", username, password);
    let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
    format!("Basic {}", encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Version;

    #[test]
    fn test_parse_basic_credentials() {
        let mut req = RequestHead::new("GET", "/", Version::Http11);
        // user:pass
        req.headers
            .set("Proxy-Authorization", "Basic dXNlcjpwYXNz");
        let (user, pass) = parse_basic_credentials(&req).unwrap();
        assert_eq!(user, "user");
        assert_eq!(pass, "pass");
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        let mut req = RequestHead::new("GET", "/", Version::Http11);
        req.headers.set("Proxy-Authorization", "Bearer token");
        assert!(parse_basic_credentials(&req).is_none());

        let bare = RequestHead::new("GET", "/", Version::Http11);
        assert!(parse_basic_credentials(&bare).is_none());
    }

    #[test]
    fn test_basic_header_roundtrip() {
        let header = basic_header("user", "pass");
        assert_eq!(header, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_authenticator() {
        let auth = BasicAuthenticator::new(&AuthConfig {
            username: "user".to_string(),
            password: "pass".to_string(),
        });
        assert!(auth.authenticate("user", "pass"));
        assert!(!auth.authenticate("user", "wrong"));
    }
}
