//! Authentication headers for calls made to the remote system.

use crate::config::ConfigError;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue};
use std::fmt;
use std::str::FromStr;

/// Supported HTTP authentication methods.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
}

impl AuthMethod {
    pub const ALL: &'static [AuthMethod] = &[AuthMethod::Basic];

    pub const fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Basic => "basic",
        }
    }

    pub fn headers(&self, username: &str, password: &str) -> Result<HeaderMap, ConfigError> {
        let mut headers = HeaderMap::new();
        match self {
            AuthMethod::Basic => {
                let encoded = STANDARD.encode(format!("{username}:{password}"));
                let value = HeaderValue::from_str(&format!("Basic {encoded}"))
                    .map_err(|_| ConfigError::InvalidCredentials)?;
                headers.insert(AUTHORIZATION, value);
            }
        }
        Ok(headers)
    }
}

impl FromStr for AuthMethod {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        AuthMethod::ALL
            .iter()
            .find(|method| method.as_str() == name)
            .copied()
            .ok_or_else(|| ConfigError::UnsupportedAuthMethod(name.to_string()))
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the headers for `method_name`.
///
/// The method is checked before the username, so a misconfigured method is
/// reported even when no credentials are set. No username means no
/// authentication and an empty header map. A missing password is sent as
/// the empty string.
pub fn sign(
    method_name: &str,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<HeaderMap, ConfigError> {
    let method: AuthMethod = method_name.parse()?;
    match username {
        Some(username) => method.headers(username, password.unwrap_or_default()),
        None => Ok(HeaderMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_basic(headers: &HeaderMap) -> String {
        let value = headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        let encoded = value.strip_prefix("Basic ").unwrap();
        String::from_utf8(STANDARD.decode(encoded).unwrap()).unwrap()
    }

    #[test]
    fn test_basic_auth_header() {
        let headers = sign("basic", Some("u"), Some("p")).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(decode_basic(&headers), "u:p");
    }

    #[test]
    fn test_basic_auth_non_ascii() {
        let headers = sign("basic", Some("üser"), Some("pässword")).unwrap();
        assert_eq!(decode_basic(&headers), "üser:pässword");
    }

    #[test]
    fn test_missing_password_is_empty() {
        let headers = sign("basic", Some("u"), None).unwrap();
        assert_eq!(decode_basic(&headers), "u:");
    }

    #[test]
    fn test_no_username_no_headers() {
        let headers = sign("basic", None, Some("p")).unwrap();
        assert!(headers.is_empty());
    }

    #[test]
    fn test_unknown_method() {
        assert_eq!(
            sign("digest", Some("u"), Some("p")).unwrap_err(),
            ConfigError::UnsupportedAuthMethod("digest".into())
        );
        // Reported even without credentials
        assert!(sign("digest", None, None).is_err());
    }

    #[test]
    fn test_registry_round_trip() {
        for method in AuthMethod::ALL {
            assert_eq!(method.as_str().parse::<AuthMethod>().unwrap(), *method);
        }
    }
}
