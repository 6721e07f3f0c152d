//! Caller authentication for the send endpoint.

use crate::config::{ConfigContext, ConfigError, ConfigResolver, RelaySettings};
use crate::signer::AuthMethod;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderMap;
use http::header::{AUTHORIZATION, HeaderValue};
use std::sync::Arc;
use subtle::ConstantTimeEq;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
    /// Deliberately says nothing about which part of the credentials was wrong.
    #[error("unauthorized")]
    Unauthorized,
    #[error("malformed credentials")]
    Malformed,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Anonymous,
    UsernamePassword { username: String, password: String },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Anonymous => f.write_str("Anonymous"),
            Credentials::UsernamePassword { username, .. } => f
                .debug_struct("UsernamePassword")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

impl Credentials {
    /// Reads credentials from the `Authorization` header. No header means
    /// anonymous; any scheme other than Basic is malformed.
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, AuthError> {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Ok(Credentials::Anonymous);
        };

        let value = value.to_str().map_err(|_| AuthError::Malformed)?;
        let (scheme, encoded) = value.trim().split_once(' ').ok_or(AuthError::Malformed)?;
        if !scheme.eq_ignore_ascii_case(AuthMethod::Basic.as_str()) {
            return Err(AuthError::Malformed);
        }

        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| AuthError::Malformed)?;
        let decoded = String::from_utf8(decoded).map_err(|_| AuthError::Malformed)?;
        let (username, password) = decoded.split_once(':').ok_or(AuthError::Malformed)?;

        Ok(Credentials::UsernamePassword {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

/// Checks callers against the `vumi_username` / `vumi_password` settings
/// resolved for the caller's username.
#[derive(Clone)]
pub struct AuthGateway {
    resolver: Arc<dyn ConfigResolver>,
}

impl AuthGateway {
    pub fn new(resolver: Arc<dyn ConfigResolver>) -> Self {
        Self { resolver }
    }

    /// Returns the authenticated username, or `None` for an accepted
    /// anonymous caller.
    pub async fn authenticate(&self, credentials: &Credentials) -> Result<Option<String>, AuthError> {
        let username = match credentials {
            Credentials::Anonymous => None,
            Credentials::UsernamePassword { username, .. } => Some(username.as_str()),
        };
        let settings = self
            .resolver
            .resolve(&ConfigContext::for_username(username))
            .await?;

        match settings.vumi_auth_method.parse::<AuthMethod>()? {
            AuthMethod::Basic => check_basic(&settings, credentials),
        }
    }
}

fn check_basic(settings: &RelaySettings, credentials: &Credentials) -> Result<Option<String>, AuthError> {
    match credentials {
        // Anonymous access is allowed only when no username is configured
        Credentials::Anonymous => match settings.vumi_username {
            None => Ok(None),
            Some(_) => Err(AuthError::Unauthorized),
        },
        Credentials::UsernamePassword { username, password } => {
            let username_ok = settings
                .vumi_username
                .as_deref()
                .is_some_and(|expected| bytes_eq(expected, username));
            let password_ok = settings
                .vumi_password
                .as_deref()
                .is_some_and(|expected| bytes_eq(expected, password));

            match username_ok && password_ok {
                true => Ok(Some(username.clone())),
                false => Err(AuthError::Unauthorized),
            }
        }
    }
}

/// Value for the `WWW-Authenticate` challenge sent with a 401.
pub fn challenge() -> HeaderValue {
    HeaderValue::from_static("basic realm=\"RapidSMS Relay\"")
}

fn bytes_eq(expected: &str, given: &str) -> bool {
    expected.as_bytes().ct_eq(given.as_bytes()).into()
}
