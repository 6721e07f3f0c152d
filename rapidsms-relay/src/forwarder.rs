use crate::config::{ConfigContext, ConfigError, ConfigResolver};
use crate::message::Message;
use crate::metrics_defs::FORWARD_REQUESTS;
use crate::signer::sign;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use shared::counter;
use std::sync::Arc;

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("could not serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Relays backbone messages to the remote system's HTTP backend.
///
/// Settings are resolved for every message, so the URL, method and
/// credentials may differ per routing context. One attempt is made per
/// message and nothing is retried.
#[derive(Clone)]
pub struct RemoteForwarder {
    client: reqwest::Client,
    resolver: Arc<dyn ConfigResolver>,
}

impl RemoteForwarder {
    pub fn new(resolver: Arc<dyn ConfigResolver>) -> Self {
        Self::with_client(reqwest::Client::new(), resolver)
    }

    pub fn with_client(client: reqwest::Client, resolver: Arc<dyn ConfigResolver>) -> Self {
        Self { client, resolver }
    }

    /// Sends `message` as the JSON request body and returns the remote status.
    pub async fn forward(&self, message: &Message) -> Result<StatusCode, ForwardError> {
        let settings = self
            .resolver
            .resolve(&ConfigContext::for_message(message))
            .await?;

        let headers = sign(
            &settings.rapidsms_auth_method,
            settings.rapidsms_username.as_deref(),
            settings.rapidsms_password.as_deref(),
        )?;
        let url = settings.remote_url()?.clone();
        let method = settings.http_method()?;
        let body = serde_json::to_vec(message)?;

        let response = self
            .client
            .request(method, url)
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        Ok(response.status())
    }

    /// Like [`RemoteForwarder::forward`], but the outcome only ends up in the
    /// logs and metrics.
    pub async fn forward_and_log(&self, message: &Message) {
        match self.forward(message).await {
            Ok(status) if status.is_success() => {
                counter!(FORWARD_REQUESTS, "outcome" => "ok").increment(1);
                tracing::info!(
                    message_id = %message.message_id,
                    status = status.as_u16(),
                    "forwarded message to rapidsms"
                );
            }
            Ok(status) => {
                counter!(FORWARD_REQUESTS, "outcome" => "rejected").increment(1);
                tracing::warn!(
                    message_id = %message.message_id,
                    status = status.as_u16(),
                    "rapidsms rejected forwarded message"
                );
            }
            Err(e) => {
                counter!(FORWARD_REQUESTS, "outcome" => "error").increment(1);
                tracing::error!(
                    message_id = %message.message_id,
                    error = %e,
                    "failed to forward message to rapidsms"
                );
            }
        }
    }
}
