//! Credential and channel-auth seams.
//!
//! Token acquisition itself belongs to the external auth service; this
//! module only consumes a bearer credential and performs the per-channel
//! broadcasting-auth exchange that private/presence subscriptions require.

use async_trait::async_trait;
use serde::Deserialize;

use fitlink_shared::error::TransportError;
use fitlink_shared::types::UserId;

/// Supplies the bearer credential used for the WebSocket handshake and the
/// channel auth exchange.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn bearer_token(&self, user_id: UserId) -> Result<String, TransportError>;
}

/// Authorization material for one private/presence channel subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelAuth {
    /// Signature string placed in the `auth` field of the subscribe frame.
    pub auth: String,
    /// Presence channels additionally carry the member payload.
    #[serde(default)]
    pub channel_data: Option<String>,
}

/// Performs the HTTP auth exchange authorizing one channel for one socket.
#[async_trait]
pub trait ChannelAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        socket_id: &str,
        channel_name: &str,
        bearer: &str,
    ) -> Result<ChannelAuth, TransportError>;
}

/// Production authorizer: `POST` to the broadcasting-auth endpoint with the
/// bearer token; the response authorizes that specific channel for this
/// connection.
pub struct BroadcastAuthClient {
    http: reqwest::Client,
    auth_url: String,
}

impl BroadcastAuthClient {
    pub fn new(auth_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_url: auth_url.into(),
        }
    }
}

#[async_trait]
impl ChannelAuthorizer for BroadcastAuthClient {
    async fn authorize(
        &self,
        socket_id: &str,
        channel_name: &str,
        bearer: &str,
    ) -> Result<ChannelAuth, TransportError> {
        let response = self
            .http
            .post(&self.auth_url)
            .bearer_auth(bearer)
            .form(&[("socket_id", socket_id), ("channel_name", channel_name)])
            .send()
            .await
            .map_err(|e| TransportError::AuthExchange {
                status: None,
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::AuthExchange {
                status: Some(status.as_u16()),
                message: format!("auth endpoint rejected channel {channel_name}"),
            });
        }

        response
            .json::<ChannelAuth>()
            .await
            .map_err(|e| TransportError::AuthExchange {
                status: Some(status.as_u16()),
                message: format!("malformed auth response: {e}"),
            })
    }
}
