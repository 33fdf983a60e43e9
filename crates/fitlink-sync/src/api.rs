//! Consumed REST endpoints.
//!
//! The resource services (invitations, lobby state, groups) live outside
//! this layer; [`FitnessApi`] specifies them at the interface boundary and
//! [`HttpFitnessApi`] is the production implementation.  Tests substitute
//! in-memory mocks.

use async_trait::async_trait;
use serde::Deserialize;

use fitlink_shared::error::ApiError;
use fitlink_shared::invitation::Invitation;
use fitlink_shared::types::{GroupId, InvitationId, LobbyState, SessionId};

/// Returned by a successful accept; the UI navigates into this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub group_id: GroupId,
}

/// The external REST collaborators consumed by the coordination layer.
#[async_trait]
pub trait FitnessApi: Send + Sync {
    /// Currently-pending invitations for this user.  Authoritative for
    /// queue reconciliation.
    async fn fetch_pending_invitations(&self) -> Result<Vec<Invitation>, ApiError>;

    async fn accept_invitation(&self, id: InvitationId) -> Result<SessionHandle, ApiError>;

    async fn decline_invitation(&self, id: InvitationId) -> Result<(), ApiError>;

    async fn fetch_lobby_state(&self, session_id: SessionId) -> Result<LobbyState, ApiError>;

    /// Groups the user belongs to; derives the initial channel set.
    async fn fetch_user_groups(&self) -> Result<Vec<GroupId>, ApiError>;
}

/// Production client over `reqwest` with bearer auth.
pub struct HttpFitnessApi {
    http: reqwest::Client,
    base_url: String,
    bearer: String,
}

#[derive(Debug, Deserialize)]
struct AcceptResponse {
    session_id: SessionId,
    group_id: GroupId,
}

#[derive(Debug, Deserialize)]
struct GroupsResponse {
    groups: Vec<GroupId>,
}

impl HttpFitnessApi {
    pub fn new(base_url: impl Into<String>, bearer: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            bearer: bearer.into(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.bearer)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        decode_response(response).await
    }

    async fn post_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        decode_response(response).await
    }
}

async fn decode_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            code: status.as_u16(),
            message,
        });
    }
    response
        .json::<T>()
        .await
        .map_err(|e| ApiError::Decode(e.to_string()))
}

#[async_trait]
impl FitnessApi for HttpFitnessApi {
    async fn fetch_pending_invitations(&self) -> Result<Vec<Invitation>, ApiError> {
        self.get_json("/workouts/invitations/pending").await
    }

    async fn accept_invitation(&self, id: InvitationId) -> Result<SessionHandle, ApiError> {
        let response: AcceptResponse = self
            .post_json(&format!("/workouts/invitations/{id}/accept"))
            .await?;
        Ok(SessionHandle {
            session_id: response.session_id,
            group_id: response.group_id,
        })
    }

    async fn decline_invitation(&self, id: InvitationId) -> Result<(), ApiError> {
        let url = format!("{}/workouts/invitations/{id}/decline", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer)
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                code: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn fetch_lobby_state(&self, session_id: SessionId) -> Result<LobbyState, ApiError> {
        self.get_json(&format!("/workouts/lobbies/{session_id}")).await
    }

    async fn fetch_user_groups(&self) -> Result<Vec<GroupId>, ApiError> {
        let response: GroupsResponse = self.get_json("/groups/mine").await?;
        Ok(response.groups)
    }
}
