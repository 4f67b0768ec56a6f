//! HTTP client for the master registry API

use std::time::Duration;

use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::server::{
    CreateInvite, InviteCreated, InviteValidation, Registered, StatusReply, ValidateInvite,
};
use super::session::{ServerFilter, SessionDescriptor, SessionUpdate};
use super::store::RegistryStats;

/// Timeout for registry requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors talking to the master registry
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status}: {message}")]
    Status { status: StatusCode, message: String },
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Client for a master registry at `base_url`
#[derive(Debug, Clone)]
pub struct MasterClient {
    base_url: String,
    http: reqwest::Client,
}

impl MasterClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// List live sessions matching `filter`
    pub async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<SessionDescriptor>, ClientError> {
        let response = self
            .http
            .get(self.url("/api/servers"))
            .query(&filter.to_query())
            .send()
            .await?;
        parse(response).await
    }

    /// Register a session and return its id
    pub async fn register(&self, session: &SessionDescriptor) -> Result<String, ClientError> {
        let response = self
            .http
            .post(self.url("/api/servers"))
            .json(session)
            .send()
            .await?;
        let registered: Registered = parse(response).await?;
        debug!("Registered as {}", registered.server_id);
        Ok(registered.server_id)
    }

    /// Keep a session alive, optionally updating name, player count or map
    pub async fn heartbeat(&self, server_id: &str, update: &SessionUpdate) -> Result<(), ClientError> {
        let response = self
            .http
            .put(self.url(&format!("/api/servers/{}", server_id)))
            .json(update)
            .send()
            .await?;
        let _: StatusReply = parse(response).await?;
        Ok(())
    }

    pub async fn unregister(&self, server_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/servers/{}", server_id)))
            .send()
            .await?;
        let _: StatusReply = parse(response).await?;
        Ok(())
    }

    /// Issue an invite code for a session
    pub async fn create_invite(
        &self,
        server_id: &str,
        steam_id: Option<&str>,
        expires_minutes: Option<i64>,
    ) -> Result<String, ClientError> {
        let body = CreateInvite {
            server_id: Some(server_id.to_string()),
            steam_id: steam_id.map(str::to_string),
            expires: expires_minutes.map(Value::from),
            max_uses: None,
        };
        let response = self
            .http
            .post(self.url("/api/invite/create"))
            .json(&body)
            .send()
            .await?;
        let created: InviteCreated = parse(response).await?;
        Ok(created.code)
    }

    /// Redeem an invite code; `None` when it is not valid
    pub async fn validate_invite(
        &self,
        code: &str,
        steam_id: Option<&str>,
    ) -> Result<Option<SessionDescriptor>, ClientError> {
        let body = ValidateInvite {
            code: Some(code.to_string()),
            steam_id: steam_id.map(str::to_string),
        };
        let response = self
            .http
            .post(self.url("/api/invite/validate"))
            .json(&body)
            .send()
            .await?;
        let validation: InviteValidation = parse(response).await?;
        Ok(validation.server.filter(|_| validation.valid))
    }

    pub async fn stats(&self) -> Result<RegistryStats, ClientError> {
        let response = self.http.get(self.url("/api/stats")).send().await?;
        parse(response).await
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_default();
        return Err(ClientError::Status { status, message });
    }
    Ok(response.json().await?)
}
