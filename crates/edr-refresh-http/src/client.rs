use async_trait::async_trait;
use chrono::Duration;
use edc_edr_core::core::{
    model::edr::{now, CachedEdr, EdrCredential},
    service::refresh::TokenRefresher,
};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::{config::RefreshConfig, model::TokenResponse};

const TOKEN_PATH: &str = "/token";

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Cannot perform token refresh: required property '{0}' not found on EDR {1}")]
    MissingProperty(&'static str, String),
    #[error("Token refresh for EDR {id} rejected with {status}: {body}")]
    Rejected {
        id: String,
        status: StatusCode,
        body: String,
    },
    #[error("Token refresh for EDR {0} returned an empty body")]
    EmptyBody(String),
    #[error("Invalid token response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Refreshes credentials with the OAuth2 style `refresh_token` grant at the
/// provider's refresh endpoint.
#[derive(Clone)]
pub struct HttpTokenRefresher {
    client: Client,
}

impl HttpTokenRefresher {
    pub fn new(cfg: &RefreshConfig) -> Result<Self, RefreshError> {
        let client = Client::builder().timeout(cfg.timeout()).build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub async fn refresh_credential(&self, edr: &CachedEdr) -> Result<EdrCredential, RefreshError> {
        let id = edr.entry.id();
        let credential = &edr.credential;

        if credential.auth_token.is_empty() {
            return Err(RefreshError::MissingProperty("authorization", id.to_string()));
        }
        let refresh_token = credential
            .refresh_token
            .as_deref()
            .ok_or_else(|| RefreshError::MissingProperty("refresh_token", id.to_string()))?;
        let refresh_endpoint = credential
            .refresh_endpoint
            .as_deref()
            .ok_or_else(|| RefreshError::MissingProperty("refresh_endpoint", id.to_string()))?;

        let url = token_url(refresh_endpoint);
        debug!("Refreshing EDR {} at {}", id, url);

        let response = self
            .client
            .post(&url)
            .query(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .bearer_auth(&credential.auth_token)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(RefreshError::Rejected {
                id: id.to_string(),
                status,
                body,
            });
        }
        if body.trim().is_empty() {
            return Err(RefreshError::EmptyBody(id.to_string()));
        }

        let token = serde_json::from_str::<TokenResponse>(&body)?;
        Ok(refreshed_credential(credential, token))
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, edr: &CachedEdr) -> anyhow::Result<EdrCredential> {
        Ok(self.refresh_credential(edr).await?)
    }
}

fn token_url(refresh_endpoint: &str) -> String {
    let endpoint = refresh_endpoint.trim_end_matches('/');
    if endpoint.ends_with(TOKEN_PATH) {
        endpoint.to_string()
    } else {
        format!("{}{}", endpoint, TOKEN_PATH)
    }
}

fn refreshed_credential(old: &EdrCredential, token: TokenResponse) -> EdrCredential {
    let issued_at = now();
    let expires_at = token
        .expires_in
        .and_then(|secs| issued_at.checked_add_signed(Duration::seconds(secs)));

    EdrCredential::builder()
        .endpoint(old.endpoint.clone())
        .auth_key(old.auth_key.clone())
        .auth_token(token.access_token)
        .maybe_refresh_token(token.refresh_token.or_else(|| old.refresh_token.clone()))
        .maybe_refresh_endpoint(old.refresh_endpoint.clone())
        .issued_at(issued_at)
        .maybe_expires_in(token.expires_in)
        .maybe_expires_at(expires_at)
        .build()
}
