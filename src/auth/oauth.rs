use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Refresh failures, classified for the token manager's policy decisions.
/// `InvalidGrant` is terminal for the account; `Transient` may succeed on
/// a later attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),
    #[error("transient refresh failure: {0}")]
    Transient(String),
    #[error("refresh failed: {0}")]
    Upstream(String),
}

pub struct OauthClient {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

fn env_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(t.to_string());
            }
        }
    }
    None
}

impl OauthClient {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Build from environment: `TRESTLE_GOOGLE_OAUTH_CLIENT_ID` (or the
    /// generic `GOOGLE_OAUTH_CLIENT_ID`) plus an optional client secret.
    pub fn from_env(client: reqwest::Client) -> Result<Self, String> {
        let client_id = env_first(&["TRESTLE_GOOGLE_OAUTH_CLIENT_ID", "GOOGLE_OAUTH_CLIENT_ID"])
            .ok_or_else(|| {
                "Missing Google OAuth client_id. Set TRESTLE_GOOGLE_OAUTH_CLIENT_ID.".to_string()
            })?;
        let client_secret = env_first(&[
            "TRESTLE_GOOGLE_OAUTH_CLIENT_SECRET",
            "GOOGLE_OAUTH_CLIENT_SECRET",
        ]);
        Ok(Self::new(
            client,
            crate::constants::OAUTH_TOKEN_URL,
            client_id,
            client_secret,
        ))
    }

    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
        account_id: Option<i64>,
    ) -> Result<TokenResponse, RefreshError> {
        let mut params: Vec<(&str, String)> = vec![
            ("client_id", self.client_id.clone()),
            ("refresh_token", refresh_token.to_string()),
            ("grant_type", "refresh_token".to_string()),
        ];
        if let Some(s) = &self.client_secret {
            params.push(("client_secret", s.clone()));
        }

        if let Some(id) = account_id {
            tracing::debug!("Refreshing token for account {}", id);
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    RefreshError::Transient(format!(
                        "Refresh request failed: {}. Unable to reach the authorization server.",
                        e
                    ))
                } else {
                    RefreshError::Transient(format!("Refresh request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let token = response
                .json::<TokenResponse>()
                .await
                .map_err(|e| RefreshError::Upstream(format!("Refresh data parsing failed: {}", e)))?;
            tracing::debug!("Token refreshed, expires in {}s", token.expires_in);
            return Ok(token);
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(RefreshError::Transient(format!(
                "Refresh failed: HTTP {} - {}",
                status, body
            )))
        } else if body.contains("invalid_grant") {
            Err(RefreshError::InvalidGrant(body))
        } else {
            Err(RefreshError::Upstream(format!(
                "Refresh failed: HTTP {} - {}",
                status, body
            )))
        }
    }
}
