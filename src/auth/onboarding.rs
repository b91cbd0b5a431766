use serde::Deserialize;
use serde_json::json;

/// Result of the one-time onboarding sequence: the project every upstream
/// call must carry, and the quota tier the account was admitted at.
#[derive(Debug, Clone)]
pub struct OnboardingInfo {
    pub project_id: String,
    pub tier: String,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(rename = "cloudaicompanionProject")]
    project_id: Option<String>,
    #[serde(rename = "currentTier")]
    current_tier: Option<Tier>,
    #[serde(rename = "paidTier")]
    paid_tier: Option<Tier>,
    #[serde(rename = "allowedTiers", default)]
    allowed_tiers: Vec<Tier>,
}

#[derive(Debug, Deserialize)]
struct Tier {
    id: Option<String>,
    #[serde(rename = "isDefault", default)]
    is_default: bool,
}

const ONBOARD_POLL_ATTEMPTS: u32 = 5;
const ONBOARD_POLL_DELAY_MS: u64 = 1_000;

/// Client for the "load onboarded user" / "onboard user" sequence of the
/// code-assist API.
pub struct CodeAssistOnboarding {
    client: reqwest::Client,
    base_url: String,
}

impl CodeAssistOnboarding {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    /// Discover project id and tier for an account that holds a valid
    /// access token. Falls back to `onboardUser` when the load call knows
    /// the user but has not bound a managed project yet.
    pub async fn discover(&self, access_token: &str) -> Result<OnboardingInfo, String> {
        let load = self.load_code_assist(access_token).await?;

        let tier = load
            .paid_tier
            .and_then(|t| t.id)
            .or_else(|| load.current_tier.and_then(|t| t.id))
            .or_else(|| {
                load.allowed_tiers
                    .into_iter()
                    .find(|t| t.is_default)
                    .and_then(|t| t.id)
            })
            .unwrap_or_else(|| "free-tier".to_string());

        if let Some(project_id) = load.project_id.filter(|p| !p.trim().is_empty()) {
            return Ok(OnboardingInfo { project_id, tier });
        }

        let project_id = self.onboard_user(access_token, &tier).await?;
        Ok(OnboardingInfo { project_id, tier })
    }

    async fn load_code_assist(&self, access_token: &str) -> Result<LoadResponse, String> {
        let body = json!({"metadata": {"ideType": "ANTIGRAVITY"}});
        let response = self
            .client
            .post(format!("{}:loadCodeAssist", self.base_url))
            .bearer_auth(access_token)
            .header(
                reqwest::header::USER_AGENT,
                crate::constants::USER_AGENT.as_str(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("loadCodeAssist request failed: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("loadCodeAssist returned {}: {}", status, body));
        }

        response
            .json::<LoadResponse>()
            .await
            .map_err(|e| format!("loadCodeAssist parse failed: {}", e))
    }

    /// Run the onboarding long-running operation until it reports done and
    /// yields the managed project id.
    async fn onboard_user(&self, access_token: &str, tier: &str) -> Result<String, String> {
        let body = json!({
            "tierId": tier,
            "metadata": {"ideType": "ANTIGRAVITY"}
        });

        for attempt in 1..=ONBOARD_POLL_ATTEMPTS {
            let response = self
                .client
                .post(format!("{}:onboardUser", self.base_url))
                .bearer_auth(access_token)
                .header(
                    reqwest::header::USER_AGENT,
                    crate::constants::USER_AGENT.as_str(),
                )
                .json(&body)
                .send()
                .await
                .map_err(|e| format!("onboardUser request failed: {}", e))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(format!("onboardUser returned {}: {}", status, body));
            }

            let lro: serde_json::Value = response
                .json()
                .await
                .map_err(|e| format!("onboardUser parse failed: {}", e))?;

            let done = lro.get("done").and_then(|v| v.as_bool()).unwrap_or(false);
            if done {
                if let Some(project_id) = lro
                    .get("response")
                    .and_then(|r| r.get("cloudaicompanionProject"))
                    .and_then(|p| p.get("id"))
                    .and_then(|v| v.as_str())
                    .filter(|p| !p.trim().is_empty())
                {
                    return Ok(project_id.to_string());
                }
                return Err("onboardUser completed without a project id".to_string());
            }

            tracing::debug!(
                "onboardUser pending, attempt {}/{}",
                attempt,
                ONBOARD_POLL_ATTEMPTS
            );
            tokio::time::sleep(std::time::Duration::from_millis(ONBOARD_POLL_DELAY_MS)).await;
        }

        Err("onboardUser did not complete in time".to_string())
    }
}
