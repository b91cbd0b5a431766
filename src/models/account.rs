use serde::{Deserialize, Serialize};

/// Lifecycle state of a stored account.
///
/// `Error` is entered automatically after `error_threshold` consecutive
/// upstream failures or a rejected refresh token; `Disabled` only by an
/// operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Disabled,
    Error,
}

impl AccountStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Disabled => "disabled",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "disabled" => Self::Disabled,
            "error" => Self::Error,
            _ => Self::Active,
        }
    }
}

/// A stored credential record for one upstream user identity.
///
/// All timestamps are epoch milliseconds. `project_id` and `tier` are
/// discovered during onboarding and are required before the account is
/// eligible for selection.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub email: Option<String>,
    pub refresh_token: String,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<i64>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub status: AccountStatus,
    pub error_count: i64,
    pub last_used_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error_message: Option<String>,
    pub created_at: i64,
}

impl Account {
    /// Whether the persisted access token is usable at `now_ms`, treating
    /// anything inside the skew window as already expired.
    pub fn has_fresh_token(&self, now_ms: i64, skew_ms: i64) -> bool {
        match (&self.access_token, self.access_token_expires_at) {
            (Some(tok), Some(expires_at)) if !tok.is_empty() => expires_at > now_ms + skew_ms,
            _ => false,
        }
    }

    pub fn is_onboarded(&self) -> bool {
        self.project_id.as_deref().is_some_and(|p| !p.is_empty())
            && self.tier.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Static half of the selectability predicate; lock state and per-model
    /// cooldowns are checked by the pool.
    pub fn is_selectable(&self) -> bool {
        self.status == AccountStatus::Active && self.is_onboarded()
    }
}

/// Redacted view of an account for the admin surface. The refresh token
/// never leaves the store.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub id: i64,
    pub email: Option<String>,
    pub project_id: Option<String>,
    pub tier: Option<String>,
    pub status: AccountStatus,
    pub error_count: i64,
    pub last_used_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error_message: Option<String>,
    pub created_at: i64,
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id,
            email: account.email.clone(),
            project_id: account.project_id.clone(),
            tier: account.tier.clone(),
            status: account.status,
            error_count: account.error_count,
            last_used_at: account.last_used_at,
            last_error_at: account.last_error_at,
            last_error_message: account.last_error_message.clone(),
            created_at: account.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_account() -> Account {
        Account {
            id: 1,
            email: Some("a@test".to_string()),
            refresh_token: "rt".to_string(),
            access_token: Some("at".to_string()),
            access_token_expires_at: Some(10_000),
            project_id: Some("proj".to_string()),
            tier: Some("standard-tier".to_string()),
            status: AccountStatus::Active,
            error_count: 0,
            last_used_at: None,
            last_error_at: None,
            last_error_message: None,
            created_at: 0,
        }
    }

    #[test]
    fn token_inside_skew_window_counts_as_expired() {
        let account = base_account();
        assert!(account.has_fresh_token(8_000, 1_000));
        assert!(!account.has_fresh_token(9_500, 1_000));
        assert!(!account.has_fresh_token(11_000, 1_000));
    }

    #[test]
    fn account_without_onboarding_is_not_selectable() {
        let mut account = base_account();
        account.tier = None;
        assert!(!account.is_selectable());
        account.tier = Some("free-tier".to_string());
        account.project_id = None;
        assert!(!account.is_selectable());
    }

    #[test]
    fn errored_account_is_not_selectable() {
        let mut account = base_account();
        account.status = AccountStatus::Error;
        assert!(!account.is_selectable());
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            AccountStatus::Active,
            AccountStatus::Disabled,
            AccountStatus::Error,
        ] {
            assert_eq!(AccountStatus::parse(status.as_str()), status);
        }
    }
}
