use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::auth::oauth::{OauthClient, RefreshError};
use crate::auth::onboarding::CodeAssistOnboarding;
use crate::models::{Account, AccountStatus};
use crate::store::Store;
use crate::util::now_ms;

/// Fresh credential view handed to callers. Guaranteed usable for at
/// least the skew window at the time it was produced.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub access_token: String,
    pub project_id: String,
    pub tier: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TokenError {
    #[error("account {0} not found")]
    NotFound(i64),
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),
    #[error("transient refresh failure: {0}")]
    Transient(String),
    #[error("upstream refresh failure: {0}")]
    Upstream(String),
    #[error("account has not completed onboarding")]
    NotOnboarded,
    #[error("duplicate account: project {0} is already bound to another account")]
    Duplicate(String),
    #[error("store failure: {0}")]
    Store(String),
}

impl TokenError {
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Self::InvalidGrant(_))
    }
}

type FlightResult = Result<Account, TokenError>;

/// Removes the in-flight marker when the leading refresh finishes or is
/// cancelled, so followers of an abandoned flight can elect a new leader.
struct FlightGuard<'a> {
    inflight: &'a DashMap<i64, watch::Receiver<Option<FlightResult>>>,
    account_id: i64,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.account_id);
    }
}

/// Owns the credential lifecycle: refresh, onboarding discovery, and the
/// at-most-one-refresh-per-account coalescing the pool relies on.
///
/// Persisted token fields are written through the store only; callers
/// observe snapshots and never mutate account rows themselves.
pub struct TokenManager {
    store: Arc<Store>,
    oauth: Arc<OauthClient>,
    onboarding: Arc<CodeAssistOnboarding>,
    skew_ms: i64,
    inflight: DashMap<i64, watch::Receiver<Option<FlightResult>>>,
}

impl TokenManager {
    pub fn new(
        store: Arc<Store>,
        oauth: Arc<OauthClient>,
        onboarding: Arc<CodeAssistOnboarding>,
        skew_ms: i64,
    ) -> Self {
        Self {
            store,
            oauth,
            onboarding,
            skew_ms,
            inflight: DashMap::new(),
        }
    }

    /// Return a snapshot that satisfies the freshness invariant, entering
    /// the coalesced refresh when the persisted token is stale.
    pub async fn ensure_valid_token(&self, account_id: i64) -> Result<TokenSnapshot, TokenError> {
        let account = self
            .store
            .get_account(account_id)
            .map_err(TokenError::Store)?
            .ok_or(TokenError::NotFound(account_id))?;

        if account.has_fresh_token(now_ms(), self.skew_ms) {
            return snapshot_of(&account).ok_or(TokenError::NotOnboarded);
        }

        let refreshed = self.refresh_account(account_id, false).await?;
        snapshot_of(&refreshed).ok_or(TokenError::NotOnboarded)
    }

    /// Refresh regardless of the persisted expiry; used after the upstream
    /// rejects a token that still looked fresh locally.
    pub async fn force_refresh(&self, account_id: i64) -> Result<TokenSnapshot, TokenError> {
        let refreshed = self.refresh_account(account_id, true).await?;
        snapshot_of(&refreshed).ok_or(TokenError::NotOnboarded)
    }

    /// Bring a freshly created account into service: refresh its token,
    /// discover project id and tier, then mark it active. A duplicate
    /// project binding deletes the row and fails with `Duplicate`.
    pub async fn initialize_account(&self, account_id: i64) -> Result<Account, TokenError> {
        let account = self.refresh_account(account_id, false).await?;
        let access_token = account
            .access_token
            .clone()
            .ok_or_else(|| TokenError::Upstream("refresh yielded no access token".to_string()))?;

        let info = self
            .onboarding
            .discover(&access_token)
            .await
            .map_err(|e| {
                let _ = self.store.bump_error(account_id, &e, now_ms());
                TokenError::Upstream(e)
            })?;

        let duplicate_of = self
            .store
            .find_account_by_project(&info.project_id, account_id)
            .map_err(TokenError::Store)?;
        if duplicate_of.is_some() {
            tracing::warn!(
                "Account {} resolved to project {} already bound elsewhere, removing",
                account_id,
                info.project_id
            );
            let _ = self.store.delete_account(account_id);
            return Err(TokenError::Duplicate(info.project_id));
        }

        self.store
            .set_onboarding(account_id, &info.project_id, &info.tier)
            .map_err(TokenError::Store)?;
        self.store
            .set_status(account_id, AccountStatus::Active)
            .map_err(TokenError::Store)?;

        tracing::info!(
            "Account {} onboarded (project: {}, tier: {})",
            account_id,
            info.project_id,
            info.tier
        );

        self.store
            .get_account(account_id)
            .map_err(TokenError::Store)?
            .ok_or(TokenError::NotFound(account_id))
    }

    /// At most one refresh is in flight per account id. The first caller
    /// becomes the leader and performs the OAuth call; concurrent callers
    /// await the same published result, success or failure.
    async fn refresh_account(&self, account_id: i64, force: bool) -> FlightResult {
        loop {
            enum Role {
                Leader(watch::Sender<Option<FlightResult>>),
                Follower(watch::Receiver<Option<FlightResult>>),
            }

            let role = match self.inflight.entry(account_id) {
                dashmap::mapref::entry::Entry::Occupied(e) => Role::Follower(e.get().clone()),
                dashmap::mapref::entry::Entry::Vacant(v) => {
                    let (tx, rx) = watch::channel(None);
                    v.insert(rx);
                    Role::Leader(tx)
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    loop {
                        {
                            let published = rx.borrow_and_update();
                            if let Some(result) = published.as_ref() {
                                return result.clone();
                            }
                        }
                        if rx.changed().await.is_err() {
                            // Leader abandoned without publishing; elect anew.
                            break;
                        }
                    }
                }
                Role::Leader(tx) => {
                    let guard = FlightGuard {
                        inflight: &self.inflight,
                        account_id,
                    };
                    let result = self.do_refresh(account_id, force).await;
                    let _ = tx.send(Some(result.clone()));
                    drop(guard);
                    return result;
                }
            }
        }
    }

    async fn do_refresh(&self, account_id: i64, force: bool) -> FlightResult {
        let account = self
            .store
            .get_account(account_id)
            .map_err(TokenError::Store)?
            .ok_or(TokenError::NotFound(account_id))?;

        // A flight that queued behind a completed refresh sees the fresh
        // token here and skips the OAuth round trip.
        if !force && account.has_fresh_token(now_ms(), self.skew_ms) {
            return Ok(account);
        }

        match self
            .oauth
            .refresh_access_token(&account.refresh_token, Some(account_id))
            .await
        {
            Ok(token) => {
                let expires_at = now_ms() + token.expires_in * 1_000 - self.skew_ms;
                self.store
                    .update_access_token(account_id, &token.access_token, expires_at)
                    .map_err(TokenError::Store)?;
                self.store
                    .get_account(account_id)
                    .map_err(TokenError::Store)?
                    .ok_or(TokenError::NotFound(account_id))
            }
            Err(RefreshError::InvalidGrant(msg)) => {
                tracing::warn!(
                    "Account {} refresh token rejected, marking account as errored",
                    account_id
                );
                let _ = self.store.bump_error(account_id, &msg, now_ms());
                let _ = self.store.set_status(account_id, AccountStatus::Error);
                Err(TokenError::InvalidGrant(msg))
            }
            Err(RefreshError::Transient(msg)) => Err(TokenError::Transient(msg)),
            Err(RefreshError::Upstream(msg)) => Err(TokenError::Upstream(msg)),
        }
    }
}

fn snapshot_of(account: &Account) -> Option<TokenSnapshot> {
    match (&account.access_token, &account.project_id, &account.tier) {
        (Some(access_token), Some(project_id), Some(tier))
            if !access_token.is_empty() && !project_id.is_empty() && !tier.is_empty() =>
        {
            Some(TokenSnapshot {
                access_token: access_token.clone(),
                project_id: project_id.clone(),
                tier: tier.clone(),
            })
        }
        _ => None,
    }
}
