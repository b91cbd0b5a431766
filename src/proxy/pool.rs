use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::auth::{TokenError, TokenManager, TokenSnapshot};
use crate::models::{Account, AccountStatus};
use crate::proxy::cooldown::CooldownTracker;
use crate::store::Store;
use crate::util::now_ms;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no accounts available")]
    NoAccounts,
    #[error("all accounts are busy")]
    AllBusy,
    #[error("all accounts are capacity-limited for this model")]
    AllLimited,
    #[error("cancelled while waiting for an account")]
    Cancelled,
    #[error("token failure on account {account_id}: {source}")]
    Token {
        account_id: i64,
        source: TokenError,
    },
}

/// A selected, exclusively locked account together with a fresh token
/// snapshot. The caller must hand the id back through `unlock_account`
/// on every exit path.
#[derive(Debug, Clone)]
pub struct LeasedAccount {
    pub account: Account,
    pub token: TokenSnapshot,
}

#[derive(Debug)]
struct PoolSlot {
    account: Account,
    locked: bool,
}

struct Waiter {
    model: String,
    notify: Arc<Notify>,
}

struct PoolInner {
    slots: HashMap<i64, PoolSlot>,
    cooldowns: CooldownTracker,
    waiters: VecDeque<Waiter>,
}

impl PoolInner {
    fn has_candidate(&self, model: &str, now: i64) -> bool {
        self.slots.iter().any(|(id, slot)| {
            slot.account.is_selectable()
                && !slot.locked
                && !self.cooldowns.is_limited(*id, model, now)
        })
    }

    /// Wake the oldest waiter that would accept the capacity that just
    /// became available. Waking nobody is correct when nothing queued can
    /// use it.
    fn wake_eligible(&mut self) {
        let now = now_ms();
        let position = self
            .waiters
            .iter()
            .position(|waiter| self.has_candidate(&waiter.model, now));
        if let Some(index) = position {
            if let Some(waiter) = self.waiters.remove(index) {
                waiter.notify.notify_one();
            }
        }
    }
}

enum Selection {
    Picked(Account),
    Empty,
    /// Nothing eligible right now; `next_ready_ms` is the earliest
    /// cooldown expiry that could change that without an unlock.
    Wait { next_ready_ms: Option<i64> },
}

/// Owns account selection, exclusive locks, capacity cooldowns, and the
/// error-count lifecycle. All pool state lives behind one mutex; waiting
/// callers queue FIFO on notify handles and re-check under the lock.
pub struct AccountPool {
    inner: Mutex<PoolInner>,
    store: Arc<Store>,
    tokens: Arc<TokenManager>,
    preferred_tiers: HashMap<String, Vec<String>>,
    error_threshold: i64,
    account_wait_ms: u64,
}

impl AccountPool {
    pub fn new(
        store: Arc<Store>,
        tokens: Arc<TokenManager>,
        preferred_tiers: HashMap<String, Vec<String>>,
        error_threshold: i64,
        account_wait_ms: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                slots: HashMap::new(),
                cooldowns: CooldownTracker::new(),
                waiters: VecDeque::new(),
            }),
            store,
            tokens,
            preferred_tiers,
            error_threshold: error_threshold.max(1),
            account_wait_ms,
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Populate the registry from the store. Lock flags of accounts that
    /// survive the reload are preserved.
    pub fn load_from_store(&self) -> Result<usize, String> {
        let accounts = self.store.list_accounts()?;
        let mut inner = self.lock_inner();
        let mut fresh: HashMap<i64, PoolSlot> = HashMap::new();
        for account in accounts {
            let locked = inner
                .slots
                .get(&account.id)
                .map(|slot| slot.locked)
                .unwrap_or(false);
            fresh.insert(account.id, PoolSlot { account, locked });
        }
        inner.slots = fresh;
        Ok(inner.slots.len())
    }

    /// Refresh a single registry entry from the store, inserting it when
    /// new and dropping it when the row is gone.
    pub fn reload_account(&self, account_id: i64) -> Result<(), String> {
        let account = self.store.get_account(account_id)?;
        let mut inner = self.lock_inner();
        match account {
            Some(account) => {
                let locked = inner
                    .slots
                    .get(&account_id)
                    .map(|slot| slot.locked)
                    .unwrap_or(false);
                inner.slots.insert(account_id, PoolSlot { account, locked });
                inner.wake_eligible();
            }
            None => {
                inner.slots.remove(&account_id);
                inner.cooldowns.forget_account(account_id);
            }
        }
        Ok(())
    }

    pub fn remove_account(&self, account_id: i64) {
        let mut inner = self.lock_inner();
        inner.slots.remove(&account_id);
        inner.cooldowns.forget_account(account_id);
    }

    /// Select, lock, and return the best account for `model`, suspending
    /// up to `account_wait_ms` when everything eligible is locked or
    /// cooling down. Waiters are served oldest-first.
    pub async fn get_best_account(
        &self,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<LeasedAccount, PoolError> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.account_wait_ms);
        let mut woken = false;

        loop {
            let notify = Arc::new(Notify::new());
            let selection = {
                let mut inner = self.lock_inner();
                // Queue membership is established before selection so an
                // unlock racing with this critical section leaves a permit
                // rather than a lost wakeup. A re-woken waiter keeps its
                // place at the head of the line.
                let waiter = Waiter {
                    model: model.to_string(),
                    notify: notify.clone(),
                };
                if woken {
                    inner.waiters.push_front(waiter);
                } else {
                    inner.waiters.push_back(waiter);
                }
                let selection = self.try_select_locked(&mut inner, model);
                if !matches!(selection, Selection::Wait { .. }) {
                    inner
                        .waiters
                        .retain(|w| !Arc::ptr_eq(&w.notify, &notify));
                }
                selection
            };

            match selection {
                Selection::Empty => return Err(PoolError::NoAccounts),
                Selection::Picked(account) => {
                    let account_id = account.id;
                    match self.tokens.ensure_valid_token(account_id).await {
                        Ok(token) => return Ok(LeasedAccount { account, token }),
                        Err(source) => {
                            // Lock released, account re-enters selection for
                            // other callers; this caller's budget absorbs it.
                            self.unlock_account(account_id);
                            if source.is_invalid_grant() {
                                self.reload_account(account_id).ok();
                            }
                            return Err(PoolError::Token { account_id, source });
                        }
                    }
                }
                Selection::Wait { next_ready_ms } => {
                    // Cooldowns lapse without anyone calling unlock, so the
                    // wait also re-checks at the earliest expiry.
                    let mut wake_at = deadline;
                    let mut ready_recheck = false;
                    if let Some(ready_ms) = next_ready_ms {
                        let delta = (ready_ms - now_ms()).max(0) as u64;
                        let ready_at =
                            tokio::time::Instant::now() + Duration::from_millis(delta);
                        if ready_at < deadline {
                            wake_at = ready_at;
                            ready_recheck = true;
                        }
                    }
                    tokio::select! {
                        _ = notify.notified() => {
                            woken = true;
                        }
                        _ = tokio::time::sleep_until(wake_at) => {
                            self.drop_waiter(&notify);
                            if ready_recheck {
                                woken = false;
                                continue;
                            }
                            return Err(self.timeout_error(model));
                        }
                        _ = cancel.cancelled() => {
                            self.drop_waiter(&notify);
                            return Err(PoolError::Cancelled);
                        }
                    }
                }
            }
        }
    }

    fn try_select_locked(&self, inner: &mut PoolInner, model: &str) -> Selection {
        let now = now_ms();
        let mut any_selectable = false;
        let mut next_ready_ms: Option<i64> = None;
        let mut candidates: Vec<(usize, i64, i64)> = Vec::new();

        let preferences = self.preferred_tiers.get(model);
        for (id, slot) in &inner.slots {
            if !slot.account.is_selectable() {
                continue;
            }
            any_selectable = true;
            if slot.locked {
                continue;
            }
            if inner.cooldowns.is_limited(*id, model, now) {
                if let Some(until) = inner.cooldowns.limited_until(*id, model) {
                    next_ready_ms = Some(next_ready_ms.map_or(until, |v| v.min(until)));
                }
                continue;
            }
            let tier_rank = match (preferences, slot.account.tier.as_deref()) {
                (Some(list), Some(tier)) => list
                    .iter()
                    .position(|preferred| preferred == tier)
                    .unwrap_or(usize::MAX),
                _ => usize::MAX,
            };
            let recency = slot.account.last_used_at.unwrap_or(i64::MIN);
            candidates.push((tier_rank, recency, *id));
        }

        if !any_selectable {
            return Selection::Empty;
        }
        if candidates.is_empty() {
            return Selection::Wait { next_ready_ms };
        }

        candidates.sort();
        let chosen = candidates[0].2;
        let slot = inner.slots.get_mut(&chosen).expect("candidate exists");
        slot.locked = true;
        slot.account.last_used_at = Some(now);
        let account = slot.account.clone();
        if let Err(e) = self.store.touch_last_used(chosen, now) {
            tracing::warn!("Failed to persist last_used_at for {}: {}", chosen, e);
        }
        Selection::Picked(account)
    }

    fn drop_waiter(&self, notify: &Arc<Notify>) {
        let mut inner = self.lock_inner();
        inner.waiters.retain(|w| !Arc::ptr_eq(&w.notify, notify));
        // A permit delivered in the instant before departure must not be
        // swallowed.
        inner.wake_eligible();
    }

    fn timeout_error(&self, model: &str) -> PoolError {
        let inner = self.lock_inner();
        let now = now_ms();
        let any_locked = inner
            .slots
            .values()
            .any(|slot| slot.account.is_selectable() && slot.locked);
        let any_limited = inner.slots.iter().any(|(id, slot)| {
            slot.account.is_selectable() && inner.cooldowns.is_limited(*id, model, now)
        });
        if !any_locked && any_limited {
            PoolError::AllLimited
        } else {
            PoolError::AllBusy
        }
    }

    /// Release the exclusive lock. Safe to call any number of times.
    pub fn unlock_account(&self, account_id: i64) {
        let mut inner = self.lock_inner();
        let was_locked = match inner.slots.get_mut(&account_id) {
            Some(slot) => std::mem::replace(&mut slot.locked, false),
            None => false,
        };
        if was_locked {
            inner.wake_eligible();
        }
    }

    /// Record a capacity hit for (account, model). Returns the cooldown
    /// expiry in epoch ms.
    pub fn mark_capacity_limited(&self, account_id: i64, model: &str, message: &str) -> i64 {
        let mut inner = self.lock_inner();
        let until = inner
            .cooldowns
            .mark_limited(account_id, model, message, now_ms());
        tracing::info!(
            "Account {} cooling down on {} until {} ({})",
            account_id,
            model,
            until,
            message.chars().take(120).collect::<String>()
        );
        until
    }

    pub fn mark_capacity_recovered(&self, account_id: i64, model: &str) {
        let mut inner = self.lock_inner();
        inner.cooldowns.mark_recovered(account_id, model);
        inner.wake_eligible();
    }

    /// A successful upstream call clears the pair's cooldown and resets
    /// the consecutive-error counter.
    pub fn mark_success(&self, account_id: i64, model: &str) {
        {
            let mut inner = self.lock_inner();
            inner.cooldowns.mark_recovered(account_id, model);
            if let Some(slot) = inner.slots.get_mut(&account_id) {
                slot.account.error_count = 0;
            }
            inner.wake_eligible();
        }
        if let Err(e) = self.store.reset_error_count(account_id) {
            tracing::warn!("Failed to reset error count for {}: {}", account_id, e);
        }
    }

    /// Count a failure against the account; past the threshold the
    /// account flips to `error` status and leaves the eligible set.
    pub fn mark_account_error(&self, account_id: i64, message: &str) {
        let count = match self.store.bump_error(account_id, message, now_ms()) {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to bump error count for {}: {}", account_id, e);
                return;
            }
        };
        let errored = count >= self.error_threshold;
        if errored {
            tracing::warn!(
                "Account {} reached {} consecutive errors, marking as errored",
                account_id,
                count
            );
            if let Err(e) = self.store.set_status(account_id, AccountStatus::Error) {
                tracing::warn!("Failed to set error status for {}: {}", account_id, e);
            }
        }
        let mut inner = self.lock_inner();
        if let Some(slot) = inner.slots.get_mut(&account_id) {
            slot.account.error_count = count;
            slot.account.last_error_message = Some(message.to_string());
            slot.account.last_error_at = Some(now_ms());
            if errored {
                slot.account.status = AccountStatus::Error;
            }
        }
    }

    pub fn is_locked(&self, account_id: i64) -> bool {
        self.lock_inner()
            .slots
            .get(&account_id)
            .map(|slot| slot.locked)
            .unwrap_or(false)
    }

    pub fn locked_count(&self) -> usize {
        self.lock_inner()
            .slots
            .values()
            .filter(|slot| slot.locked)
            .count()
    }

    pub fn cooldown_until(&self, account_id: i64, model: &str) -> Option<i64> {
        self.lock_inner().cooldowns.limited_until(account_id, model)
    }
}
