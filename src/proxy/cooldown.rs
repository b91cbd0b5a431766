use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// First-hit cooldown when the upstream message carries no usable hint.
const BASE_COOLDOWN_MS: i64 = 60_000;
/// Ladder ceiling for repeat offenders on the same (account, model) pair.
const MAX_COOLDOWN_MS: i64 = 3_600_000;
/// Cushion added on top of a parsed reset hint.
const HINT_CUSHION_MS: i64 = 1_000;

static RESET_HINT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)reset after (\d+)\s*s").expect("Invalid reset hint regex"));

/// Best-effort extraction of "reset after Ns" from an upstream error
/// message. The message format is not a contract; absence falls back to
/// the tiered ladder.
pub fn parse_reset_hint(message: &str) -> Option<u64> {
    RESET_HINT_RE
        .captures(message)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

#[derive(Debug, Clone)]
pub struct CooldownEntry {
    pub until_ms: i64,
    pub hits: u32,
    pub from_hint: bool,
}

/// Per (account id, model) capacity cooldowns. Not internally
/// synchronised: the pool owns an instance inside its critical section.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    entries: HashMap<(i64, String), CooldownEntry>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a capacity hit and return the cooldown expiry. Repeat hits
    /// without an intervening recovery climb the ladder even if the
    /// previous window already lapsed.
    pub fn mark_limited(&mut self, account_id: i64, model: &str, message: &str, now_ms: i64) -> i64 {
        let entry = self
            .entries
            .entry((account_id, model.to_string()))
            .or_insert(CooldownEntry {
                until_ms: 0,
                hits: 0,
                from_hint: false,
            });
        entry.hits += 1;

        let (duration_ms, from_hint) = match parse_reset_hint(message) {
            Some(secs) => ((secs as i64) * 1_000 + HINT_CUSHION_MS, true),
            None => {
                let shift = (entry.hits - 1).min(10);
                ((BASE_COOLDOWN_MS << shift).min(MAX_COOLDOWN_MS), false)
            }
        };

        entry.until_ms = now_ms + duration_ms;
        entry.from_hint = from_hint;
        entry.until_ms
    }

    /// Clear the pair entirely; the next hit starts the ladder over.
    pub fn mark_recovered(&mut self, account_id: i64, model: &str) {
        self.entries.remove(&(account_id, model.to_string()));
    }

    pub fn is_limited(&self, account_id: i64, model: &str, now_ms: i64) -> bool {
        self.entries
            .get(&(account_id, model.to_string()))
            .is_some_and(|e| e.until_ms > now_ms)
    }

    pub fn limited_until(&self, account_id: i64, model: &str) -> Option<i64> {
        self.entries
            .get(&(account_id, model.to_string()))
            .map(|e| e.until_ms)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything recorded for an account, across all models.
    pub fn forget_account(&mut self, account_id: i64) {
        self.entries.retain(|(id, _), _| *id != account_id);
    }
}
