use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Sleep that wakes early when `cancel` fires. Returns `false` if the
/// sleep was interrupted by cancellation.
pub async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Session id the upstream expects when the caller did not supply one:
/// a negative random integer rendered as a string.
pub fn synthesize_session_id() -> String {
    use rand::Rng;
    let n: i64 = rand::thread_rng().gen_range(1..i64::MAX);
    format!("-{}", n)
}
