use std::sync::LazyLock;

/// Base URL for the cloud code-assist API. All generation and onboarding
/// calls are `POST {base}:{method}`.
pub const CODE_ASSIST_BASE_URL: &str = "https://cloudcode-pa.googleapis.com/v1internal";

/// Google OAuth token endpoint used for refresh-token grants.
pub const OAUTH_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// The `userAgent` field of every upstream envelope. Distinct from the
/// HTTP User-Agent header below.
pub const ENVELOPE_USER_AGENT: &str = "antigravity";

/// Substrings the upstream embeds in capacity-exhaustion error bodies.
/// A 429 status is always treated as capacity regardless of body text.
pub const CAPACITY_MARKERS: [&str; 3] = [
    "exhausted your capacity",
    "Resource has been exhausted",
    "No capacity available",
];

pub static USER_AGENT: LazyLock<String> = LazyLock::new(|| {
    format!(
        "trestle/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
});
