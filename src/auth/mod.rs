pub mod oauth;
pub mod onboarding;
pub mod token_manager;

pub use oauth::{OauthClient, RefreshError, TokenResponse};
pub use onboarding::{CodeAssistOnboarding, OnboardingInfo};
pub use token_manager::{TokenError, TokenManager, TokenSnapshot};
