pub mod auth;

pub use auth::{admin_auth_middleware, api_key_auth_middleware, ApiKeyIdentity};
