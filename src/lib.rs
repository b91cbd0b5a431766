pub mod auth;
pub mod constants;
pub mod error;
pub mod models;
pub mod proxy;
pub mod store;
pub mod util;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::models::AppConfig;
use crate::proxy::state::AppState;

fn init_tracing() {
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,trestle=info")
    } else if env.contains("trestle") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{},trestle=info", env))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        match port.trim().parse::<u16>() {
            Ok(p) if p > 0 => {
                config.port = p;
                info!("Using port from environment: {}", p);
            }
            _ => warn!("Ignoring invalid PORT value: {}", port),
        }
    }
    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.host = host.trim().to_string();
        }
    }
    if let Ok(key) = std::env::var("ADMIN_KEY") {
        if !key.trim().is_empty() {
            info!("Using admin key from environment");
            config.admin_key = Some(key);
        }
    }
    if let Ok(dir) = std::env::var("DATA_DIR") {
        if !dir.trim().is_empty() {
            config.data_dir = Some(dir);
        }
    }
}

/// Wire the full application state from a loaded config. Tests build
/// their own state against mock endpoints instead of calling this.
pub fn build_state(config: AppConfig, shutdown: CancellationToken) -> Result<AppState, String> {
    let config = Arc::new(config);
    let store = Arc::new(store::Store::open(&config.data_dir())?);

    let http = proxy::upstream::build_http_client(&config)?;
    let oauth = Arc::new(auth::OauthClient::from_env(http.clone())?);
    let onboarding = Arc::new(auth::CodeAssistOnboarding::new(
        http.clone(),
        constants::CODE_ASSIST_BASE_URL,
    ));
    let tokens = Arc::new(auth::TokenManager::new(
        store.clone(),
        oauth,
        onboarding,
        config.token_refresh_skew_ms,
    ));

    let call_log = Arc::new(proxy::call_log::CallLogger::new(config.call_log_capacity));
    let upstream = Arc::new(proxy::upstream::UpstreamClient::new(
        http,
        constants::CODE_ASSIST_BASE_URL,
        tokens.clone(),
        call_log.clone(),
    ));
    let pool = Arc::new(proxy::pool::AccountPool::new(
        store.clone(),
        tokens.clone(),
        config.preferred_tiers.clone(),
        config.error_threshold,
        config.account_wait_ms,
    ));
    let limiter = Arc::new(proxy::limiter::ModelRateLimiter::new(
        config.default_model_concurrency,
        config.model_concurrency.clone(),
    ));

    let dispatcher = Arc::new(proxy::dispatcher::Dispatcher::new(
        pool.clone(),
        limiter,
        upstream,
        store.clone(),
        config.capacity_retries,
        config.capacity_retry_delay_ms,
        config.image_model.clone(),
        shutdown,
    ));

    // Config aliases seed the map; rows from the model_mappings table win.
    let mut aliases: HashMap<String, String> = config.model_aliases.clone();
    match store.list_model_mappings() {
        Ok(mappings) => {
            for (alias, target) in mappings {
                aliases.insert(alias, target);
            }
        }
        Err(e) => warn!("Failed to load model mappings: {}", e),
    }

    let loaded = pool.load_from_store()?;
    info!("Loaded {} account(s) into the pool", loaded);

    Ok(AppState {
        config,
        store,
        tokens,
        pool,
        call_log,
        dispatcher,
        translator: Arc::new(proxy::translate::PassthroughTranslator),
        aliases: Arc::new(tokio::sync::RwLock::new(aliases)),
    })
}

pub fn run() {
    init_tracing();

    let runtime = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    runtime.block_on(async {
        let data_dir = std::env::var("DATA_DIR")
            .ok()
            .filter(|d| !d.trim().is_empty())
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| std::path::PathBuf::from("trestle-data"));

        let mut config = match models::config::load_app_config(&data_dir) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load config: {}", e);
                std::process::exit(1);
            }
        };
        apply_env_overrides(&mut config);
        if let Err(errors) = models::config::validate_app_config(&config) {
            error!("Configuration validation failed:\n{}", errors.join("\n"));
            std::process::exit(1);
        }

        let shutdown = CancellationToken::new();
        let state = match build_state(config.clone(), shutdown.clone()) {
            Ok(state) => state,
            Err(e) => {
                error!("Startup failed: {}", e);
                std::process::exit(1);
            }
        };

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], config.port)));

        let signal_token = shutdown.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            signal_token.cancel();
        });

        if let Err(e) = proxy::server::serve(state, addr, shutdown).await {
            error!("{}", e);
            std::process::exit(1);
        }
    });
}
