pub mod app;
pub mod config;
pub mod error;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tracing::info;

use devlease::{Hub, JwksVerifier, PrincipalResolver, RealtimeBroker, ReservationLedger};

use crate::app::AppState;
use crate::config::Config;

/// Wire the ledger, verifier, broker and hub described by `config`.
pub fn build_state(config: &Config) -> Result<AppState> {
    config.validate()?;
    let policy = config.booking_policy();
    let ledger = if config.database.as_os_str() == ":memory:" {
        ReservationLedger::open_in_memory(policy)
    } else {
        ReservationLedger::open(&config.database, policy)
    }
    .with_context(|| format!("failed to open ledger {}", config.database.display()))?;

    let jwks = config.auth.jwks_config()?;
    info!(issuer = %jwks.issuer, jwks_url = %jwks.jwks_url, "token verification configured");
    if config.device_key.as_deref().is_none_or(str::is_empty) {
        info!("no device key configured, device tier disabled");
    }

    let resolver = PrincipalResolver::new(
        config.device_key.clone(),
        Arc::new(JwksVerifier::new(jwks)),
        config.auth.client_id.clone(),
    );
    let broker = Arc::new(RealtimeBroker::new(config.session_queue));
    let hub = Hub::new(Arc::new(ledger), broker, config.hub_options());

    Ok(AppState {
        hub: Arc::new(hub),
        resolver: Arc::new(resolver),
    })
}

pub fn build_app(config: &Config) -> Result<Router> {
    let state = build_state(config)?;
    Ok(app::router(state, config.cors_layer()?))
}
