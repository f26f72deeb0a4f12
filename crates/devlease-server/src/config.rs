use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use chrono::TimeDelta;
use clap::Parser;
use devlease::{BookingPolicy, HubOptions, JwksConfig};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use tower_http::cors::{AllowOrigin, CorsLayer};

/// One year. Longer slots or quotas are configuration mistakes.
const MAX_BOOKING_MINUTES: i64 = 365 * 24 * 60;
/// Ten years of lookback for the quota and listing windows.
const MAX_WINDOW_DAYS: i64 = 3650;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "devlease booking and device control server")]
pub struct Args {
    /// TOML configuration file.
    #[arg(long, env = "DEVLEASE_CONFIG")]
    pub config: Option<PathBuf>,
    /// Listen address, overrides the config file.
    #[arg(long, env = "DEVLEASE_LISTEN")]
    pub listen: Option<SocketAddr>,
    /// SQLite database path (`:memory:` for a throwaway ledger).
    #[arg(long, env = "DEVLEASE_DATABASE")]
    pub database: Option<PathBuf>,
    /// Pre-shared key that identifies the controlled device.
    #[arg(long, env = "DEVLEASE_DEVICE_KEY", hide_env_values = true)]
    pub device_key: Option<String>,
    /// Token issuer, e.g. `https://auth.example.org/realms/iot-project`.
    #[arg(long, env = "DEVLEASE_ISSUER")]
    pub issuer: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub listen: SocketAddr,
    pub database: PathBuf,
    pub allow_origins: Vec<String>,
    pub device_key: Option<String>,
    pub default_device_id: String,
    pub admin_override: bool,
    pub admin_role: String,
    pub session_queue: usize,
    pub auth: AuthConfig,
    pub booking: BookingConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub issuer: String,
    pub jwks_url: Option<String>,
    pub client_id: String,
    pub algorithms: Vec<String>,
    pub jwks_ttl_secs: u64,
    pub leeway_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct BookingConfig {
    pub max_slot_minutes: i64,
    pub quota_minutes: i64,
    pub quota_window_days: i64,
    pub listing_window_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database: PathBuf::from("devlease.db"),
            allow_origins: vec!["http://localhost:3000".to_string()],
            device_key: None,
            default_device_id: "ESP-Real-Hardware".to_string(),
            admin_override: false,
            admin_role: "admin".to_string(),
            session_queue: 256,
            auth: AuthConfig::default(),
            booking: BookingConfig::default(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080/realms/iot-project".to_string(),
            jwks_url: None,
            client_id: "esp-web-app".to_string(),
            algorithms: vec!["RS256".to_string()],
            jwks_ttl_secs: 3600,
            leeway_secs: 60,
        }
    }
}

impl Default for BookingConfig {
    fn default() -> Self {
        Self {
            max_slot_minutes: 240,
            quota_minutes: 120,
            quota_window_days: 7,
            listing_window_days: 7,
        }
    }
}

impl Config {
    /// Config file (if any) first, then command-line and environment overrides.
    pub fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        if let Some(listen) = args.listen {
            config.listen = listen;
        }
        if let Some(database) = &args.database {
            config.database = database.clone();
        }
        if let Some(key) = &args.device_key {
            config.device_key = Some(key.clone());
        }
        if let Some(issuer) = &args.issuer {
            config.auth.issuer = issuer.clone();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.booking;
        for (key, value) in [
            ("max_slot_minutes", b.max_slot_minutes),
            ("quota_minutes", b.quota_minutes),
        ] {
            if !(1..=MAX_BOOKING_MINUTES).contains(&value) {
                bail!("booking.{key} must be between 1 and {MAX_BOOKING_MINUTES}, got {value}");
            }
        }
        for (key, value) in [
            ("quota_window_days", b.quota_window_days),
            ("listing_window_days", b.listing_window_days),
        ] {
            if !(1..=MAX_WINDOW_DAYS).contains(&value) {
                bail!("booking.{key} must be between 1 and {MAX_WINDOW_DAYS}, got {value}");
            }
        }
        if self.session_queue == 0 {
            bail!("session_queue must be > 0");
        }
        self.auth.algorithms()?;
        self.cors_layer()?;
        Ok(())
    }

    /// CORS for the browser client. `*` anywhere in `allow_origins` opens
    /// the API to every origin.
    pub fn cors_layer(&self) -> Result<CorsLayer> {
        let allow_origin = if self.allow_origins.iter().any(|o| o == "*") {
            AllowOrigin::any()
        } else {
            let origins = self
                .allow_origins
                .iter()
                .map(|o| {
                    HeaderValue::from_str(o)
                        .with_context(|| format!("invalid allow_origins entry: {o}"))
                })
                .collect::<Result<Vec<_>>>()?;
            AllowOrigin::list(origins)
        };
        Ok(CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([AUTHORIZATION, CONTENT_TYPE]))
    }

    pub fn booking_policy(&self) -> BookingPolicy {
        BookingPolicy {
            max_slot: TimeDelta::minutes(self.booking.max_slot_minutes),
            quota: TimeDelta::minutes(self.booking.quota_minutes),
            quota_window: TimeDelta::days(self.booking.quota_window_days),
        }
    }

    pub fn hub_options(&self) -> HubOptions {
        HubOptions {
            default_device_id: self.default_device_id.clone(),
            listing_window: TimeDelta::days(self.booking.listing_window_days),
            admin_role: self.admin_override.then(|| self.admin_role.clone()),
        }
    }
}

impl AuthConfig {
    pub fn algorithms(&self) -> Result<Vec<Algorithm>> {
        if self.algorithms.is_empty() {
            bail!("auth.algorithms must not be empty");
        }
        self.algorithms
            .iter()
            .map(|name| {
                let alg = Algorithm::from_str(name)
                    .with_context(|| format!("unknown signing algorithm: {name}"))?;
                if matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512) {
                    bail!("symmetric algorithm {name} cannot be used with a JWKS");
                }
                Ok(alg)
            })
            .collect()
    }

    pub fn jwks_config(&self) -> Result<JwksConfig> {
        let mut jwks = JwksConfig::for_issuer(self.issuer.clone());
        if let Some(url) = &self.jwks_url {
            jwks.jwks_url = url.clone();
        }
        jwks.algorithms = self.algorithms()?;
        jwks.ttl = Duration::from_secs(self.jwks_ttl_secs);
        jwks.leeway_secs = self.leeway_secs;
        Ok(jwks)
    }
}
