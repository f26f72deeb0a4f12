//! [`TokenVerifier`] backed by an OpenID Connect JWKS endpoint.
//!
//! Keys are fetched lazily, cached for a fixed TTL, and refetched once when a
//! token names a key id the cache does not know (key rotation).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::VerifyError;
use crate::principal::{TokenClaims, TokenVerifier};

#[derive(Debug, Clone)]
pub struct JwksConfig {
    pub issuer: String,
    pub jwks_url: String,
    pub algorithms: Vec<Algorithm>,
    pub ttl: Duration,
    pub leeway_secs: u64,
}

impl JwksConfig {
    /// Keycloak layout: `{issuer}/protocol/openid-connect/certs`.
    ///
    /// A trailing `/` is dropped; tokens carry the issuer without one.
    pub fn for_issuer(issuer: impl Into<String>) -> Self {
        let issuer = issuer.into().trim_end_matches('/').to_string();
        let jwks_url = format!("{issuer}/protocol/openid-connect/certs");
        Self {
            issuer,
            jwks_url,
            algorithms: vec![Algorithm::RS256],
            ttl: Duration::from_secs(3600),
            leeway_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedJwks {
    jwks: JwkSet,
    expires_at: Instant,
}

pub struct JwksVerifier {
    client: reqwest::Client,
    config: JwksConfig,
    cache: RwLock<Option<CachedJwks>>,
}

impl JwksVerifier {
    pub fn new(config: JwksConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            cache: RwLock::new(None),
        }
    }

    /// Start with a known key set, e.g. for offline deployments.
    pub fn with_key_set(config: JwksConfig, jwks: JwkSet) -> Self {
        let expires_at = Instant::now() + config.ttl;
        Self {
            client: reqwest::Client::new(),
            config,
            cache: RwLock::new(Some(CachedJwks { jwks, expires_at })),
        }
    }

    async fn key_set(&self) -> Result<JwkSet, VerifyError> {
        if let Some(entry) = self.cache.read().await.as_ref() {
            if entry.expires_at > Instant::now() {
                return Ok(entry.jwks.clone());
            }
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Result<JwkSet, VerifyError> {
        debug!(url = %self.config.jwks_url, "fetching signing keys");
        let jwks: JwkSet = self
            .client
            .get(&self.config.jwks_url)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| VerifyError::KeySource(e.to_string()))?
            .json()
            .await
            .map_err(|e| VerifyError::KeySource(e.to_string()))?;
        *self.cache.write().await = Some(CachedJwks {
            jwks: jwks.clone(),
            expires_at: Instant::now() + self.config.ttl,
        });
        Ok(jwks)
    }
}

#[async_trait]
impl TokenVerifier for JwksVerifier {
    async fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
        // Reject on the header alone before touching the network.
        let header = decode_header(token).map_err(|e| VerifyError::Malformed(e.to_string()))?;
        if !self.config.algorithms.contains(&header.alg) {
            return Err(VerifyError::UnsupportedAlgorithm);
        }
        let kid = header.kid.as_deref().ok_or(VerifyError::MissingKeyId)?;

        let jwk = match self.key_set().await?.find(kid).cloned() {
            Some(jwk) => jwk,
            None => self
                .refresh()
                .await?
                .find(kid)
                .cloned()
                .ok_or(VerifyError::UnknownKey)?,
        };
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| VerifyError::KeySource(e.to_string()))?;

        let mut validation = Validation::new(header.alg);
        validation.algorithms = self.config.algorithms.clone();
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.validate_aud = false;
        validation.leeway = self.config.leeway_secs;

        let data = decode::<TokenClaims>(token, &key, &validation)
            .map_err(|e| VerifyError::Rejected(e.to_string()))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;

    fn offline_verifier() -> JwksVerifier {
        let mut config = JwksConfig::for_issuer("https://auth.example/realms/iot/");
        // Nothing listens on the discard port, so refreshes fail fast.
        config.jwks_url = "http://127.0.0.1:9/certs".to_string();
        JwksVerifier::with_key_set(config, JwkSet { keys: Vec::new() })
    }

    fn unsigned_token(header: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(header.to_string());
        let claims = URL_SAFE_NO_PAD.encode(json!({"sub": "u-1"}).to_string());
        format!("{header}.{claims}.c2ln")
    }

    #[test]
    fn keycloak_jwks_url_is_derived_from_issuer() {
        let config = JwksConfig::for_issuer("https://auth.example/realms/iot/");
        assert_eq!(
            config.jwks_url,
            "https://auth.example/realms/iot/protocol/openid-connect/certs"
        );
        assert_eq!(config.algorithms, vec![Algorithm::RS256]);
        assert_eq!(config.issuer, "https://auth.example/realms/iot");
    }

    #[tokio::test]
    async fn garbage_is_malformed() {
        let err = offline_verifier().verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, VerifyError::Malformed(_)));
    }

    #[tokio::test]
    async fn symmetric_tokens_are_refused() {
        let token = encode(
            &Header::default(),
            &json!({"sub": "u-1"}),
            &EncodingKey::from_secret(b"shared"),
        )
        .unwrap();
        let err = offline_verifier().verify(&token).await.unwrap_err();
        assert!(matches!(err, VerifyError::UnsupportedAlgorithm));
    }

    #[tokio::test]
    async fn token_without_kid_is_refused() {
        let token = unsigned_token(json!({"alg": "RS256", "typ": "JWT"}));
        let err = offline_verifier().verify(&token).await.unwrap_err();
        assert!(matches!(err, VerifyError::MissingKeyId));
    }

    #[tokio::test]
    async fn unknown_kid_triggers_refresh_and_surfaces_key_source_failure() {
        let token = unsigned_token(json!({"alg": "RS256", "typ": "JWT", "kid": "k9"}));
        let err = offline_verifier().verify(&token).await.unwrap_err();
        assert!(matches!(err, VerifyError::KeySource(_)));
    }

    const ISSUER: &str = "https://auth.example/realms/iot";
    const SIGNING_KEY_PEM: &str = include_str!("../testdata/rsa_signing_key.pem");
    const SIGNING_KEY_N: &str = "yMrbqqaJkKG3xWdpVDyQkizupbdHZKvPe1y3pGt0gMPzVvdVlAeENbJna65fnfH3hUDzNj5uyE3NDDTizCfU37wBKo-vldzGmppWNnPlDXSG688xprzfqzpMVKe0Wq1Wi4vwxys-FgL2TNoRSIbzSwnHFq6raIxCuSFYKZKiDtUUz3luQ7Ge1yg2pKOXZ0udvEI5mUkXaJX5VKxYKBJ5DL1O4HZ11BRWW-11jm1U8mPRhJcI7yJOHCSIvEJIpNBWLDGLZNwdkH9JT5dYPSPeXwgAt5BWRDRB5cV4FGZ33e6u63e6V2JTUQr-TpQmFZ10m7nDxb9ZMh0xsk4AMziJbw";

    /// Verifier that already trusts the fixture key under kid `k1`.
    fn seeded_verifier(issuer: &str) -> JwksVerifier {
        let jwks: JwkSet = serde_json::from_value(json!({
            "keys": [{
                "kty": "RSA",
                "kid": "k1",
                "alg": "RS256",
                "use": "sig",
                "n": SIGNING_KEY_N,
                "e": "AQAB"
            }]
        }))
        .unwrap();
        let mut config = JwksConfig::for_issuer(issuer);
        config.jwks_url = "http://127.0.0.1:9/certs".to_string();
        JwksVerifier::with_key_set(config, jwks)
    }

    fn signed_token(iss: &str, exp_offset_secs: i64) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("k1".to_string());
        let now = chrono::Utc::now().timestamp();
        let claims = json!({
            "iss": iss,
            "sub": "u-1",
            "preferred_username": "alice",
            "iat": now,
            "exp": now + exp_offset_secs,
            "realm_access": {"roles": ["user"]},
        });
        let key = EncodingKey::from_rsa_pem(SIGNING_KEY_PEM.as_bytes()).unwrap();
        encode(&header, &claims, &key).unwrap()
    }

    #[tokio::test]
    async fn accepts_token_signed_by_published_key() {
        let claims = seeded_verifier(ISSUER)
            .verify(&signed_token(ISSUER, 300))
            .await
            .unwrap();
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.preferred_username.as_deref(), Some("alice"));
        assert_eq!(claims.realm_access.unwrap().roles, vec!["user".to_string()]);
    }

    #[tokio::test]
    async fn slash_terminated_issuer_still_matches_tokens() {
        let verifier = seeded_verifier(&format!("{ISSUER}/"));
        assert!(verifier.verify(&signed_token(ISSUER, 300)).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_foreign_issuer() {
        let err = seeded_verifier(ISSUER)
            .verify(&signed_token("https://evil.example/realms/iot", 300))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Rejected(ref m) if m.contains("InvalidIssuer")));
    }

    #[tokio::test]
    async fn rejects_expired_token_beyond_leeway() {
        let err = seeded_verifier(ISSUER)
            .verify(&signed_token(ISSUER, -600))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Rejected(ref m) if m.contains("ExpiredSignature")));
    }

    #[tokio::test]
    async fn rejects_tampered_payload() {
        let token = signed_token(ISSUER, 300);
        let forged = URL_SAFE_NO_PAD.encode(
            json!({"iss": ISSUER, "sub": "u-2", "exp": chrono::Utc::now().timestamp() + 300})
                .to_string(),
        );
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[1] = &forged;
        let err = seeded_verifier(ISSUER)
            .verify(&parts.join("."))
            .await
            .unwrap_err();
        assert!(matches!(err, VerifyError::Rejected(_)));
    }
}
