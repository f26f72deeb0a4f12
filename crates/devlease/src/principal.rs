use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

pub use devlease_protocol::Tier;

use crate::error::{AuthenticationError, VerifyError};

/// Role granted to every guest connection.
pub const GUEST_ROLE: &str = "guest";

/// The identity attached to a connection or request.
///
/// Only [`Tier::User`] principals carry an `id`; it is the verified token
/// subject and the join key into the reservation ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    id: Option<String>,
    display_name: String,
    roles: BTreeSet<String>,
    tier: Tier,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self {
            id: None,
            display_name: "Anonymous".to_string(),
            roles: BTreeSet::new(),
            tier: Tier::Anonymous,
        }
    }

    pub fn device() -> Self {
        Self {
            id: None,
            display_name: "ESP-Device".to_string(),
            roles: BTreeSet::new(),
            tier: Tier::Device,
        }
    }

    pub fn guest() -> Self {
        Self {
            id: None,
            display_name: "Guest".to_string(),
            roles: BTreeSet::from([GUEST_ROLE.to_string()]),
            tier: Tier::Guest,
        }
    }

    pub fn user(
        id: impl Into<String>,
        display_name: impl Into<String>,
        roles: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            display_name: display_name.into(),
            roles: roles.into_iter().collect(),
            tier: Tier::User,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// Raw credentials presented by a connection handshake or HTTP request.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub device_key: Option<String>,
    pub token: Option<String>,
}

impl Credentials {
    /// Extract the bearer token from an `Authorization` header value.
    pub fn from_authorization(header: Option<&str>) -> Self {
        let token = header.and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| token.trim().to_string())
        });
        Self {
            device_key: None,
            token,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleGrant {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims of a verified identity-provider token that matter here.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Issuer-level role grants.
    #[serde(default)]
    pub realm_access: Option<RoleGrant>,
    /// Application-level role grants keyed by client id.
    #[serde(default)]
    pub resource_access: HashMap<String, RoleGrant>,
}

/// Verifies a signed token against the trust anchor and returns its claims.
///
/// Key retrieval and caching live behind this seam.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError>;
}

/// Turns raw credentials into a [`Principal`].
pub struct PrincipalResolver {
    device_key: Option<String>,
    verifier: Arc<dyn TokenVerifier>,
    client_id: String,
}

impl PrincipalResolver {
    /// `device_key` of `None` (or empty) disables the device tier.
    /// `client_id` selects which application's roles are merged into the
    /// issuer-level roles.
    pub fn new(
        device_key: Option<String>,
        verifier: Arc<dyn TokenVerifier>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            device_key: device_key.filter(|k| !k.is_empty()),
            verifier,
            client_id: client_id.into(),
        }
    }

    /// Resolve a real-time handshake.
    ///
    /// First match wins: device key, then guest (no token), then user.
    /// A present but invalid token is an error, never a silent downgrade.
    pub async fn resolve(&self, creds: &Credentials) -> Result<Principal, AuthenticationError> {
        if let Some(presented) = creds.device_key.as_deref() {
            if self.device_key_matches(presented) {
                debug!("device key accepted");
                return Ok(Principal::device());
            }
            warn!("device key mismatch, continuing as non-device");
        }

        match creds.token.as_deref().filter(|t| !t.is_empty()) {
            None => Ok(Principal::guest()),
            Some(token) => self.resolve_token(token).await,
        }
    }

    /// Resolve an HTTP request. Only bearer tokens are honoured here; a request
    /// without one is anonymous.
    pub async fn resolve_request(
        &self,
        authorization: Option<&str>,
    ) -> Result<Principal, AuthenticationError> {
        let creds = Credentials::from_authorization(authorization);
        match creds.token.as_deref().filter(|t| !t.is_empty()) {
            None => Ok(Principal::anonymous()),
            Some(token) => self.resolve_token(token).await,
        }
    }

    async fn resolve_token(&self, token: &str) -> Result<Principal, AuthenticationError> {
        let claims = self.verifier.verify(token).await.map_err(|err| {
            warn!(error = %err, "token verification failed");
            AuthenticationError::InvalidToken(err)
        })?;
        let principal = self.principal_from_claims(claims);
        info!(
            user = %principal.display_name(),
            roles = ?principal.roles(),
            "user authenticated"
        );
        Ok(principal)
    }

    fn principal_from_claims(&self, claims: TokenClaims) -> Principal {
        let mut roles: BTreeSet<String> = claims
            .realm_access
            .map(|grant| grant.roles.into_iter().collect())
            .unwrap_or_default();
        if let Some(grant) = claims.resource_access.get(&self.client_id) {
            roles.extend(grant.roles.iter().cloned());
        }
        let display_name = claims
            .preferred_username
            .unwrap_or_else(|| claims.sub.clone());
        Principal::user(claims.sub, display_name, roles)
    }

    fn device_key_matches(&self, presented: &str) -> bool {
        match &self.device_key {
            Some(expected) => bool::from(expected.as_bytes().ct_eq(presented.as_bytes())),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Accepts tokens from a fixed table; everything else is rejected.
    struct TableVerifier(HashMap<String, TokenClaims>);

    #[async_trait]
    impl TokenVerifier for TableVerifier {
        async fn verify(&self, token: &str) -> Result<TokenClaims, VerifyError> {
            self.0
                .get(token)
                .cloned()
                .ok_or_else(|| VerifyError::Rejected("bad signature".to_string()))
        }
    }

    fn resolver() -> PrincipalResolver {
        let claims: TokenClaims = serde_json::from_value(json!({
            "sub": "u-1",
            "preferred_username": "alice",
            "realm_access": {"roles": ["user", "offline_access"]},
            "resource_access": {
                "esp-web-app": {"roles": ["admin", "user"]},
                "other-app": {"roles": ["ignored"]}
            }
        }))
        .unwrap();
        let verifier = TableVerifier(HashMap::from([("good".to_string(), claims)]));
        PrincipalResolver::new(Some("s3cret".to_string()), Arc::new(verifier), "esp-web-app")
    }

    #[tokio::test]
    async fn device_key_wins_over_token() {
        let creds = Credentials {
            device_key: Some("s3cret".to_string()),
            token: Some("garbage".to_string()),
        };
        let principal = resolver().resolve(&creds).await.unwrap();
        assert_eq!(principal.tier(), Tier::Device);
        assert!(principal.id().is_none());
        assert!(principal.roles().is_empty());
    }

    #[tokio::test]
    async fn no_token_is_guest() {
        let principal = resolver().resolve(&Credentials::default()).await.unwrap();
        assert_eq!(principal.tier(), Tier::Guest);
        assert!(principal.has_role(GUEST_ROLE));
        assert!(principal.id().is_none());
    }

    #[tokio::test]
    async fn wrong_device_key_without_token_degrades_to_guest() {
        let creds = Credentials {
            device_key: Some("nope".to_string()),
            token: None,
        };
        let principal = resolver().resolve(&creds).await.unwrap();
        assert_eq!(principal.tier(), Tier::Guest);
    }

    #[tokio::test]
    async fn unconfigured_device_key_never_matches() {
        let verifier = TableVerifier(HashMap::new());
        let resolver = PrincipalResolver::new(Some(String::new()), Arc::new(verifier), "app");
        let creds = Credentials {
            device_key: Some(String::new()),
            token: None,
        };
        let principal = resolver.resolve(&creds).await.unwrap();
        assert_eq!(principal.tier(), Tier::Guest);
    }

    #[tokio::test]
    async fn valid_token_merges_realm_and_client_roles() {
        let creds = Credentials {
            device_key: None,
            token: Some("good".to_string()),
        };
        let principal = resolver().resolve(&creds).await.unwrap();
        assert_eq!(principal.tier(), Tier::User);
        assert_eq!(principal.id(), Some("u-1"));
        assert_eq!(principal.display_name(), "alice");
        let roles: Vec<&str> = principal.roles().iter().map(String::as_str).collect();
        assert_eq!(roles, vec!["admin", "offline_access", "user"]);
    }

    #[tokio::test]
    async fn invalid_token_fails_instead_of_downgrading() {
        let creds = Credentials {
            device_key: None,
            token: Some("forged".to_string()),
        };
        let err = resolver().resolve(&creds).await.unwrap_err();
        assert!(matches!(err, AuthenticationError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn request_without_bearer_is_anonymous() {
        let principal = resolver().resolve_request(None).await.unwrap();
        assert_eq!(principal.tier(), Tier::Anonymous);

        let principal = resolver().resolve_request(Some("Basic abc")).await.unwrap();
        assert_eq!(principal.tier(), Tier::Anonymous);
    }

    #[tokio::test]
    async fn request_bearer_resolves_user() {
        let principal = resolver().resolve_request(Some("Bearer good")).await.unwrap();
        assert_eq!(principal.id(), Some("u-1"));
        assert!(resolver().resolve_request(Some("bearer forged")).await.is_err());
    }

    #[test]
    fn display_name_falls_back_to_subject() {
        let claims: TokenClaims = serde_json::from_value(json!({"sub": "u-2"})).unwrap();
        let principal = resolver().principal_from_claims(claims);
        assert_eq!(principal.display_name(), "u-2");
        assert!(principal.roles().is_empty());
    }
}
