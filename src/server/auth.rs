//! Token issuance and operator sessions.
//!
//! One signing mechanism serves two subject spaces:
//!
//! - per-license device tokens (`sub` = license id, 12 h default), minted
//!   by the validation engine, and
//! - the reserved operator subject [`ADMIN_SUBJECT`] (24 h default),
//!   carried in an HTTP-only session cookie.
//!
//! Verification fails closed: a bad signature, malformed payload, wrong
//! issuer/audience, or past expiry all yield `None`. Callers must check
//! which subject space they expect.
//!
//! # Configuration
//!
//! Set via `config.toml` or environment variables:
//! - `KEYWARDEN_JWT_SECRET` - required secret for HS256 signing
//! - `KEYWARDEN_JWT_ISSUER` / `KEYWARDEN_JWT_AUDIENCE` - claim pinning
//! - `KEYWARDEN_ADMIN_PASSWORD` - operator login credential

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::request::Parts,
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{get_config, AuthConfig};
use crate::errors::{ServiceError, ServiceResult};
use crate::server::handlers::{AppState, MessageResponse};

/// Reserved subject id for operator sessions.
pub const ADMIN_SUBJECT: &str = "admin";

/// Device slot used in operator session tokens.
pub const ADMIN_DEVICE: &str = "system";

/// Name of the operator session cookie.
pub const ADMIN_COOKIE: &str = "admin_token";

/// Token claims.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: a license id, or [`ADMIN_SUBJECT`] for operator sessions
    pub sub: String,
    /// Device id the token is bound to
    pub dev: String,
    /// Issued at (Unix timestamp)
    pub iat: u64,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issuer
    pub iss: String,
    /// Audience
    pub aud: String,
}

impl Claims {
    /// Whether these claims belong to the operator subject space.
    pub fn is_admin(&self) -> bool {
        self.sub == ADMIN_SUBJECT
    }
}

/// Issues and verifies signed bearer tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
    device_ttl_secs: u64,
    admin_ttl_secs: u64,
}

impl TokenIssuer {
    /// Create a token issuer from auth configuration.
    pub fn from_config(config: &AuthConfig) -> ServiceResult<Self> {
        if config.jwt_secret.is_empty() {
            return Err(ServiceError::Config(
                "auth.jwt_secret is required".to_string(),
            ));
        }

        // Resolve secret (support env: prefix for environment variable)
        let secret = if let Some(env_var) = config.jwt_secret.strip_prefix("env:") {
            std::env::var(env_var).map_err(|_| {
                ServiceError::Config(format!(
                    "environment variable '{env_var}' not found for jwt_secret"
                ))
            })?
        } else {
            config.jwt_secret.clone()
        };

        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.set_issuer(&[&config.jwt_issuer]);
        validation.set_audience(&[&config.jwt_audience]);
        validation.validate_exp = true;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
            device_ttl_secs: config.device_token_secs,
            admin_ttl_secs: config.admin_session_secs,
        })
    }

    /// Mint a token for the given subject and device with an explicit TTL.
    pub fn issue(&self, subject: &str, device_id: &str, ttl_secs: u64) -> ServiceResult<String> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| ServiceError::Internal(format!("system time error: {e}")))?
            .as_secs();

        let claims = Claims {
            sub: subject.to_string(),
            dev: device_id.to_string(),
            iat: now,
            exp: now + ttl_secs,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ServiceError::Internal(format!("failed to create token: {e}")))
    }

    /// Mint a device token for a validated license.
    pub fn issue_device_token(&self, license_id: &str, device_id: &str) -> ServiceResult<String> {
        self.issue(license_id, device_id, self.device_ttl_secs)
    }

    /// Mint an operator session token.
    pub fn issue_admin_token(&self) -> ServiceResult<String> {
        self.issue(ADMIN_SUBJECT, ADMIN_DEVICE, self.admin_ttl_secs)
    }

    /// Verify a token, failing closed.
    ///
    /// Any signature mismatch, malformed payload, claim mismatch, or past
    /// expiry yields `None`; this never surfaces an error to the caller.
    pub fn verify(&self, token: &str) -> Option<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .ok()
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("device_ttl_secs", &self.device_ttl_secs)
            .field("admin_ttl_secs", &self.admin_ttl_secs)
            .finish()
    }
}

/// Extractor proving the request carries a valid operator session.
///
/// ```rust,ignore
/// async fn protected_handler(_operator: Operator) -> impl IntoResponse { ... }
/// ```
#[derive(Debug, Clone)]
pub struct Operator;

#[async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let token = jar
            .get(ADMIN_COOKIE)
            .ok_or_else(|| ServiceError::Unauthorized("not logged in".to_string()))?;

        let claims = state
            .issuer
            .verify(token.value())
            .ok_or_else(|| ServiceError::Unauthorized("invalid or expired session".to_string()))?;

        if !claims.is_admin() {
            return Err(ServiceError::Unauthorized(
                "invalid session subject".to_string(),
            ));
        }

        Ok(Operator)
    }
}

/// Request body for operator login.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: Option<String>,
}

/// POST /auth/login - exchange the shared operator credential for a
/// session cookie.
pub async fn login_handler(
    State(state): State<AppState>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> ServiceResult<(CookieJar, Json<MessageResponse>)> {
    let password = req
        .password
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ServiceError::InvalidInput("password is required".to_string()))?;

    let config = get_config()?;
    if config.auth.admin_password.is_empty() {
        warn!("operator login rejected: no admin password configured");
        return Err(ServiceError::Unauthorized("invalid password".to_string()));
    }

    if password != config.auth.admin_password {
        warn!("operator login rejected: wrong password");
        return Err(ServiceError::Unauthorized("invalid password".to_string()));
    }

    let token = state.issuer.issue_admin_token()?;

    let cookie = Cookie::build((ADMIN_COOKIE, token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .build();

    info!("operator logged in");
    Ok((jar.add(cookie), Json(MessageResponse::new("login successful"))))
}

/// POST /auth/logout - clear the session cookie. Clears unconditionally,
/// matching login's single-tenant model; no session check required.
pub async fn logout_handler(jar: CookieJar) -> (CookieJar, Json<MessageResponse>) {
    let cookie = Cookie::build((ADMIN_COOKIE, "")).path("/").build();
    (
        jar.remove(cookie),
        Json(MessageResponse::new("logout successful")),
    )
}

/// GET /auth/verify - 200 when the session cookie is valid, 401 otherwise.
pub async fn verify_session_handler(_operator: Operator) -> Json<MessageResponse> {
    Json(MessageResponse::new("session valid"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AuthConfig {
        AuthConfig {
            admin_password: "correct-horse".to_string(),
            jwt_secret: "test-secret-key-for-testing-only".to_string(),
            jwt_issuer: "keywarden".to_string(),
            jwt_audience: "keywarden-api".to_string(),
            admin_session_secs: 24 * 3600,
            device_token_secs: 12 * 3600,
        }
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let issuer = TokenIssuer::from_config(&test_config()).unwrap();

        let token = issuer.issue_device_token("lic-123", "device-abc").unwrap();
        let claims = issuer.verify(&token).unwrap();

        assert_eq!(claims.sub, "lic-123");
        assert_eq!(claims.dev, "device-abc");
        assert_eq!(claims.iss, "keywarden");
        assert_eq!(claims.aud, "keywarden-api");
        assert!(claims.exp > claims.iat);
        assert!(!claims.is_admin());
    }

    #[test]
    fn admin_token_uses_reserved_subject() {
        let issuer = TokenIssuer::from_config(&test_config()).unwrap();

        let token = issuer.issue_admin_token().unwrap();
        let claims = issuer.verify(&token).unwrap();

        assert_eq!(claims.sub, ADMIN_SUBJECT);
        assert_eq!(claims.dev, ADMIN_DEVICE);
        assert!(claims.is_admin());
    }

    #[test]
    fn verify_rejects_garbage() {
        let issuer = TokenIssuer::from_config(&test_config()).unwrap();
        assert!(issuer.verify("not-a-token").is_none());
        assert!(issuer.verify("").is_none());
    }

    #[test]
    fn verify_rejects_tampered_signature() {
        let issuer = TokenIssuer::from_config(&test_config()).unwrap();
        let token = issuer.issue_device_token("lic-123", "device-abc").unwrap();

        // Flip the last character of the signature segment.
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });

        assert!(issuer.verify(&tampered).is_none());
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let issuer = TokenIssuer::from_config(&test_config()).unwrap();
        let other = TokenIssuer::from_config(&AuthConfig {
            jwt_secret: "a-completely-different-secret".to_string(),
            ..test_config()
        })
        .unwrap();

        let token = issuer.issue_device_token("lic-123", "device-abc").unwrap();
        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn verify_rejects_expired_token() {
        let config = test_config();
        let issuer = TokenIssuer::from_config(&config).unwrap();

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs();

        // Expired two hours ago, well past any validation leeway.
        let expired = Claims {
            sub: "lic-123".to_string(),
            dev: "device-abc".to_string(),
            iat: now - 4 * 3600,
            exp: now - 2 * 3600,
            iss: config.jwt_issuer.clone(),
            aud: config.jwt_audience.clone(),
        };

        let token = encode(
            &Header::default(),
            &expired,
            &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
        )
        .unwrap();

        assert!(issuer.verify(&token).is_none());
    }

    #[test]
    fn verify_rejects_wrong_issuer() {
        let issuer = TokenIssuer::from_config(&test_config()).unwrap();
        let other = TokenIssuer::from_config(&AuthConfig {
            jwt_issuer: "someone-else".to_string(),
            ..test_config()
        })
        .unwrap();

        let token = other.issue_device_token("lic-123", "device-abc").unwrap();
        assert!(issuer.verify(&token).is_none());
    }

    #[test]
    fn empty_secret_fails() {
        let config = AuthConfig {
            jwt_secret: String::new(),
            ..test_config()
        };
        assert!(TokenIssuer::from_config(&config).is_err());
    }
}
