//! Driver token verification.
//!
//! Drivers present an HS256 JWT on connect. Token issuance happens in the
//! identity provider; this module only verifies integrity and expiry and
//! extracts the driver identity. Whether the driver actually exists is
//! checked against the store by the caller.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::TrackError;

/// Process-wide JWT verification configuration.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    secret: String,
}

impl JwtConfig {
    /// Minimum secret length for security.
    const MIN_SECRET_LENGTH: usize = 32;

    pub fn try_new(secret: impl Into<String>) -> Result<Self, JwtConfigError> {
        let secret = secret.into();
        if secret.len() < Self::MIN_SECRET_LENGTH {
            return Err(JwtConfigError {
                message: format!(
                    "JWT secret must be at least {} bytes, got {}. \
                     Use a cryptographically secure random secret.",
                    Self::MIN_SECRET_LENGTH,
                    secret.len()
                ),
            });
        }
        Ok(Self { secret })
    }

    /// Read the secret from an environment variable.
    pub fn try_from_env(env_var: &str) -> Result<Self, JwtConfigError> {
        let secret = std::env::var(env_var).map_err(|_| JwtConfigError {
            message: format!(
                "JWT secret environment variable '{}' is not set. \
                 Set it to a cryptographically secure random value (at least 32 bytes).",
                env_var
            ),
        })?;
        Self::try_new(secret)
    }

    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            secret: "test-secret-0123456789-0123456789-ok".to_string(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("JWT config error: {message}")]
pub struct JwtConfigError {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Driver,
    Admin,
}

/// Claims carried by a driver token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverClaims {
    /// Driver id.
    pub sub: String,
    pub phone: String,
    pub role: Role,
    /// Expiration (Unix timestamp).
    pub exp: u64,
    /// Issued at (Unix timestamp).
    pub iat: u64,
}

/// Verified driver identity extracted from a token.
#[derive(Debug, Clone)]
pub struct DriverIdentity {
    pub driver_id: String,
    pub phone: String,
    pub role: Role,
}

/// Verify a token's signature and expiry and extract the driver identity.
///
/// Any malformed, tampered or expired token maps to `AuthInvalid`; the
/// caller distinguishes `AuthUnknown` by looking the driver up.
pub fn verify(token: &str, config: &JwtConfig) -> Result<DriverIdentity, TrackError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let key = DecodingKey::from_secret(config.secret.as_bytes());
    let data =
        decode::<DriverClaims>(token, &key, &validation).map_err(|_| TrackError::AuthInvalid)?;

    Ok(DriverIdentity {
        driver_id: data.claims.sub,
        phone: data.claims.phone,
        role: data.claims.role,
    })
}

/// Issue a token for the given claims. Mirrors what the external identity
/// provider produces; used by operational tooling and tests.
pub fn issue(claims: &DriverClaims, config: &JwtConfig) -> Result<String, TrackError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
    .map_err(|_| TrackError::AuthInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims_expiring_in(hours: i64) -> DriverClaims {
        let now = chrono::Utc::now();
        DriverClaims {
            sub: "DRV1".to_string(),
            phone: "+491701234567".to_string(),
            role: Role::Driver,
            exp: (now + chrono::Duration::hours(hours)).timestamp() as u64,
            iat: now.timestamp() as u64,
        }
    }

    #[test]
    fn valid_token_round_trips() {
        let config = JwtConfig::for_testing();
        let token = issue(&claims_expiring_in(1), &config).unwrap();
        let identity = verify(&token, &config).unwrap();
        assert_eq!(identity.driver_id, "DRV1");
        assert_eq!(identity.role, Role::Driver);
    }

    #[test]
    fn expired_token_is_invalid() {
        let config = JwtConfig::for_testing();
        let token = issue(&claims_expiring_in(-1), &config).unwrap();
        assert!(matches!(
            verify(&token, &config),
            Err(TrackError::AuthInvalid)
        ));
    }

    #[test]
    fn malformed_token_is_invalid() {
        let config = JwtConfig::for_testing();
        assert!(matches!(
            verify("not-a-jwt", &config),
            Err(TrackError::AuthInvalid)
        ));
    }

    #[test]
    fn tampered_token_is_invalid() {
        let config = JwtConfig::for_testing();
        let other = JwtConfig::try_new("another-secret-0123456789-0123456789").unwrap();
        let token = issue(&claims_expiring_in(1), &other).unwrap();
        assert!(matches!(
            verify(&token, &config),
            Err(TrackError::AuthInvalid)
        ));
    }

    #[test]
    fn short_secret_is_rejected() {
        assert!(JwtConfig::try_new("short").is_err());
    }
}
