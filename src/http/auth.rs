// ABOUTME: Bearer JWT verification for the HTTP session layer
// ABOUTME: JWKS rotation and remote key fetch are out of scope; HS256 shared-secret only

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{AppError, ErrorKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Verifies bearer tokens against the configured shared secret, issuer,
/// audience and required scopes (spec section 6, auth gate).
pub struct JwtVerifier {
    config: AuthConfig,
}

impl JwtVerifier {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AppError> {
        let secret = self
            .config
            .jwt_secret
            .as_ref()
            .ok_or_else(|| AppError::new(ErrorKind::Internal, "no JWT secret configured"))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &self.config.audience {
            validation.set_audience(&[audience]);
        }

        let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
            .map_err(|_| AppError::new(ErrorKind::AuthInvalid, "token signature or claims are invalid"))?;

        if !self.config.required_scopes.is_empty() {
            let granted: Vec<&str> = data.claims.scope.as_deref().unwrap_or("").split(' ').collect();
            let satisfied = self.config.required_scopes.iter().all(|s| granted.contains(&s.as_str()));
            if !satisfied {
                return Err(AppError::new(ErrorKind::AuthInvalid, "token is missing a required scope"));
            }
        }

        Ok(data.claims)
    }
}
