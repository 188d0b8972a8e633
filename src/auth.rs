// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Bearer-token validation for auth-gated registry mutations
//!
//! The core only needs a stamp identifying who performed a mutating call;
//! token issuance and user management live outside this crate. A static API
//! token gates registration, unregistration and on-demand probes. With no
//! token configured the server runs in open mode, which is intended for
//! single-operator deployments and tests.

use tracing::warn;

use crate::errors::CoreError;

/// Identity stamped on a mutating call after validation
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Principal the request authenticated as
    pub principal: String,
}

/// Validates `Authorization: Bearer <token>` headers against a static token
#[derive(Clone)]
pub struct AuthValidator {
    token: Option<String>,
}

impl AuthValidator {
    pub fn new(token: Option<String>) -> Self {
        if token.is_none() {
            warn!("no API token configured, mutating routes are open");
        }
        Self { token }
    }

    /// Validate the Authorization header of an auth-gated request.
    pub fn authenticate(&self, header: Option<&str>) -> Result<AuthContext, CoreError> {
        let Some(expected) = &self.token else {
            return Ok(AuthContext {
                principal: "anonymous".to_string(),
            });
        };

        let Some(header) = header else {
            return Err(CoreError::Unauthorized(
                "missing Authorization header".to_string(),
            ));
        };
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| CoreError::Unauthorized("expected a bearer token".to_string()))?;

        if token == expected {
            Ok(AuthContext {
                principal: "api-token".to_string(),
            })
        } else {
            Err(CoreError::Unauthorized("invalid API token".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mode_accepts_anything() {
        let validator = AuthValidator::new(None);
        assert_eq!(validator.authenticate(None).unwrap().principal, "anonymous");
        assert!(validator.authenticate(Some("Bearer whatever")).is_ok());
    }

    #[test]
    fn token_mode_requires_matching_bearer() {
        let validator = AuthValidator::new(Some("s3cret".to_string()));

        assert!(matches!(
            validator.authenticate(None),
            Err(CoreError::Unauthorized(_))
        ));
        assert!(matches!(
            validator.authenticate(Some("s3cret")),
            Err(CoreError::Unauthorized(_))
        ));
        assert!(matches!(
            validator.authenticate(Some("Bearer wrong")),
            Err(CoreError::Unauthorized(_))
        ));
        assert_eq!(
            validator.authenticate(Some("Bearer s3cret")).unwrap().principal,
            "api-token"
        );
    }
}
