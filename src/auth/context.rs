use super::Claims;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Authenticated user context extracted from a verified JWT
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// User ID (from JWT sub claim)
    pub user_id: Uuid,

    /// User email if available
    pub email: Option<String>,

    /// User role if specified
    pub role: Option<String>,

    /// Token issuer
    pub issuer: String,
}

impl AuthContext {
    pub fn from_claims(claims: &Claims) -> Result<Self, &'static str> {
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| "Invalid user ID in token")?;

        Ok(Self {
            user_id,
            email: claims.email.clone(),
            role: claims.role.clone(),
            issuer: claims.iss.clone(),
        })
    }

    /// Operator-only endpoints (settlement runs) sit behind this check.
    pub fn require_admin(&self) -> ApiResult<()> {
        match self.role.as_deref() {
            Some("admin") | Some("operator") => Ok(()),
            _ => Err(ApiError::Forbidden(
                "this endpoint requires an operator role".into(),
            )),
        }
    }
}
