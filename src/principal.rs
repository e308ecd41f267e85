//! Caller identity capture and restoration.
//!
//! A [`Principal`] is the identity on whose behalf a message was sent:
//! a bag of claims, duplicates allowed (a caller may hold several roles).
//! At enqueue the identity is serialized into a compact opaque token that
//! travels with the message; at dispatch the token is validated back into
//! a principal for the listener's context.
//!
//! Token format is owned by the [`SecurityTokenService`] implementation.
//! The default service round-trips the claim set as bs58-encoded JSON;
//! hosts with a real token authority (signed JWTs, reference tokens)
//! supply their own implementation.

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub kind: String,
    pub value: String,
}

impl Claim {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    claims: Vec<Claim>,
}

impl Principal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim(mut self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        self.claims.push(Claim::new(kind, value));
        self
    }

    pub fn add_claim(&mut self, kind: impl Into<String>, value: impl Into<String>) {
        self.claims.push(Claim::new(kind, value));
    }

    pub fn has_claim(&self, kind: &str, value: &str) -> bool {
        self.claims
            .iter()
            .any(|c| c.kind == kind && c.value == value)
    }

    /// First claim of the given kind, if any.
    pub fn find_claim(&self, kind: &str) -> Option<&str> {
        self.claims
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.value.as_str())
    }

    pub fn claims(&self) -> &[Claim] {
        &self.claims
    }
}

/// Serializes a principal into an opaque token and back.
pub trait SecurityTokenService: Send + Sync {
    fn issue(&self, principal: &Principal) -> Result<String, Error>;
    fn validate(&self, token: &str) -> Result<Principal, Error>;
}

/// Default token service: the claim set as bs58-encoded JSON.
///
/// The token is opaque and self-contained but unsigned; it preserves
/// claims across the store boundary without vouching for them.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bs58TokenService;

impl SecurityTokenService for Bs58TokenService {
    fn issue(&self, principal: &Principal) -> Result<String, Error> {
        let json = serde_json::to_vec(principal)?;
        Ok(bs58::encode(json).into_string())
    }

    fn validate(&self, token: &str) -> Result<Principal, Error> {
        let json = bs58::decode(token)
            .into_vec()
            .map_err(Error::invalid_token)?;
        serde_json::from_slice(&json).map_err(Error::invalid_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip_preserves_duplicate_claims() {
        let principal = Principal::new()
            .with_claim("name", "test@example.com")
            .with_claim("role", "user")
            .with_claim("role", "staff");

        let svc = Bs58TokenService;
        let token = svc.issue(&principal).unwrap();
        let restored = svc.validate(&token).unwrap();

        assert_eq!(restored, principal);
        assert!(restored.has_claim("role", "user"));
        assert!(restored.has_claim("role", "staff"));
    }

    #[test]
    fn validate_rejects_garbage() {
        let svc = Bs58TokenService;
        assert!(svc.validate("not base58 0OIl").is_err());
    }
}
