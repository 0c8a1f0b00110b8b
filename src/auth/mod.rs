//! Authentication module for sign-in and chat tokens
//!
//! This module provides:
//! - [`IdentityProvider`]: maps an inbound bearer credential to a user
//! - [`ClerkIdentity`]: Clerk session verification + profile lookup
//! - [`TokenSigner`]: HS256 tokens for the chat service

mod clerk;
mod token;

use async_trait::async_trait;

use crate::agent::UserProfile;
use crate::error::Error;
use crate::Result;

pub use clerk::ClerkIdentity;
pub use token::TokenSigner;

/// Identity provider trait: resolves who is calling.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a bearer credential and return the caller's profile.
    async fn authenticate(&self, bearer: &str) -> Result<UserProfile>;
}

/// Provider used when sign-in is not configured; rejects every caller.
pub struct DisabledIdentity;

#[async_trait]
impl IdentityProvider for DisabledIdentity {
    async fn authenticate(&self, _bearer: &str) -> Result<UserProfile> {
        Err(Error::Auth("sign-in is not configured".to_string()))
    }
}

/// Extract the token from an `Authorization: Bearer ...` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// Fixed token → profile table for tests.
#[cfg(test)]
pub struct StaticIdentity {
    pub users: std::collections::HashMap<String, UserProfile>,
}

#[cfg(test)]
#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn authenticate(&self, bearer: &str) -> Result<UserProfile> {
        self.users
            .get(bearer)
            .cloned()
            .ok_or_else(|| Error::Auth("invalid session token".to_string()))
    }
}
