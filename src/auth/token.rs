//! Chat service tokens.
//!
//! The chat service accepts HS256 JWTs signed with the application
//! secret: `{"user_id": ...}` for a user, `{"server": true}` for the
//! server-side client.

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize)]
struct UserClaims<'a> {
    user_id: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct ServerClaims {
    server: bool,
}

/// Signs chat tokens with the application secret.
#[derive(Clone)]
pub struct TokenSigner {
    key: EncodingKey,
}

impl TokenSigner {
    pub fn new(api_secret: &str) -> Result<Self> {
        if api_secret.is_empty() {
            return Err(Error::Config("Stream API secret is required".to_string()));
        }
        Ok(Self {
            key: EncodingKey::from_secret(api_secret.as_bytes()),
        })
    }

    /// Token a client uses to connect as `user_id`.
    pub fn user_token(&self, user_id: &str) -> Result<String> {
        Ok(encode(&Header::default(), &UserClaims { user_id }, &self.key)?)
    }

    /// Token for server-side REST calls.
    pub fn server_token(&self) -> Result<String> {
        Ok(encode(&Header::default(), &ServerClaims { server: true }, &self.key)?)
    }
}
