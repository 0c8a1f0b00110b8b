//! Clerk identity provider.
//!
//! Session tokens are verified locally against the instance's PEM
//! public key (RS256); the profile then comes from the Clerk backend API.

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::agent::UserProfile;
use crate::config::Config;
use crate::error::Error;
use crate::Result;

use super::IdentityProvider;

#[derive(Debug, Deserialize)]
struct SessionClaims {
    sub: String,
}

/// User object returned by `GET /users/{id}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ClerkUser {
    id: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

impl ClerkUser {
    /// Chat profile: first name, else username, else "User".
    pub(crate) fn into_profile(self) -> UserProfile {
        let name = [self.first_name, self.username]
            .into_iter()
            .flatten()
            .find(|n| !n.is_empty())
            .unwrap_or_else(|| "User".to_string());
        UserProfile {
            id: self.id,
            name,
            image: self.image_url.filter(|url| !url.is_empty()),
        }
    }
}

/// `{api_url}/users/{user_id}` with the id percent-encoded as one segment.
fn user_url(api_url: &str, user_id: &str) -> Result<Url> {
    let mut url =
        Url::parse(api_url).map_err(|e| Error::Config(format!("invalid Clerk API URL: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| Error::Config("Clerk API URL cannot be a base".to_string()))?
        .pop_if_empty()
        .extend(["users", user_id]);
    Ok(url)
}

/// Clerk-backed [`IdentityProvider`].
pub struct ClerkIdentity {
    secret_key: String,
    api_url: String,
    decoding_key: DecodingKey,
    client: Client,
}

impl ClerkIdentity {
    pub fn from_config(config: &Config) -> Result<Self> {
        if config.clerk_secret_key.is_empty() || config.clerk_jwt_key.is_empty() {
            return Err(Error::Config(
                "Clerk secret key and JWT public key are required".to_string(),
            ));
        }
        let decoding_key = DecodingKey::from_rsa_pem(config.clerk_jwt_key.as_bytes())?;
        Ok(Self {
            secret_key: config.clerk_secret_key.clone(),
            api_url: config.clerk_api_url.trim_end_matches('/').to_string(),
            decoding_key,
            client: Client::new(),
        })
    }

    fn verify_session(&self, token: &str) -> Result<String> {
        let validation = Validation::new(Algorithm::RS256);
        let data = decode::<SessionClaims>(token, &self.decoding_key, &validation)
            .map_err(|e| Error::Auth(format!("invalid session token: {e}")))?;
        Ok(data.claims.sub)
    }

    async fn fetch_user(&self, user_id: &str) -> Result<ClerkUser> {
        let response = self
            .client
            .get(user_url(&self.api_url, user_id)?)
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound("Clerk user not found".to_string())),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::Transport(format!("Clerk API error ({status}): {body}")))
            }
            _ => Ok(response.json().await?),
        }
    }
}

#[async_trait]
impl IdentityProvider for ClerkIdentity {
    async fn authenticate(&self, bearer: &str) -> Result<UserProfile> {
        let user_id = self.verify_session(bearer)?;
        debug!(user = %user_id, "Clerk session verified");
        Ok(self.fetch_user(&user_id).await?.into_profile())
    }
}
