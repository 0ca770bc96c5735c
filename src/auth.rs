use std::sync::{Arc, Mutex};

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::constants::OAUTH_TOKEN_URL;
use crate::error::{Error, Result};
use crate::http::{BatchExecutor, HttpRequest};

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<String> {
        if self.0.is_empty() {
            return Err(Error::Auth("empty access token".into()));
        }
        Ok(self.0.clone())
    }
}

/// How requests to the generative service are authorized.
///
/// With an API key the key rides in the `key` query parameter and no bearer header is sent.
/// The token provider is still needed for Drive access.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub token: Option<Arc<dyn TokenProvider>>,
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            api_key: Some(key.into()),
            token: None,
        }
    }

    pub fn bearer(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            api_key: None,
            token: Some(provider),
        }
    }

    pub fn with_token(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token = Some(provider);
        self
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        self.api_key
            .iter()
            .map(|key| ("key", key.clone()))
            .collect()
    }

    /// Adds the bearer header only when no API key is configured.
    pub fn authorize(&self, request: HttpRequest) -> Result<HttpRequest> {
        if self.api_key.is_some() {
            return Ok(request);
        }
        Ok(request.bearer(&self.bearer_token()?))
    }

    pub fn bearer_token(&self) -> Result<String> {
        match &self.token {
            Some(provider) => provider.token(),
            None => Err(Error::Auth("no bearer token provider configured".into())),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
}

impl ServiceAccountKey {
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading service account credentials {}", path.display()))?;
        Ok(serde_json::from_str(&text)?)
    }
}

pub struct ServiceAccount {
    key: ServiceAccountKey,
    scopes: Vec<String>,
    executor: Arc<dyn BatchExecutor>,
    cached: Mutex<Option<(String, OffsetDateTime)>>,
}

impl ServiceAccount {
    pub fn new(key: ServiceAccountKey, scopes: &[&str], executor: Arc<dyn BatchExecutor>) -> Self {
        Self {
            key,
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            executor,
            cached: Mutex::new(None),
        }
    }

    fn fetch(&self) -> Result<(String, OffsetDateTime)> {
        let now = OffsetDateTime::now_utc();
        let scope = self.scopes.join(" ");
        let claim = ServiceAccountClaim {
            iss: &self.key.client_email,
            scope: &scope,
            aud: OAUTH_TOKEN_URL,
            exp: now.saturating_add(Duration::minutes(55)).unix_timestamp(),
            iat: now.unix_timestamp(),
        };
        let signing_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|err| Error::Auth(err.to_string()))?;
        let jwt = encode(&Header::new(Algorithm::RS256), &claim, &signing_key)
            .map_err(|err| Error::Auth(err.to_string()))?;
        let form = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer")
            .append_pair("assertion", &jwt)
            .finish();
        let request =
            HttpRequest::post(OAUTH_TOKEN_URL).body("application/x-www-form-urlencoded", form);
        let resp = self.executor.send(request)?;
        if !resp.is_success() {
            return Err(Error::Auth(format!(
                "token exchange failed with status {}: {}",
                resp.status,
                resp.text()
            )));
        }
        let payload: TokenResponse = resp.json()?;
        let expires_at = now + Duration::seconds(payload.expires_in.unwrap_or(3600) as i64);
        Ok((payload.access_token, expires_at))
    }
}

impl TokenProvider for ServiceAccount {
    fn token(&self) -> Result<String> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| Error::Auth("token cache poisoned".into()))?;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at - OffsetDateTime::now_utc() > Duration::minutes(5) {
                return Ok(token.clone());
            }
        }
        let fresh = self.fetch()?;
        let token = fresh.0.clone();
        *cached = Some(fresh);
        Ok(token)
    }
}

#[derive(Serialize)]
struct ServiceAccountClaim<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    exp: i64,
    iat: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}
