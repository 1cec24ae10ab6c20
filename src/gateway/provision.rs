use crate::config::ProvisionConfig;
use crate::validator::{self, PhoneNumber};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Issues access tokens for the calling SDK. The gateway refreshes through
/// this on credential failure.
#[async_trait::async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a usable access token, fetching one if none is cached.
    async fn access_token(&self) -> Result<String>;
    /// Discard any cached token and fetch a fresh one.
    async fn refresh_token(&self) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    platform: &'a str,
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct PhoneNumbersRequest<'a> {
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct PhoneNumbersResponse {
    #[serde(rename = "phoneNumbers")]
    phone_numbers: Vec<String>,
}

/// HTTP client for the token/phone-number provisioning endpoints. Fetched
/// tokens are cached until a refresh is forced.
pub struct ProvisioningClient {
    client: reqwest::Client,
    config: ProvisionConfig,
    cached_token: RwLock<Option<String>>,
}

impl ProvisioningClient {
    pub fn new(config: ProvisionConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            cached_token: RwLock::new(None),
        }
    }

    async fn fetch_token(&self) -> Result<String> {
        if self.config.token_url.is_empty() {
            return Err(anyhow!("no token endpoint configured"));
        }
        let response = self
            .client
            .post(&self.config.token_url)
            .json(&TokenRequest {
                platform: &self.config.platform,
                api_key: &self.config.api_key,
            })
            .send()
            .await
            .context("token request failed")?
            .error_for_status()
            .context("token endpoint rejected the request")?;
        let body: TokenResponse = response.json().await.context("bad token response")?;
        info!("access token fetched");
        Ok(body.token)
    }

    /// Fetch the outbound caller-number inventory. Entries that fail
    /// validation are dropped.
    pub async fn fetch_phone_numbers(&self) -> Result<Vec<PhoneNumber>> {
        if self.config.phone_numbers_url.is_empty() {
            return Err(anyhow!("no phone-numbers endpoint configured"));
        }
        let response = self
            .client
            .post(&self.config.phone_numbers_url)
            .json(&PhoneNumbersRequest {
                api_key: &self.config.api_key,
            })
            .send()
            .await
            .context("phone-numbers request failed")?
            .error_for_status()
            .context("phone-numbers endpoint rejected the request")?;
        let body: PhoneNumbersResponse =
            response.json().await.context("bad phone-numbers response")?;

        let mut numbers = Vec::with_capacity(body.phone_numbers.len());
        for raw in body.phone_numbers {
            match validator::validate(&raw) {
                Ok(number) => numbers.push(number),
                Err(e) => warn!(raw, "skipping provisioned number: {}", e),
            }
        }
        info!(count = numbers.len(), "caller numbers fetched");
        Ok(numbers)
    }
}

#[async_trait::async_trait]
impl TokenProvider for ProvisioningClient {
    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token.read().await.clone() {
            return Ok(token);
        }
        let token = self.fetch_token().await?;
        *self.cached_token.write().await = Some(token.clone());
        Ok(token)
    }

    async fn refresh_token(&self) -> Result<String> {
        let token = self.fetch_token().await?;
        *self.cached_token.write().await = Some(token.clone());
        Ok(token)
    }
}
