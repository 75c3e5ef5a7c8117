use log::warn;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use crate::auth::Token;
use crate::config::ServerConfig;
use crate::error::{ChainLensError, Result};

/// HTTP plumbing shared by all REST calls against one server.
pub struct RestClient {
    client: Client,
    base_url: Url,
    server_id: String,
    token: Option<Token>,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RestClient {
    pub fn new(config: &ServerConfig, token: Option<Token>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("chainlens/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ChainLensError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut base = config.url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ChainLensError::Config(format!("Invalid base URL '{}': {e}", config.url)))?;

        Ok(Self {
            client,
            base_url,
            server_id: config.id.clone(),
            token,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ChainLensError::Config(format!("Invalid endpoint '{path}': {e}")))
    }

    /// GET a JSON document. `None` when the server answers 404.
    pub async fn get_json<T>(&self, path: &str, query: &[(&str, String)]) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get(path, query, "application/json").await? {
            Some(response) => Ok(Some(response.json().await?)),
            None => Ok(None),
        }
    }

    /// GET a plain-text document. `None` when the server answers 404.
    pub async fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<Option<String>> {
        match self.get(path, query, "text/plain").await? {
            Some(response) => Ok(Some(response.text().await?)),
            None => Ok(None),
        }
    }

    /// Executes a GET with retry on network errors, rate limits and server errors.
    async fn get(
        &self,
        path: &str,
        query: &[(&str, String)],
        accept: &str,
    ) -> Result<Option<reqwest::Response>> {
        let url = self.endpoint(path)?;

        // One permit per logical request, retries included
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| ChainLensError::Task(format!("request limiter closed: {e}")))?;

        let mut retry_count = 0;
        loop {
            let request = self.auth_request(
                self.client
                    .get(url.clone())
                    .query(query)
                    .header(reqwest::header::ACCEPT, accept),
            );

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                    if retry_count >= self.max_retries {
                        return Err(ChainLensError::upstream(&self.server_id, e));
                    }
                    warn!(
                        "Network error on {} ({}), retrying in {}s ({}/{})...",
                        self.server_id,
                        e,
                        self.retry_delay.as_secs(),
                        retry_count + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                if retry_count >= self.max_retries {
                    return Err(ChainLensError::upstream(
                        &self.server_id,
                        format!("status {status} after {} retries", self.max_retries),
                    ));
                }

                warn!(
                    "{} API error (status {status}). Waiting {}s before retry {}/{}...",
                    self.server_id,
                    self.retry_delay.as_secs(),
                    retry_count + 1,
                    self.max_retries
                );

                tokio::time::sleep(self.retry_delay).await;
                retry_count += 1;
                continue;
            }

            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ChainLensError::Unauthorized(self.server_id.clone()));
            }

            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(ChainLensError::Api {
                    status: status.as_u16(),
                    message,
                });
            }

            return Ok(Some(response));
        }
    }
}
