use async_trait::async_trait;
use reqwest::Client;

use super::error::FetchError;
use crate::config::FetchConfig;

/// Status, `Retry-After` seconds (if any) and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub retry_after: Option<u64>,
    pub body: String,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            retry_after: None,
            body: body.into(),
        }
    }
}

/// A single GET with no retry logic. `FetchClient` layers retries on top.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<RawResponse, FetchError>;
}

/// Production transport on a shared `reqwest::Client` (timeout, user agent
/// and optional proxy are fixed at construction).
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
}

impl ReqwestTransport {
    pub fn new(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let mut builder = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout);
        if let Some(proxy) = cfg.proxy.as_deref() {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        Ok(Self {
            http: builder.build()?,
        })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<RawResponse, FetchError> {
        let mut req = self.http.get(url);
        if !params.is_empty() {
            req = req.query(params);
        }
        for (name, value) in headers {
            req = req.header(name.as_str(), value.as_str());
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = resp.text().await?;
        Ok(RawResponse {
            status,
            retry_after,
            body,
        })
    }
}
