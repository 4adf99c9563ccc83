//! Generic HTTP GET with timeout, retry/backoff and request decoration.
//!
//! Transient failures (429/503, transport errors) are retried with capped
//! exponential backoff and jitter; once the budget is spent the caller gets
//! `Ok(None)`. Any other non-2xx status is terminal for that request and comes
//! back as `FetchError::Status`.

mod credentials;
mod error;
mod transport;

pub use credentials::CredentialPool;
pub use error::FetchError;
pub use transport::{RawResponse, ReqwestTransport, Transport};

use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::FetchConfig;

pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&FetchConfig::default())
    }
}

impl From<&FetchConfig> for RetryPolicy {
    fn from(cfg: &FetchConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            base_delay: cfg.backoff_base,
            max_delay: cfg.backoff_cap,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn is_transient(status: u16) -> bool {
        matches!(status, 429 | 503)
    }

    /// `min(cap, base * 2^attempt)` plus jitter in `[0, base)`; a larger
    /// `Retry-After` (also capped) wins.
    pub fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let mut delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter && !self.base_delay.is_zero() {
            let base_ms = self.base_delay.as_millis().max(1) as u64;
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..base_ms));
        }
        if let Some(secs) = retry_after_secs {
            let hinted = Duration::from_secs(secs).min(self.max_delay);
            delay = delay.max(hinted);
        }
        delay
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub max_retries: Option<u32>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    pub fn header(mut self, name: &str, value: impl ToString) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = Some(n);
        self
    }
}

#[derive(Clone)]
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    default_headers: Vec<(String, String)>,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            policy,
            default_headers: vec![("Accept".to_string(), "application/json".to_string())],
        }
    }

    pub fn from_config(cfg: &FetchConfig) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(cfg)?;
        Ok(Self::new(Arc::new(transport), RetryPolicy::from(cfg)))
    }

    pub fn with_default_header(mut self, name: &str, value: impl ToString) -> Self {
        self.default_headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        self.default_headers
            .push((name.to_string(), value.to_string()));
        self
    }

    fn merged_headers(&self, overrides: &[(String, String)]) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .default_headers
            .iter()
            .filter(|(k, _)| !overrides.iter().any(|(o, _)| o.eq_ignore_ascii_case(k)))
            .cloned()
            .collect();
        out.extend(overrides.iter().cloned());
        out
    }

    /// Raw body of a 2xx response, `None` once transient retries are exhausted.
    pub async fn get_text(&self, req: &FetchRequest) -> Result<Option<String>, FetchError> {
        let max_retries = req.max_retries.unwrap_or(self.policy.max_retries);
        let headers = self.merged_headers(&req.headers);
        let mut attempt: u32 = 0;
        loop {
            let retry_after = match self.transport.get(&req.url, &req.params, &headers).await {
                Ok(resp) if (200..300).contains(&resp.status) => return Ok(Some(resp.body)),
                Ok(resp) if RetryPolicy::is_transient(resp.status) => {
                    warn!(
                        url = %req.url,
                        status = resp.status,
                        attempt,
                        max_retries,
                        "rate limited or unavailable"
                    );
                    resp.retry_after
                }
                Ok(resp) => {
                    let body = truncate_for_log(&resp.body, 400);
                    warn!(
                        url = %req.url,
                        params = ?req.params,
                        status = resp.status,
                        body = %body,
                        "non-retryable status"
                    );
                    return Err(FetchError::Status {
                        status: resp.status,
                        url: req.url.clone(),
                        body,
                    });
                }
                Err(err) => {
                    warn!(url = %req.url, error = %err, attempt, max_retries, "transport error");
                    None
                }
            };
            if attempt >= max_retries {
                warn!(url = %req.url, attempts = attempt + 1, "giving up after retries");
                return Ok(None);
            }
            let delay = self.policy.delay_for(attempt, retry_after);
            debug!(url = %req.url, delay_ms = delay.as_millis() as u64, "backing off");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Parsed JSON body; an unparseable 2xx body is treated like an empty result.
    pub async fn get_json(&self, req: &FetchRequest) -> Result<Option<Value>, FetchError> {
        let Some(text) = self.get_text(req).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Value>(&text) {
            Ok(v) => Ok(Some(v)),
            Err(err) => {
                debug!(url = %req.url, error = %err, "unparseable JSON body");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{instant_policy, MockTransport};

    const URL: &str = "https://api.test/items";

    fn client(mock: &Arc<MockTransport>, retries: u32) -> FetchClient {
        FetchClient::new(mock.clone(), instant_policy(retries))
    }

    #[tokio::test]
    async fn three_rate_limits_then_success_returns_payload() {
        let mock = Arc::new(
            MockTransport::new()
                .on(URL, 429, "slow down")
                .on(URL, 429, "slow down")
                .on(URL, 429, "slow down")
                .on(URL, 200, r#"{"ok": true}"#),
        );
        let body = client(&mock, 3)
            .get_json(&FetchRequest::new(URL))
            .await
            .unwrap();
        assert_eq!(body, Some(serde_json::json!({"ok": true})));
        assert_eq!(mock.calls_to(URL), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_yield_empty_not_error() {
        let mock = Arc::new(MockTransport::new().on(URL, 503, "down"));
        let body = client(&mock, 2)
            .get_json(&FetchRequest::new(URL))
            .await
            .unwrap();
        assert!(body.is_none());
        assert_eq!(mock.calls_to(URL), 3);
    }

    #[tokio::test]
    async fn per_request_retry_budget_overrides_policy() {
        let mock = Arc::new(MockTransport::new().on(URL, 429, ""));
        let req = FetchRequest::new(URL).max_retries(0);
        assert!(client(&mock, 5).get_text(&req).await.unwrap().is_none());
        assert_eq!(mock.calls_to(URL), 1);
    }

    #[tokio::test]
    async fn other_statuses_are_terminal_for_the_request() {
        let mock = Arc::new(MockTransport::new().on(URL, 404, "missing"));
        let err = client(&mock, 3)
            .get_json(&FetchRequest::new(URL))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(404));
        assert_eq!(mock.calls_to(URL), 1);
    }

    #[tokio::test]
    async fn transport_errors_are_retried() {
        let mock = Arc::new(
            MockTransport::new()
                .on_error(URL, "connection reset")
                .on(URL, 200, "[1,2]"),
        );
        let body = client(&mock, 1)
            .get_json(&FetchRequest::new(URL))
            .await
            .unwrap();
        assert_eq!(body, Some(serde_json::json!([1, 2])));
    }

    #[tokio::test]
    async fn unparseable_json_is_empty_but_text_is_returned() {
        let mock = Arc::new(MockTransport::new().on(URL, 200, "<html>nope</html>"));
        let c = client(&mock, 0);
        assert!(c.get_json(&FetchRequest::new(URL)).await.unwrap().is_none());
        assert_eq!(
            c.get_text(&FetchRequest::new(URL)).await.unwrap().as_deref(),
            Some("<html>nope</html>")
        );
    }

    #[tokio::test]
    async fn per_call_headers_override_defaults() {
        let mock = Arc::new(MockTransport::new().on(URL, 200, "{}"));
        let c = client(&mock, 0).with_default_header("User-Agent", "default-agent");
        let req = FetchRequest::new(URL)
            .param("q", "slack")
            .header("user-agent", "custom-agent");
        c.get_json(&req).await.unwrap();
        let call = &mock.calls()[0];
        assert_eq!(call.header("User-Agent"), Some("custom-agent"));
        assert_eq!(call.header("Accept"), Some("application/json"));
        assert_eq!(call.param("q"), Some("slack"));
        assert_eq!(
            call.headers
                .iter()
                .filter(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                .count(),
            1
        );
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: false,
        };
        assert_eq!(policy.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30, None), Duration::from_millis(350));
        // Retry-After is honoured up to the cap.
        assert_eq!(policy.delay_for(0, Some(60)), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_below_one_base_delay() {
        let policy = RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            jitter: true,
        };
        for _ in 0..20 {
            let d = policy.delay_for(1, None);
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(150));
        }
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_for_log("short", 10), "short");
        assert_eq!(truncate_for_log("héllo", 2), "h…");
    }
}
