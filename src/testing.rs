// Test doubles for the network and storage seams.
//
// - MockTransport (Transport): URL/param routed replies, records every call
// - MemoryStore (WorkflowStore): in-memory upsert keyed on source_id
//
// Plus small builders for evidence items.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::fetch::{FetchClient, FetchError, RawResponse, RetryPolicy, Transport};
use crate::models::{
    CanonicalWorkflow, EvidenceItem, ForumMetrics, Platform, PlatformMetrics, VideoMetrics,
    WorkflowFilters,
};
use crate::storage::{WorkflowPage, WorkflowStore};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Reply {
    Response(RawResponse),
    Error(String),
}

struct Route {
    url: String,
    params: Vec<(String, String)>,
    replies: VecDeque<Reply>,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl RecordedCall {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Routes by URL plus optional required params; the most specific route wins.
/// Replies queue up per route and the last one repeats. Unrouted URLs get 404.
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn push(self, url: &str, params: &[(&str, &str)], reply: Reply) -> Self {
        {
            let mut routes = self.routes.lock().unwrap();
            let params: Vec<(String, String)> = params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            match routes
                .iter_mut()
                .find(|r| r.url == url && r.params == params)
            {
                Some(route) => route.replies.push_back(reply),
                None => routes.push(Route {
                    url: url.to_string(),
                    params,
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn on(self, url: &str, status: u16, body: &str) -> Self {
        self.push(url, &[], Reply::Response(RawResponse::new(status, body)))
    }

    pub fn on_with(self, url: &str, params: &[(&str, &str)], status: u16, body: &str) -> Self {
        self.push(url, params, Reply::Response(RawResponse::new(status, body)))
    }

    pub fn on_error(self, url: &str, message: &str) -> Self {
        self.push(url, &[], Reply::Error(message.to_string()))
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.url == url).count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(
        &self,
        url: &str,
        params: &[(String, String)],
        headers: &[(String, String)],
    ) -> Result<RawResponse, FetchError> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            params: params.to_vec(),
            headers: headers.to_vec(),
        });

        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .filter(|r| r.url == url && r.params.iter().all(|p| params.contains(p)))
            .max_by_key(|r| r.params.len());
        let Some(route) = route else {
            return Ok(RawResponse::new(404, "not found"));
        };
        let reply = if route.replies.len() > 1 {
            route.replies.pop_front()
        } else {
            route.replies.front().cloned()
        };
        match reply {
            Some(Reply::Response(resp)) => Ok(resp),
            Some(Reply::Error(msg)) => Err(FetchError::Transport(msg)),
            None => Ok(RawResponse::new(404, "not found")),
        }
    }
}

/// No sleeping between retries.
pub fn instant_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: false,
    }
}

pub fn client_for(transport: std::sync::Arc<MockTransport>) -> FetchClient {
    FetchClient::new(transport, instant_policy(2))
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory `WorkflowStore`; `failing()` makes every write error.
pub struct MemoryStore {
    records: Mutex<Vec<CanonicalWorkflow>>,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_writes: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail_writes: true,
        }
    }

    pub fn records(&self) -> Vec<CanonicalWorkflow> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn upsert(&self, record: &CanonicalWorkflow) -> Result<()> {
        if self.fail_writes {
            bail!("storage unavailable");
        }
        let mut records = self.records.lock().unwrap();
        match records.iter_mut().find(|r| r.source_id == record.source_id) {
            Some(existing) => {
                let id = existing.id.clone();
                *existing = record.clone();
                existing.id = id;
            }
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn query_workflows(
        &self,
        filters: &WorkflowFilters,
        limit: i64,
        offset: i64,
    ) -> Result<WorkflowPage> {
        let records = self.records.lock().unwrap().clone();
        Ok(crate::storage::page_in_memory(records, filters, limit, offset))
    }
}

// ---------------------------------------------------------------------------
// Evidence builders
// ---------------------------------------------------------------------------

pub fn video_item(id: &str, title: &str, views: Option<i64>, likes: Option<i64>, comments: Option<i64>) -> EvidenceItem {
    EvidenceItem::new(
        Platform::Video,
        format!("youtube:{id}"),
        PlatformMetrics::Video(VideoMetrics {
            views,
            likes,
            comments,
            ..Default::default()
        }),
    )
    .with_title(Some(title.to_string()))
}

pub fn forum_item(id: &str, title: &str, metrics: ForumMetrics) -> EvidenceItem {
    EvidenceItem::new(
        Platform::Forum,
        format!("discourse:{id}"),
        PlatformMetrics::Forum(metrics),
    )
    .with_title(Some(title.to_string()))
}
