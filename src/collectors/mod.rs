//! Per-source evidence collectors.
//!
//! Each collector turns query terms into `EvidenceItem`s. Every source tries a
//! structured API first and falls back to scraping rendered pages; whichever
//! path produced them, the items have the same shape.

pub mod country;
pub mod forum;
pub mod scrape;
pub mod trends;
pub mod video;

pub use forum::ForumCollector;
pub use trends::TrendsCollector;
pub use video::VideoCollector;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::models::EvidenceItem;

/// Result of one stage of a fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome<T> {
    Found(Vec<T>),
    /// The stage worked but had nothing to offer.
    Empty,
    /// Denied, rate limited past the retry budget, or otherwise unusable.
    Blocked,
}

impl<T> SourceOutcome<T> {
    pub fn from_items(items: Vec<T>) -> Self {
        if items.is_empty() {
            SourceOutcome::Empty
        } else {
            SourceOutcome::Found(items)
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, SourceOutcome::Found(_))
    }

    pub fn into_items(self) -> Vec<T> {
        match self {
            SourceOutcome::Found(items) => items,
            SourceOutcome::Empty | SourceOutcome::Blocked => Vec::new(),
        }
    }
}

#[async_trait]
pub trait EvidenceCollector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Max queries in flight at once.
    fn concurrency(&self) -> usize {
        4
    }

    /// Evidence for one query term. Failures are logged and contained here.
    async fn collect_query(&self, query: &str) -> Vec<EvidenceItem>;

    /// Lazy stream over all queries; a failing query only loses its own items.
    fn collect<'a>(&'a self, queries: &'a [String]) -> BoxStream<'a, EvidenceItem> {
        stream::iter(queries)
            .map(move |q| self.collect_query(q))
            .buffer_unordered(self.concurrency().max(1))
            .flat_map(stream::iter)
            .boxed()
    }

    async fn collect_all(&self, queries: &[String]) -> Vec<EvidenceItem> {
        self.collect(queries).collect().await
    }
}
