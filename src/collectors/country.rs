//! Best-effort contributor country inference from free-text profile fields.

use indexmap::IndexMap;
use std::sync::{Mutex, PoisonError};

/// Checked in order; the first table with a hit wins. Entries are matched
/// as whole words (or whole word sequences) against the lowercased text.
const COUNTRY_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "IN",
        &[
            "india", "bharat", "delhi", "new delhi", "mumbai", "bangalore", "bengaluru",
            "bengal", "hyderabad", "chennai", "kolkata", "pune",
        ],
    ),
    (
        "US",
        &[
            "united states", "usa", "us", "america", "new york", "san francisco",
            "california", "texas", "seattle", "chicago", "boston",
        ],
    ),
    (
        "GB",
        &[
            "united kingdom", "uk", "england", "scotland", "wales", "london", "manchester",
        ],
    ),
    ("CA", &["canada", "toronto", "vancouver", "montreal", "ottawa"]),
    ("DE", &["germany", "deutschland", "berlin", "munich", "münchen", "hamburg"]),
    ("FR", &["france", "paris", "lyon", "marseille"]),
    ("BR", &["brazil", "brasil", "são paulo", "sao paulo", "rio de janeiro"]),
    ("AU", &["australia", "sydney", "melbourne", "brisbane"]),
];

/// Map free text (location, bio, custom fields) to an ISO country code.
pub fn infer_country(text: &str) -> Option<&'static str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    // A bare code such as "IN" or "de".
    if trimmed.len() == 2 {
        let upper = trimmed.to_ascii_uppercase();
        if let Some((code, _)) = COUNTRY_KEYWORDS.iter().find(|(c, _)| *c == upper) {
            return Some(code);
        }
    }

    let words: Vec<String> = trimmed
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect();
    let padded = format!(" {} ", words.join(" "));

    COUNTRY_KEYWORDS
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| padded.contains(&format!(" {kw} "))))
        .map(|(code, _)| *code)
}

/// Username → inferred country (or a remembered miss), bounded with FIFO eviction.
#[derive(Debug)]
pub struct CountryCache {
    cap: usize,
    entries: Mutex<IndexMap<String, Option<String>>>,
}

impl CountryCache {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            entries: Mutex::new(IndexMap::new()),
        }
    }

    /// `None` means "not looked up yet"; `Some(None)` is a cached miss.
    pub fn get(&self, user: &str) -> Option<Option<String>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned()
    }

    /// Last writer wins; inference is idempotent so races are harmless.
    pub fn insert(&self, user: &str, country: Option<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(user.to_string(), country);
        while entries.len() > self.cap {
            entries.shift_remove_index(0);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
