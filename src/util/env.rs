//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in the binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;
use tracing::info;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        if dotenv::dotenv().is_ok() {
            return;
        }
        // Fallback to the crate root so `cargo run` from a subdirectory still works.
        let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
        let _ = dotenv::from_filename(candidate);
    });
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v.trim().to_string()),
        _ => None,
    }
}

/// First non-empty value among several keys, in order.
pub fn env_first(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| env_opt(k))
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env_opt(key) {
        Some(raw) => raw.parse::<T>().unwrap_or(default),
        None => default,
    }
}

/// Optional parsed value.
pub fn env_parse_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    env_opt(key).and_then(|s| s.parse().ok())
}

/// Boolean flag; accepts 1/true/on/yes (case-insensitive) as true.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env_opt(key) {
        Some(raw) => {
            let v = raw.to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes")
        }
        None => default,
    }
}

/// Comma-separated list; blanks are dropped.
pub fn env_list(key: &str) -> Vec<String> {
    env_opt(key).map(|raw| split_list(&raw)).unwrap_or_default()
}

pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn redact_value(key: &str, val: &str) -> String {
    let k = key.to_ascii_uppercase();
    let secret = ["PASSWORD", "SECRET", "TOKEN"].iter().any(|m| k.contains(m))
        || k.ends_with("_KEY")
        || k.ends_with("_KEYS");
    if secret {
        return if val.is_empty() { String::new() } else { "***".to_string() };
    }

    let val_trim = val.trim();
    // DSNs and proxy URLs may embed credentials.
    if let Ok(mut u) = url::Url::parse(val_trim) {
        if !u.username().is_empty() || u.password().is_some() {
            let _ = u.set_username("***");
            let _ = u.set_password(Some("***"));
            return u.to_string();
        }
    }
    val_trim.to_string()
}

/// Log a consolidated, redacted snapshot of configuration.
pub fn log_snapshot(title: &str, keys: &[&str]) {
    let snapshot: Vec<(String, String)> = keys
        .iter()
        .map(|&k| {
            let v = env_opt(k).unwrap_or_default();
            (k.to_string(), redact_value(k, &v))
        })
        .collect();
    info!(target = "preflight", title, snapshot = ?snapshot, "configuration snapshot");
}
