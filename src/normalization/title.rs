/// Canonical comparison form of a workflow title or trend keyword.
///
/// Normalization steps:
/// - lowercase (Unicode aware)
/// - every non-alphanumeric character becomes a space
/// - runs of whitespace collapse to one space, ends trimmed
pub fn normalize_title(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let spaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}
