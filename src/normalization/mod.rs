//! Group keys and evidence clustering.

mod title;

pub use title::normalize_title;

use indexmap::IndexMap;
use uuid::Uuid;

use crate::models::EvidenceItem;

/// Normalized key to the evidence describing one workflow, in arrival order.
pub type EvidenceGroups = IndexMap<String, Vec<EvidenceItem>>;

/// Marks keys built from a `source_id`. Normalized titles never contain `:`.
const SOURCE_KEY_PREFIX: &str = "sid:";

/// Normalized title (or keyword). Items whose label normalizes to nothing are
/// keyed by their own `source_id`, so they never merge with anything else.
pub fn group_key(item: &EvidenceItem) -> String {
    let key = item.label().map(normalize_title).unwrap_or_default();
    if !key.is_empty() {
        return key;
    }
    if !item.source_id.trim().is_empty() {
        return format!("{SOURCE_KEY_PREFIX}{}", item.source_id);
    }
    format!("{SOURCE_KEY_PREFIX}{}", Uuid::new_v4())
}

/// Human-facing form of a group key: the `source_id` for untitled groups.
pub fn key_name(key: &str) -> &str {
    key.strip_prefix(SOURCE_KEY_PREFIX).unwrap_or(key)
}

pub fn group_evidence(items: impl IntoIterator<Item = EvidenceItem>) -> EvidenceGroups {
    let mut groups = EvidenceGroups::new();
    for item in items {
        groups.entry(group_key(&item)).or_default().push(item);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Platform, PlatformMetrics};
    use crate::testing::video_item;

    #[test]
    fn same_title_same_key_regardless_of_order() {
        let a = video_item("a", "Slack Alerts!", Some(1), None, None);
        let b = video_item("b", "slack   alerts", Some(2), None, None);
        assert_eq!(group_key(&a), group_key(&b));

        let forward = group_evidence(vec![a.clone(), b.clone()]);
        let backward = group_evidence(vec![b, a]);
        assert_eq!(forward.len(), 1);
        assert_eq!(
            forward.keys().collect::<Vec<_>>(),
            backward.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn untitled_items_stay_alone() {
        let mut a = video_item("a", "x", None, None, None);
        a.title = None;
        let mut b = video_item("b", "x", None, None, None);
        b.title = Some("???".into());
        let groups = group_evidence(vec![a, b]);
        assert_eq!(groups.len(), 2);
        assert!(groups.contains_key("sid:youtube:a"));
        assert!(groups.contains_key("sid:youtube:b"));
        assert_eq!(key_name("sid:youtube:a"), "youtube:a");
    }

    #[test]
    fn untitled_source_id_never_joins_a_title_group() {
        let mut bare = video_item("x", "", None, None, None);
        bare.source_id = "slack".into();
        bare.title = None;
        let titled = video_item("y", "Slack", Some(5), None, None);
        let groups = group_evidence(vec![bare, titled]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["slack"].len(), 1);
        assert_eq!(groups["slack"][0].source_id, "youtube:y");
        assert_eq!(groups["sid:slack"].len(), 1);
    }

    #[test]
    fn keyword_is_used_when_title_is_missing() {
        let item = EvidenceItem::new(
            Platform::Trends,
            "trends:n8n slack:US",
            PlatformMetrics::empty_for(Platform::Trends),
        )
        .with_keyword("N8N Slack");
        assert_eq!(group_key(&item), "n8n slack");
    }

    #[test]
    fn region_variants_group_only_by_title() {
        let us = video_item("abc::US", "Webhook Tutorial", None, None, None);
        let inn = video_item("abc::IN", "Webhook tutorial", None, None, None);
        let other = video_item("abc::GB", "Something else", None, None, None);
        let groups = group_evidence(vec![us, inn, other]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["webhook tutorial"].len(), 2);
        assert_eq!(groups["webhook tutorial"][0].source_id, "youtube:abc::US");
    }
}
