use std::collections::HashSet;

use crate::item_identity::ContentItem;

/// Item ids already processed in the current run. One ledger per run, no
/// eviction.
#[derive(Debug, Default, Clone)]
pub struct DedupLedger {
    seen: HashSet<String>,
    order: Vec<String>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Returns `false` when `id` was already recorded.
    pub fn mark_processed(&mut self, id: &str) -> bool {
        if !self.seen.insert(id.to_string()) {
            return false;
        }
        self.order.push(id.to_string());
        true
    }

    /// First item in snapshot order that has not been processed yet.
    pub fn first_unseen<'a>(&self, snapshot: &'a [ContentItem]) -> Option<&'a ContentItem> {
        snapshot.iter().find(|item| !self.contains(&item.id))
    }

    pub fn has_unseen(&self, snapshot: &[ContentItem]) -> bool {
        self.first_unseen(snapshot).is_some()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Processed ids in processing order.
    pub fn processed_ids(&self) -> &[String] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::DedupLedger;
    use crate::item_identity::ContentItem;

    fn items(names: &[&str]) -> Vec<ContentItem> {
        names
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                ContentItem::new(*name, "post", Some(format!("https://x.test/{name}")), idx)
            })
            .collect()
    }

    #[test]
    fn marking_is_idempotent_and_ordered() {
        let mut ledger = DedupLedger::new();
        assert!(ledger.mark_processed("a"));
        assert!(ledger.mark_processed("b"));
        assert!(!ledger.mark_processed("a"));
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.processed_ids(), ["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn first_unseen_respects_snapshot_order() {
        let snapshot = items(&["a", "b", "c"]);
        let mut ledger = DedupLedger::new();
        ledger.mark_processed(&snapshot[0].id);
        let next = ledger.first_unseen(&snapshot).expect("unseen");
        assert_eq!(next.author, "b");

        ledger.mark_processed(&snapshot[1].id);
        ledger.mark_processed(&snapshot[2].id);
        assert!(!ledger.has_unseen(&snapshot));
    }
}
