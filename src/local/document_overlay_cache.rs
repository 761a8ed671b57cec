use std::collections::{BTreeMap, BTreeSet};

use crate::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath};

/// Per-user store of the net pending mutation for each document.
pub trait DocumentOverlayCache: Send + Sync {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay>;

    /// Replaces the overlays for the given keys, tagging them with
    /// `largest_batch_id`.
    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: &BTreeMap<DocumentKey, Mutation>);

    /// Removes every overlay last written by `batch_id`.
    fn remove_overlays_for_batch_id(&mut self, document_keys: &BTreeSet<DocumentKey>, batch_id: BatchId);

    /// Overlays for documents directly inside `collection` written by batches
    /// after `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay>;

    /// Overlays in `collection_group` after `since_batch_id`, taking whole
    /// batches in batch order until at least `count` overlays are collected.
    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    overlay_by_batch_id: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_overlay(&mut self, largest_batch_id: BatchId, mutation: Mutation) {
        let key = mutation.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            let previous_batch = existing.largest_batch_id;
            if let Some(keys) = self.overlay_by_batch_id.get_mut(&previous_batch) {
                keys.remove(&key);
                if keys.is_empty() {
                    self.overlay_by_batch_id.remove(&previous_batch);
                }
            }
        }
        self.overlays
            .insert(key.clone(), Overlay::new(largest_batch_id, mutation));
        self.overlay_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key);
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| self.get_overlay(key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: &BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.values() {
            self.save_overlay(largest_batch_id, mutation.clone());
        }
    }

    fn remove_overlays_for_batch_id(&mut self, _document_keys: &BTreeSet<DocumentKey>, batch_id: BatchId) {
        if let Some(keys) = self.overlay_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let immediate_children = collection.len() + 1;
        self.overlays
            .range(DocumentKey::collection_scan_start(collection)..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                key.path().len() == immediate_children && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let mut by_batch: BTreeMap<BatchId, Vec<&Overlay>> = BTreeMap::new();
        for (key, overlay) in &self.overlays {
            if key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id {
                by_batch.entry(overlay.largest_batch_id).or_default().push(overlay);
            }
        }

        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay.clone());
            }
            if result.len() >= count {
                break;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{delete_mutation, key, map, path, set_mutation};

    fn overlays_for(mutations: Vec<Mutation>) -> BTreeMap<DocumentKey, Mutation> {
        mutations.into_iter().map(|m| (m.key().clone(), m)).collect()
    }

    #[test]
    fn newer_batch_replaces_overlay() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(1, &overlays_for(vec![set_mutation("rooms/a", map(&[]))]));
        cache.save_overlays(2, &overlays_for(vec![delete_mutation("rooms/a")]));

        let overlay = cache.get_overlay(&key("rooms/a")).unwrap();
        assert_eq!(overlay.largest_batch_id, 2);

        cache.remove_overlays_for_batch_id(&BTreeSet::new(), 1);
        assert!(cache.get_overlay(&key("rooms/a")).is_some());
        cache.remove_overlays_for_batch_id(&BTreeSet::new(), 2);
        assert!(cache.get_overlay(&key("rooms/a")).is_none());
    }

    #[test]
    fn collection_lookup_respects_batch_and_depth() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(1, &overlays_for(vec![set_mutation("rooms/a", map(&[]))]));
        cache.save_overlays(
            2,
            &overlays_for(vec![
                set_mutation("rooms/b", map(&[])),
                set_mutation("rooms/a/messages/m", map(&[])),
            ]),
        );

        let all = cache.get_overlays_for_collection(&path("rooms"), -1);
        assert_eq!(all.len(), 2);
        let recent = cache.get_overlays_for_collection(&path("rooms"), 1);
        assert_eq!(recent.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
    }

    #[test]
    fn collection_group_lookup_takes_whole_batches() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(
            1,
            &overlays_for(vec![
                set_mutation("a/1/messages/x", map(&[])),
                set_mutation("b/2/messages/y", map(&[])),
            ]),
        );
        cache.save_overlays(2, &overlays_for(vec![set_mutation("c/3/messages/z", map(&[]))]));

        let first = cache.get_overlays_for_collection_group("messages", -1, 1);
        assert_eq!(first.len(), 2);
        let all = cache.get_overlays_for_collection_group("messages", -1, 10);
        assert_eq!(all.len(), 3);
    }
}
