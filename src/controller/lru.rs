use std::sync::Arc;

use linked_hash_map::LinkedHashMap;

use crate::item::{ItemId, ShareableItem};

/// Recency tracking for populated in-memory items. Front of the map is the
/// least recently used; touching moves an item to the back so it is
/// evicted last.
#[derive(Default)]
pub(crate) struct LruTracker {
    map: LinkedHashMap<ItemId, Arc<ShareableItem>>,
}

impl LruTracker {
    pub fn touch(&mut self, item: &Arc<ShareableItem>) {
        let id = item.id();
        if self.map.get_refresh(&id).is_none() {
            self.map.insert(id, item.clone());
        }
    }

    pub fn remove(&mut self, id: ItemId) {
        self.map.remove(&id);
    }

    /// Iterates least-recently-used first.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ShareableItem>> {
        self.map.values()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
