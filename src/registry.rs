use std::collections::HashMap;

use url::Url;
use uuid::Uuid;

use crate::entry::BlobEntry;

/// Directory of live blob entries plus the public URL mappings onto them.
/// Entry lifetime is owned here: created once, deleted once when the
/// refcount reaches zero.
#[derive(Default)]
pub(crate) struct Registry {
    entries: HashMap<Uuid, BlobEntry>,
    urls: HashMap<Url, Uuid>,
}

impl Registry {
    pub fn insert(&mut self, entry: BlobEntry) {
        debug_assert!(!self.entries.contains_key(&entry.uuid()));
        self.entries.insert(entry.uuid(), entry);
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.entries.contains_key(uuid)
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&BlobEntry> {
        self.entries.get(uuid)
    }

    pub fn get_mut(&mut self, uuid: &Uuid) -> Option<&mut BlobEntry> {
        self.entries.get_mut(uuid)
    }

    pub fn remove(&mut self, uuid: &Uuid) -> Option<BlobEntry> {
        self.entries.remove(uuid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Maps a public URL onto an existing entry. Returns false if the URL
    /// is taken or the uuid is unknown.
    pub fn register_url(&mut self, url: Url, uuid: Uuid) -> bool {
        if self.urls.contains_key(&url) || !self.entries.contains_key(&uuid) {
            return false;
        }
        self.urls.insert(url, uuid);
        true
    }

    /// Removes a URL mapping. Never deletes the entry itself.
    pub fn revoke_url(&mut self, url: &Url) -> Option<Uuid> {
        self.urls.remove(url)
    }

    pub fn uuid_from_url(&self, url: &Url) -> Option<Uuid> {
        self.urls.get(url).copied()
    }
}
