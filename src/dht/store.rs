use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::bits::Bitmap;
use super::contact::Contact;

/// Which peers have announced which blob hashes.
///
/// Announcements carry a timestamp and age out after the configured TTL.
/// Contacts are stored once and referenced per hash, so a reannouncing
/// peer updates its endpoint everywhere at once.
pub struct ContactStore {
    expire_after: Duration,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// blob hash -> announcing contact id -> time of announcement
    hashes: HashMap<Bitmap, HashMap<Bitmap, Instant>>,
    /// contact id -> contact; holds every id referenced above
    contacts: HashMap<Bitmap, Contact>,
}

impl ContactStore {
    pub fn new(expire_after: Duration) -> Self {
        Self {
            expire_after,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Records that `contact` announced `blob_hash` just now.
    pub fn upsert(&self, blob_hash: Bitmap, contact: Contact) {
        let mut inner = self.inner.write();
        inner
            .hashes
            .entry(blob_hash)
            .or_default()
            .insert(contact.id, Instant::now());
        inner.contacts.insert(contact.id, contact);
    }

    /// All unexpired contacts announced for `blob_hash`.
    pub fn get(&self, blob_hash: &Bitmap) -> Vec<Contact> {
        let inner = self.inner.read();

        let Some(ids) = inner.hashes.get(blob_hash) else {
            return Vec::new();
        };

        ids.iter()
            .filter(|(_, announced)| announced.elapsed() < self.expire_after)
            .map(|(id, _)| {
                *inner
                    .contacts
                    .get(id)
                    .expect("announced id missing from contact index")
            })
            .collect()
    }

    pub fn has(&self, blob_hash: &Bitmap) -> bool {
        !self.get(blob_hash).is_empty()
    }

    /// Drops expired announcements, empty hash entries, and contacts no
    /// longer referenced by any hash.
    pub fn remove_expired(&self) {
        let mut inner = self.inner.write();
        let expire_after = self.expire_after;

        for ids in inner.hashes.values_mut() {
            ids.retain(|_, announced| announced.elapsed() < expire_after);
        }
        inner.hashes.retain(|_, ids| !ids.is_empty());

        let referenced: std::collections::HashSet<Bitmap> = inner
            .hashes
            .values()
            .flat_map(|ids| ids.keys().copied())
            .collect();
        inner.contacts.retain(|id, _| referenced.contains(id));
    }

    /// Number of distinct hashes with at least one announcement recorded.
    pub fn hash_count(&self) -> usize {
        self.inner.read().hashes.len()
    }
}
