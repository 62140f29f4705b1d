use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::bits::Bitmap;
use super::contact::Contact;
use crate::constants::{BUCKET_SIZE, MAX_PEER_FAILS, NODE_ID_BITS};

struct BucketEntry {
    contact: Contact,
    last_seen: Instant,
    fails: u8,
}

impl BucketEntry {
    fn new(contact: Contact) -> Self {
        Self {
            contact,
            last_seen: Instant::now(),
            fails: 0,
        }
    }
}

struct Bucket {
    /// Front is least recently seen.
    entries: VecDeque<BucketEntry>,
    /// Contacts heard from while the bucket was full, kept as candidates.
    backup: VecDeque<Contact>,
    last_changed: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(BUCKET_SIZE),
            backup: VecDeque::with_capacity(BUCKET_SIZE),
            last_changed: Instant::now(),
        }
    }

    fn position(&self, id: &Bitmap) -> Option<usize> {
        self.entries.iter().position(|e| e.contact.id == *id)
    }

    fn remember_backup(&mut self, contact: Contact) {
        self.backup.retain(|c| c.id != contact.id);
        if self.backup.len() == BUCKET_SIZE {
            self.backup.pop_front();
        }
        self.backup.push_back(contact);
    }

    fn promote_backup(&mut self) {
        if let Some(promoted) = self.backup.pop_front() {
            self.entries.push_back(BucketEntry::new(promoted));
        }
    }
}

/// What happened on [`RoutingTable::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Added,
    Refreshed,
    /// Bucket is full. The caller should probe `oldest` for liveness, then
    /// either [`RoutingTable::touch`] it (alive: candidate stays in backup)
    /// or [`RoutingTable::replace`] it with the candidate (dead).
    Full { oldest: Contact },
    /// The contact is ourselves.
    Ignored,
}

/// The Kademlia routing table: one bucket per bit of XOR distance from our
/// own id, each holding up to k contacts ordered least-recently-seen first.
pub struct RoutingTable {
    id: Bitmap,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(id: Bitmap) -> Self {
        let buckets = (0..NODE_ID_BITS).map(|_| RwLock::new(Bucket::new())).collect();
        Self { id, buckets }
    }

    pub fn id(&self) -> &Bitmap {
        &self.id
    }

    /// Bucket index for `other`: the shared-prefix length with our id,
    /// clamped for the (never inserted) case of our own id.
    pub fn bucket_index(&self, other: &Bitmap) -> usize {
        self.id.prefix_len(other).min(NODE_ID_BITS - 1)
    }

    /// Records that we heard from `contact`.
    ///
    /// A known contact is refreshed in place (endpoint updated, marked most
    /// recently seen). A new contact joins its bucket if there is room;
    /// otherwise it is remembered as a backup candidate and `Full` asks the
    /// caller to arbitrate liveness against the oldest entry.
    pub fn insert(&self, contact: Contact) -> InsertOutcome {
        if contact.id == self.id {
            return InsertOutcome::Ignored;
        }

        let idx = self.bucket_index(&contact.id);
        let mut bucket = self.buckets[idx].write();

        if let Some(pos) = bucket.position(&contact.id) {
            let mut entry = bucket.entries.remove(pos).expect("position just found");
            entry.contact = contact;
            entry.last_seen = Instant::now();
            entry.fails = 0;
            bucket.entries.push_back(entry);
            bucket.last_changed = Instant::now();
            return InsertOutcome::Refreshed;
        }

        if bucket.entries.len() < BUCKET_SIZE {
            bucket.entries.push_back(BucketEntry::new(contact));
            bucket.last_changed = Instant::now();
            return InsertOutcome::Added;
        }

        bucket.remember_backup(contact);
        let oldest = bucket.entries.front().expect("full bucket").contact;
        InsertOutcome::Full { oldest }
    }

    /// Marks an existing contact as just heard from.
    pub fn touch(&self, id: &Bitmap) {
        let idx = self.bucket_index(id);
        let mut bucket = self.buckets[idx].write();

        if let Some(pos) = bucket.position(id) {
            let mut entry = bucket.entries.remove(pos).expect("position just found");
            entry.last_seen = Instant::now();
            entry.fails = 0;
            bucket.entries.push_back(entry);
            bucket.last_changed = Instant::now();
        }
    }

    /// Swaps a dead entry for a backup candidate after a failed liveness
    /// probe. Both ids live in the candidate's bucket.
    pub fn replace(&self, evicted: &Bitmap, contact: &Contact) {
        let idx = self.bucket_index(&contact.id);
        let mut bucket = self.buckets[idx].write();

        if let Some(pos) = bucket.position(evicted) {
            bucket.entries.remove(pos);
        }
        bucket.backup.retain(|c| c.id != contact.id);

        if bucket.position(&contact.id).is_none() && bucket.entries.len() < BUCKET_SIZE {
            bucket.entries.push_back(BucketEntry::new(*contact));
        }
        bucket.last_changed = Instant::now();
    }

    /// Counts an RPC timeout against the peer; drops it after
    /// `MAX_PEER_FAILS` consecutive failures and promotes a backup.
    pub fn record_failure(&self, id: &Bitmap) {
        let idx = self.bucket_index(id);
        let mut bucket = self.buckets[idx].write();

        if let Some(pos) = bucket.position(id) {
            bucket.entries[pos].fails += 1;
            if bucket.entries[pos].fails >= MAX_PEER_FAILS {
                bucket.entries.remove(pos);
                bucket.promote_backup();
                bucket.last_changed = Instant::now();
            }
        }
    }

    pub fn contains(&self, id: &Bitmap) -> bool {
        let idx = self.bucket_index(id);
        self.buckets[idx].read().position(id).is_some()
    }

    /// The `n` known contacts with smallest XOR distance to `target`.
    pub fn closest(&self, target: &Bitmap, n: usize) -> Vec<Contact> {
        let mut all: Vec<Contact> = Vec::new();
        for bucket in &self.buckets {
            all.extend(bucket.read().entries.iter().map(|e| e.contact));
        }

        all.sort_by_key(|c| (c.id.distance(target), c.id));
        all.truncate(n);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.read().entries.is_empty())
    }

    /// Indexes of buckets currently holding contacts.
    pub fn active_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.read().entries.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Non-empty buckets whose contents haven't changed for `max_age`.
    pub fn stale_buckets(&self, max_age: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                let b = b.read();
                !b.entries.is_empty() && b.last_changed.elapsed() > max_age
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// (bucket index, occupancy) for every non-empty bucket.
    pub fn occupancy(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter_map(|(i, b)| {
                let len = b.read().entries.len();
                (len > 0).then_some((i, len))
            })
            .collect()
    }

    /// A random id falling in `bucket`'s distance range: shares exactly
    /// `bucket` prefix bits with our id.
    pub fn refresh_target(&self, bucket: usize) -> Bitmap {
        let bucket = bucket.min(NODE_ID_BITS - 1);
        let mut id = *self.id.as_bytes();

        let byte_idx = bucket / 8;
        let bit_idx = bucket % 8; // 0 is the most significant bit

        id[byte_idx] ^= 0x80 >> bit_idx;

        if bit_idx < 7 {
            let keep_mask = !(0xffu8 >> (bit_idx + 1));
            let random: u8 = rand::random();
            id[byte_idx] = (id[byte_idx] & keep_mask) | (random & !keep_mask);
        }
        for byte in id.iter_mut().skip(byte_idx + 1) {
            *byte = rand::random();
        }

        Bitmap::from(id)
    }
}
