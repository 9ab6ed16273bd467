//! The per-network answer table.
//!
//! A fixed-capacity hash table with external collision chains and a
//! least-recently-used eviction list, stored as an index arena: every live
//! entry sits in a slot addressed by a `u32`, and the bucket chains and the
//! MRU list link slots by index rather than by pointer. Each live entry is
//! reachable exactly once from exactly one bucket chain and exactly once
//! from the MRU list.
//!
//! The table also carries the pending-request markers used for
//! single-flight coordination; the registry owns the condition variable the
//! markers pair with.

use bytes::Bytes;
use rill_proto::query;
use tracing::{debug, info};

#[derive(Debug)]
struct Slot {
    /// Fingerprint of the query.
    hash: u32,

    /// Query and answer copies, back to back in one buffer.
    data: Bytes,
    query_len: usize,

    /// Wall-clock second after which the entry is dead.
    expires: u64,

    /// Monotonically assigned id, for log correlation only.
    id: u32,

    bucket_next: Option<u32>,
    mru_prev: Option<u32>,
    mru_next: Option<u32>,
}

/// Bounded query → answer table with MRU eviction.
#[derive(Debug)]
pub(crate) struct Cache {
    max_entries: usize,
    buckets: Vec<Option<u32>>,
    slots: Vec<Slot>,
    free: Vec<u32>,
    num_entries: usize,
    last_id: u32,
    /// Most recently used entry.
    mru_head: Option<u32>,
    /// Oldest entry; evicted first.
    mru_tail: Option<u32>,
    /// Fingerprints some thread is currently resolving.
    pending: Vec<u32>,
}

impl Cache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            buckets: vec![None; max_entries],
            slots: Vec::new(),
            free: Vec::new(),
            num_entries: 0,
            last_id: 0,
            mru_head: None,
            mru_tail: None,
            pending: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.num_entries
    }

    pub(crate) fn is_full(&self) -> bool {
        self.num_entries >= self.max_entries
    }

    #[inline]
    fn bucket_of(&self, hash: u32) -> usize {
        hash as usize % self.max_entries
    }

    /// Finds the live entry matching `key`, if any.
    pub(crate) fn probe(&self, hash: u32, key: &[u8]) -> Option<u32> {
        let mut cur = self.buckets[self.bucket_of(hash)];
        while let Some(idx) = cur {
            let slot = &self.slots[idx as usize];
            if slot.hash == hash
                && slot.query_len == key.len()
                && query::queries_equal(&slot.data[..slot.query_len], key)
            {
                return Some(idx);
            }
            cur = slot.bucket_next;
        }
        None
    }

    pub(crate) fn answer(&self, idx: u32) -> &[u8] {
        let slot = &self.slots[idx as usize];
        &slot.data[slot.query_len..]
    }

    pub(crate) fn expires(&self, idx: u32) -> u64 {
        self.slots[idx as usize].expires
    }

    /// Inserts a new entry. The caller has already ruled out a duplicate
    /// and made room.
    pub(crate) fn insert(&mut self, hash: u32, key: &[u8], answer: &[u8], expires: u64) {
        self.last_id += 1;

        let mut data = Vec::with_capacity(key.len() + answer.len());
        data.extend_from_slice(key);
        data.extend_from_slice(answer);

        let bucket = self.bucket_of(hash);
        let slot = Slot {
            hash,
            data: Bytes::from(data),
            query_len: key.len(),
            expires,
            id: self.last_id,
            bucket_next: self.buckets[bucket],
            mru_prev: None,
            mru_next: None,
        };

        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = slot;
                idx
            }
            None => {
                self.slots.push(slot);
                (self.slots.len() - 1) as u32
            }
        };

        self.buckets[bucket] = Some(idx);
        self.mru_push_front(idx);
        self.num_entries += 1;
        debug!(
            id = self.last_id,
            count = self.num_entries,
            "cache entry added"
        );
    }

    /// Unlinks and frees an entry.
    pub(crate) fn remove(&mut self, idx: u32) {
        self.bucket_unlink(idx);
        self.mru_unlink(idx);

        let slot = &mut self.slots[idx as usize];
        debug!(id = slot.id, count = self.num_entries - 1, "cache entry removed");
        slot.data = Bytes::new();
        slot.query_len = 0;

        self.free.push(idx);
        self.num_entries -= 1;
    }

    /// Moves an entry to the front of the MRU list.
    pub(crate) fn touch(&mut self, idx: u32) {
        if self.mru_head == Some(idx) {
            return;
        }
        self.mru_unlink(idx);
        self.mru_push_front(idx);
    }

    /// Drops every entry whose expiry has passed.
    pub(crate) fn remove_expired(&mut self, now: u64) {
        let mut expired = Vec::new();
        let mut cur = self.mru_head;
        while let Some(idx) = cur {
            let slot = &self.slots[idx as usize];
            if now >= slot.expires {
                expired.push(idx);
            }
            cur = slot.mru_next;
        }
        for idx in expired {
            self.remove(idx);
        }
    }

    /// Evicts the least recently used entry.
    pub(crate) fn remove_oldest(&mut self) {
        if let Some(idx) = self.mru_tail {
            debug!("cache full, evicting oldest entry");
            self.remove(idx);
        }
    }

    /// Drops every entry and every pending marker.
    pub(crate) fn flush(&mut self) {
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.slots.clear();
        self.free.clear();
        self.num_entries = 0;
        self.last_id = 0;
        self.mru_head = None;
        self.mru_tail = None;
        self.pending.clear();
        info!("cache flushed");
    }

    // Pending-request markers. The registry pairs these with its condition
    // variable; at most one marker exists per fingerprint.

    pub(crate) fn has_pending(&self, hash: u32) -> bool {
        self.pending.contains(&hash)
    }

    pub(crate) fn add_pending(&mut self, hash: u32) {
        if !self.pending.contains(&hash) {
            self.pending.push(hash);
        }
    }

    /// Removes the marker for `hash`; returns whether one existed.
    pub(crate) fn clear_pending(&mut self, hash: u32) -> bool {
        match self.pending.iter().position(|&h| h == hash) {
            Some(pos) => {
                self.pending.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    fn mru_unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.mru_prev, slot.mru_next)
        };
        match prev {
            Some(p) => self.slots[p as usize].mru_next = next,
            None => self.mru_head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].mru_prev = prev,
            None => self.mru_tail = prev,
        }
    }

    fn mru_push_front(&mut self, idx: u32) {
        let head = self.mru_head;
        {
            let slot = &mut self.slots[idx as usize];
            slot.mru_prev = None;
            slot.mru_next = head;
        }
        match head {
            Some(h) => self.slots[h as usize].mru_prev = Some(idx),
            None => self.mru_tail = Some(idx),
        }
        self.mru_head = Some(idx);
    }

    fn bucket_unlink(&mut self, idx: u32) {
        let (hash, next) = {
            let slot = &self.slots[idx as usize];
            (slot.hash, slot.bucket_next)
        };
        let bucket = self.bucket_of(hash);

        if self.buckets[bucket] == Some(idx) {
            self.buckets[bucket] = next;
            return;
        }
        let mut cur = self.buckets[bucket];
        while let Some(c) = cur {
            let c_next = self.slots[c as usize].bucket_next;
            if c_next == Some(idx) {
                self.slots[c as usize].bucket_next = next;
                return;
            }
            cur = c_next;
        }
        debug!(idx, "entry missing from its bucket chain");
    }
}
