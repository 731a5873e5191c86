use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use tokio::time::Instant;

use super::CachedResponse;

/// All cache bookkeeping behind one lock: stored responses, per-url vary
/// records, the expiration heap, and the byte budget. Slots carry generation
/// ids so a replaced entry's pending expiration becomes a no-op instead of
/// evicting its successor.
#[derive(Debug)]
pub(super) struct CacheIndex {
    responses: HashMap<String, ResponseSlot>,
    vary: HashMap<String, VarySlot>,
    expirations: BinaryHeap<Reverse<Expiration>>,
    bytes_in_use: u64,
    max_bytes: u64,
    next_id: u64,
}

#[derive(Debug)]
struct ResponseSlot {
    id: u64,
    expires_at: Instant,
    response: Arc<CachedResponse>,
}

#[derive(Debug)]
struct VarySlot {
    id: u64,
    expires_at: Instant,
    names: Vec<String>,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Expiration {
    at: Instant,
    id: u64,
    target: ExpireTarget,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum ExpireTarget {
    Response(String),
    Vary(String),
}

impl CacheIndex {
    pub(super) fn new(max_bytes: u64) -> Self {
        Self {
            responses: HashMap::new(),
            vary: HashMap::new(),
            expirations: BinaryHeap::new(),
            bytes_in_use: 0,
            max_bytes,
            next_id: 1,
        }
    }

    /// True when storing `additional` more body bytes would blow the budget.
    pub(super) fn would_exceed(&self, additional: u64) -> bool {
        self.bytes_in_use.saturating_add(additional) > self.max_bytes
    }

    pub(super) fn insert_response(
        &mut self,
        key: String,
        response: Arc<CachedResponse>,
        expires_at: Instant,
    ) {
        let id = self.next_id();
        if let Some(old) = self.responses.remove(&key) {
            self.bytes_in_use = self
                .bytes_in_use
                .saturating_sub(old.response.body.len() as u64);
        }
        self.bytes_in_use = self
            .bytes_in_use
            .saturating_add(response.body.len() as u64);
        self.expirations.push(Reverse(Expiration {
            at: expires_at,
            id,
            target: ExpireTarget::Response(key.clone()),
        }));
        self.responses.insert(
            key,
            ResponseSlot {
                id,
                expires_at,
                response,
            },
        );
    }

    pub(super) fn insert_vary(&mut self, url: String, names: Vec<String>, expires_at: Instant) {
        let id = self.next_id();
        self.expirations.push(Reverse(Expiration {
            at: expires_at,
            id,
            target: ExpireTarget::Vary(url.clone()),
        }));
        self.vary.insert(
            url,
            VarySlot {
                id,
                expires_at,
                names,
            },
        );
    }

    /// Fetch a live response, dropping it if its deadline passed so hits
    /// never depend on sweeper latency.
    pub(super) fn get_response(&mut self, key: &str, now: Instant) -> Option<Arc<CachedResponse>> {
        let expired = self
            .responses
            .get(key)
            .is_some_and(|slot| slot.expires_at <= now);
        if expired {
            if let Some(slot) = self.responses.remove(key) {
                self.bytes_in_use = self
                    .bytes_in_use
                    .saturating_sub(slot.response.body.len() as u64);
            }
            return None;
        }
        self.responses.get(key).map(|slot| slot.response.clone())
    }

    pub(super) fn get_vary(&mut self, url: &str, now: Instant) -> Option<Vec<String>> {
        let expired = self.vary.get(url).is_some_and(|slot| slot.expires_at <= now);
        if expired {
            self.vary.remove(url);
            return None;
        }
        self.vary.get(url).map(|slot| slot.names.clone())
    }

    /// Remove every entry whose deadline has passed, skipping heap entries
    /// superseded by a later store. Returns (entries removed, bytes freed).
    pub(super) fn remove_due(&mut self, now: Instant) -> (usize, u64) {
        let mut removed = 0;
        let mut bytes_freed = 0;
        while let Some(Reverse(due)) = self.expirations.peek() {
            if due.at > now {
                break;
            }
            let Some(Reverse(due)) = self.expirations.pop() else {
                break;
            };
            match due.target {
                ExpireTarget::Response(key) => {
                    let matches = self
                        .responses
                        .get(&key)
                        .is_some_and(|slot| slot.id == due.id);
                    if matches && let Some(slot) = self.responses.remove(&key) {
                        let len = slot.response.body.len() as u64;
                        self.bytes_in_use = self.bytes_in_use.saturating_sub(len);
                        bytes_freed += len;
                        removed += 1;
                    }
                }
                ExpireTarget::Vary(url) => {
                    if self.vary.get(&url).is_some_and(|slot| slot.id == due.id) {
                        self.vary.remove(&url);
                        removed += 1;
                    }
                }
            }
        }
        (removed, bytes_freed)
    }

    pub(super) fn next_deadline(&self) -> Option<Instant> {
        self.expirations.peek().map(|Reverse(due)| due.at)
    }

    pub(super) fn clear(&mut self) {
        self.responses.clear();
        self.vary.clear();
        self.expirations.clear();
        self.bytes_in_use = 0;
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    #[cfg(test)]
    pub(super) fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.responses.len()
    }
}
