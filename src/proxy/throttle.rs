use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use http::{Method, Uri};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Hierarchical in-memory throttle. Entries are keyed per
/// `(method, scheme, host, path-prefix)`; a request is governed by every
/// entry whose path is a `/`-bounded prefix of its own, so a host-wide rate
/// and a stricter `/api` rate both apply to `/api/users`.
pub struct MemoryHttpThrottle {
    entries: Mutex<HashMap<String, Arc<ThrottleEntry>>>,
    default_wait: Duration,
    stopped: AtomicBool,
}

/// Per-key state machine: the instant the next request may proceed, the
/// configured spacing between requests, and the latest open block window.
struct ThrottleEntry {
    state: Mutex<EntryState>,
}

struct EntryState {
    period: Duration,
    next_free: Instant,
    block_until: Option<Instant>,
}

impl ThrottleEntry {
    fn new(period: Duration) -> Self {
        Self {
            state: Mutex::new(EntryState {
                period,
                next_free: Instant::now() + period,
                block_until: None,
            }),
        }
    }

    /// Wait for all open block windows to close, then consume one slot.
    /// Deadlines are re-read after every sleep, so a block window opened
    /// mid-wait still holds this waiter back; waiters that already consumed
    /// their slot are not called back.
    async fn wait_turn(&self) {
        loop {
            let deadline = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let deadline = state
                    .block_until
                    .map_or(state.next_free, |block| block.max(state.next_free));
                if deadline <= now {
                    state.next_free = now + state.period;
                    if state.block_until.is_some_and(|block| block <= now) {
                        state.block_until = None;
                    }
                    None
                } else {
                    Some(deadline)
                }
            };
            match deadline {
                None => return,
                Some(at) => tokio::time::sleep_until(at).await,
            }
        }
    }

    fn reset(&self, period: Duration) {
        let mut state = self.state.lock();
        state.period = period;
        state.next_free = Instant::now() + period;
    }

    fn block(&self, duration: Duration) {
        let until = Instant::now() + duration;
        let mut state = self.state.lock();
        state.block_until = Some(state.block_until.map_or(until, |block| block.max(until)));
    }
}

impl MemoryHttpThrottle {
    pub fn new(default_wait: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            default_wait,
            stopped: AtomicBool::new(false),
        }
    }

    /// Suspend until every applicable prefix entry admits the request,
    /// shortest prefix first. Requests matching no entry sleep for the
    /// default duration.
    pub async fn wait(&self, method: &Method, uri: &Uri) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let applicable: Vec<Arc<ThrottleEntry>> = {
            let entries = self.entries.lock();
            path_prefixes(uri_path(uri))
                .into_iter()
                .filter_map(|prefix| entries.get(&entry_key(method, uri, &prefix)).cloned())
                .collect()
        };

        if applicable.is_empty() {
            tokio::time::sleep(self.default_wait).await;
            return;
        }

        for entry in applicable {
            entry.wait_turn().await;
        }
    }

    /// Open a block window on the entry for the request's full path, creating
    /// the entry if needed. Overlapping windows accumulate: no wait completes
    /// before the last window closes.
    pub fn block(&self, method: &Method, uri: &Uri, duration: Duration) {
        let key = entry_key(method, uri, uri_path(uri));
        debug!(key, wait_ms = duration.as_millis() as u64, "blocking throttle");
        let entry = {
            let mut entries = self.entries.lock();
            entries
                .entry(key)
                .or_insert_with(|| Arc::new(ThrottleEntry::new(duration)))
                .clone()
        };
        entry.block(duration);
    }

    /// Create or reset the entry for the url's method and path. Resetting an
    /// existing entry restarts its interval: the next slot opens `duration`
    /// from now.
    pub fn set_throttle(&self, method: &Method, uri: &Uri, duration: Duration) {
        let key = entry_key(method, uri, uri_path(uri));
        let mut entries = self.entries.lock();
        match entries.entry(key) {
            Entry::Occupied(existing) => existing.get().reset(duration),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(ThrottleEntry::new(duration)));
            }
        }
    }

    /// Shut the throttle down. Entries are discarded and subsequent waits
    /// return immediately; only called when the process stops serving.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.entries.lock().clear();
    }
}

/// The raw request path, empty when the url carries none. `Uri::path()`
/// substitutes `/`, which would break prefix matching for host-level keys.
fn uri_path(uri: &Uri) -> &str {
    uri.path_and_query().map_or("", |pq| pq.path())
}

fn entry_key(method: &Method, uri: &Uri, path: &str) -> String {
    format!(
        "{method} {}://{}{path}",
        uri.scheme_str().unwrap_or_default(),
        uri.authority().map_or("", |authority| authority.as_str()),
    )
}

/// Every `/`-bounded prefix of the path, shortest first, including the empty
/// prefix: `/a/b` yields ["", "/a", "/a/b"].
fn path_prefixes(path: &str) -> Vec<String> {
    let parts: Vec<&str> = path.split('/').collect();
    (0..parts.len()).map(|end| parts[..=end].join("/")).collect()
}
