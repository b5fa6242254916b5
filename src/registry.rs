//! Session registry (component D).
//!
//! Owns every `Session` by `SessionKey`, plus the background reaper that
//! expires connections stuck in `Waiting` past the configured TTL (§4.D,
//! P4). Lock ordering throughout the daemon is registry → session →
//! transport (never reversed), so the registry only ever takes its own
//! lock briefly to look up or mutate the map itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::session::{Session, SessionInfo, SessionKey, Status};

/// `Arc`-shared session table. Cloning a `Registry` clones the `Arc`.
#[derive(Debug, Clone)]
pub struct Registry {
    inner: Arc<Mutex<HashMap<SessionKey, Arc<Session>>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Insert a brand new session. Returns `false` without mutating
    /// anything if `key` is already taken (I1: keys are unique).
    #[must_use]
    pub fn insert(&self, session: Arc<Session>) -> bool {
        let mut map = self.inner.lock().expect("registry lock poisoned");
        if map.contains_key(&session.key) {
            return false;
        }
        map.insert(session.key.clone(), session);
        true
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.inner.lock().expect("registry lock poisoned").get(key).cloned()
    }

    pub fn remove(&self, key: &SessionKey) -> Option<Arc<Session>> {
        self.inner.lock().expect("registry lock poisoned").remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot for the `Ps` control-plane verb. `all` includes every
    /// status; otherwise only `Waiting`/`Connected` sessions are listed.
    pub fn list(&self, all: bool) -> Vec<SessionInfo> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .values()
            .filter(|s| all || s.status() != Status::Closed)
            .map(|s| s.to_info())
            .collect()
    }

    /// Find a session by `(name, addr)`, or by `name` alone when `addr` is
    /// empty (control-plane lookups accept a bare name when unambiguous).
    pub fn find(&self, name: &str, addr: &str) -> Option<Arc<Session>> {
        let map = self.inner.lock().expect("registry lock poisoned");
        if !addr.is_empty() {
            return map.get(&SessionKey::new(name, addr)).cloned();
        }
        let mut matches: Vec<Arc<Session>> = map
            .values()
            .filter(|s| s.key.name == name)
            .cloned()
            .collect();
        if matches.len() == 1 {
            matches.pop()
        } else {
            None
        }
    }

    /// Close every expired `Waiting` session once per reaper tick (P4),
    /// discarding any recorder artifact it may have opened speculatively.
    pub fn reap_expired(&self, waiting_conn_time: u64, now: i64) {
        let expired: Vec<Arc<Session>> = {
            let map = self.inner.lock().expect("registry lock poisoned");
            map.values()
                .filter(|s| s.is_waiting_expired(waiting_conn_time, now))
                .cloned()
                .collect()
        };
        for session in expired {
            log::info!("session {} expired while waiting for a connection", session.key);
            if let Some(rec) = session.take_pending_recorder() {
                rec.discard();
            }
            session.set_status(Status::Closed);
            if let Some(parent_key) = &session.parent {
                if let Some(parent) = self.get(parent_key) {
                    parent.link_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                }
            }
            self.remove(&session.key);
        }
    }

    /// Background task: reaps expired `Waiting` sessions once a second
    /// until `shutdown` fires.
    pub async fn run_reaper(self: Arc<Self>, waiting_conn_time: u64, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0);
                    self.reap_expired(waiting_conn_time, now);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
