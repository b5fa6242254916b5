//! Session data model (§3) — keys, methods, status, policy and the
//! `Session` entity itself. The live multiplexer context (connections,
//! inbound channel, PTY/Player handle, recorder) lives in
//! [`crate::multiplexer::SharedContext`]; a `Session` only ever points at
//! one once promoted.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cidr::NetFilter;
use crate::multiplexer::SharedContext;
use crate::pty::UserSpec;
use crate::recorder::Recorder;

/// `(name, addr)` — unique per daemon; `addr` both displays and constrains
/// which remote IPs may connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub name: String,
    pub addr: String,
}

impl SessionKey {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.addr)
    }
}

/// How a session's PTY source came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Exec,
    Share,
    Attach,
    Play,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Method::Exec => "exec",
            Method::Share => "share",
            Method::Attach => "attach",
            Method::Play => "play",
        };
        write!(f, "{s}")
    }
}

/// Monotonically advancing lifecycle state (I2): Waiting → Connected → Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Status {
    Waiting = 0,
    Connected = 1,
    Closed = 2,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Waiting => "waiting",
            Status::Connected => "connected",
            Status::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// Invocation options carried by a session, resolved at Exec/Attach/Play
/// time and inherited (with write forced off unless fully permitted) by
/// Share clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub permit_write: bool,
    pub permit_share: bool,
    pub permit_share_write: bool,
    pub record: bool,
    pub speed: f64,
    pub repeat: bool,
    /// Replay idle cap in seconds; 0 = uncapped.
    pub max_wait: u64,
    /// Target identity for the spawned child (Exec only); `UserSpec::default()`
    /// means "run as the daemon's own identity".
    pub user: UserSpec,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            permit_write: false,
            permit_share: false,
            permit_share_write: false,
            record: false,
            speed: 1.0,
            repeat: false,
            max_wait: 0,
            user: UserSpec::default(),
        }
    }
}

/// A snapshot of a session for the `Ps` control-plane verb (§4.G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub parent_key: Option<SessionKey>,
    pub link_count: i32,
    pub method: Method,
    pub status: Status,
    pub command: Vec<String>,
    pub remote_addr: Option<String>,
    /// Seconds since connection, or 0 if not yet connected.
    pub conn_age: i64,
    pub rec_id: Option<String>,
}

/// The central entity (§3). Cheap fields use plain `Mutex`es; the
/// performance-sensitive multiplexer state lives behind `context`, set
/// exactly once at promotion.
pub struct Session {
    pub key: SessionKey,
    pub parent: Option<SessionKey>,
    pub link_count: AtomicI32,
    pub method: Method,
    status: Mutex<Status>,
    pub create_time: i64,
    conn_time: Mutex<Option<i64>>,
    pub policy: Policy,
    pub command: Vec<String>,
    pub nets: NetFilter,
    remote_addr: Mutex<Option<String>>,
    rec_id: Mutex<Option<String>>,
    pub context: Mutex<Option<Arc<SharedContext>>>,
    /// A recorder opened at Exec-call time (§4.G "optionally open recorder;
    /// return key + RecId"), handed off to the multiplexer at promotion so
    /// the RecId is known to the caller before the session ever connects.
    pending_recorder: Mutex<Option<Recorder>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("method", &self.method)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Session {
    /// Create a brand-new Waiting session.
    pub fn new(
        key: SessionKey,
        parent: Option<SessionKey>,
        method: Method,
        policy: Policy,
        command: Vec<String>,
        nets: NetFilter,
    ) -> Self {
        Self {
            key,
            parent,
            link_count: AtomicI32::new(1),
            method,
            status: Mutex::new(Status::Waiting),
            create_time: unix_now(),
            conn_time: Mutex::new(None),
            policy,
            command,
            nets,
            remote_addr: Mutex::new(None),
            rec_id: Mutex::new(None),
            context: Mutex::new(None),
            pending_recorder: Mutex::new(None),
        }
    }

    pub fn status(&self) -> Status {
        *self.status.lock().expect("session status lock poisoned")
    }

    /// Advance the status. Callers are responsible for respecting I2
    /// (monotonic advance) — this just stores the new value.
    pub fn set_status(&self, status: Status) {
        *self.status.lock().expect("session status lock poisoned") = status;
    }

    pub fn conn_time(&self) -> Option<i64> {
        *self.conn_time.lock().expect("conn_time lock poisoned")
    }

    pub fn mark_connected(&self, remote_addr: Option<String>) {
        *self.conn_time.lock().expect("conn_time lock poisoned") = Some(unix_now());
        *self.remote_addr.lock().expect("remote_addr lock poisoned") = remote_addr;
        self.set_status(Status::Connected);
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.remote_addr.lock().expect("remote_addr lock poisoned").clone()
    }

    pub fn rec_id(&self) -> Option<String> {
        self.rec_id.lock().expect("rec_id lock poisoned").clone()
    }

    pub fn set_rec_id(&self, id: String) {
        *self.rec_id.lock().expect("rec_id lock poisoned") = Some(id);
    }

    pub fn set_pending_recorder(&self, recorder: Recorder) {
        *self.pending_recorder.lock().expect("pending_recorder lock poisoned") = Some(recorder);
    }

    /// Hand off the recorder opened at Exec time, if any. Called exactly
    /// once, by `promote_exec`.
    pub fn take_pending_recorder(&self) -> Option<Recorder> {
        self.pending_recorder
            .lock()
            .expect("pending_recorder lock poisoned")
            .take()
    }

    pub fn set_context(&self, context: Arc<SharedContext>) {
        *self.context.lock().expect("context lock poisoned") = Some(context);
    }

    pub fn context_handle(&self) -> Option<Arc<SharedContext>> {
        self.context.lock().expect("context lock poisoned").clone()
    }

    pub fn is_waiting_expired(&self, waiting_conn_time: u64, now: i64) -> bool {
        self.status() == Status::Waiting && self.create_time + waiting_conn_time as i64 <= now
    }

    pub fn to_info(&self) -> SessionInfo {
        let conn_age = self.conn_time().map(|t| unix_now() - t).unwrap_or(0);
        SessionInfo {
            key: self.key.clone(),
            parent_key: self.parent.clone(),
            link_count: self.link_count.load(Ordering::SeqCst),
            method: self.method,
            status: self.status(),
            command: self.command.clone(),
            remote_addr: self.remote_addr(),
            conn_age,
            rec_id: self.rec_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_session(status: Status) -> Session {
        let s = Session::new(
            SessionKey::new("a", "0.0.0.0/0"),
            None,
            Method::Exec,
            Policy::default(),
            vec!["/bin/true".to_string()],
            NetFilter::parse("0.0.0.0/0"),
        );
        s.set_status(status);
        s
    }

    #[test]
    fn test_new_session_starts_waiting() {
        let s = make_session(Status::Waiting);
        assert_eq!(s.status(), Status::Waiting);
        assert_eq!(s.link_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_waiting_expires_after_ttl() {
        let s = make_session(Status::Waiting);
        let now = s.create_time + 11;
        assert!(s.is_waiting_expired(10, now));
        assert!(!s.is_waiting_expired(10, s.create_time));
    }

    #[test]
    fn test_connected_session_never_reported_expired() {
        let s = make_session(Status::Connected);
        assert!(!s.is_waiting_expired(10, s.create_time + 1000));
    }

    #[test]
    fn test_mark_connected_sets_conn_time_and_status() {
        let s = make_session(Status::Waiting);
        assert!(s.conn_time().is_none());
        s.mark_connected(Some("127.0.0.1".to_string()));
        assert!(s.conn_time().is_some());
        assert_eq!(s.status(), Status::Connected);
        assert_eq!(s.remote_addr().as_deref(), Some("127.0.0.1"));
    }
}
