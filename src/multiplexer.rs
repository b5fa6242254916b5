//! Session multiplexer (component F).
//!
//! `SharedContext` is the live state a promoted session's descendants all
//! point at through one `Arc`: the connection set, the shared inbound
//! channel, the PTY or Player source, and the optional recorder. Promoting
//! a session (Exec/Play) creates one and spawns its pumps; cloning into a
//! session (Share/Attach) just registers another key against the same one.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::Result;
use crate::frame::{self, ResizeArgs};
use crate::player::{Player, PlayerEvent};
use crate::pty::{PtyProcess, UserSpec};
use crate::recorder::Recorder;
use crate::registry::Registry;
use crate::session::{Method, Session, SessionKey, Status};
use crate::transport::{ClientTransport, InboundEvent};

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// The live PTY source behind a promoted session: a real child process, or
/// a `Player` standing in for one during replay (§9 "synthetic child-process
/// handle" — here a variant rather than a literal fake `Child`, since we
/// never need to hand a `Player` to code expecting `portable_pty::Child`).
pub enum PtyHandle {
    Exec(ExecPty),
    Play(AsyncMutex<Player>),
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PtyHandle::Exec(_) => f.write_str("PtyHandle::Exec"),
            PtyHandle::Play(_) => f.write_str("PtyHandle::Play"),
        }
    }
}

/// A live child process wired to a background reader thread, bridging
/// `portable_pty`'s blocking I/O into the async world.
pub struct ExecPty {
    pty: StdMutex<PtyProcess>,
    writer: StdMutex<Box<dyn Write + Send>>,
    output_rx: AsyncMutex<Option<mpsc::Receiver<std::io::Result<Vec<u8>>>>>,
}

impl ExecPty {
    pub fn spawn(
        argv: &[String],
        rows: u16,
        cols: u16,
        cwd: Option<&std::path::Path>,
        user: Option<&UserSpec>,
    ) -> Result<Self> {
        let pty = PtyProcess::spawn(argv, rows, cols, cwd, user)?;
        let mut reader = pty.try_clone_reader()?;
        let writer = pty.take_writer()?;

        let (tx, rx) = mpsc::channel(32);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(e));
                        break;
                    }
                }
            }
        });

        Ok(Self {
            pty: StdMutex::new(pty),
            writer: StdMutex::new(writer),
            output_rx: AsyncMutex::new(Some(rx)),
        })
    }

    fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.pty
            .lock()
            .expect("pty lock poisoned")
            .resize(rows, cols)
    }

    fn write_input(&self, data: &[u8]) -> std::io::Result<()> {
        self.writer.lock().expect("writer lock poisoned").write_all(data)
    }

    async fn take_output_rx(&self) -> mpsc::Receiver<std::io::Result<Vec<u8>>> {
        self.output_rx
            .lock()
            .await
            .take()
            .expect("output receiver taken exactly once, by the output pump")
    }

    /// Drop the writer half, delivering EOF to the child's stdin.
    fn close_pty(&self) {
        *self.writer.lock().expect("writer lock poisoned") = Box::new(std::io::sink());
    }

    /// Best-effort `kill(pid, sig)`; the close signal, not a hard kill.
    fn send_signal(&self, sig: i32) {
        if let Some(pid) = self.pty.lock().expect("pty lock poisoned").pid() {
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
    }

    /// Poll until the child exits. No timeout: the supervisor's close
    /// sequence waits unconditionally, matching the daemon's own shutdown.
    async fn wait(&self) {
        loop {
            let done = matches!(
                self.pty.lock().expect("pty lock poisoned").try_wait(),
                Ok(Some(_))
            );
            if done {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

/// State shared by a primary session and every clone/attach descendant
/// pointed at the same PTY or Player (I5).
pub struct SharedContext {
    connections: StdMutex<HashMap<SessionKey, Arc<ClientTransport>>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    pub pty: PtyHandle,
    recorder: Option<Recorder>,
    permit_write_by_key: StdMutex<HashMap<SessionKey, bool>>,
    /// Current known terminal size (rows, cols); `(0, 0)` means unknown
    /// (a Play session before its first recorded `ResizeTerminal`). Updated
    /// by the input pump on a live Exec resize and by the output pump on a
    /// replayed `PlayerEvent::Resize`; read by the front door so a newly
    /// joining client learns the session's current geometry.
    dimensions: StdMutex<(u16, u16)>,
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedContext")
            .field("pty", &self.pty)
            .field("recording", &self.recorder.is_some())
            .finish_non_exhaustive()
    }
}

impl SharedContext {
    pub fn inbound_sender(&self) -> mpsc::UnboundedSender<InboundEvent> {
        self.inbound_tx.clone()
    }

    /// Register a connecting client's transport under `key` and its
    /// resolved write permission, so the input pump can enforce it.
    pub fn register_connection(
        &self,
        key: SessionKey,
        transport: Arc<ClientTransport>,
        permit_write: bool,
    ) {
        self.connections.lock().expect("connections lock poisoned").insert(key.clone(), transport);
        self.permit_write_by_key
            .lock()
            .expect("permit map lock poisoned")
            .insert(key, permit_write);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().expect("connections lock poisoned").len()
    }

    /// Current known (rows, cols), or `(0, 0)` if none has been observed yet.
    pub fn dimensions(&self) -> (u16, u16) {
        *self.dimensions.lock().expect("dimensions lock poisoned")
    }

    fn set_dimensions(&self, rows: u16, cols: u16) {
        *self.dimensions.lock().expect("dimensions lock poisoned") = (rows, cols);
    }

    async fn fan_out(&self, wire_frame: Vec<u8>) -> usize {
        let conns: Vec<(SessionKey, Arc<ClientTransport>)> = {
            let map = self.connections.lock().expect("connections lock poisoned");
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        let mut dead = Vec::new();
        for (key, transport) in conns {
            if let Err(e) = transport.send_frame(wire_frame.clone()).await {
                log::debug!("fan-out to {key}: {e}");
                dead.push(key);
            }
        }
        if !dead.is_empty() {
            let mut map = self.connections.lock().expect("connections lock poisoned");
            for key in &dead {
                map.remove(key);
            }
        }
        self.connections.lock().expect("connections lock poisoned").len()
    }

    fn record(&self, opcode: u8, payload: &[u8]) {
        if let Some(rec) = &self.recorder {
            if let Err(e) = rec.write_frame(opcode, payload) {
                log::warn!("recorder write failed: {e}");
            }
        }
    }

    /// Close one connection by key (control-plane `Close`, non-`all`). The
    /// resulting `InboundEvent::Closed` does the actual bookkeeping, so this
    /// never duplicates the input pump's close logic.
    pub async fn close_one(&self, key: &SessionKey) {
        let transport = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .get(key)
            .cloned();
        if let Some(t) = transport {
            t.close().await;
        }
    }

    /// Close every connection in this context's set (control-plane `Close
    /// -a`), letting the pumps observe an empty set and tear the session
    /// down through the normal supervisor path.
    pub async fn close_all(&self) {
        let keys: Vec<SessionKey> = self
            .connections
            .lock()
            .expect("connections lock poisoned")
            .keys()
            .cloned()
            .collect();
        for key in keys {
            self.close_one(&key).await;
        }
    }
}

/// Open a PTY, build its `SharedContext`, register it on `session` and
/// spawn the cooperative pumps. Returns the context so the caller (the
/// front door) can attach the promoting client's own transport.
pub async fn promote_exec(
    session: &Arc<Session>,
    argv: &[String],
    rec_dir: &std::path::Path,
    registry: Arc<Registry>,
    close_signal: i32,
) -> Result<Arc<SharedContext>> {
    let exec = ExecPty::spawn(argv, DEFAULT_ROWS, DEFAULT_COLS, None, Some(&session.policy.user))?;

    // The recorder is opened at Exec-call time (control.rs), not here, so
    // that the control plane can return the RecId before the session ever
    // connects (§4.G). Fall back to opening one now only if a caller bypasses
    // the control plane (e.g. a test that calls `promote_exec` directly).
    let recorder = match session.take_pending_recorder() {
        Some(rec) => Some(rec),
        None if session.policy.record => {
            let term = std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string());
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            let rec = Recorder::create(rec_dir, &term, &shell, &argv.join(" "))?;
            session.set_rec_id(rec.rec_id().to_string());
            Some(rec)
        }
        None => None,
    };

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(SharedContext {
        connections: StdMutex::new(HashMap::new()),
        inbound_tx,
        pty: PtyHandle::Exec(exec),
        recorder,
        permit_write_by_key: StdMutex::new(HashMap::new()),
        dimensions: StdMutex::new((DEFAULT_ROWS, DEFAULT_COLS)),
    });

    session.set_context(ctx.clone());
    tokio::spawn(run_primary(session.clone(), ctx.clone(), registry, close_signal, inbound_rx));
    Ok(ctx)
}

/// Open a recording for replay and spawn the same pump pair as `promote_exec`
/// (Decision, §9): Play never records and never receives a close signal, but
/// otherwise drives the identical supervisor close sequence.
pub async fn promote_play(
    session: &Arc<Session>,
    rec_path: &std::path::Path,
    registry: Arc<Registry>,
) -> Result<Arc<SharedContext>> {
    let player = Player::open(
        rec_path,
        session.policy.speed,
        session.policy.repeat,
        session.policy.max_wait,
    )?;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(SharedContext {
        connections: StdMutex::new(HashMap::new()),
        inbound_tx,
        pty: PtyHandle::Play(AsyncMutex::new(player)),
        recorder: None,
        permit_write_by_key: StdMutex::new(HashMap::new()),
        dimensions: StdMutex::new((0, 0)),
    });

    session.set_context(ctx.clone());
    tokio::spawn(run_primary(session.clone(), ctx.clone(), registry, 0, inbound_rx));
    Ok(ctx)
}

/// Point a Share/Attach child at its parent's already-running context. No
/// new pumps: the parent's pumps already drive fan-out for every key in its
/// connection set (§4.F "clones do not start their own pumps").
pub fn clone_into_parent(child: &Arc<Session>, parent_ctx: Arc<SharedContext>) {
    child.set_context(parent_ctx);
}

async fn output_pump(ctx: Arc<SharedContext>) {
    match &ctx.pty {
        PtyHandle::Exec(exec) => {
            let mut rx = exec.take_output_rx().await;
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(chunk) if chunk.is_empty() => continue,
                    Ok(chunk) => {
                        ctx.record(frame::SERVER_OUTPUT, &chunk);
                        let wire = frame::build(frame::SERVER_OUTPUT, BASE64.encode(&chunk).as_bytes());
                        if ctx.fan_out(wire).await == 0 {
                            break;
                        }
                    }
                    Err(e) => {
                        log::debug!("pty read error: {e}");
                        break;
                    }
                }
            }
        }
        PtyHandle::Play(player) => loop {
            let event = {
                let mut p = player.lock().await;
                p.next_event().await
            };
            match event {
                Ok(Some(PlayerEvent::Output(bytes))) => {
                    let wire = frame::build(frame::SERVER_OUTPUT, BASE64.encode(&bytes).as_bytes());
                    if ctx.fan_out(wire).await == 0 {
                        break;
                    }
                }
                Ok(Some(PlayerEvent::Resize { rows, cols })) => {
                    ctx.set_dimensions(rows, cols);
                    let args = ResizeArgs {
                        columns: cols as f64,
                        rows: rows as f64,
                    };
                    if let Ok(payload) = serde_json::to_vec(&args) {
                        ctx.fan_out(frame::build(frame::SERVER_RESIZE_TERMINAL, &payload)).await;
                    }
                    continue;
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("player error: {e}");
                    break;
                }
            }
        },
    }
}

async fn input_pump(
    ctx: Arc<SharedContext>,
    mut inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    registry: Arc<Registry>,
) {
    while let Some(event) = inbound_rx.recv().await {
        match event {
            InboundEvent::Closed { key } => {
                let remaining = {
                    let mut map = ctx.connections.lock().expect("connections lock poisoned");
                    map.remove(&key);
                    map.len()
                };
                ctx.permit_write_by_key
                    .lock()
                    .expect("permit map lock poisoned")
                    .remove(&key);
                if let Some(sess) = registry.get(&key) {
                    sess.set_status(Status::Closed);
                    if let Some(parent_key) = &sess.parent {
                        if let Some(parent) = registry.get(parent_key) {
                            parent.link_count.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    if sess.parent.is_some() {
                        registry.remove(&key);
                    }
                }
                if remaining == 0 {
                    break;
                }
            }
            InboundEvent::Frame { key, data } => {
                if data.is_empty() {
                    log::warn!("empty Input payload from {key}, closing its session");
                    break;
                }
                match data[0] {
                    frame::CLIENT_INPUT => {
                        let permit = ctx
                            .permit_write_by_key
                            .lock()
                            .expect("permit map lock poisoned")
                            .get(&key)
                            .copied()
                            .unwrap_or(false);
                        let payload = &data[1..];
                        if !permit {
                            if payload == [0x03] || payload == [0x04] {
                                if let Some(t) = ctx.connections.lock().expect("connections lock poisoned").get(&key).cloned() {
                                    t.close().await;
                                }
                            }
                            continue;
                        }
                        if let PtyHandle::Exec(exec) = &ctx.pty {
                            if let Err(e) = exec.write_input(payload) {
                                log::debug!("pty write error: {e}");
                                break;
                            }
                        }
                    }
                    frame::CLIENT_PING => {
                        if ctx.fan_out(frame::build(frame::SERVER_PONG, &[])).await == 0 {
                            break;
                        }
                    }
                    frame::CLIENT_RESIZE_TERMINAL => match serde_json::from_slice::<ResizeArgs>(&data[1..]) {
                        Ok(args) => {
                            let rows = args.rows as u16;
                            let cols = args.columns as u16;
                            if let PtyHandle::Exec(exec) = &ctx.pty {
                                if let Err(e) = exec.resize(rows, cols) {
                                    log::debug!("resize failed: {e}");
                                } else {
                                    ctx.set_dimensions(rows, cols);
                                    ctx.fan_out(frame::build(frame::SERVER_RESIZE_TERMINAL, &data[1..])).await;
                                }
                            }
                            ctx.record(frame::CLIENT_RESIZE_TERMINAL, &data[1..]);
                        }
                        Err(e) => {
                            log::warn!("malformed ResizeTerminal from {key}: {e}");
                            break;
                        }
                    },
                    other => {
                        log::warn!("unknown opcode {other} from {key}, closing its session");
                        break;
                    }
                }
            }
        }
    }
}

/// Drives a promoted session end to end: spawn both pumps, wait for either
/// to end (connections fully drained, PTY EOF'd, or a protocol violation),
/// then run the close sequence from §4.F.
async fn run_primary(
    session: Arc<Session>,
    ctx: Arc<SharedContext>,
    registry: Arc<Registry>,
    close_signal: i32,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
) {
    let key = session.key.clone();
    let out = tokio::spawn(output_pump(ctx.clone()));
    let inp = tokio::spawn(input_pump(ctx.clone(), inbound_rx, registry.clone()));

    tokio::select! {
        _ = out => {},
        _ = inp => {},
    }

    session.set_status(Status::Closed);

    if let PtyHandle::Exec(exec) = &ctx.pty {
        exec.close_pty();
    }
    if let Some(rec) = &ctx.recorder {
        if let Err(e) = rec.close() {
            log::warn!("recorder close failed for {key}: {e}");
        }
    }
    if session.method != Method::Play {
        if let PtyHandle::Exec(exec) = &ctx.pty {
            exec.send_signal(close_signal);
        }
    }
    if let PtyHandle::Exec(exec) = &ctx.pty {
        exec.wait().await;
    }

    let stragglers: Vec<SessionKey> = {
        let map = ctx.connections.lock().expect("connections lock poisoned");
        map.keys().cloned().collect()
    };
    for straggler in stragglers {
        if let Some(t) = ctx.connections.lock().expect("connections lock poisoned").remove(&straggler) {
            t.close().await;
        }
    }

    registry.remove(&key);
    let drift = session.link_count.load(Ordering::SeqCst);
    if drift > 1 {
        log::warn!("session {key} closed with {drift} outstanding links (expected cleanup by now)");
    }
    log::info!("session {key} closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::NetFilter;
    use crate::session::Policy;

    #[tokio::test]
    async fn test_promote_exec_runs_and_closes() {
        let registry = Registry::new();
        let session = Arc::new(Session::new(
            SessionKey::new("a", "0.0.0.0/0"),
            None,
            Method::Exec,
            Policy::default(),
            vec!["/bin/true".to_string()],
            NetFilter::parse("0.0.0.0/0"),
        ));
        registry.insert(session.clone());

        let dir = tempfile::tempdir().unwrap();
        let ctx = promote_exec(&session, &session.command, dir.path(), registry.clone(), libc::SIGHUP)
            .await
            .unwrap();
        assert_eq!(ctx.connection_count(), 0);

        // No transports ever attach, so the input pump never sees a Frame;
        // the output pump ends once /bin/true exits and EOFs the reader.
        for _ in 0..100 {
            if registry.get(&session.key).is_none() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("session was never reaped after child exit");
    }

    #[test]
    fn test_clone_into_parent_shares_context() {
        let parent = Arc::new(Session::new(
            SessionKey::new("p", "0.0.0.0/0"),
            None,
            Method::Exec,
            Policy::default(),
            vec!["/bin/true".to_string()],
            NetFilter::parse("0.0.0.0/0"),
        ));
        let child = Arc::new(Session::new(
            SessionKey::new("p", "10.0.0.0/8"),
            Some(parent.key.clone()),
            Method::Share,
            Policy::default(),
            parent.command.clone(),
            NetFilter::parse("10.0.0.0/8"),
        ));

        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(SharedContext {
            connections: StdMutex::new(HashMap::new()),
            inbound_tx: tx,
            pty: PtyHandle::Exec(ExecPty::spawn(&["/bin/true".to_string()], 24, 80, None, None).unwrap()),
            recorder: None,
            permit_write_by_key: StdMutex::new(HashMap::new()),
            dimensions: StdMutex::new((DEFAULT_ROWS, DEFAULT_COLS)),
        });
        parent.set_context(ctx.clone());

        clone_into_parent(&child, parent.context_handle().unwrap());
        assert!(Arc::ptr_eq(
            &child.context_handle().unwrap(),
            &parent.context_handle().unwrap()
        ));
    }
}
