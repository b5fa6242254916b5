//! `sharetty` — daemon and control-plane CLI for sharing PTY sessions
//! over a websocket transport (see `lib.rs` for the module map).

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use sharetty::client::{self, RawModeGuard};
use sharetty::control::{self, ControlReply, ControlRequest};
use sharetty::pty::UserSpec;
use sharetty::session::{Policy, SessionInfo};
use sharetty::ws;
use sharetty::{convert, frontdoor, DaemonConfig, Registry, ShareTtyError};

/// Global allocator, matching the rest of this dependency lineage.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "sharetty")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Share interactive terminal sessions over the network")]
struct Cli {
    /// Daemon/client config file (JSON). Defaults to `DaemonConfig::default()`
    /// plus environment overrides when omitted.
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the long-lived daemon: front door + control socket + reaper.
    Daemon,
    /// Launch a command as a new session and attach to it interactively.
    Exec {
        /// Permit this client (and, if shared, clones) to write input.
        #[arg(short = 'w', long)]
        w: bool,
        /// Allow other clients to share this session.
        #[arg(long)]
        share: bool,
        /// Allow shared clients to write input (requires `-w` and `-share`).
        #[arg(long = "share-write")]
        share_write: bool,
        /// Session name; auto-generated if omitted.
        #[arg(long)]
        name: Option<String>,
        /// CIDR/IP the remote client must match; open to all if omitted.
        #[arg(long)]
        addr: Option<String>,
        /// Record this session to a replay-able file.
        #[arg(long)]
        rec: bool,
        /// Numeric uid recorded on the session (not a real privilege drop;
        /// see `UserSpec` in `pty.rs`).
        #[arg(long)]
        uid: Option<u32>,
        /// Numeric gid recorded on the session, same caveat as `--uid`.
        #[arg(long)]
        gid: Option<u32>,
        /// Username to export as `USER`/`LOGNAME` in the child's environment.
        #[arg(long = "as-user")]
        as_user: Option<String>,
        /// `HOME` to export in the child's environment.
        #[arg(long)]
        home: Option<PathBuf>,
        /// Command and arguments to execute.
        #[arg(required = true)]
        cmd: Vec<String>,
    },
    /// List sessions known to a running daemon.
    Ps {
        /// Include closed sessions.
        #[arg(short = 'a', long)]
        a: bool,
    },
    /// Pre-declare a join to an existing connected session.
    Attach {
        #[arg(short = 'w', long)]
        w: bool,
        /// This attachment's own session name.
        #[arg(long)]
        name: Option<String>,
        /// This attachment's own addr/CIDR filter.
        #[arg(long)]
        addr: Option<String>,
        /// Target session's name.
        #[arg(long)]
        sname: String,
        /// Target session's addr.
        #[arg(long)]
        saddr: Option<String>,
    },
    /// Close one or all connections of a session.
    Close {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        addr: Option<String>,
        /// Close every connection in the session's set, not just one.
        #[arg(short = 'a', long)]
        a: bool,
    },
    /// Replay a recorded session and attach to it interactively.
    Play {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        addr: Option<String>,
        /// RecId of the recording to play back.
        #[arg(long = "id")]
        id: String,
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        #[arg(long)]
        repeat: bool,
        #[arg(long)]
        share: bool,
        /// Cap any single inter-frame gap, in seconds (0 = uncapped).
        #[arg(long = "max-wait", default_value_t = 0)]
        max_wait: u64,
    },
    /// Convert a recording file into an asciicast v1 JSON document.
    Convert {
        #[arg(short = 'i', long)]
        input: PathBuf,
        #[arg(short = 'o', long)]
        output: PathBuf,
        #[arg(long = "max-wait", default_value_t = 0)]
        max_wait: u64,
    },
    /// Print the version and exit.
    Version,
}

/// Error carrying the process exit code it should map to at the CLI
/// boundary (§6/§7): `thiserror`-derived `ShareTtyError`s keep their own
/// code, everything else (I/O, connect failures, malformed replies) is a
/// runtime failure (exit code 4).
struct CliError {
    code: u8,
    message: String,
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<ShareTtyError> for CliError {
    fn from(e: ShareTtyError) -> Self {
        Self {
            code: e.exit_code() as u8,
            message: e.to_string(),
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            code: 4,
            message: e.to_string(),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self {
            code: 4,
            message: e.to_string(),
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("sharetty: failed to start async runtime: {e}");
            return ExitCode::from(3);
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("sharetty: {e}");
            ExitCode::from(e.code)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<ExitCode, CliError> {
    match cli.command {
        Commands::Daemon => run_daemon(cli.config.as_deref()).await,
        Commands::Exec {
            w,
            share,
            share_write,
            name,
            addr,
            rec,
            uid,
            gid,
            as_user,
            home,
            cmd,
        } => {
            run_exec(
                cli.config.as_deref(),
                w,
                share,
                share_write,
                name,
                addr,
                rec,
                uid,
                gid,
                as_user,
                home,
                cmd,
            )
            .await
        }
        Commands::Ps { a } => run_ps(cli.config.as_deref(), a).await,
        Commands::Attach {
            w,
            name,
            addr,
            sname,
            saddr,
        } => run_attach(cli.config.as_deref(), w, name, addr, sname, saddr).await,
        Commands::Close { name, addr, a } => run_close(cli.config.as_deref(), name, addr, a).await,
        Commands::Play {
            name,
            addr,
            id,
            speed,
            repeat,
            share,
            max_wait,
        } => run_play(cli.config.as_deref(), name, addr, id, speed, repeat, share, max_wait).await,
        Commands::Convert {
            input,
            output,
            max_wait,
        } => run_convert(&input, &output, max_wait),
        Commands::Version => {
            println!("sharetty {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<DaemonConfig, CliError> {
    Ok(DaemonConfig::load(path)?)
}

/// `daemon`: run the front door, control socket, and reaper until a signal
/// asks us to stop; a second signal during drain forces immediate exit (5).
async fn run_daemon(config_path: Option<&std::path::Path>) -> Result<ExitCode, CliError> {
    let config = std::sync::Arc::new(load_config(config_path)?);
    let registry = Registry::new();

    // Same AtomicBool-flag idiom this crate's signal handling is grounded on:
    // set by the signal handler, polled from async code.
    let shutdown_signal = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown_signal.clone())
        .map_err(|e| CliError {
            code: 3,
            message: format!("failed to register SIGINT handler: {e}"),
        })?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown_signal.clone())
        .map_err(|e| CliError {
            code: 3,
            message: format!("failed to register SIGTERM handler: {e}"),
        })?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reaper = tokio::spawn(
        registry
            .clone()
            .run_reaper(config.waiting_conn_time, shutdown_rx.clone()),
    );
    let front = tokio::spawn(frontdoor::serve(
        config.clone(),
        registry.clone(),
        shutdown_rx.clone(),
    ));
    let ctrl = tokio::spawn(control::serve(
        config.clone(),
        registry.clone(),
        shutdown_rx.clone(),
    ));

    log::info!("sharetty daemon started, front door on {}", config.addr);

    // Wait for the first signal, polling same as the headless event loop
    // this is grounded on.
    while !shutdown_signal.load(std::sync::atomic::Ordering::Relaxed) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    log::info!("shutdown requested, no longer accepting new connections");
    let _ = shutdown_tx.send(true);
    // A second signal arriving after this point means "stop waiting for
    // sessions to drain, exit now" (S6) — reset and watch for it to flip
    // again rather than treating the already-observed signal as a repeat.
    shutdown_signal.store(false, std::sync::atomic::Ordering::Relaxed);

    match front.await {
        Ok(Err(e)) => log::warn!("front door task exited with error: {e}"),
        Err(e) => log::warn!("front door task panicked: {e}"),
        Ok(Ok(())) => {}
    }
    match ctrl.await {
        Ok(Err(e)) => log::warn!("control socket task exited with error: {e}"),
        Err(e) => log::warn!("control socket task panicked: {e}"),
        Ok(Ok(())) => {}
    }

    while !registry.is_empty() {
        if shutdown_signal.load(std::sync::atomic::Ordering::Relaxed) {
            log::warn!("second shutdown signal received, forcing immediate exit");
            return Ok(ExitCode::from(5));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    let _ = reaper.await;
    log::info!("sharetty daemon exiting cleanly");
    Ok(ExitCode::SUCCESS)
}

fn ws_url(config: &DaemonConfig) -> String {
    format!("ws://{}", config.addr)
}

/// Connect to the front door, send the init frame, and drive an interactive
/// session until the connection closes.
async fn interactive_attach(
    config: &DaemonConfig,
    key_name: &str,
    key_addr: &str,
    extra_args: &[String],
) -> Result<(), CliError> {
    let mut arguments = format!(
        "name={}&addr={}",
        urlencode(key_name),
        urlencode(key_addr)
    );
    for arg in extra_args {
        arguments.push_str("&arg=");
        arguments.push_str(&urlencode(arg));
    }

    let (mut writer, reader) = ws::connect(&ws_url(config), &[]).await?;
    let init = serde_json::json!({
        "Arguments": arguments,
        "AuthToken": config.credential,
    });
    writer.send_text(&init.to_string()).await?;

    let raw_mode = RawModeGuard::enable().ok();
    let result = client::run_interactive(writer, reader).await;
    drop(raw_mode);
    result.map_err(CliError::from)
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[allow(clippy::too_many_arguments)]
async fn run_exec(
    config_path: Option<&std::path::Path>,
    w: bool,
    share: bool,
    share_write: bool,
    name: Option<String>,
    addr: Option<String>,
    rec: bool,
    uid: Option<u32>,
    gid: Option<u32>,
    as_user: Option<String>,
    home: Option<PathBuf>,
    cmd: Vec<String>,
) -> Result<ExitCode, CliError> {
    let config = load_config(config_path)?;
    let policy = Policy {
        permit_write: w,
        permit_share: share,
        permit_share_write: share_write,
        record: rec,
        speed: 1.0,
        repeat: false,
        max_wait: 0,
        user: UserSpec {
            uid,
            gid,
            username: as_user,
            home,
            extra_env: std::collections::HashMap::new(),
        },
    };
    let request = ControlRequest::Exec {
        name: name.unwrap_or_default(),
        addr: addr.unwrap_or_default(),
        command: cmd,
        policy,
    };
    let info = call_for_session(&config, request).await?;
    log::info!("session {}:{} created ({})", info.key.name, info.key.addr, info.method);
    if let Some(rec_id) = &info.rec_id {
        eprintln!("recording to RecId {rec_id}");
    }
    interactive_attach(&config, &info.key.name, &info.key.addr, &[]).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_ps(config_path: Option<&std::path::Path>, all: bool) -> Result<ExitCode, CliError> {
    let config = load_config(config_path)?;
    let reply = control::call(&config.control_socket, &ControlRequest::Ps { all })
        .await
        .map_err(CliError::from)?;
    match reply {
        ControlReply::Sessions(sessions) => {
            println!("{:<20} {:<18} {:<8} {:<10} {:<6} command", "NAME", "ADDR", "METHOD", "STATUS", "LINKS");
            for s in sessions {
                println!(
                    "{:<20} {:<18} {:<8} {:<10} {:<6} {}",
                    s.key.name,
                    s.key.addr,
                    s.method,
                    s.status,
                    s.link_count,
                    s.command.join(" ")
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        ControlReply::Error { message, exit_code } => Err(CliError {
            code: exit_code as u8,
            message,
        }),
        other => Err(CliError {
            code: 4,
            message: format!("unexpected reply to Ps: {other:?}"),
        }),
    }
}

async fn run_attach(
    config_path: Option<&std::path::Path>,
    w: bool,
    name: Option<String>,
    addr: Option<String>,
    sname: String,
    saddr: Option<String>,
) -> Result<ExitCode, CliError> {
    let config = load_config(config_path)?;
    let request = ControlRequest::Attach {
        name: sname,
        addr: saddr.unwrap_or_default(),
        sname: name.unwrap_or_default(),
        saddr: addr.unwrap_or_default(),
        permit_write: w,
    };
    let info = call_for_session(&config, request).await?;
    interactive_attach(&config, &info.key.name, &info.key.addr, &[]).await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_close(
    config_path: Option<&std::path::Path>,
    name: Option<String>,
    addr: Option<String>,
    all: bool,
) -> Result<ExitCode, CliError> {
    let config = load_config(config_path)?;
    let request = ControlRequest::Close {
        name: name.unwrap_or_default(),
        addr: addr.unwrap_or_default(),
        all,
    };
    let reply = control::call(&config.control_socket, &request)
        .await
        .map_err(CliError::from)?;
    match reply {
        ControlReply::Ok => {
            println!("closed");
            Ok(ExitCode::SUCCESS)
        }
        ControlReply::Error { message, exit_code } => Err(CliError {
            code: exit_code as u8,
            message,
        }),
        other => Err(CliError {
            code: 4,
            message: format!("unexpected reply to Close: {other:?}"),
        }),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_play(
    config_path: Option<&std::path::Path>,
    name: Option<String>,
    addr: Option<String>,
    rec_id: String,
    speed: f64,
    repeat: bool,
    share: bool,
    max_wait: u64,
) -> Result<ExitCode, CliError> {
    let config = load_config(config_path)?;
    let policy = Policy {
        permit_write: false,
        permit_share: share,
        permit_share_write: false,
        record: false,
        speed,
        repeat,
        max_wait,
        user: UserSpec::default(),
    };
    let request = ControlRequest::Play {
        name: name.unwrap_or_default(),
        addr: addr.unwrap_or_default(),
        rec_id,
        policy,
    };
    let info = call_for_session(&config, request).await?;
    interactive_attach(&config, &info.key.name, &info.key.addr, &[]).await?;
    Ok(ExitCode::SUCCESS)
}

async fn call_for_session(config: &DaemonConfig, request: ControlRequest) -> Result<SessionInfo, CliError> {
    let reply = control::call(&config.control_socket, &request)
        .await
        .map_err(CliError::from)?;
    match reply {
        ControlReply::Session(info) => Ok(info),
        ControlReply::Error { message, exit_code } => Err(CliError {
            code: exit_code as u8,
            message,
        }),
        other => Err(CliError {
            code: 4,
            message: format!("unexpected control-plane reply: {other:?}"),
        }),
    }
}

fn run_convert(input: &std::path::Path, output: &std::path::Path, max_wait: u64) -> Result<ExitCode, CliError> {
    let cast = convert::convert(input, max_wait)?;
    convert::save(&cast, output)?;
    println!("wrote {}", output.display());
    Ok(ExitCode::SUCCESS)
}
