//! PTY launcher (component B).
//!
//! Opens a PTY pair and spawns a child with the slave as its controlling
//! terminal. The master end is exposed as a bidirectional byte stream plus
//! a handle for signalling and waiting on the child.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ShareTtyError};

/// Target identity a child should be downshifted to before exec.
///
/// `uid`/`gid` are recorded for CLI/config completeness but are not applied
/// as a privilege drop: `portable_pty::CommandBuilder` has no pre-exec hook
/// to call `setuid`/`setgid` on, unlike the cgo `SysProcAttr.Credential` the
/// original daemon used. Only the identity-adjacent environment (`HOME`,
/// `USER`, `LOGNAME`) and working directory are applied here; running the
/// daemon itself under the target user remains the supported way to get a
/// real privilege drop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub username: Option<String>,
    pub home: Option<PathBuf>,
    pub extra_env: HashMap<String, String>,
}

/// A running child attached to a PTY.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Open a PTY of `rows`x`cols` and spawn `argv[0] argv[1..]` attached to it.
    pub fn spawn(
        argv: &[String],
        rows: u16,
        cols: u16,
        cwd: Option<&std::path::Path>,
        user: Option<&UserSpec>,
    ) -> Result<Self> {
        if argv.is_empty() {
            return Err(ShareTtyError::Spawn("empty command".to_string()));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShareTtyError::Spawn(format!("openpty failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        if let Some(dir) = cwd {
            cmd.cwd(dir);
        }
        if let Some(user) = user {
            if let Some(home) = &user.home {
                cmd.env("HOME", home);
            }
            if let Some(name) = &user.username {
                cmd.env("USER", name);
                cmd.env("LOGNAME", name);
            }
            for (k, v) in &user.extra_env {
                cmd.env(k, v);
            }
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ShareTtyError::Spawn(format!("spawn failed: {e}")))?;
        // The slave handle is only needed to spawn; the child now holds its
        // own reference to the controlling terminal.
        drop(pair.slave);

        Ok(Self {
            master: pair.master,
            child,
        })
    }

    /// A reader for the PTY master. Blocking — intended to be driven from a
    /// dedicated `std::thread`, not directly awaited.
    pub fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>> {
        self.master
            .try_clone_reader()
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// A writer for the PTY master.
    pub fn take_writer(&self) -> Result<Box<dyn Write + Send>> {
        self.master
            .take_writer()
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Apply a new terminal size to the PTY master.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Send a termination signal to the child.
    pub fn kill(&mut self) -> Result<()> {
        self.child
            .kill()
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Block until the child exits, returning its exit status.
    pub fn wait(&mut self) -> Result<portable_pty::ExitStatus> {
        self.child
            .wait()
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// Non-blocking poll for exit, without consuming the child handle.
    pub fn try_wait(&mut self) -> Result<Option<portable_pty::ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| ShareTtyError::Io(std::io::Error::other(e.to_string())))
    }

    /// OS process id of the child, where the platform exposes one.
    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}
