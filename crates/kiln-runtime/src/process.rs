//! Process handles returned by sandbox engines.

use crate::error::{Result, RuntimeError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Capacity of the combined output channel of a spawned process.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// A command to run inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program name, resolved inside the sandbox.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Create a command from a program and its arguments.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Split a whitespace-separated command line (no quoting support).
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Notification that a server inside the sandbox accepts connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReady {
    /// Port the server listens on.
    pub port: u16,
    /// Address the preview can be reached at.
    pub url: String,
}

/// Handle to a process running inside a sandbox.
///
/// Exposes the exit code, the combined stdout/stderr byte stream, and a
/// kill switch. Engines build one with [`ProcessHandle::new`].
pub struct ProcessHandle {
    exit: oneshot::Receiver<i32>,
    output: Option<mpsc::Receiver<Bytes>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    /// Assemble a handle from its channels.
    pub fn new(
        exit: oneshot::Receiver<i32>,
        output: mpsc::Receiver<Bytes>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            exit,
            output: Some(output),
            kill,
        }
    }

    /// Take the combined output stream. Returns `None` after the first call.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Bytes>> {
        self.output.take()
    }

    /// Wait for the process to exit and return its exit code.
    pub async fn wait(self) -> Result<i32> {
        self.exit.await.map_err(|_| RuntimeError::ProcessLost)
    }

    /// Request termination.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    /// A clone of the kill switch, for terminating the process later.
    pub fn kill_switch(&self) -> CancellationToken {
        self.kill.clone()
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("output_taken", &self.output.is_none())
            .field("killed", &self.kill.is_cancelled())
            .finish()
    }
}
