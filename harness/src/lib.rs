//! # Summary
//!
//! Process-spawning and polling utilities shared by every protocol's
//! driver binary: fork a node as a child process, wait for its port to
//! come up, and poll a `status` endpoint until a scenario completes.
//! Generalizes the base crate's `harness::server::Server` wrapper, which
//! did the same for a single protocol.

use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node at {0} never opened its port")]
    NeverReady(SocketAddr),
    #[error("scenario did not finish within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Transport(#[from] transport::Error),
}

/// A spawned node process. Killed on drop so a failing driver never
/// leaves orphaned nodes behind.
pub struct Node {
    child: Child,
    pub addr: SocketAddr,
}

impl Node {
    /// Spawns `binary` with `args`, inheriting stdout/stderr so node logs
    /// interleave with the driver's own log output (matching the base
    /// crate's `chatroom`/`harness` convention of a single shared
    /// terminal during a scenario run).
    pub fn spawn(binary: &str, args: &[String], addr: SocketAddr) -> Result<Self, Error> {
        let child = Command::new(binary)
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(Node { child, addr })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Resolves the path to another binary built into the same workspace
/// target directory as the currently running one. Drivers use this to
/// spawn node binaries without hard-coding a path.
pub fn sibling_binary(name: &str) -> std::path::PathBuf {
    let mut path = std::env::current_exe().expect("[INTERNAL ERROR]: could not resolve current executable");
    path.pop();
    path.push(name);
    path
}

/// Polls `addr` with a raw TCP connect attempt until it succeeds or
/// `deadline` elapses. Replaces the base drivers' fixed `sleep(1)` before
/// assuming every port is open.
pub async fn wait_for_port(addr: SocketAddr, deadline: Duration) -> Result<(), Error> {
    let attempt = async {
        loop {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    };
    timeout(deadline, attempt)
        .await
        .map_err(|_| Error::NeverReady(addr))
}

/// Repeatedly calls `poll` (typically a `status` request) until it
/// returns `true`, sleeping `interval` between attempts, or gives up
/// after `deadline`.
pub async fn poll_until<F, Fut>(
    mut poll: F,
    interval: Duration,
    deadline: Duration,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let attempt = async {
        loop {
            if poll().await {
                return;
            }
            sleep(interval).await;
        }
    };
    timeout(deadline, attempt)
        .await
        .map_err(|_| Error::Timeout(deadline))
}
